//! Content-based MIME detection.

use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Bytes inspected from the start of the file.
pub const SNIFF_LEN: usize = 3072;

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type from the first [`SNIFF_LEN`] bytes at the current position.
pub async fn detect(file: &mut File) -> std::io::Result<String> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(sniff(&head).to_string())
}

/// Classify a header buffer. Falls back to text for valid UTF-8 and to
/// `application/octet-stream` for anything else.
pub fn sniff(head: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type();
    }
    if looks_like_text(head) {
        TEXT_PLAIN
    } else {
        OCTET_STREAM
    }
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.contains(&0) {
        return false;
    }
    match std::str::from_utf8(head) {
        Ok(_) => true,
        // The sniff window may cut a multi-byte sequence in half.
        Err(e) => e.error_len().is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    #[test]
    fn test_sniff_png() {
        assert_eq!(sniff(PNG_HEADER), "image/png");
    }

    #[test]
    fn test_sniff_pdf() {
        assert_eq!(sniff(b"%PDF-1.7\n%\xe2\xe3\xcf\xd3"), "application/pdf");
    }

    #[test]
    fn test_sniff_gif() {
        assert_eq!(sniff(b"GIF89a\x01\x00\x01\x00"), "image/gif");
    }

    #[test]
    fn test_sniff_text_fallback() {
        assert_eq!(sniff(b"hello world\n"), TEXT_PLAIN);
        assert_eq!(sniff("grüße".as_bytes()), TEXT_PLAIN);
    }

    #[test]
    fn test_sniff_truncated_utf8_is_still_text() {
        let bytes = "ü".as_bytes();
        assert_eq!(sniff(&bytes[..1]), TEXT_PLAIN);
    }

    #[test]
    fn test_sniff_binary_fallback() {
        assert_eq!(sniff(&[0xff, 0xfe, 0x00, 0x13]), OCTET_STREAM);
        assert_eq!(sniff(&[0xc3, 0x28, 0x41]), OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_detect_reads_only_the_window() {
        use tokio::io::{AsyncSeekExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sniff");
        let mut file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .unwrap();
        // Text window followed by a NUL far past it.
        let mut bytes = vec![b'a'; SNIFF_LEN];
        bytes.extend_from_slice(&[0, 0, 0]);
        file.write_all(&bytes).await.unwrap();
        file.seek(std::io::SeekFrom::Start(0)).await.unwrap();

        assert_eq!(detect(&mut file).await.unwrap(), TEXT_PLAIN);
    }
}
