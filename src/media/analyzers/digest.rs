//! Content digests.
//!
//! Both digests are reported as lowercase hex of the first 16 bytes of the
//! hash, so MD5 and SHA-1 values have the same 32-character shape.

use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Bytes of each hash kept in the report.
pub const DIGEST_LEN: usize = 16;

const CHUNK_SIZE: usize = 8 * 1024;

/// MD5 of the file from its current position to EOF.
pub async fn md5_hex(file: &mut File) -> std::io::Result<String> {
    let mut ctx = md5::Context::new();
    consume(file, |chunk| ctx.consume(chunk)).await?;
    Ok(truncated_hex(&ctx.compute().0))
}

/// SHA-1 of the file from its current position to EOF.
pub async fn sha1_hex(file: &mut File) -> std::io::Result<String> {
    let mut hasher = Sha1::new();
    consume(file, |chunk| hasher.update(chunk)).await?;
    Ok(truncated_hex(&hasher.finalize()))
}

async fn consume<F>(file: &mut File, mut update: F) -> std::io::Result<()>
where
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        update(&buf[..n]);
    }
}

fn truncated_hex(digest: &[u8]) -> String {
    hex::encode(&digest[..DIGEST_LEN.min(digest.len())])
}
