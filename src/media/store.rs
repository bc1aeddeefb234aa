//! Transient storage for fetched files.
//!
//! Each fetch gets its own uniquely named file in the temp directory. The file
//! lives exactly as long as its [`ResourceHandle`]: `release()` closes and
//! deletes it, and dropping an unreleased handle deletes it as well, so no exit
//! path (early return, error, panic) leaves it on disk.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncSeekExt;
use uuid::Uuid;

/// File name prefix for transient files.
pub const TEMP_FILE_PREFIX: &str = "fileinfo-";

/// Errors raised by transient storage.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot create temporary file: {0}")]
    Create(#[source] std::io::Error),

    #[error("error saving file to disk: {0}")]
    Write(#[source] std::io::Error),

    #[error("error removing temp file: {0}")]
    Remove(#[source] std::io::Error),

    #[error("file handle is already leased for analysis")]
    Busy,
}

/// A uniquely named temp file, deleted on release or drop.
#[derive(Debug)]
pub struct TransientFile {
    path: PathBuf,
    file: Option<File>,
    removed: bool,
}

impl TransientFile {
    /// Create a new empty file in `dir`.
    pub async fn create_in(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(format!("{}{}", TEMP_FILE_PREFIX, Uuid::new_v4()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(StoreError::Create)?;

        tracing::debug!(path = %path.display(), "created transient file");

        Ok(Self {
            path,
            file: Some(file),
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mutable access to the open file, `None` once closed.
    pub fn file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }

    fn take_file(&mut self) -> Option<File> {
        self.file.take()
    }

    /// Close and delete the file.
    pub async fn remove(mut self) -> Result<(), StoreError> {
        drop(self.file.take());
        self.removed = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Remove(e)),
        }
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        drop(self.file.take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed unreleased transient file")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove transient file"
            ),
        }
    }
}

/// One fetched artifact: a transient file plus its size.
///
/// The open file sits in a single slot. Taking it out of the slot is the
/// exclusivity guard: whoever holds the [`HandleLease`] is the only reader
/// until the lease is dropped and the file returns to the slot.
#[derive(Debug)]
pub struct ResourceHandle {
    path: PathBuf,
    size: u64,
    slot: Mutex<Option<File>>,
    storage: TransientFile,
}

impl ResourceHandle {
    /// Wrap a fully written transient file. `size` is fixed from here on.
    pub(crate) fn new(mut storage: TransientFile, size: u64) -> Self {
        let file = storage.take_file();
        Self {
            path: storage.path().to_path_buf(),
            size,
            slot: Mutex::new(file),
            storage,
        }
    }

    /// Size in bytes as measured during the fetch.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive lease, failing if another holder has it.
    pub fn acquire(&self) -> Result<HandleLease<'_>, StoreError> {
        let file = self.slot.lock().take().ok_or(StoreError::Busy)?;
        Ok(HandleLease {
            handle: self,
            file: Some(file),
        })
    }

    /// Close and delete the underlying file.
    pub async fn release(self) -> Result<(), StoreError> {
        let Self { slot, storage, .. } = self;
        drop(slot.into_inner());
        storage.remove().await
    }
}

/// Exclusive access to a [`ResourceHandle`]'s file. Returned to the handle on drop.
#[derive(Debug)]
pub struct HandleLease<'a> {
    handle: &'a ResourceHandle,
    file: Option<File>,
}

impl HandleLease<'_> {
    pub fn size(&self) -> u64 {
        self.handle.size
    }

    pub fn path(&self) -> &Path {
        &self.handle.path
    }

    /// The leased file, positioned wherever the last reader left it.
    pub fn file(&mut self) -> &mut File {
        self.file.as_mut().expect("lease holds its file until drop")
    }

    /// Reset the read position to the first byte.
    pub async fn rewind(&mut self) -> std::io::Result<()> {
        self.file().seek(SeekFrom::Start(0)).await.map(|_| ())
    }
}

impl Drop for HandleLease<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            *self.handle.slot.lock() = Some(file);
        }
    }
}
