//! Destination file shared by all chunk workers of a session.
//!
//! Workers write at disjoint offsets through positioned writes on one shared
//! handle, so no cursor is shared and no cross-chunk lock is needed.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::error::DownloadError;

/// Owned destination file accepting concurrent positioned writes.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    file: Arc<File>,
}

impl FileSink {
    /// Creates (or truncates) `path`, then extends it to `total_size` when known.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the file cannot be created or sized
    /// (permission denied, invalid path, disk full).
    pub async fn create(path: &Path, total_size: Option<u64>) -> Result<Self, DownloadError> {
        let owned = path.to_path_buf();
        let file = run_blocking(path, move || {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&owned)?;
            if let Some(len) = total_size {
                file.set_len(len)?;
            }
            Ok(file)
        })
        .await?;
        debug!(path = %path.display(), size = ?total_size, "destination allocated");
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
        })
    }

    /// Writes all of `data` starting at `offset`.
    ///
    /// Returns only once the bytes have been handed to the OS, which is the
    /// point at which a worker may count them as downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] on any write failure.
    pub async fn write_at<B>(&self, offset: u64, data: B) -> Result<(), DownloadError>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        run_blocking(&self.path, move || {
            write_all_at(&file, data.as_ref(), offset)
        })
        .await
    }

    /// Flushes written data to the storage device.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the sync fails.
    pub async fn sync(&self) -> Result<(), DownloadError> {
        let file = Arc::clone(&self.file);
        run_blocking(&self.path, move || file.sync_data()).await
    }

    /// Current on-disk length of the destination.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if metadata cannot be read.
    pub async fn allocated_len(&self) -> Result<u64, DownloadError> {
        let file = Arc::clone(&self.file);
        run_blocking(&self.path, move || file.metadata().map(|m| m.len())).await
    }
}

async fn run_blocking<T, F>(path: &Path, op: F) -> Result<T, DownloadError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(io::Error::other)
        .and_then(|result| result)
        .map_err(|e| DownloadError::io(path, e))
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
