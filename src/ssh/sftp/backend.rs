//! Transport-specific SFTP primitives.
//!
//! Everything in [`super::ops`] is written against this trait only, so a
//! backend that gets these calls right gets every recursive operation for free.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::ssh::sftp::types::{RemoteFile, WriteSource};

#[async_trait]
pub trait SftpBackend: Send + Sync {
    /// Establish the subsystem. Backends without a handshake keep the default.
    async fn open(&mut self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Rename `source` to `target`. Both are already resolved.
    async fn rename(&self, source: &str, target: &str) -> Result<()>;

    /// Copy the file at `path` into `sink`, skipping `skip` bytes and stopping
    /// after `max` bytes when given. Returns the bytes copied.
    async fn transfer(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        skip: u64,
        max: Option<u64>,
    ) -> Result<u64>;

    /// Truncate (or create) `path` and write `source` into it.
    async fn write(&self, path: &str, source: WriteSource<'_>) -> Result<u64>;

    /// Write `source` at the current end of `path`, creating it if missing.
    async fn append(&self, path: &str, source: WriteSource<'_>) -> Result<u64>;

    /// Attributes of `path`, `None` when it does not exist.
    async fn stat(&self, path: &str, follow_links: bool) -> Result<Option<RemoteFile>>;

    /// Immediate children of the directory at `path`, without `.` and `..`,
    /// in the order the server reports them.
    async fn list(&self, path: &str) -> Result<Vec<RemoteFile>>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Remove an empty directory.
    async fn remove_dir(&self, path: &str) -> Result<()>;

    /// Create one directory; the parent must exist.
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Push the locally edited attributes of `file` to the server.
    async fn set_attributes(&self, file: &RemoteFile) -> Result<()>;
}
