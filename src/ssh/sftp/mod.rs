//! SFTP executor.
//!
//! [`SftpExecutor`] owns one [`SftpBackend`] and exposes the primitives plus
//! the recursive operations from [`ops`]. One executor must not be shared
//! between tasks; open another executor on the same session instead.

mod backend;
pub mod ops;
pub mod path;
mod subsystem;
mod types;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub use backend::SftpBackend;
pub use subsystem::RusshSftp;
pub use types::{FileKind, RemoteFile, StreamEntry, WriteSource};

use crate::error::{Result, SessionError};
use crate::ssh::executor::{Executor, ExecutorKind, ExecutorState};
use crate::ssh::transfer::{TransferProgress, TransferStop};

pub struct SftpExecutor {
    backend: Box<dyn SftpBackend>,
    encoding: &'static Encoding,
    connected: bool,
    closed: bool,
}

impl SftpExecutor {
    /// `encoding` decodes text read through [`Self::read_line`] and [`Self::read_lines`].
    pub fn new(backend: Box<dyn SftpBackend>, encoding: &'static Encoding) -> Self {
        Self {
            backend,
            encoding,
            connected: false,
            closed: false,
        }
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    fn backend(&self) -> Result<&dyn SftpBackend> {
        if self.closed {
            return Err(SessionError::State("Sftp executor is closed".to_string()));
        }
        if !self.connected {
            return Err(SessionError::State("Sftp executor is not connected".to_string()));
        }
        Ok(self.backend.as_ref())
    }

    // Primitives

    /// Rename `source`; a relative `target` is taken as-is by the server.
    pub async fn rename(&self, source: &str, target: &str) -> Result<()> {
        self.backend()?.rename(source, target).await
    }

    /// Copy `path` into `sink`, skipping `skip` bytes and stopping after `max`.
    pub async fn transfer(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        skip: u64,
        max: Option<u64>,
        close_sink: bool,
    ) -> Result<u64> {
        let read = self.backend()?.transfer(path, sink, skip, max).await?;
        if close_sink {
            sink.shutdown().await?;
        }
        Ok(read)
    }

    /// Truncate `path` and write `source` into it.
    pub async fn write(&self, path: &str, source: WriteSource<'_>) -> Result<u64> {
        self.backend()?.write(path, source).await
    }

    pub async fn append(&self, path: &str, source: WriteSource<'_>) -> Result<u64> {
        self.backend()?.append(path, source).await
    }

    /// Attributes of `path`, following symlinks. `None` if it does not exist.
    pub async fn get_file(&self, path: &str) -> Result<Option<RemoteFile>> {
        self.backend()?.stat(path, true).await
    }

    pub async fn get_file_with(&self, path: &str, follow_links: bool) -> Result<Option<RemoteFile>> {
        self.backend()?.stat(path, follow_links).await
    }

    pub async fn list(&self, path: &str) -> Result<Vec<RemoteFile>> {
        self.backend()?.list(path).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get_file_with(path, false).await?.is_some())
    }

    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self
            .get_file(path)
            .await?
            .is_some_and(|file| file.is_dir()))
    }

    /// Create a single directory; the parent must exist.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.backend()?.create_dir(path).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.backend()?.remove_file(path).await
    }

    /// Push locally edited attributes back to the server.
    pub async fn set_file(&self, file: &RemoteFile) -> Result<()> {
        self.backend()?.set_attributes(file).await
    }

    // Composites

    /// Remove a file or a whole tree. Removing a missing path succeeds.
    pub async fn remove(&self, path: &str) -> Result<()> {
        ops::remove(self.backend()?, path).await
    }

    /// Create `path` and its missing ancestors; returns how many were created.
    pub async fn make_directories(&self, path: &str) -> Result<usize> {
        ops::make_directories(self.backend()?, path).await
    }

    /// Move with shell `mv` resolution for relative targets. Returns the destination.
    pub async fn move_file(&self, source: &str, target: &str) -> Result<String> {
        ops::move_file(self.backend()?, source, target).await
    }

    pub async fn list_files(
        &self,
        path: &str,
        recursive: bool,
        include_dirs: bool,
    ) -> Result<Vec<RemoteFile>> {
        ops::list_files(self.backend()?, path, recursive, include_dirs).await
    }

    pub async fn list_dirs(&self, path: &str, recursive: bool) -> Result<Vec<RemoteFile>> {
        ops::list_dirs(self.backend()?, path, recursive).await
    }

    pub async fn list_files_filter<F>(
        &self,
        path: &str,
        filter: F,
        recursive: bool,
        include_dirs: bool,
    ) -> Result<Vec<RemoteFile>>
    where
        F: Fn(&RemoteFile) -> bool + Send + Sync,
    {
        ops::list_files_filter(self.backend()?, path, filter, recursive, include_dirs).await
    }

    pub async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        target: &str,
    ) -> Result<u64> {
        ops::upload_file(self.backend()?, source, target).await
    }

    pub async fn download_file(
        &self,
        source: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        close_sink: bool,
    ) -> Result<u64> {
        ops::download_file(self.backend()?, source, sink, close_sink).await
    }

    /// Upload a local file by path.
    pub async fn upload_path(&self, local: impl AsRef<Path>, target: &str) -> Result<u64> {
        let mut file = tokio::fs::File::open(local.as_ref()).await?;
        self.upload_file(&mut file, target).await
    }

    /// Download to a local file by path, replacing it.
    pub async fn download_path(&self, source: &str, local: impl AsRef<Path>) -> Result<u64> {
        let mut file = tokio::fs::File::create(local.as_ref()).await?;
        self.download_file(source, &mut file, true).await
    }

    pub async fn upload_dir(&self, local: impl AsRef<Path>, target: &str) -> Result<usize> {
        ops::upload_dir(self.backend()?, local.as_ref(), target).await
    }

    pub async fn download_dir(&self, source: &str, local: impl AsRef<Path>) -> Result<usize> {
        ops::download_dir(self.backend()?, source, local.as_ref()).await
    }

    pub async fn upload_with_progress(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        target: &str,
        progress: &TransferProgress,
        stop: Option<&TransferStop>,
    ) -> Result<u64> {
        ops::upload_with_progress(self.backend()?, source, target, progress, stop).await
    }

    pub async fn download_with_progress(
        &self,
        source: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &TransferProgress,
        stop: Option<&TransferStop>,
    ) -> Result<u64> {
        ops::download_with_progress(self.backend()?, source, sink, progress, stop).await
    }

    pub async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<u64> {
        self.write(path, WriteSource::bytes(data)).await
    }

    pub async fn write_str(&self, path: &str, text: &str) -> Result<u64> {
        self.write_bytes(path, text.as_bytes()).await
    }

    pub async fn append_bytes(&self, path: &str, data: &[u8]) -> Result<u64> {
        self.append(path, WriteSource::bytes(data)).await
    }

    pub async fn append_str(&self, path: &str, text: &str) -> Result<u64> {
        self.append_bytes(path, text.as_bytes()).await
    }

    /// Up to `len` bytes starting at `offset`.
    pub async fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        ops::read(self.backend()?, path, offset, len).await
    }

    pub async fn read_to_end(&self, path: &str) -> Result<Vec<u8>> {
        ops::read_to_end(self.backend()?, path).await
    }

    pub async fn read_line(&self, path: &str) -> Result<Option<String>> {
        ops::read_line(self.backend()?, path, self.encoding).await
    }

    pub async fn read_lines(&self, path: &str) -> Result<Vec<String>> {
        ops::read_lines(self.backend()?, path, self.encoding).await
    }
}

#[async_trait]
impl Executor for SftpExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Sftp
    }

    fn state(&self) -> ExecutorState {
        if self.closed {
            ExecutorState::Closed
        } else if self.connected {
            ExecutorState::Connected
        } else {
            ExecutorState::Created
        }
    }

    async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.connected || self.closed {
            return Err(SessionError::State(
                "Sftp executor can only be connected once".to_string(),
            ));
        }
        self.backend.open(timeout).await?;
        self.connected = true;
        tracing::debug!("Sftp executor connected");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.backend.close().await;
        if let Err(e) = &result {
            tracing::warn!("Failed to close SFTP backend: {}", e);
        }
        tracing::debug!("Sftp executor closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::MemorySftp;

    async fn connected(fs: MemorySftp) -> SftpExecutor {
        let mut sftp = SftpExecutor::new(Box::new(fs), encoding_rs::UTF_8);
        sftp.connect(None).await.unwrap();
        sftp
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let sftp = SftpExecutor::new(Box::new(MemorySftp::new()), encoding_rs::UTF_8);
        let err = sftp.list("/").await.unwrap_err();
        assert!(matches!(err, SessionError::State(_)));
        assert_eq!(sftp.state(), ExecutorState::Created);
    }

    #[tokio::test]
    async fn test_connect_once_close_many() {
        let mut sftp = connected(MemorySftp::new()).await;
        assert!(matches!(
            sftp.connect(None).await,
            Err(SessionError::State(_))
        ));

        sftp.close().await.unwrap();
        sftp.close().await.unwrap();
        assert_eq!(sftp.state(), ExecutorState::Closed);
        assert!(sftp.exists("/").await.is_err());
    }

    #[tokio::test]
    async fn test_write_append_and_read_text() {
        let sftp = connected(MemorySftp::new()).await;

        sftp.write_str("/log.txt", "alpha\n").await.unwrap();
        sftp.append_str("/log.txt", "beta\n").await.unwrap();
        let data = b"--gamma--";
        sftp.append("/log.txt", WriteSource::Entry(StreamEntry::new(data, 2, 5).unwrap()))
            .await
            .unwrap();

        assert_eq!(sftp.read_lines("/log.txt").await.unwrap(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(sftp.read_line("/log.txt").await.unwrap().as_deref(), Some("alpha"));

        sftp.write_str("/log.txt", "reset").await.unwrap();
        assert_eq!(sftp.read_to_end("/log.txt").await.unwrap(), b"reset");
    }

    #[tokio::test]
    async fn test_get_file_and_set_file() {
        let fs = MemorySftp::new();
        fs.add_file("/etc/app.conf", b"key=value");
        let sftp = connected(fs).await;

        let mut file = sftp.get_file("/etc/app.conf").await.unwrap().unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, 9);

        file.set_mode(0o600);
        sftp.set_file(&file).await.unwrap();

        let file = sftp.get_file("/etc/app.conf").await.unwrap().unwrap();
        assert_eq!(file.mode_string().as_deref(), Some("rw-------"));
        assert!(sftp.get_file("/etc/missing").await.unwrap().is_none());
        assert!(sftp.is_dir("/etc").await.unwrap());
    }

    #[tokio::test]
    async fn test_transfer_with_offset_and_close() {
        let fs = MemorySftp::new();
        fs.add_file("/data.bin", b"0123456789");
        let sftp = connected(fs).await;

        let mut sink = Vec::new();
        let read = sftp
            .transfer("/data.bin", &mut sink, 3, Some(4), true)
            .await
            .unwrap();
        assert_eq!(read, 4);
        assert_eq!(sink, b"3456");
    }

    #[tokio::test]
    async fn test_mkdir_and_move_through_executor() {
        let sftp = connected(MemorySftp::new()).await;

        sftp.mkdir("/work").await.unwrap();
        sftp.write_bytes("/work/a.txt", b"a").await.unwrap();
        let dest = sftp.move_file("/work/a.txt", "/archive/2024/a.txt").await.unwrap();

        assert_eq!(dest, "/archive/2024/a.txt");
        assert!(!sftp.exists("/work/a.txt").await.unwrap());
        assert!(sftp.exists("/archive/2024/a.txt").await.unwrap());

        sftp.remove("/archive").await.unwrap();
        assert!(!sftp.exists("/archive").await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_and_download_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report.csv");
        std::fs::write(&local, b"a,b\n1,2\n").unwrap();
        let sftp = connected(MemorySftp::new()).await;

        assert_eq!(sftp.upload_path(&local, "/report.csv").await.unwrap(), 8);

        let back = dir.path().join("copy.csv");
        assert_eq!(sftp.download_path("/report.csv", &back).await.unwrap(), 8);
        assert_eq!(std::fs::read(&back).unwrap(), b"a,b\n1,2\n");
    }
}
