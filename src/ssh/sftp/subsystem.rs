//! SFTP primitives over the russh `sftp` subsystem.

use std::time::Duration;

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpClientError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SessionError, SftpError};
use crate::ssh::client::SessionHandle;
use crate::ssh::sftp::backend::SftpBackend;
use crate::ssh::sftp::path;
use crate::ssh::sftp::types::{FileKind, RemoteFile, WriteSource};
use crate::ssh::transfer::{copy_chunked, BUFFER_SIZE};

/// Wrap a russh-sftp failure, keeping "no such file" distinguishable.
fn sftp_error(op: &'static str, path: &str, err: SftpClientError) -> SessionError {
    match &err {
        SftpClientError::Status(status) if status.status_code == StatusCode::NoSuchFile => {
            SftpError::no_such_file(path).into()
        }
        _ => SftpError::classify(op, path, err.to_string()).into(),
    }
}

fn to_remote_file(path: String, attrs: &FileAttributes) -> RemoteFile {
    let kind = match attrs.permissions {
        Some(mode) => FileKind::from_mode(mode),
        None => FileKind::Unknown,
    };
    RemoteFile {
        path,
        kind,
        size: attrs.size.unwrap_or(0),
        uid: attrs.uid,
        gid: attrs.gid,
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
        // Neither is exposed by FileAttributes or DirEntry.
        links: None,
        longname: None,
    }
}

/// SFTP backend on a channel of an authenticated russh session.
pub struct RusshSftp {
    session: Option<SessionHandle>,
    sftp: Option<SftpSession>,
}

impl RusshSftp {
    pub(crate) fn new(session: Option<SessionHandle>) -> Self {
        Self {
            session,
            sftp: None,
        }
    }

    fn sftp(&self) -> Result<&SftpSession> {
        self.sftp
            .as_ref()
            .ok_or_else(|| SessionError::State("SFTP subsystem is not open".to_string()))
    }

    async fn start(session: SessionHandle) -> Result<SftpSession> {
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Connection(format!("Failed to open SFTP channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                SessionError::Connection(format!("Failed to request SFTP subsystem: {}", e))
            })?;

        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Connection(format!("Failed to initialize SFTP: {}", e)))
    }
}

#[async_trait]
impl SftpBackend for RusshSftp {
    async fn open(&mut self, timeout: Option<Duration>) -> Result<()> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| SessionError::Connection("session is not connected".to_string()))?;

        let start = Self::start(session);
        let sftp = match timeout {
            Some(limit) => tokio::time::timeout(limit, start).await.map_err(|_| {
                SessionError::Timeout(format!("opening SFTP subsystem after {:?}", limit))
            })??,
            None => start.await?,
        };

        self.sftp = Some(sftp);
        tracing::debug!("SFTP subsystem opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                tracing::debug!("Failed to close SFTP session cleanly: {}", e);
            }
        }
        Ok(())
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        self.sftp()?
            .rename(source, target)
            .await
            .map_err(|e| sftp_error("rename", source, e))
    }

    async fn transfer(
        &self,
        path: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        skip: u64,
        max: Option<u64>,
    ) -> Result<u64> {
        let mut file = self
            .sftp()?
            .open_with_flags(path, OpenFlags::READ)
            .await
            .map_err(|e| sftp_error("open", path, e))?;

        if skip > 0 {
            file.seek(std::io::SeekFrom::Start(skip)).await?;
        }

        let copied = copy_chunked(&mut file, sink, BUFFER_SIZE, max).await?;

        if let Err(e) = file.shutdown().await {
            tracing::debug!("Failed to close remote file {}: {}", path, e);
        }
        Ok(copied)
    }

    async fn write(&self, path: &str, source: WriteSource<'_>) -> Result<u64> {
        let mut file = self
            .sftp()?
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| sftp_error("write", path, e))?;

        let written = source.copy_to(&mut file, BUFFER_SIZE).await?;
        file.shutdown().await?;
        Ok(written)
    }

    async fn append(&self, path: &str, source: WriteSource<'_>) -> Result<u64> {
        let sftp = self.sftp()?;
        let end = match sftp.metadata(path).await {
            Ok(attrs) => attrs.size.unwrap_or(0),
            Err(SftpClientError::Status(status)) if status.status_code == StatusCode::NoSuchFile => 0,
            Err(e) => return Err(sftp_error("append", path, e)),
        };

        let mut file = sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::APPEND,
            )
            .await
            .map_err(|e| sftp_error("append", path, e))?;

        // Servers disagree on honoring APPEND, so position explicitly.
        file.seek(std::io::SeekFrom::Start(end)).await?;
        let written = source.copy_to(&mut file, BUFFER_SIZE).await?;
        file.shutdown().await?;
        Ok(written)
    }

    async fn stat(&self, path: &str, follow_links: bool) -> Result<Option<RemoteFile>> {
        let sftp = self.sftp()?;
        let attrs = if follow_links {
            sftp.metadata(path).await
        } else {
            sftp.symlink_metadata(path).await
        };

        match attrs {
            Ok(attrs) => Ok(Some(to_remote_file(path.to_string(), &attrs))),
            Err(e) => {
                let err = sftp_error("stat", path, e);
                if err.is_no_such_file() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<RemoteFile>> {
        let entries = self
            .sftp()?
            .read_dir(dir)
            .await
            .map_err(|e| sftp_error("list", dir, e))?;

        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| to_remote_file(path::join(dir, &entry.file_name()), &entry.metadata()))
            .collect())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp()?
            .remove_file(path)
            .await
            .map_err(|e| sftp_error("remove_file", path, e))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.sftp()?
            .remove_dir(path)
            .await
            .map_err(|e| sftp_error("remove_dir", path, e))
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.sftp()?
            .create_dir(path)
            .await
            .map_err(|e| sftp_error("create_dir", path, e))
    }

    async fn set_attributes(&self, file: &RemoteFile) -> Result<()> {
        let mut attrs = FileAttributes::empty();
        attrs.uid = file.uid;
        attrs.gid = file.gid;
        attrs.permissions = file.mode();
        if let (Some(atime), Some(mtime)) = (file.atime, file.mtime) {
            attrs.atime = Some(atime);
            attrs.mtime = Some(mtime);
        }

        self.sftp()?
            .set_metadata(file.path.as_str(), attrs)
            .await
            .map_err(|e| sftp_error("set_attributes", &file.path, e))
    }
}
