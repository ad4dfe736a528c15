//! SFTP data types

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SessionError};
use crate::ssh::transfer::copy_chunked;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

impl FileKind {
    /// Derive the kind from the type bits of a `st_mode` value.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFREG => FileKind::File,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Unknown,
        }
    }
}

/// A remote directory entry or stat result.
///
/// Edits are local until pushed back with `SftpExecutor::set_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Full `st_mode`, type bits included.
    pub permissions: Option<u32>,
    /// Seconds since the epoch.
    pub atime: Option<u32>,
    /// Seconds since the epoch.
    pub mtime: Option<u32>,
    /// Hard-link count. SFTP v3 attributes do not carry it, so the russh
    /// backend leaves it `None`.
    pub links: Option<u32>,
    /// Server-formatted `ls -l` line. russh-sftp's directory iterator drops
    /// it, so the russh backend leaves it `None`.
    pub longname: Option<String>,
}

impl RemoteFile {
    pub fn new(path: impl Into<String>, kind: FileKind) -> Self {
        Self {
            path: path.into(),
            kind,
            size: 0,
            uid: None,
            gid: None,
            permissions: None,
            atime: None,
            mtime: None,
            links: None,
            longname: None,
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        crate::ssh::sftp::path::file_name(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Permission bits without the file type.
    pub fn mode(&self) -> Option<u32> {
        self.permissions.map(|p| p & 0o7777)
    }

    /// Replace the permission bits, keeping the type bits.
    pub fn set_mode(&mut self, mode: u32) {
        let type_bits = self.permissions.unwrap_or(0) & S_IFMT;
        self.permissions = Some(type_bits | (mode & 0o7777));
    }

    /// `rwxr-xr-x` style rendering of the permission bits.
    pub fn mode_string(&self) -> Option<String> {
        let mode = self.mode()?;
        let mut out = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        Some(out)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.mtime
            .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0))
    }

    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        self.atime
            .and_then(|t| DateTime::<Utc>::from_timestamp(i64::from(t), 0))
    }
}

/// A window over an in-memory buffer, used instead of a stream for small writes.
#[derive(Debug, Clone, Copy)]
pub struct StreamEntry<'a> {
    buffer: &'a [u8],
    offset: usize,
    length: usize,
}

impl<'a> StreamEntry<'a> {
    /// Fails when `offset + length` runs past the end of `buffer`.
    pub fn new(buffer: &'a [u8], offset: usize, length: usize) -> Result<Self> {
        match offset.checked_add(length) {
            Some(end) if end <= buffer.len() => Ok(Self {
                buffer,
                offset,
                length,
            }),
            _ => Err(SessionError::State(format!(
                "stream entry {}+{} exceeds buffer of {} bytes",
                offset,
                length,
                buffer.len()
            ))),
        }
    }

    pub fn whole(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            length: buffer.len(),
        }
    }

    pub fn as_slice(&self) -> &'a [u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Data for a write or append primitive.
pub enum WriteSource<'a> {
    Stream(&'a mut (dyn AsyncRead + Send + Unpin)),
    Entry(StreamEntry<'a>),
}

impl<'a> WriteSource<'a> {
    pub fn bytes(data: &'a [u8]) -> Self {
        WriteSource::Entry(StreamEntry::whole(data))
    }

    /// Copy the whole source into `writer` in `chunk_size` pieces.
    pub async fn copy_to<W>(self, writer: &mut W, chunk_size: usize) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        match self {
            WriteSource::Entry(entry) => {
                for chunk in entry.as_slice().chunks(chunk_size.max(1)) {
                    writer.write_all(chunk).await?;
                }
                Ok(entry.len() as u64)
            }
            WriteSource::Stream(reader) => copy_chunked(reader, writer, chunk_size, None).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(0o040755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(0o100644), FileKind::File);
        assert_eq!(FileKind::from_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o020666), FileKind::Unknown);
    }

    #[test]
    fn test_remote_file_mode_helpers() {
        let mut file = RemoteFile::new("/etc/hosts", FileKind::File);
        file.permissions = Some(0o100644);

        assert_eq!(file.name(), "hosts");
        assert_eq!(file.mode(), Some(0o644));
        assert_eq!(file.mode_string().as_deref(), Some("rw-r--r--"));

        file.set_mode(0o750);
        assert_eq!(file.permissions, Some(0o100750));
        assert_eq!(file.mode_string().as_deref(), Some("rwxr-x---"));
    }

    #[test]
    fn test_remote_file_timestamps() {
        let mut file = RemoteFile::new("/tmp/a", FileKind::File);
        assert!(file.modified().is_none());

        file.mtime = Some(1_700_000_000);
        assert_eq!(file.modified().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_stream_entry_bounds() {
        let data = b"0123456789";
        let entry = StreamEntry::new(data, 2, 5).unwrap();
        assert_eq!(entry.as_slice(), b"23456");
        assert_eq!(entry.len(), 5);

        assert!(StreamEntry::new(data, 8, 3).is_err());
        assert!(StreamEntry::new(data, usize::MAX, 2).is_err());
        assert!(StreamEntry::new(data, 10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_source_copies_entry_window() {
        let data = b"--payload--";
        let source = WriteSource::Entry(StreamEntry::new(data, 2, 7).unwrap());
        let mut out = Vec::new();

        let copied = source.copy_to(&mut out, 3).await.unwrap();
        assert_eq!(copied, 7);
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_write_source_copies_stream() {
        let mut reader = std::io::Cursor::new(b"streamed".to_vec());
        let mut out = Vec::new();

        let copied = WriteSource::Stream(&mut reader)
            .copy_to(&mut out, 4)
            .await
            .unwrap();
        assert_eq!(copied, 8);
        assert_eq!(out, b"streamed");
    }
}
