//! In-process doubles for the channel and SFTP seams.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Result, SessionError, SftpError};
use crate::ssh::channel::{BoxedReader, BoxedWriter, Channel};
use crate::ssh::pty::PtyConfig;
use crate::ssh::sftp::path;
use crate::ssh::sftp::{FileKind, RemoteFile, SftpBackend, WriteSource};
use crate::ssh::transfer::copy_chunked;

struct FailingReader(String);

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            self.0.clone(),
        )))
    }
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for SharedWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Channel that replays canned output and records what it is sent.
pub(crate) struct ScriptedChannel {
    stdout_data: Vec<u8>,
    stderr_data: Vec<u8>,
    exit: Option<u32>,
    stdout_failure: Option<String>,
    refusal: Option<String>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    stdin: Option<BoxedWriter>,
    connected: bool,
    closed: bool,
    disconnects: Arc<AtomicUsize>,
    pty: Arc<Mutex<Option<PtyConfig>>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedChannel {
    pub(crate) fn new(stdout: &[u8], stderr: &[u8], exit: Option<u32>) -> Self {
        Self {
            stdout_data: stdout.to_vec(),
            stderr_data: stderr.to_vec(),
            exit,
            stdout_failure: None,
            refusal: None,
            stdout: None,
            stderr: None,
            stdin: None,
            connected: false,
            closed: false,
            disconnects: Arc::new(AtomicUsize::new(0)),
            pty: Arc::new(Mutex::new(None)),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Stdout fails on the first read with `message`.
    pub(crate) fn failing_stdout(message: &str) -> Self {
        let mut channel = Self::new(b"", b"", None);
        channel.stdout_failure = Some(message.to_string());
        channel
    }

    /// `connect` fails with a connection error carrying `message`.
    pub(crate) fn refusing(message: &str) -> Self {
        let mut channel = Self::new(b"", b"", None);
        channel.refusal = Some(message.to_string());
        channel
    }

    pub(crate) fn disconnect_counter(&self) -> Arc<AtomicUsize> {
        self.disconnects.clone()
    }

    pub(crate) fn pty_slot(&self) -> Arc<Mutex<Option<PtyConfig>>> {
        self.pty.clone()
    }

    pub(crate) fn stdin_buffer(&self) -> Arc<Mutex<Vec<u8>>> {
        self.written.clone()
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn connect(&mut self, _timeout: Option<Duration>) -> Result<()> {
        if let Some(message) = &self.refusal {
            return Err(SessionError::Connection(message.clone()));
        }

        self.stdout = Some(match &self.stdout_failure {
            Some(message) => Box::pin(FailingReader(message.clone())),
            None => Box::pin(Cursor::new(self.stdout_data.clone())),
        });
        self.stderr = Some(Box::pin(Cursor::new(self.stderr_data.clone())));
        self.stdin = Some(Box::pin(SharedWriter(self.written.clone())));
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.connected = false;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    fn exit_status(&self) -> Option<u32> {
        self.exit
    }

    fn set_pty(&mut self, pty: PtyConfig) {
        *self.pty.lock().unwrap() = Some(pty);
    }

    async fn resize(&mut self, pty: &PtyConfig) -> Result<()> {
        *self.pty.lock().unwrap() = Some(pty.clone());
        Ok(())
    }
}

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

enum Node {
    Dir,
    File(Vec<u8>),
}

struct Entry {
    node: Node,
    mode: u32,
}

/// In-memory SFTP server. Relative paths resolve against `/home/tester`.
pub(crate) struct MemorySftp {
    tree: Mutex<BTreeMap<String, Entry>>,
    home: String,
    create_dir_calls: AtomicUsize,
    transfer_calls: AtomicUsize,
    removal_failure: Mutex<Option<String>>,
}

impl MemorySftp {
    pub(crate) fn new() -> Self {
        let fs = Self {
            tree: Mutex::new(BTreeMap::new()),
            home: "/home/tester".to_string(),
            create_dir_calls: AtomicUsize::new(0),
            transfer_calls: AtomicUsize::new(0),
            removal_failure: Mutex::new(None),
        };
        fs.insert_dir("/");
        fs.add_dir("/home/tester");
        fs
    }

    fn resolve(&self, p: &str) -> String {
        if path::is_absolute(p) {
            path::normalize(p)
        } else {
            path::normalize(&path::join(&self.home, p))
        }
    }

    fn insert_dir(&self, resolved: &str) {
        self.tree.lock().unwrap().insert(
            resolved.to_string(),
            Entry {
                node: Node::Dir,
                mode: 0o755,
            },
        );
    }

    pub(crate) fn add_dir(&self, p: &str) {
        for dir in path::ancestors(&self.resolve(p)) {
            if !self.tree.lock().unwrap().contains_key(&dir) {
                self.insert_dir(&dir);
            }
        }
    }

    pub(crate) fn add_file(&self, p: &str, data: &[u8]) {
        let resolved = self.resolve(p);
        if let Some(parent) = path::parent(&resolved) {
            self.add_dir(&parent);
        }
        self.tree.lock().unwrap().insert(
            resolved,
            Entry {
                node: Node::File(data.to_vec()),
                mode: 0o644,
            },
        );
    }

    pub(crate) fn contents(&self, p: &str) -> Option<Vec<u8>> {
        match self.tree.lock().unwrap().get(&self.resolve(p)) {
            Some(Entry {
                node: Node::File(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    pub(crate) fn create_dir_calls(&self) -> usize {
        self.create_dir_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    /// Make every later removal fail with `message`.
    pub(crate) fn fail_removals(&self, message: &str) {
        *self.removal_failure.lock().unwrap() = Some(message.to_string());
    }

    fn missing(op: &'static str, p: &str) -> SessionError {
        SftpError::classify(op, p, "No such file").into()
    }

    fn failure(op: &'static str, p: &str, message: &str) -> SessionError {
        SftpError::classify(op, p, message).into()
    }

    fn check_removal(&self, op: &'static str, p: &str) -> Result<()> {
        match self.removal_failure.lock().unwrap().as_deref() {
            Some(message) => Err(Self::failure(op, p, message)),
            None => Ok(()),
        }
    }

    fn require_parent_dir(&self, op: &'static str, p: &str, resolved: &str) -> Result<()> {
        let tree = self.tree.lock().unwrap();
        match path::parent(resolved).and_then(|parent| tree.get(&parent)) {
            Some(Entry {
                node: Node::Dir, ..
            }) => Ok(()),
            _ => Err(Self::missing(op, p)),
        }
    }

    fn file_data(&self, op: &'static str, p: &str) -> Result<Vec<u8>> {
        match self.tree.lock().unwrap().get(&self.resolve(p)) {
            Some(Entry {
                node: Node::File(data),
                ..
            }) => Ok(data.clone()),
            Some(_) => Err(Self::failure(op, p, "is a directory")),
            None => Err(Self::missing(op, p)),
        }
    }

    fn store(&self, resolved: String, data: Vec<u8>) {
        let mut tree = self.tree.lock().unwrap();
        let mode = tree.get(&resolved).map(|e| e.mode).unwrap_or(0o644);
        tree.insert(
            resolved,
            Entry {
                node: Node::File(data),
                mode,
            },
        );
    }
}

#[async_trait]
impl SftpBackend for MemorySftp {
    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let from = self.resolve(source);
        let to = self.resolve(target);
        self.require_parent_dir("rename", target, &to)?;

        let mut tree = self.tree.lock().unwrap();
        if !tree.contains_key(&from) {
            return Err(Self::missing("rename", source));
        }
        let moved: Vec<String> = tree
            .keys()
            .filter(|k| *k == &from || path::strip_root(&from, k).is_some_and(|s| !s.is_empty()))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = tree.remove(&key) {
                let suffix = path::strip_root(&from, &key).unwrap_or("").to_string();
                let new_key = if suffix.is_empty() {
                    to.clone()
                } else {
                    path::join(&to, &suffix)
                };
                tree.insert(new_key, entry);
            }
        }
        Ok(())
    }

    async fn transfer(
        &self,
        p: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
        skip: u64,
        max: Option<u64>,
    ) -> Result<u64> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.file_data("transfer", p)?;
        let start = (skip as usize).min(data.len());
        let mut reader = Cursor::new(&data[start..]);
        Ok(copy_chunked(&mut reader, sink, 8 * 1024, max).await?)
    }

    async fn write(&self, p: &str, source: WriteSource<'_>) -> Result<u64> {
        let resolved = self.resolve(p);
        self.require_parent_dir("write", p, &resolved)?;

        let mut data = Vec::new();
        let written = source.copy_to(&mut data, 8 * 1024).await?;
        self.store(resolved, data);
        Ok(written)
    }

    async fn append(&self, p: &str, source: WriteSource<'_>) -> Result<u64> {
        let resolved = self.resolve(p);
        self.require_parent_dir("append", p, &resolved)?;

        let mut data = match self.file_data("append", p) {
            Ok(existing) => existing,
            Err(e) if e.is_no_such_file() => Vec::new(),
            Err(e) => return Err(e),
        };
        let written = source.copy_to(&mut data, 8 * 1024).await?;
        self.store(resolved, data);
        Ok(written)
    }

    async fn stat(&self, p: &str, _follow_links: bool) -> Result<Option<RemoteFile>> {
        let tree = self.tree.lock().unwrap();
        Ok(tree.get(&self.resolve(p)).map(|entry| {
            let (kind, size, type_bits) = match &entry.node {
                Node::Dir => (FileKind::Directory, 4096, S_IFDIR),
                Node::File(data) => (FileKind::File, data.len() as u64, S_IFREG),
            };
            let mut file = RemoteFile::new(p, kind);
            file.size = size;
            file.uid = Some(1000);
            file.gid = Some(1000);
            file.permissions = Some(type_bits | entry.mode);
            file
        }))
    }

    async fn list(&self, p: &str) -> Result<Vec<RemoteFile>> {
        let resolved = self.resolve(p);
        let names: Vec<String> = {
            let tree = self.tree.lock().unwrap();
            match tree.get(&resolved) {
                Some(Entry {
                    node: Node::Dir, ..
                }) => {}
                Some(_) => return Err(Self::failure("list", p, "not a directory")),
                None => return Err(Self::missing("list", p)),
            }
            tree.keys()
                .filter(|k| *k != &resolved && path::parent(k).as_deref() == Some(resolved.as_str()))
                .map(|k| path::file_name(k).to_string())
                .collect()
        };

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(file) = self.stat(&path::join(p, &name), false).await? {
                out.push(file);
            }
        }
        Ok(out)
    }

    async fn remove_file(&self, p: &str) -> Result<()> {
        self.check_removal("remove_file", p)?;
        let resolved = self.resolve(p);
        let mut tree = self.tree.lock().unwrap();
        match tree.get(&resolved) {
            Some(Entry {
                node: Node::File(_),
                ..
            }) => {
                tree.remove(&resolved);
                Ok(())
            }
            Some(_) => Err(Self::failure("remove_file", p, "is a directory")),
            None => Err(Self::missing("remove_file", p)),
        }
    }

    async fn remove_dir(&self, p: &str) -> Result<()> {
        self.check_removal("remove_dir", p)?;
        let resolved = self.resolve(p);
        let mut tree = self.tree.lock().unwrap();
        match tree.get(&resolved) {
            Some(Entry {
                node: Node::Dir, ..
            }) => {
                let has_children = tree
                    .keys()
                    .any(|k| path::parent(k).as_deref() == Some(resolved.as_str()) && *k != resolved);
                if has_children {
                    return Err(Self::failure("remove_dir", p, "directory not empty"));
                }
                tree.remove(&resolved);
                Ok(())
            }
            Some(_) => Err(Self::failure("remove_dir", p, "not a directory")),
            None => Err(Self::missing("remove_dir", p)),
        }
    }

    async fn create_dir(&self, p: &str) -> Result<()> {
        self.create_dir_calls.fetch_add(1, Ordering::SeqCst);
        let resolved = self.resolve(p);
        self.require_parent_dir("create_dir", p, &resolved)?;
        if self.tree.lock().unwrap().contains_key(&resolved) {
            return Err(Self::failure("create_dir", p, "file already exists"));
        }
        self.insert_dir(&resolved);
        Ok(())
    }

    async fn set_attributes(&self, file: &RemoteFile) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        let entry = tree
            .get_mut(&self.resolve(&file.path))
            .ok_or_else(|| Self::missing("set_attributes", &file.path))?;
        if let Some(mode) = file.mode() {
            entry.mode = mode;
        }
        Ok(())
    }
}
