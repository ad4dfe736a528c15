//! Composite SFTP operations.
//!
//! Built only from [`SftpBackend`] primitives and path arithmetic. Recursive
//! work runs sequentially, one round trip at a time. Nothing is rolled back
//! when a step fails partway.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use encoding_rs::Encoding;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{Result, SessionError, SftpError};
use crate::ssh::sftp::backend::SftpBackend;
use crate::ssh::sftp::path;
use crate::ssh::sftp::types::{RemoteFile, WriteSource};
use crate::ssh::transfer::{
    map_transfer_error, ProgressReader, ProgressWriter, TransferProgress, TransferStop,
    BUFFER_SIZE,
};

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_no_such_file() => Ok(()),
        other => other,
    }
}

/// Remove a file or directory tree. A missing target counts as removed.
pub async fn remove<B>(backend: &B, target: &str) -> Result<()>
where
    B: SftpBackend + ?Sized,
{
    match backend.stat(target, false).await? {
        None => Ok(()),
        Some(file) if file.is_dir() => remove_tree(backend, target.to_string()).await,
        Some(_) => ignore_missing(backend.remove_file(target).await),
    }
}

fn remove_tree<'a, B>(backend: &'a B, dir: String) -> BoxFuture<'a, Result<()>>
where
    B: SftpBackend + ?Sized,
{
    Box::pin(async move {
        let children = match backend.list(&dir).await {
            Ok(children) => children,
            Err(e) if e.is_no_such_file() => return Ok(()),
            Err(e) => return Err(e),
        };

        let (dirs, files): (Vec<RemoteFile>, Vec<RemoteFile>) =
            children.into_iter().partition(RemoteFile::is_dir);

        for file in files {
            ignore_missing(backend.remove_file(&file.path).await)?;
        }
        for child in dirs {
            remove_tree(backend, child.path).await?;
        }

        tracing::debug!("Removing directory {}", dir);
        ignore_missing(backend.remove_dir(&dir).await)
    })
}

/// Create `target` and any missing ancestors. Returns how many were created.
///
/// Ancestors are checked root first; everything below the first missing one
/// is created without further checks.
pub async fn make_directories<B>(backend: &B, target: &str) -> Result<usize>
where
    B: SftpBackend + ?Sized,
{
    let segments = path::ancestors(target);
    let mut first_missing = segments.len();

    for (idx, segment) in segments.iter().enumerate() {
        match backend.stat(segment, true).await? {
            Some(file) if file.is_dir() => continue,
            _ => {
                first_missing = idx;
                break;
            }
        }
    }

    for segment in &segments[first_missing..] {
        backend.create_dir(segment).await?;
    }

    let created = segments.len() - first_missing;
    if created > 0 {
        tracing::debug!("Created {} directories for {}", created, target);
    }
    Ok(created)
}

/// Rename `source` to `target`, returning the resolved destination.
///
/// A relative `target` lands beside `source`. An absolute one gets its parent
/// created first unless it is also `source`'s parent.
pub async fn move_file<B>(backend: &B, source: &str, target: &str) -> Result<String>
where
    B: SftpBackend + ?Sized,
{
    let destination = path::resolve_sibling(source, target);

    if path::is_absolute(target) {
        let dest_parent = path::parent(&destination);
        if dest_parent != path::parent(source) {
            if let Some(dir) = dest_parent {
                make_directories(backend, &dir).await?;
            }
        }
    }

    backend.rename(source, &destination).await?;
    tracing::debug!("Moved {} to {}", source, destination);
    Ok(destination)
}

enum Selection<'f> {
    Files {
        include_dirs: bool,
        filter: &'f (dyn Fn(&RemoteFile) -> bool + Send + Sync),
    },
    DirsOnly,
}

fn walk<'a, B>(
    backend: &'a B,
    dir: String,
    selection: &'a Selection<'a>,
    recursive: bool,
    out: &'a mut Vec<RemoteFile>,
) -> BoxFuture<'a, Result<()>>
where
    B: SftpBackend + ?Sized,
{
    Box::pin(async move {
        for child in backend.list(&dir).await? {
            if child.is_dir() {
                let include = match selection {
                    Selection::Files { include_dirs, .. } => *include_dirs,
                    Selection::DirsOnly => true,
                };
                let child_path = child.path.clone();
                if include {
                    out.push(child);
                }
                if recursive {
                    walk(backend, child_path, selection, recursive, out).await?;
                }
            } else if let Selection::Files { filter, .. } = selection {
                if filter(&child) {
                    out.push(child);
                }
            }
        }
        Ok(())
    })
}

pub async fn list_files<B>(
    backend: &B,
    dir: &str,
    recursive: bool,
    include_dirs: bool,
) -> Result<Vec<RemoteFile>>
where
    B: SftpBackend + ?Sized,
{
    list_files_filter(backend, dir, |_| true, recursive, include_dirs).await
}

pub async fn list_dirs<B>(backend: &B, dir: &str, recursive: bool) -> Result<Vec<RemoteFile>>
where
    B: SftpBackend + ?Sized,
{
    let mut out = Vec::new();
    walk(backend, dir.to_string(), &Selection::DirsOnly, recursive, &mut out).await?;
    Ok(out)
}

/// Non-directory entries passing `filter`, plus directories when `include_dirs`.
pub async fn list_files_filter<B, F>(
    backend: &B,
    dir: &str,
    filter: F,
    recursive: bool,
    include_dirs: bool,
) -> Result<Vec<RemoteFile>>
where
    B: SftpBackend + ?Sized,
    F: Fn(&RemoteFile) -> bool + Send + Sync,
{
    let selection = Selection::Files {
        include_dirs,
        filter: &filter,
    };
    let mut out = Vec::new();
    walk(backend, dir.to_string(), &selection, recursive, &mut out).await?;
    Ok(out)
}

/// Write everything `source` yields to `target`, replacing its content.
///
/// The caller keeps ownership of `source` and decides when to drop it.
pub async fn upload_file<B>(
    backend: &B,
    source: &mut (dyn AsyncRead + Unpin + Send),
    target: &str,
) -> Result<u64>
where
    B: SftpBackend + ?Sized,
{
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source);
    let written = backend.write(target, WriteSource::Stream(&mut reader)).await?;
    tracing::debug!("Uploaded {} bytes to {}", written, target);
    Ok(written)
}

/// Copy the remote file into `sink`. With `close_sink`, the sink is shut down afterwards.
pub async fn download_file<B>(
    backend: &B,
    source: &str,
    sink: &mut (dyn AsyncWrite + Unpin + Send),
    close_sink: bool,
) -> Result<u64>
where
    B: SftpBackend + ?Sized,
{
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, sink);
    let read = backend.transfer(source, &mut writer, 0, None).await?;
    writer.flush().await?;
    if close_sink {
        writer.shutdown().await?;
    }
    tracing::debug!("Downloaded {} bytes from {}", read, source);
    Ok(read)
}

/// Create `dir` when missing, without walking its ancestors.
async fn ensure_dir<B>(backend: &B, dir: &str) -> Result<()>
where
    B: SftpBackend + ?Sized,
{
    match backend.stat(dir, true).await? {
        Some(file) if file.is_dir() => Ok(()),
        _ => backend.create_dir(dir).await,
    }
}

struct LocalTree {
    dirs: Vec<String>,
    files: Vec<(PathBuf, String)>,
}

/// Walk `root`, returning directories (parents first) and files as `/`-joined suffixes.
fn scan_local_tree(root: &Path) -> std::io::Result<LocalTree> {
    let mut tree = LocalTree {
        dirs: Vec::new(),
        files: Vec::new(),
    };

    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let suffix = match entry.path().strip_prefix(root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => continue,
        };

        if entry.file_type().is_dir() {
            tree.dirs.push(suffix);
        } else if entry.path().is_file() {
            tree.files.push((entry.path().to_path_buf(), suffix));
        } else {
            tracing::debug!("Skipping {}: not a regular file", entry.path().display());
        }
    }

    Ok(tree)
}

/// Mirror a local directory tree under `remote_root`. Returns the number of files uploaded.
///
/// Every remote directory is created before the first file is written.
pub async fn upload_dir<B>(backend: &B, local_root: &Path, remote_root: &str) -> Result<usize>
where
    B: SftpBackend + ?Sized,
{
    let root = local_root.to_path_buf();
    let tree = tokio::task::spawn_blocking(move || scan_local_tree(&root))
        .await
        .map_err(|e| SessionError::State(format!("local directory walk failed: {}", e)))??;

    let remote_root = path::normalize(remote_root);
    make_directories(backend, &remote_root).await?;
    for dir in &tree.dirs {
        ensure_dir(backend, &path::join(&remote_root, dir)).await?;
    }

    for (local, suffix) in &tree.files {
        let mut file = tokio::fs::File::open(local).await?;
        upload_file(backend, &mut file, &path::join(&remote_root, suffix)).await?;
    }

    tracing::debug!(
        "Uploaded {} files and {} directories to {}",
        tree.files.len(),
        tree.dirs.len(),
        remote_root
    );
    Ok(tree.files.len())
}

fn local_path(root: &Path, suffix: &str) -> PathBuf {
    suffix
        .split(path::SEPARATOR)
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |acc, segment| acc.join(segment))
}

/// Mirror a remote directory tree under `local_root`. Returns the number of files downloaded.
pub async fn download_dir<B>(backend: &B, remote_root: &str, local_root: &Path) -> Result<usize>
where
    B: SftpBackend + ?Sized,
{
    let remote_root = path::normalize(remote_root);
    let root = backend
        .stat(&remote_root, true)
        .await?
        .ok_or_else(|| SftpError::no_such_file(&remote_root))?;
    if !root.is_dir() {
        return Err(SftpError::Failure {
            op: "download_dir",
            path: remote_root,
            message: "not a directory".to_string(),
        }
        .into());
    }

    tokio::fs::create_dir_all(local_root).await?;
    let entries = list_files(backend, &remote_root, true, true).await?;
    let (dirs, files): (Vec<RemoteFile>, Vec<RemoteFile>) =
        entries.into_iter().partition(RemoteFile::is_dir);

    for dir in &dirs {
        let suffix = relative_to(&remote_root, &dir.path)?;
        tokio::fs::create_dir_all(local_path(local_root, suffix)).await?;
    }

    let mut downloaded = 0;
    for file in &files {
        let suffix = relative_to(&remote_root, &file.path)?;
        let mut sink = tokio::fs::File::create(local_path(local_root, suffix)).await?;
        download_file(backend, &file.path, &mut sink, true).await?;
        downloaded += 1;
    }

    tracing::debug!("Downloaded {} files from {}", downloaded, remote_root);
    Ok(downloaded)
}

fn relative_to<'a>(root: &str, entry: &'a str) -> Result<&'a str> {
    path::strip_root(root, entry).ok_or_else(|| {
        SftpError::Failure {
            op: "download_dir",
            path: entry.to_string(),
            message: format!("listed outside of {}", root),
        }
        .into()
    })
}

/// Up to `len` bytes of `source` starting at `offset`.
pub async fn read<B>(backend: &B, source: &str, offset: u64, len: u64) -> Result<Vec<u8>>
where
    B: SftpBackend + ?Sized,
{
    let mut buf = Vec::new();
    backend.transfer(source, &mut buf, offset, Some(len)).await?;
    Ok(buf)
}

pub async fn read_to_end<B>(backend: &B, source: &str) -> Result<Vec<u8>>
where
    B: SftpBackend + ?Sized,
{
    let mut buf = Vec::new();
    backend.transfer(source, &mut buf, 0, None).await?;
    Ok(buf)
}

/// Collects bytes up to the first `\n`, then fails the write to end the transfer.
#[derive(Default)]
struct FirstLine {
    line: Vec<u8>,
    complete: bool,
}

impl AsyncWrite for FirstLine {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.complete {
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    this.line.extend_from_slice(&buf[..pos]);
                    this.complete = true;
                }
                None => {
                    this.line.extend_from_slice(buf);
                    return Poll::Ready(Ok(buf.len()));
                }
            }
        }
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Other,
            "first line complete",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// First line of `source` without its terminator, `None` for an empty file.
///
/// One transfer, cut short as soon as the line terminator arrives.
pub async fn read_line<B>(
    backend: &B,
    source: &str,
    encoding: &'static Encoding,
) -> Result<Option<String>>
where
    B: SftpBackend + ?Sized,
{
    let mut sink = FirstLine::default();
    match backend.transfer(source, &mut sink, 0, None).await {
        Ok(_) => {}
        Err(_) if sink.complete => {}
        Err(e) => return Err(e),
    }

    let FirstLine { mut line, complete } = sink;
    if !complete && line.is_empty() {
        return Ok(None);
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
    let (text, _, _) = encoding.decode(&line);
    Ok(Some(text.into_owned()))
}

pub async fn read_lines<B>(
    backend: &B,
    source: &str,
    encoding: &'static Encoding,
) -> Result<Vec<String>>
where
    B: SftpBackend + ?Sized,
{
    let data = read_to_end(backend, source).await?;
    let (text, _, _) = encoding.decode(&data);
    Ok(text
        .lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect())
}

fn recognize_stop(err: SessionError) -> SessionError {
    match err {
        SessionError::Io(e) => map_transfer_error(e),
        other => other,
    }
}

/// Download into `sink`, feeding `progress` per chunk and honoring `stop` between chunks.
pub async fn download_with_progress<B>(
    backend: &B,
    source: &str,
    sink: &mut (dyn AsyncWrite + Unpin + Send),
    progress: &TransferProgress,
    stop: Option<&TransferStop>,
) -> Result<u64>
where
    B: SftpBackend + ?Sized,
{
    let file = backend
        .stat(source, true)
        .await?
        .ok_or_else(|| SftpError::no_such_file(source))?;
    progress.set_end(file.size);
    progress.start();

    let mut writer = ProgressWriter::new(sink, progress.clone(), stop.cloned());
    let result = backend
        .transfer(source, &mut writer, 0, None)
        .await
        .map_err(recognize_stop);
    let result = match result {
        Ok(n) => writer.flush().await.map(|_| n).map_err(map_transfer_error),
        Err(e) => Err(e),
    };

    progress.finish(result.is_err());
    result
}

/// Upload from `source`, feeding `progress` per chunk and honoring `stop` between chunks.
pub async fn upload_with_progress<B>(
    backend: &B,
    source: &mut (dyn AsyncRead + Unpin + Send),
    target: &str,
    progress: &TransferProgress,
    stop: Option<&TransferStop>,
) -> Result<u64>
where
    B: SftpBackend + ?Sized,
{
    progress.start();
    let mut reader = ProgressReader::new(source, progress.clone(), stop.cloned());
    let result = backend
        .write(target, WriteSource::Stream(&mut reader))
        .await
        .map_err(recognize_stop);

    progress.finish(result.is_err());
    result
}
