//! Executor lifecycle shared by the command, shell and sftp executors.
//!
//! Every executor walks `Created -> Connected -> Executing -> Done -> Closed`
//! (sftp executors skip the exec states). Output draining runs as a task
//! whose completion hook fires exactly once, success or not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};
use crate::ssh::channel::{BoxedReader, Channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Command,
    Shell,
    Sftp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Connected,
    Executing,
    Done,
    Closed,
}

/// Whether `exec` drains output on the caller's task or a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Sync,
    Async,
}

/// Connection lifecycle common to all executor kinds.
#[async_trait]
pub trait Executor: Send {
    fn kind(&self) -> ExecutorKind;

    fn state(&self) -> ExecutorState;

    /// Connect the underlying channel. Allowed once.
    async fn connect(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Release streams and disconnect. Safe to call repeatedly.
    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ExecutorState::Connected | ExecutorState::Executing | ExecutorState::Done
        )
    }
}

/// Consumer of one output stream.
#[async_trait]
pub trait OutputHandler: Send {
    /// Read `stream` to completion.
    async fn handle(&mut self, stream: &mut (dyn AsyncRead + Send + Unpin)) -> std::io::Result<()>;
}

/// Calls back once per decoded line, without the line terminator.
pub struct LineHandler<F> {
    on_line: F,
    encoding: &'static encoding_rs::Encoding,
}

impl<F> LineHandler<F>
where
    F: FnMut(&str) + Send,
{
    pub fn new(on_line: F) -> Self {
        Self::with_encoding(on_line, encoding_rs::UTF_8)
    }

    pub fn with_encoding(on_line: F, encoding: &'static encoding_rs::Encoding) -> Self {
        Self { on_line, encoding }
    }
}

#[async_trait]
impl<F> OutputHandler for LineHandler<F>
where
    F: FnMut(&str) + Send,
{
    async fn handle(&mut self, stream: &mut (dyn AsyncRead + Send + Unpin)) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line.ends_with(b"\n") {
                line.pop();
                if line.ends_with(b"\r") {
                    line.pop();
                }
            }
            let (text, _, _) = self.encoding.decode(&line);
            (self.on_line)(&text);
        }

        Ok(())
    }
}

/// Buffers a whole stream; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CollectHandler {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CollectHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buffer.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }
}

#[async_trait]
impl OutputHandler for CollectHandler {
    async fn handle(&mut self, stream: &mut (dyn AsyncRead + Send + Unpin)) -> std::io::Result<()> {
        let mut local = Vec::new();
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            local.extend_from_slice(&chunk[..n]);
        }

        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(&local);
        }
        Ok(())
    }
}

/// Drains a stream nobody asked for so the peer never blocks on it.
pub(crate) struct DiscardHandler;

#[async_trait]
impl OutputHandler for DiscardHandler {
    async fn handle(&mut self, stream: &mut (dyn AsyncRead + Send + Unpin)) -> std::io::Result<()> {
        let discarded = tokio::io::copy(stream, &mut tokio::io::sink()).await?;
        if discarded > 0 {
            tracing::debug!("Discarded {} bytes of unhandled output", discarded);
        }
        Ok(())
    }
}

/// Completion callback; receives the drain error, if any.
pub type CompletionCallback = Box<dyn FnOnce(Option<&SessionError>) + Send>;

/// Fires the completion callback and raises `done` exactly once, even if the
/// drain task panics or is aborted.
struct CompletionGuard {
    callback: Option<CompletionCallback>,
    done: Arc<AtomicBool>,
}

impl CompletionGuard {
    fn fire(mut self, error: Option<&SessionError>) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(callback) = self.callback.take() {
            callback(error);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(callback) = self.callback.take() {
            callback(Some(&SessionError::State(
                "output drain ended abnormally".to_string(),
            )));
        }
    }
}

/// Read stdout (and stderr unless merged) to completion.
///
/// With `merge`, stderr is read after stdout ends; output is concatenated,
/// not interleaved.
pub(crate) fn drain(
    stdout: BoxedReader,
    stderr: Option<BoxedReader>,
    merge: bool,
    mut out_handler: Box<dyn OutputHandler>,
    err_handler: Option<Box<dyn OutputHandler>>,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let mut stdout = stdout;
        match stderr {
            Some(stderr) if merge => {
                let mut merged = stdout.chain(stderr);
                out_handler.handle(&mut merged).await?;
            }
            Some(mut stderr) => {
                let mut err_handler = err_handler.unwrap_or_else(|| Box::new(DiscardHandler));
                let (out, err) = tokio::join!(
                    out_handler.handle(&mut stdout),
                    err_handler.handle(&mut stderr)
                );
                out?;
                err?;
            }
            None => {
                out_handler.handle(&mut stdout).await?;
            }
        }
        Ok(())
    })
}

/// Channel ownership plus the connect-once / exec-once / close-many rules.
pub(crate) struct ChannelCore {
    kind: ExecutorKind,
    pub(crate) channel: Box<dyn Channel>,
    connected: bool,
    exec_called: bool,
    closed: bool,
    done: Arc<AtomicBool>,
    on_complete: Option<CompletionCallback>,
    runtime: Option<Handle>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ChannelCore {
    pub(crate) fn new(kind: ExecutorKind, channel: Box<dyn Channel>) -> Self {
        Self {
            kind,
            channel,
            connected: false,
            exec_called: false,
            closed: false,
            done: Arc::new(AtomicBool::new(false)),
            on_complete: None,
            runtime: None,
            task: None,
        }
    }

    pub(crate) fn set_on_complete(&mut self, callback: CompletionCallback) {
        self.on_complete = Some(callback);
    }

    pub(crate) fn set_runtime(&mut self, runtime: Handle) {
        self.runtime = Some(runtime);
    }

    pub(crate) fn state(&self) -> ExecutorState {
        if self.closed {
            ExecutorState::Closed
        } else if self.done.load(Ordering::SeqCst) {
            ExecutorState::Done
        } else if self.exec_called {
            ExecutorState::Executing
        } else if self.connected {
            ExecutorState::Connected
        } else {
            ExecutorState::Created
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_connected(&self) -> Result<()> {
        if self.closed {
            return Err(SessionError::State(format!("{:?} executor is closed", self.kind)));
        }
        if !self.connected {
            return Err(SessionError::State(format!(
                "{:?} executor is not connected",
                self.kind
            )));
        }
        Ok(())
    }

    pub(crate) async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.connected || self.closed {
            return Err(SessionError::State(format!(
                "{:?} executor can only be connected once",
                self.kind
            )));
        }
        self.channel.connect(timeout).await?;
        self.connected = true;
        tracing::debug!("{:?} executor connected", self.kind);
        Ok(())
    }

    /// Validate the exec preconditions. Must run before any stream is taken.
    pub(crate) fn begin_exec(&mut self, has_handler: bool) -> Result<()> {
        if self.exec_called {
            return Err(SessionError::State(format!(
                "{:?} executor was already executed",
                self.kind
            )));
        }
        self.ensure_connected()?;
        if !has_handler {
            return Err(SessionError::State("no output handler configured".to_string()));
        }
        self.exec_called = true;
        Ok(())
    }

    /// Run the drain either inline or on a worker, then fire the completion hook.
    pub(crate) async fn run(
        &mut self,
        work: BoxFuture<'static, Result<()>>,
        mode: ExecMode,
    ) -> Result<()> {
        let guard = CompletionGuard {
            callback: self.on_complete.take(),
            done: self.done.clone(),
        };
        let kind = self.kind;

        match mode {
            ExecMode::Sync => {
                let result = work.await;
                guard.fire(result.as_ref().err());
                tracing::debug!("{:?} executor drained (sync)", kind);
                result
            }
            ExecMode::Async => {
                let task = async move {
                    let result = work.await;
                    if let Err(e) = &result {
                        tracing::debug!("{:?} executor drain failed: {}", kind, e);
                    }
                    guard.fire(result.as_ref().err());
                    result
                };
                let handle = match &self.runtime {
                    Some(runtime) => runtime.spawn(task),
                    None => tokio::spawn(task),
                };
                self.task = Some(handle);
                Ok(())
            }
        }
    }

    /// Wait for an asynchronous drain to finish and return its outcome.
    pub(crate) async fn wait(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| SessionError::State(format!("output drain task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Dropping unclaimed streams releases them even if disconnect fails.
        drop(self.channel.take_stdout());
        drop(self.channel.take_stderr());
        drop(self.channel.take_stdin());

        let result = self.channel.disconnect().await;
        if let Err(e) = &result {
            tracing::warn!("Failed to disconnect {:?} channel: {}", self.kind, e);
        }
        tracing::debug!("{:?} executor closed", self.kind);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_line_handler_strips_terminators() {
        let mut lines = Vec::new();
        {
            let mut handler = LineHandler::new(|line: &str| lines.push(line.to_string()));
            let mut input = Cursor::new(b"one\r\ntwo\nthree".to_vec());
            handler.handle(&mut input).await.unwrap();
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_line_handler_decodes_charset() {
        let mut lines = Vec::new();
        {
            let mut handler = LineHandler::with_encoding(
                |line: &str| lines.push(line.to_string()),
                encoding_rs::WINDOWS_1252,
            );
            let mut input = Cursor::new(vec![b'c', b'a', b'f', 0xE9, b'\n']);
            handler.handle(&mut input).await.unwrap();
        }
        assert_eq!(lines, vec!["café"]);
    }

    #[tokio::test]
    async fn test_collect_handler_shares_buffer() {
        let collector = CollectHandler::new();
        let mut handler = collector.clone();
        let mut input = Cursor::new(b"payload".to_vec());
        handler.handle(&mut input).await.unwrap();

        assert_eq!(collector.text(), "payload");
    }

    #[tokio::test]
    async fn test_drain_merge_reads_stdout_first() {
        let collector = CollectHandler::new();
        let stdout: BoxedReader = Box::pin(Cursor::new(b"out\n".to_vec()));
        let stderr: BoxedReader = Box::pin(Cursor::new(b"err\n".to_vec()));

        drain(stdout, Some(stderr), true, Box::new(collector.clone()), None)
            .await
            .unwrap();
        assert_eq!(collector.text(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_drain_separate_streams() {
        let out = CollectHandler::new();
        let err = CollectHandler::new();
        let stdout: BoxedReader = Box::pin(Cursor::new(b"out".to_vec()));
        let stderr: BoxedReader = Box::pin(Cursor::new(b"err".to_vec()));

        drain(
            stdout,
            Some(stderr),
            false,
            Box::new(out.clone()),
            Some(Box::new(err.clone())),
        )
        .await
        .unwrap();
        assert_eq!(out.text(), "out");
        assert_eq!(err.text(), "err");
    }

    #[test]
    fn test_completion_guard_fires_on_drop() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));
        let seen = fired.clone();
        let guard = CompletionGuard {
            callback: Some(Box::new(move |err| {
                seen.lock().unwrap().push(err.is_some());
            })),
            done: done.clone(),
        };

        drop(guard);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(*fired.lock().unwrap(), vec![true]);
    }
}
