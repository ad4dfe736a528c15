//! PTY (pseudo-terminal) handling for interactive SSH sessions.
//!
//! A [`ShellExecutor`] keeps the remote shell's input open after `exec`, so
//! callers can keep sending keystrokes while a worker drains the output.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;

use crate::error::{Result, SessionError};
use crate::ssh::channel::{BoxedWriter, Channel};
use crate::ssh::executor::{
    drain, ChannelCore, CompletionCallback, ExecMode, Executor, ExecutorKind, ExecutorState,
    OutputHandler,
};

/// Ctrl-C.
const INTERRUPT: u8 = 0x03;
/// Ctrl-Z.
const SUSPEND: u8 = 0x1a;
const EXIT_COMMAND: &[u8] = b"exit\n";

/// Terminal type and geometry negotiated when the channel opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyConfig {
    pub term: String,
    pub columns: u32,
    pub rows: u32,
    #[serde(default)]
    pub width_px: u32,
    #[serde(default)]
    pub height_px: u32,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            columns: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

impl PtyConfig {
    pub fn new(term: impl Into<String>, columns: u32, rows: u32) -> Self {
        Self {
            term: term.into(),
            columns,
            rows,
            width_px: 0,
            height_px: 0,
        }
    }

    /// Size the PTY after the local terminal, falling back to 80x24.
    pub fn from_terminal() -> Self {
        let (width, height) = get_terminal_size();
        Self::new("xterm-256color", width as u32, height as u32)
    }

    pub fn with_pixels(mut self, width_px: u32, height_px: u32) -> Self {
        self.width_px = width_px;
        self.height_px = height_px;
        self
    }
}

/// Get current terminal size.
fn get_terminal_size() -> (u16, u16) {
    crossterm::terminal::size().unwrap_or((80, 24))
}

/// Executor for an interactive shell.
pub struct ShellExecutor {
    core: ChannelCore,
    pty: PtyConfig,
    handler: Option<Box<dyn OutputHandler>>,
    input: Option<BoxedWriter>,
}

impl ShellExecutor {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            core: ChannelCore::new(ExecutorKind::Shell, channel),
            pty: PtyConfig::default(),
            handler: None,
            input: None,
        }
    }

    /// Terminal to negotiate. Ignored once connected; use [`Self::resize`] then.
    pub fn set_pty(&mut self, pty: PtyConfig) -> &mut Self {
        self.pty = pty;
        self
    }

    pub fn pty(&self) -> &PtyConfig {
        &self.pty
    }

    pub fn set_handler(&mut self, handler: impl OutputHandler + 'static) -> &mut Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn on_complete(
        &mut self,
        callback: impl FnOnce(Option<&SessionError>) + Send + 'static,
    ) -> &mut Self {
        let callback: CompletionCallback = Box::new(callback);
        self.core.set_on_complete(callback);
        self
    }

    pub fn with_runtime(&mut self, runtime: Handle) -> &mut Self {
        self.core.set_runtime(runtime);
        self
    }

    /// Start draining the shell output. Input stays writable afterwards.
    pub async fn exec(&mut self, mode: ExecMode) -> Result<()> {
        self.core.begin_exec(self.handler.is_some())?;

        let handler = self
            .handler
            .take()
            .ok_or_else(|| SessionError::State("no output handler configured".to_string()))?;
        let output = self
            .core
            .channel
            .take_stdout()
            .ok_or_else(|| SessionError::State("channel output stream unavailable".to_string()))?;

        let work = drain(output, None, false, handler, None);
        self.core.run(work, mode).await
    }

    pub async fn wait(&mut self) -> Result<()> {
        self.core.wait().await
    }

    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.core.channel.exit_status()
    }

    /// Send raw bytes to the shell.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| SessionError::State("Shell executor is not connected".to_string()))?;
        input.write_all(data).await?;
        input.flush().await?;
        Ok(())
    }

    /// Send a command followed by a line feed.
    pub async fn write_line(&mut self, command: &str) -> Result<()> {
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.write(&line).await
    }

    pub async fn interrupt(&mut self) -> Result<()> {
        self.write(&[INTERRUPT]).await
    }

    pub async fn hang_up(&mut self) -> Result<()> {
        self.write(&[SUSPEND]).await
    }

    pub async fn exit(&mut self) -> Result<()> {
        self.write(EXIT_COMMAND).await
    }

    pub async fn resize(&mut self, columns: u32, rows: u32, width_px: u32, height_px: u32) -> Result<()> {
        self.core.ensure_connected()?;
        let pty = PtyConfig {
            columns,
            rows,
            width_px,
            height_px,
            ..self.pty.clone()
        };
        self.core.channel.resize(&pty).await?;
        self.pty = pty;
        Ok(())
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Shell
    }

    fn state(&self) -> ExecutorState {
        self.core.state()
    }

    async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.core.channel.set_pty(self.pty.clone());
        self.core.connect(timeout).await?;
        self.input = self.core.channel.take_stdin();
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.shutdown().await {
                tracing::debug!("Failed to shut down shell input: {}", e);
            }
        }
        self.core.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::executor::CollectHandler;
    use crate::ssh::testing::ScriptedChannel;

    #[test]
    fn test_get_terminal_size() {
        let (width, height) = get_terminal_size();
        // Should return some reasonable values
        assert!(width > 0);
        assert!(height > 0);
    }

    #[test]
    fn test_pty_config_defaults() {
        let pty = PtyConfig::default();
        assert_eq!(pty.term, "xterm-256color");
        assert_eq!((pty.columns, pty.rows), (80, 24));

        let pty = PtyConfig::new("vt100", 132, 43).with_pixels(640, 480);
        assert_eq!((pty.width_px, pty.height_px), (640, 480));
    }

    #[tokio::test]
    async fn test_connect_negotiates_pty() {
        let channel = ScriptedChannel::new(b"", b"", None);
        let negotiated = channel.pty_slot();
        let mut shell = ShellExecutor::new(Box::new(channel));
        shell.set_pty(PtyConfig::new("vt220", 100, 30));

        shell.connect(None).await.unwrap();

        assert_eq!(negotiated.lock().unwrap().as_ref().unwrap().term, "vt220");
    }

    #[tokio::test]
    async fn test_control_sequences_written_to_input() {
        let channel = ScriptedChannel::new(b"$ ", b"", None);
        let written = channel.stdin_buffer();
        let mut shell = ShellExecutor::new(Box::new(channel));
        shell.set_handler(CollectHandler::new());

        shell.connect(None).await.unwrap();
        shell.exec(ExecMode::Async).await.unwrap();
        shell.write_line("uptime").await.unwrap();
        shell.interrupt().await.unwrap();
        shell.hang_up().await.unwrap();
        shell.exit().await.unwrap();
        shell.wait().await.unwrap();

        assert_eq!(written.lock().unwrap().as_slice(), b"uptime\n\x03\x1aexit\n");
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let mut shell = ShellExecutor::new(Box::new(ScriptedChannel::new(b"", b"", None)));
        let err = shell.write(b"ls\n").await.unwrap_err();
        assert!(matches!(err, SessionError::State(_)));
    }

    #[tokio::test]
    async fn test_resize_updates_geometry() {
        let channel = ScriptedChannel::new(b"", b"", None);
        let negotiated = channel.pty_slot();
        let mut shell = ShellExecutor::new(Box::new(channel));
        shell.connect(None).await.unwrap();

        shell.resize(120, 40, 0, 0).await.unwrap();

        assert_eq!((shell.pty().columns, shell.pty().rows), (120, 40));
        assert_eq!(negotiated.lock().unwrap().as_ref().unwrap().columns, 120);
    }

    #[tokio::test]
    async fn test_exec_twice_and_close_twice() {
        let mut shell = ShellExecutor::new(Box::new(ScriptedChannel::new(b"", b"", None)));
        shell.set_handler(CollectHandler::new());
        shell.connect(None).await.unwrap();
        shell.exec(ExecMode::Sync).await.unwrap();

        shell.set_handler(CollectHandler::new());
        assert!(matches!(
            shell.exec(ExecMode::Sync).await,
            Err(SessionError::State(_))
        ));

        shell.close().await.unwrap();
        shell.close().await.unwrap();
        assert_eq!(shell.state(), ExecutorState::Closed);
    }
}
