//! Remote command execution.
//!
//! Runs one non-interactive command and drains stdout/stderr into the
//! registered handlers, either on the caller's task or in the background.

use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::error::{Result, SessionError};
use crate::ssh::channel::Channel;
use crate::ssh::executor::{
    drain, ChannelCore, CompletionCallback, ExecMode, Executor, ExecutorKind, ExecutorState,
    OutputHandler,
};
use crate::ssh::pty::PtyConfig;

/// Executor for a single non-interactive command.
pub struct CommandExecutor {
    command: String,
    core: ChannelCore,
    merge_stderr: bool,
    out_handler: Option<Box<dyn OutputHandler>>,
    err_handler: Option<Box<dyn OutputHandler>>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, channel: Box<dyn Channel>) -> Self {
        Self {
            command: command.into(),
            core: ChannelCore::new(ExecutorKind::Command, channel),
            merge_stderr: false,
            out_handler: None,
            err_handler: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Consumer for stdout (or the merged stream when stderr is inherited).
    pub fn set_handler(&mut self, handler: impl OutputHandler + 'static) -> &mut Self {
        self.out_handler = Some(Box::new(handler));
        self
    }

    /// Consumer for stderr. Without one, stderr is drained and dropped.
    pub fn set_error_handler(&mut self, handler: impl OutputHandler + 'static) -> &mut Self {
        self.err_handler = Some(Box::new(handler));
        self
    }

    /// Deliver stderr through the stdout handler, after stdout ends.
    pub fn inherit_stderr(&mut self) -> &mut Self {
        self.merge_stderr = true;
        self
    }

    /// Allocate a pseudo-terminal for the command. Must precede `connect`.
    pub fn set_pty(&mut self, pty: PtyConfig) -> &mut Self {
        self.core.channel.set_pty(pty);
        self
    }

    /// Called once when draining ends, with the error if it failed.
    pub fn on_complete(
        &mut self,
        callback: impl FnOnce(Option<&SessionError>) + Send + 'static,
    ) -> &mut Self {
        let callback: CompletionCallback = Box::new(callback);
        self.core.set_on_complete(callback);
        self
    }

    /// Runtime the asynchronous drain worker is spawned on.
    pub fn with_runtime(&mut self, runtime: Handle) -> &mut Self {
        self.core.set_runtime(runtime);
        self
    }

    /// Drain the command's output.
    ///
    /// In [`ExecMode::Sync`] this returns once output is fully drained; in
    /// [`ExecMode::Async`] it returns immediately and [`Self::wait`] yields
    /// the drain result.
    pub async fn exec(&mut self, mode: ExecMode) -> Result<()> {
        self.core.begin_exec(self.out_handler.is_some())?;

        let out_handler = self
            .out_handler
            .take()
            .ok_or_else(|| SessionError::State("no output handler configured".to_string()))?;
        let stdout = self
            .core
            .channel
            .take_stdout()
            .ok_or_else(|| SessionError::State("channel output stream unavailable".to_string()))?;
        let stderr = self.core.channel.take_stderr();

        tracing::debug!("Executing command: {}", self.command);
        let work = drain(
            stdout,
            stderr,
            self.merge_stderr,
            out_handler,
            self.err_handler.take(),
        );
        self.core.run(work, mode).await
    }

    /// Await an asynchronous drain. Returns immediately after a sync exec.
    pub async fn wait(&mut self) -> Result<()> {
        self.core.wait().await
    }

    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// Exit status, or `None` while the command may still be running.
    pub fn exit_code(&self) -> Option<u32> {
        self.core.channel.exit_status()
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Command
    }

    fn state(&self) -> ExecutorState {
        self.core.state()
    }

    async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.core.connect(timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        self.core.close().await
    }
}
