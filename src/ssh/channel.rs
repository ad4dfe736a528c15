//! Channel transport.
//!
//! [`Channel`] is the seam between the executors and the wire: a duplex
//! endpoint with connect/disconnect, output streams and an exit-status slot.
//! [`RusshChannel`] implements it over a russh session channel.

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::ChannelMsg;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use crate::error::{Result, SessionError};
use crate::ssh::client::SessionHandle;
use crate::ssh::pty::PtyConfig;

/// Capacity of the in-process pipe between callers writing stdin and the driver task.
const STDIN_BUFFER: usize = 64 * 1024;

/// How long `disconnect` waits for the driver task to wind down before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A connected, bidirectional byte-stream endpoint.
///
/// Streams are handed out once: each `take_*` call after the first returns `None`.
#[async_trait]
pub trait Channel: Send {
    /// Open the channel and start the remote process.
    async fn connect(&mut self, timeout: Option<Duration>) -> Result<()>;

    /// Tear the channel down. Calling it again is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn take_stdout(&mut self) -> Option<BoxedReader>;

    /// Separate error stream. Interactive channels have none.
    fn take_stderr(&mut self) -> Option<BoxedReader>;

    fn take_stdin(&mut self) -> Option<BoxedWriter>;

    /// Terminal status of the remote process, `None` while it may still be running.
    fn exit_status(&self) -> Option<u32>;

    /// Request a pseudo-terminal. Only honored before `connect`.
    fn set_pty(&mut self, pty: PtyConfig);

    /// Change the pseudo-terminal size of a connected channel.
    async fn resize(&mut self, _pty: &PtyConfig) -> Result<()> {
        Err(SessionError::State(
            "channel does not support terminal resize".to_string(),
        ))
    }
}

/// Write-once slot the driver fills when the server reports an exit status.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExitSlot(Arc<OnceLock<u32>>);

impl ExitSlot {
    pub(crate) fn set(&self, status: u32) {
        let _ = self.0.set(status);
    }

    pub(crate) fn get(&self) -> Option<u32> {
        self.0.get().copied()
    }
}

/// Turn a queue of chunks into an `AsyncRead` that hits EOF once every sender is gone.
///
/// Unbounded, so the driver never stalls on a stream the caller
/// has not started reading yet.
pub(crate) fn queue_reader(rx: mpsc::UnboundedReceiver<Bytes>) -> BoxedReader {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
    });
    Box::pin(StreamReader::new(Box::pin(stream)))
}

/// What the channel runs once it is open.
#[derive(Debug, Clone)]
pub(crate) enum ChannelRequest {
    Exec { command: String },
    Shell,
}

enum Control {
    Resize(PtyConfig),
    Close,
}

/// Exec or shell channel over a russh session.
pub struct RusshChannel {
    session: Option<SessionHandle>,
    request: ChannelRequest,
    pty: Option<PtyConfig>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    stdin: Option<BoxedWriter>,
    control: Option<mpsc::UnboundedSender<Control>>,
    driver: Option<JoinHandle<()>>,
    exit: ExitSlot,
    connected: bool,
    closed: bool,
}

impl RusshChannel {
    pub(crate) fn new(session: Option<SessionHandle>, request: ChannelRequest) -> Self {
        Self {
            session,
            request,
            pty: None,
            stdout: None,
            stderr: None,
            stdin: None,
            control: None,
            driver: None,
            exit: ExitSlot::default(),
            connected: false,
            closed: false,
        }
    }

    async fn open(
        session: SessionHandle,
        request: ChannelRequest,
        pty: Option<PtyConfig>,
    ) -> Result<russh::Channel<russh::client::Msg>> {
        #[allow(unused_mut)]
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Connection(format!("Failed to open channel: {}", e)))?;

        if let Some(pty) = &pty {
            channel
                .request_pty(
                    true,
                    &pty.term,
                    pty.columns,
                    pty.rows,
                    pty.width_px,
                    pty.height_px,
                    &[],
                )
                .await
                .map_err(|e| SessionError::Connection(format!("Failed to request PTY: {}", e)))?;
        }

        match &request {
            ChannelRequest::Exec { command } => {
                channel.exec(true, command.as_bytes()).await.map_err(|e| {
                    SessionError::Connection(format!("Failed to execute command: {}", e))
                })?;
            }
            ChannelRequest::Shell => {
                channel.request_shell(true).await.map_err(|e| {
                    SessionError::Connection(format!("Failed to request shell: {}", e))
                })?;
            }
        }

        Ok(channel)
    }
}

#[async_trait]
impl Channel for RusshChannel {
    async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.connected || self.closed {
            return Err(SessionError::State("channel was already connected".to_string()));
        }

        let session = self
            .session
            .clone()
            .ok_or_else(|| SessionError::Connection("session is not connected".to_string()))?;

        let open = Self::open(session, self.request.clone(), self.pty.clone());
        let channel = match timeout {
            Some(limit) => tokio::time::timeout(limit, open)
                .await
                .map_err(|_| SessionError::Timeout(format!("opening channel after {:?}", limit)))??,
            None => open.await?,
        };

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let stderr_tx = match self.request {
            ChannelRequest::Exec { .. } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.stderr = Some(queue_reader(rx));
                Some(tx)
            }
            ChannelRequest::Shell => None,
        };
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stdin_writer, stdin_reader) = tokio::io::duplex(STDIN_BUFFER);

        self.stdout = Some(queue_reader(stdout_rx));
        self.stdin = Some(Box::pin(stdin_writer));
        self.control = Some(control_tx);
        self.driver = Some(tokio::spawn(drive(
            channel,
            stdin_reader,
            control_rx,
            stdout_tx,
            stderr_tx,
            self.exit.clone(),
        )));
        self.connected = true;

        tracing::debug!("Channel opened: {:?}", self.request);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.connected = false;

        self.stdin = None;
        self.stdout = None;
        self.stderr = None;

        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Close);
        }

        if let Some(driver) = self.driver.take() {
            let abort = driver.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, driver).await.is_err() {
                tracing::warn!("Channel driver did not stop in {:?}, aborting", CLOSE_GRACE);
                abort.abort();
            }
        }

        tracing::debug!("Channel closed");
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
        self.exit.get()
    }

    fn set_pty(&mut self, pty: PtyConfig) {
        if !self.connected {
            self.pty = Some(pty);
        }
    }

    async fn resize(&mut self, pty: &PtyConfig) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| SessionError::State("channel is not connected".to_string()))?;

        control
            .send(Control::Resize(pty.clone()))
            .map_err(|_| SessionError::State("channel is closed".to_string()))
    }
}

/// Pump one russh channel: stdin pipe to the server, server data into the output queues.
async fn drive(
    mut channel: russh::Channel<russh::client::Msg>,
    mut stdin: DuplexStream,
    mut control: mpsc::UnboundedReceiver<Control>,
    stdout: mpsc::UnboundedSender<Bytes>,
    stderr: Option<mpsc::UnboundedSender<Bytes>>,
    exit: ExitSlot,
) {
    let mut input_buf = vec![0u8; 32 * 1024];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = stdin.read(&mut input_buf), if stdin_open => {
                match result {
                    Ok(0) => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        if let Err(e) = channel.data(&input_buf[..n]).await {
                            tracing::debug!("Failed to send data: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("stdin pipe error: {}", e);
                        stdin_open = false;
                    }
                }
            }

            ctrl = control.recv() => {
                match ctrl {
                    Some(Control::Resize(pty)) => {
                        if let Err(e) = channel
                            .window_change(pty.columns, pty.rows, pty.width_px, pty.height_px)
                            .await
                        {
                            tracing::debug!("Window change failed: {}", e);
                        }
                    }
                    Some(Control::Close) | None => {
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let _ = stdout.send(Bytes::copy_from_slice(&data));
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        let chunk = Bytes::copy_from_slice(&data);
                        match (&stderr, ext) {
                            (Some(stderr), 1) => {
                                let _ = stderr.send(chunk);
                            }
                            _ => {
                                let _ = stdout.send(chunk);
                            }
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit.set(exit_status);
                    }
                    Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_reader_preserves_order_then_eof() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(b"hello ")).unwrap();
        tx.send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let mut reader = queue_reader(rx);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_exit_slot_is_write_once() {
        let slot = ExitSlot::default();
        assert_eq!(slot.get(), None);

        slot.set(3);
        slot.set(0);
        assert_eq!(slot.get(), Some(3));
    }

    #[tokio::test]
    async fn test_connect_without_session_is_connection_error() {
        let mut channel = RusshChannel::new(
            None,
            ChannelRequest::Exec {
                command: "true".to_string(),
            },
        );

        let err = channel.connect(None).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_noop() {
        let mut channel = RusshChannel::new(None, ChannelRequest::Shell);

        channel.disconnect().await.unwrap();
        channel.disconnect().await.unwrap();
        assert!(channel.is_closed());
        assert!(channel.take_stdout().is_none());
    }

    #[tokio::test]
    async fn test_resize_requires_connection() {
        let mut channel = RusshChannel::new(None, ChannelRequest::Shell);

        let err = channel.resize(&PtyConfig::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::State(_)));
    }
}
