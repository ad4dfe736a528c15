//! Chunked transfers with progress and throughput tracking.
//!
//! [`TransferProgress`] is a cloneable handle: the side moving bytes calls
//! [`TransferProgress::accept`] after every chunk while observers read the
//! counters. Cancellation is cooperative through [`TransferStop`], checked
//! between chunks.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};

/// Buffer size for single-file uploads and downloads.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Default chunk size for progress-tracked transfers.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Throughput sample, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    /// Bytes since the previous sample over the time since that sample.
    pub instant: f64,
    /// Bytes since `start()` over the time since `start()`.
    pub average: f64,
}

/// Receives a throughput sample after every accepted chunk.
pub trait RateSink: Send {
    fn on_rate(&mut self, rate: Rate);
}

impl<F> RateSink for F
where
    F: FnMut(Rate) + Send,
{
    fn on_rate(&mut self, rate: Rate) {
        self(rate)
    }
}

struct ProgressState {
    end: Option<u64>,
    moved: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
    error: bool,
    last_sample: Option<(Instant, u64)>,
    rate_sink: Option<Box<dyn RateSink>>,
}

/// Shared transfer counter.
#[derive(Clone)]
pub struct TransferProgress {
    state: Arc<Mutex<ProgressState>>,
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("TransferProgress")
            .field("end", &state.end)
            .field("moved", &state.moved)
            .field("started", &state.started.is_some())
            .field("finished", &state.finished.is_some())
            .field("error", &state.error)
            .finish()
    }
}

impl TransferProgress {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgressState {
                end: None,
                moved: 0,
                started: None,
                finished: None,
                error: false,
                last_sample: None,
                rate_sink: None,
            })),
        }
    }

    pub fn with_end(end: u64) -> Self {
        let progress = Self::new();
        progress.set_end(end);
        progress
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // A panicking rate sink must not wedge every later reader.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total size, once known. Clamps the counter if it already ran past.
    pub fn set_end(&self, end: u64) {
        let mut state = self.lock();
        state.end = Some(end);
        state.moved = state.moved.min(end);
    }

    pub fn set_rate_sink(&self, sink: impl RateSink + 'static) {
        self.lock().rate_sink = Some(Box::new(sink));
    }

    pub fn start(&self) {
        self.start_at(Instant::now());
    }

    pub(crate) fn start_at(&self, now: Instant) {
        let mut state = self.lock();
        if state.started.is_none() {
            state.started = Some(now);
            state.last_sample = Some((now, state.moved));
        }
    }

    /// Record `delta` more bytes. Starts the clock if needed; ignored after `finish`.
    pub fn accept(&self, delta: u64) {
        self.accept_at(delta, Instant::now());
    }

    pub(crate) fn accept_at(&self, delta: u64, now: Instant) {
        let mut state = self.lock();
        if state.finished.is_some() {
            return;
        }
        if state.started.is_none() {
            state.started = Some(now);
            state.last_sample = Some((now, state.moved));
        }

        let moved = state.moved.saturating_add(delta);
        state.moved = match state.end {
            Some(end) => moved.min(end),
            None => moved,
        };

        let (last_at, last_moved) = state.last_sample.unwrap_or((now, 0));
        let started = state.started.unwrap_or(now);
        let rate = Rate {
            instant: per_second(state.moved - last_moved.min(state.moved), now - last_at),
            average: per_second(state.moved, now - started),
        };
        state.last_sample = Some((now, state.moved));

        // The sink runs unlocked so it can read this tracker.
        let Some(mut sink) = state.rate_sink.take() else {
            return;
        };
        drop(state);
        sink.on_rate(rate);

        let mut state = self.lock();
        if state.rate_sink.is_none() {
            state.rate_sink = Some(sink);
        }
    }

    /// Terminal. The first call wins; later calls change nothing.
    pub fn finish(&self, error: bool) {
        let mut state = self.lock();
        if state.finished.is_none() {
            state.finished = Some(Instant::now());
            state.error = error;
        }
    }

    /// Zero the counter. Only allowed before the transfer starts.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock();
        if state.started.is_some() {
            return Err(SessionError::State(
                "cannot reset a transfer that has started".to_string(),
            ));
        }
        state.moved = 0;
        state.last_sample = None;
        Ok(())
    }

    pub fn moved(&self) -> u64 {
        self.lock().moved
    }

    pub fn end(&self) -> Option<u64> {
        self.lock().end
    }

    pub fn is_started(&self) -> bool {
        self.lock().started.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.lock().error
    }

    /// Time from `start()` to `finish()`, or to now while running.
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.lock();
        let started = state.started?;
        Some(state.finished.unwrap_or_else(Instant::now) - started)
    }

    /// Completion in percent, `None` while the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        let state = self.lock();
        state.end.map(|end| {
            if end == 0 {
                100.0
            } else {
                state.moved as f64 / end as f64 * 100.0
            }
        })
    }
}

fn per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        bytes as f64 / secs
    }
}

/// Cooperative stop flag shared between a transfer and whoever may cancel it.
#[derive(Debug, Clone, Default)]
pub struct TransferStop {
    stopped: Arc<AtomicBool>,
}

impl TransferStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Marker carried inside an `io::Error` when a stop request interrupts a transfer.
#[derive(Debug)]
struct StopRequested;

impl std::fmt::Display for StopRequested {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("transfer stopped")
    }
}

impl std::error::Error for StopRequested {}

fn stopped_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, StopRequested)
}

/// Map an io error from a progress-tracked transfer, recognizing stop requests.
pub(crate) fn map_transfer_error(err: io::Error) -> SessionError {
    if err.get_ref().is_some_and(|inner| inner.is::<StopRequested>()) {
        SessionError::Cancelled
    } else {
        SessionError::Io(err)
    }
}

/// Copy up to `limit` bytes from `reader` to `writer`, `chunk_size` at a time.
pub async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    limit: Option<u64>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;

    loop {
        let want = match limit {
            Some(limit) if total >= limit => break,
            Some(limit) => (limit - total).min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    Ok(total)
}

/// Counts bytes written through it and honors a stop flag before each write.
pub struct ProgressWriter<W> {
    inner: W,
    progress: TransferProgress,
    stop: Option<TransferStop>,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, progress: TransferProgress, stop: Option<TransferStop>) -> Self {
        Self {
            inner,
            progress,
            stop,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.stop.as_ref().is_some_and(TransferStop::is_stopped) {
            return Poll::Ready(Err(stopped_error()));
        }
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.progress.accept(*n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Counts bytes read through it and honors a stop flag before each read.
pub struct ProgressReader<R> {
    inner: R,
    progress: TransferProgress,
    stop: Option<TransferStop>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: TransferProgress, stop: Option<TransferStop>) -> Self {
        Self {
            inner,
            progress,
            stop,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.stop.as_ref().is_some_and(TransferStop::is_stopped) {
            return Poll::Ready(Err(stopped_error()));
        }
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.progress.accept(read as u64);
            }
        }
        poll
    }
}

/// A cancellable unit of work copying a reader into a writer.
pub struct TransferTask<R, W> {
    reader: R,
    writer: W,
    chunk_size: usize,
    progress: TransferProgress,
    stop: TransferStop,
}

impl<R, W> TransferTask<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, progress: TransferProgress) -> Self {
        Self {
            reader,
            writer,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress,
            stop: TransferStop::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_stop(mut self, stop: TransferStop) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> TransferStop {
        self.stop.clone()
    }

    pub fn progress(&self) -> TransferProgress {
        self.progress.clone()
    }

    /// Copy until EOF or a stop request; returns the bytes moved.
    pub async fn run(mut self) -> Result<u64> {
        self.progress.start();
        let result = self.copy().await;
        self.progress.finish(result.is_err());
        match &result {
            Ok(total) => tracing::debug!("Transfer finished: {} bytes", total),
            Err(e) => tracing::debug!("Transfer ended: {}", e),
        }
        result
    }

    pub fn spawn(self) -> JoinHandle<Result<u64>> {
        tokio::spawn(self.run())
    }

    async fn copy(&mut self) -> Result<u64> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            if self.stop.is_stopped() {
                return Err(SessionError::Cancelled);
            }
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.writer.write_all(&buf[..n]).await?;
            total += n as u64;
            self.progress.accept(n as u64);
        }

        self.writer.flush().await?;
        Ok(total)
    }
}
