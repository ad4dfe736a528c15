//! SSH session and executors.
//!
//! ## Modules
//!
//! - [`client`] - session connect, authentication and executor factories
//! - [`channel`] - the channel seam and its russh implementation
//! - [`executor`] - lifecycle shared by all executors, output handlers
//! - [`exec`] - non-interactive command execution
//! - [`pty`] - interactive shell sessions
//! - [`sftp`] - SFTP primitives and recursive file operations
//! - [`transfer`] - chunked transfers with progress and throughput
//! - [`proxy`] - HTTP and SOCKS tunnels for the transport

pub mod channel;
mod client;
mod exec;
pub mod executor;
pub mod proxy;
mod pty;
pub mod sftp;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for public API
pub use channel::{BoxedReader, BoxedWriter, Channel, RusshChannel};
pub use client::{ClientHandler, Session};
pub use exec::CommandExecutor;
pub use executor::{
    CollectHandler, CompletionCallback, ExecMode, Executor, ExecutorKind, ExecutorState,
    LineHandler, OutputHandler,
};
pub use pty::{PtyConfig, ShellExecutor};
pub use sftp::{FileKind, RemoteFile, RusshSftp, SftpBackend, SftpExecutor, StreamEntry, WriteSource};
pub use transfer::{Rate, RateSink, TransferProgress, TransferStop, TransferTask};
