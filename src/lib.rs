//! Remote session execution over SSH.
//!
//! A [`Session`] owns one authenticated SSH connection and hands out
//! executors for the three channel kinds it can open:
//!
//! - [`CommandExecutor`] - a single non-interactive command
//! - [`ShellExecutor`] - an interactive PTY shell
//! - [`SftpExecutor`] - file system operations over the sftp subsystem
//!
//! Large transfers report through [`TransferProgress`].

pub mod config;
pub mod error;
pub mod logging;
pub mod ssh;

pub use config::{AuthMethod, HostKeyPolicy, ProxyConfig, ProxyKind, SessionConfig};
pub use error::{Result, SessionError, SftpError};
pub use ssh::{
    Channel, CollectHandler, CommandExecutor, ExecMode, Executor, ExecutorKind, ExecutorState,
    FileKind, LineHandler, OutputHandler, PtyConfig, RemoteFile, Session, SftpBackend,
    SftpExecutor, ShellExecutor, StreamEntry, TransferProgress, TransferStop, TransferTask,
    WriteSource,
};
