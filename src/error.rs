use thiserror::Error;

/// Markers that identify a credential rejection in a connect failure message.
const AUTH_FAILURE_MARKERS: &[&str] = &["auth fail", "authentication failed", "permission denied"];

/// Marker used by SFTP servers for a missing path.
const NO_SUCH_FILE_MARKER: &str = "no such file";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SSH connection error: {0}")]
    Connection(String),

    #[error("SSH authentication error: {0}")]
    Authentication(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Contract violation: double exec, exec without a handler, exec before connect.
    #[error("Invalid executor state: {0}")]
    State(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Sftp(#[from] SftpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    SshProtocol(#[from] russh::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    /// Classify a connect failure by its message.
    ///
    /// Anything mentioning a credential rejection is reported as
    /// [`SessionError::Authentication`], everything else as
    /// [`SessionError::Connection`].
    pub fn classify_connect(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
            SessionError::Authentication(message)
        } else {
            SessionError::Connection(message)
        }
    }

    /// Whether this is the benign "no such file" SFTP condition.
    pub fn is_no_such_file(&self) -> bool {
        matches!(self, SessionError::Sftp(SftpError::NoSuchFile { .. }))
    }
}

/// Errors raised by SFTP primitives.
#[derive(Error, Debug)]
pub enum SftpError {
    /// The target path does not exist.
    #[error("No such file: {path}")]
    NoSuchFile { path: String },

    #[error("SFTP {op} failed for {path}: {message}")]
    Failure {
        op: &'static str,
        path: String,
        message: String,
    },
}

impl SftpError {
    /// Build an error from a transport failure message, recognizing the
    /// "no such file" pattern.
    pub fn classify(op: &'static str, path: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains(NO_SUCH_FILE_MARKER) {
            SftpError::NoSuchFile {
                path: path.to_string(),
            }
        } else {
            SftpError::Failure {
                op,
                path: path.to_string(),
                message,
            }
        }
    }

    pub fn no_such_file(path: &str) -> Self {
        SftpError::NoSuchFile {
            path: path.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
