//! Error types for void-desktop

use thiserror::Error;

/// Result type alias using void-desktop Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in void-desktop operations
#[derive(Error, Debug)]
pub enum Error {
    /// A command inside the sandbox exited with a non-zero status.
    ///
    /// This is the only kind the condition poller treats as transient.
    #[error("command `{command}` exited with code {exit_code}: {stderr}")]
    CommandExit {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Timeout waiting for a readiness condition
    #[error("Timeout: {0}")]
    Timeout(String),

    /// `start` called while a VNC server is already running
    #[error("Stream is already running")]
    StreamAlreadyRunning,

    /// URL requested before the stream was started
    #[error("Server is not running")]
    StreamNotRunning,

    /// Auth key requested but the stream was started without authentication
    #[error("Unable to retrieve stream auth key, check if require_auth is enabled")]
    AuthNotEnabled,

    /// Probe output did not match the expected pattern
    #[error("Failed to parse {what} from output: {output}")]
    Parse { what: &'static str, output: String },

    /// Sandbox platform errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream URL construction errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Whether a readiness probe may simply be retried after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::CommandExit { .. })
    }

    /// Exit code of a failed sandbox command, if that is what this error is.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::CommandExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}
