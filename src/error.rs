//! Error types for kata-tunnel.

use thiserror::Error;

/// Main error type for kata-tunnel operations.
#[derive(Error, Debug)]
pub enum KataTunnelError {
    /// Transport dial or handshake failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Transport dial did not finish within the configured bound.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// Command channel could not be created on an open connection.
    #[error("channel error: {0}")]
    Channel(String),

    /// Local file rejected before any network action.
    #[error("file validation failed: {0}")]
    FileValidation(#[from] FileValidationError),

    /// Remote command finished with a non-zero exit status.
    #[error("remote command failed with exit status {exit_status}")]
    CommandFailed { exit_status: u32 },

    /// Channel closed before the remote command reported an exit status.
    #[error("channel closed before the command completed")]
    ChannelClosed,

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: crate::session::SessionState,
        to: crate::session::SessionState,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Discovery request or payload failure.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The requested platform is not listed by the world.
    #[error("platform not found: {0}")]
    PlatformNotFound(String),

    /// Configuration could not be loaded or is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Reasons a local file is refused for transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileValidationError {
    /// File does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Path names a directory.
    #[error("path is a directory: {0}")]
    IsDirectory(String),

    /// File name does not carry an accepted suffix.
    #[error("invalid file extension: {name} (expected one of {expected:?})")]
    InvalidExtension { name: String, expected: Vec<String> },

    /// File is at or above the size cutoff.
    #[error("file too large: {size} bytes (limit {max})")]
    TooLarge { size: u64, max: u64 },

    /// Metadata could not be read.
    #[error("cannot read file metadata: {0}")]
    Metadata(String),
}

impl From<russh::Error> for KataTunnelError {
    fn from(e: russh::Error) -> Self {
        KataTunnelError::Connection(e.to_string())
    }
}

impl From<reqwest::Error> for KataTunnelError {
    fn from(e: reqwest::Error) -> Self {
        KataTunnelError::Discovery(e.to_string())
    }
}

/// Convenience Result type for kata-tunnel operations.
pub type Result<T> = std::result::Result<T, KataTunnelError>;
