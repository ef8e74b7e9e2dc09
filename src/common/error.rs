//! Error types for the IPC transport
//!
//! Every transport operation returns [`Result`]; nothing panics across the
//! endpoint boundary. [`Error::code`] gives collaborators a stable status
//! string to log or map onto their own error reporting.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the transport
#[derive(Error, Debug)]
pub enum Error {
    // === Initialization Errors ===
    #[error("Permission denied while opening {channel}: {source}")]
    PermissionDenied {
        channel: String,
        #[source]
        source: io::Error,
    },

    #[error("{channel} is busy or exists with an incompatible mode: {source}")]
    ResourceBusy {
        channel: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create or attach {channel}: {source}")]
    ChannelCreate {
        channel: String,
        #[source]
        source: io::Error,
    },

    #[error("Device service is not running (no listener at {0})")]
    ServiceNotRunning(String),

    // === Transport Errors ===
    #[error("Failed to send message: {0}")]
    Send(#[source] io::Error),

    #[error("Failed to receive message: {0}")]
    Receive(#[source] io::Error),

    #[error("Peer closed the channel")]
    PeerClosed,

    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("No live connection for routing key {0}")]
    UnknownRoute(i64),

    #[error("Receive interrupted by a stop request")]
    Stopped,

    // === Logic Errors ===
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Endpoint is closed")]
    Closed,

    #[error("Cannot stop thread '{0}' from inside itself")]
    Reentrant(String),

    #[error("Thread '{thread}' did not exit within {timeout_ms} ms")]
    ShutdownTimeout { thread: String, timeout_ms: u64 },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify an OS error raised while creating or attaching a channel
    pub fn channel_init(channel: &str, source: io::Error) -> Self {
        let channel = channel.to_string();
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { channel, source },
            io::ErrorKind::AlreadyExists | io::ErrorKind::AddrInUse => {
                Self::ResourceBusy { channel, source }
            }
            _ => Self::ChannelCreate { channel, source },
        }
    }

    /// Stable status code for logs and collaborators
    pub fn code(&self) -> &'static str {
        match self {
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::ResourceBusy { .. } => "RESOURCE_BUSY",
            Error::ChannelCreate { .. } => "CHANNEL_CREATE_FAILED",
            Error::ServiceNotRunning(_) => "SERVICE_NOT_RUNNING",
            Error::Send(_) => "SEND_FAILED",
            Error::Receive(_) => "RECEIVE_FAILED",
            Error::PeerClosed => "PEER_CLOSED",
            Error::MalformedFrame { .. } => "MALFORMED_FRAME",
            Error::UnknownRoute(_) => "UNKNOWN_ROUTE",
            Error::Stopped => "STOPPED",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Closed => "CLOSED",
            Error::Reentrant(_) => "REENTRANT",
            Error::ShutdownTimeout { .. } => "SHUTDOWN_TIMEOUT",
            Error::Config(_) | Error::ConfigParse(_) | Error::FileRead { .. } => "CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for errors that mean the underlying channel is gone for good
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::PeerClosed | Error::Closed | Error::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_init_classifies_os_errors() {
        let err = Error::channel_init(
            "to-server queue",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.code(), "PERMISSION_DENIED");

        let err = Error::channel_init("pipe", io::Error::from(io::ErrorKind::AddrInUse));
        assert_eq!(err.code(), "RESOURCE_BUSY");

        let err = Error::channel_init("pipe", io::Error::from(io::ErrorKind::Other));
        assert_eq!(err.code(), "CHANNEL_CREATE_FAILED");
    }

    #[test]
    fn test_unsupported_is_distinct() {
        let err = Error::Unsupported("call while a callback is registered");
        assert_eq!(err.code(), "UNSUPPORTED");
        assert!(!err.is_disconnect());
    }
}
