//! Error types for Mau.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::ResultCode;

/// Result type alias for Mau operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Mau.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("hostname resolution failed for {host}: {reason}")]
    ResolveFailed { host: String, reason: String },

    // Resource errors
    #[error("buffer pool exhausted")]
    AllocationFailed,

    // Lifecycle errors
    #[error("proxy already shut down")]
    Shutdown,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },
}

impl Error {
    /// Map an error onto the sticky façade result code.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Error::Config(_) | Error::InvalidConfig(_) => ResultCode::InvalidArgument,
            Error::Transport(TransportError::BindFailed { .. }) => ResultCode::BindFailed,
            Error::Transport(TransportError::DatagramTooLarge { .. }) => {
                ResultCode::InvalidArgument
            }
            Error::Transport(_) | Error::Io(_) | Error::Internal(_) => ResultCode::SendFailed,
            Error::ResolveFailed { .. } => ResultCode::ResolveFailed,
            Error::AllocationFailed => ResultCode::AllocationFailed,
            Error::Shutdown => ResultCode::Shutdown,
        }
    }

    /// Check if a send error is transient (peer ICMP noise rather than a
    /// broken socket).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
