//! Error type shared by every transfer component.
//!
//! Callers (the CLI, a GUI shell) only need [`TransferError::kind`] to pick
//! the status text they show; the variants carry the detail for logs.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Broad failure category, used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unexpected frame, bad length, version mismatch. Never retried.
    Protocol,
    /// Connect, handshake, read or write failure.
    Transport,
    /// Missing certificate or fingerprint mismatch. Needs an explicit re-trust.
    Trust,
    /// Destination escapes the download root.
    PathSafety,
    /// Cooperative cancellation.
    Cancelled,
    /// Settings or certificate provisioning.
    Settings,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected end of stream while reading protocol frame")]
    UnexpectedEof,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(i32),

    /// Error frame sent back by the receiving peer.
    #[error("Remote peer reported: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Trust validation failed: {0}")]
    Trust(String),

    #[error("Transfer path escapes the download directory: {0}")]
    PathEscape(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Protocol(_)
            | TransferError::UnexpectedEof
            | TransferError::UnsupportedVersion(_)
            | TransferError::Remote(_) => ErrorKind::Protocol,
            TransferError::Io(_) | TransferError::Tls(_) | TransferError::Timeout(_) => {
                ErrorKind::Transport
            }
            TransferError::Trust(_) => ErrorKind::Trust,
            TransferError::PathEscape(_) => ErrorKind::PathSafety,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Settings(_)
            | TransferError::Certificate(_)
            | TransferError::Json(_) => ErrorKind::Settings,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }
}

impl From<rcgen::Error> for TransferError {
    fn from(e: rcgen::Error) -> Self {
        TransferError::Certificate(e.to_string())
    }
}
