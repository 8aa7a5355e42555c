//! # Error Types
//!
//! Error taxonomy for the secure transport core.
//!
//! This module defines all error variants that can occur while driving a
//! connection, from low-level socket failures to protocol-level rejections.
//!
//! ## Error Categories
//! - **Transport Errors**: socket failures, closed/lost connections
//! - **Handshake Errors**: bad hello messages, AEAD failures, pinned
//!   certificate mismatch
//! - **Request Errors**: per-query server rejections and timeouts
//! - **Lifecycle Errors**: logout, pairing failures, the expected
//!   post-pairing restart
//!
//! Handshake and framing errors are always fatal to the connection and are
//! never retried internally; query-scoped errors (`RequestFailed`, `Timeout`)
//! never close the connection by themselves.

use std::io;
use thiserror::Error;

/// Primary error type for all transport operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    Websocket(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("certificate issuer serial mismatch")]
    CertificateMismatch,

    #[error("AEAD authentication failed")]
    Crypto,

    #[error("frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("request failed with code {code}: {text}")]
    RequestFailed { code: u16, text: String },

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection lost")]
    ConnectionLost,

    #[error("logged out by server")]
    LoggedOut,

    #[error("restart required")]
    RestartRequired,

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using `ClientError`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Cloneable classification of why a connection ended.
///
/// Connection teardown happens on a background task, so the causing
/// [`ClientError`] is reduced to this summary and published with the terminal
/// `Closed` state update. A supervisor decides whether to reconnect based on
/// this value; the core never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The socket closed or was closed locally.
    ConnectionClosed,
    /// The keepalive watchdog observed no traffic for too long.
    ConnectionLost,
    /// The server invalidated our credentials.
    LoggedOut,
    /// Expected disconnect after a successful pairing; reconnect with the
    /// newly registered identity.
    RestartRequired,
    /// The handshake failed before the channel was established.
    Handshake(String),
    /// Device pairing failed.
    Pairing(String),
    /// Any other transport-level failure.
    Transport(String),
}

impl DisconnectReason {
    /// Rebuild a `ClientError` from the summary, for callers awaiting a
    /// state change that instead saw the connection close.
    pub fn to_error(&self) -> ClientError {
        match self {
            Self::ConnectionClosed => ClientError::ConnectionClosed,
            Self::ConnectionLost => ClientError::ConnectionLost,
            Self::LoggedOut => ClientError::LoggedOut,
            Self::RestartRequired => ClientError::RestartRequired,
            Self::Handshake(msg) => ClientError::HandshakeFailed(msg.clone()),
            Self::Pairing(msg) => ClientError::PairingFailed(msg.clone()),
            Self::Transport(msg) => ClientError::Websocket(msg.clone()),
        }
    }
}

impl From<&ClientError> for DisconnectReason {
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::ConnectionLost | ClientError::Timeout => Self::ConnectionLost,
            ClientError::LoggedOut => Self::LoggedOut,
            ClientError::RestartRequired => Self::RestartRequired,
            ClientError::HandshakeFailed(msg) => Self::Handshake(msg.clone()),
            ClientError::CertificateMismatch => {
                Self::Handshake("certificate issuer serial mismatch".into())
            }
            ClientError::PairingFailed(msg) => Self::Pairing(msg.clone()),
            ClientError::Io(e) => Self::Transport(e.to_string()),
            ClientError::Websocket(msg) => Self::Transport(msg.clone()),
            _ => Self::ConnectionClosed,
        }
    }
}
