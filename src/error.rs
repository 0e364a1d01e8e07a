//! Typed error hierarchy for riptide
//!
//! Errors carry a kind describing the failure class so callers can decide
//! between retrying (transport), dropping the offender (protocol/integrity)
//! and failing the torrent (storage).

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the swarm engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-level failure. Usually recoverable by retrying or redialing.
    #[error("transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        retryable: bool,
    },

    /// The remote side violated a protocol contract. The offender is dropped.
    #[error("protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// A piece failed hash verification.
    #[error("integrity error for piece {piece}: {message}")]
    Integrity { piece: u32, message: String },

    /// Filesystem/database failure. Fatal to the torrent.
    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Out of ports, file descriptors or similar. Refuse new work.
    #[error("resource exhausted: {resource}: {message}")]
    Resource {
        resource: &'static str,
        message: String,
    },

    /// Invalid input, rejected at add-time.
    #[error("invalid configuration for '{field}': {message}")]
    Config {
        field: &'static str,
        message: String,
    },

    /// The engine is shutting down.
    #[error("engine is shutting down")]
    Shutdown,
}

/// Transport error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset or closed by the remote
    ConnectionReset,
    /// Operation timed out
    Timeout,
    /// Server returned an error status
    HttpStatus(u16),
    /// Other network error
    Other,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Handshake did not complete in time
    HandshakeTimeout,
    /// Malformed handshake or info-hash mismatch
    BadHandshake,
    /// Peer wire protocol violation
    Violation,
    /// Invalid .torrent metainfo
    MalformedMetainfo,
    /// Invalid magnet URI
    InvalidMagnet,
    /// Bencode parsing error
    BencodeParse,
    /// Tracker returned an error or malformed response
    TrackerError,
    /// Webseed returned a malformed response
    WebseedError,
}

impl EngineError {
    /// Check if the failed operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Protocol { kind, .. } => {
                matches!(
                    kind,
                    ProtocolErrorKind::TrackerError | ProtocolErrorKind::WebseedError
                )
            }
            _ => false,
        }
    }

    /// Create a transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            TransportErrorKind::Timeout
                | TransportErrorKind::ConnectionReset
                | TransportErrorKind::ConnectionRefused
        );
        Self::Transport {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an integrity error for a piece
    pub fn integrity(piece: u32, message: impl Into<String>) -> Self {
        Self::Integrity {
            piece,
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn resource(resource: &'static str, message: impl Into<String>) -> Self {
        Self::Resource {
            resource,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
                TransportErrorKind::ConnectionReset
            }
            ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::Other,
        };
        Self::transport(kind, err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::ConnectionRefused
        } else if let Some(status) = err.status() {
            TransportErrorKind::HttpStatus(status.as_u16())
        } else {
            TransportErrorKind::Other
        };
        Self::transport(kind, err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::config("url", err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            message: format!("snapshot encoding: {}", err),
        }
    }
}
