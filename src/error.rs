//! Error types for the relay core

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// WebSocket frame decoding errors
///
/// Every variant is fatal for the connection that produced it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Client frame is not masked")]
    Unmasked,

    #[error("64-bit payload length is not supported")]
    PayloadTooLarge,

    #[error("Frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Multipart upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Not an upload path")]
    NotUploadPath,

    #[error("Request header block is incomplete")]
    IncompleteHeaders,

    #[error("Multipart boundary not found")]
    MissingBoundary,

    #[error("Boundary longer than {0} bytes")]
    BoundaryTooLong(usize),

    #[error("Content-Disposition filename not found")]
    MissingFilename,

    #[error("Filename longer than {0} bytes")]
    FilenameTooLong(usize),

    #[error("Cannot create {path}: {source}")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    /// Whether more request bytes might still fix the error
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::IncompleteHeaders | Self::MissingBoundary)
    }

    /// HTTP status reported to the client
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Storage { .. } => 500,
            _ => 400,
        }
    }
}

/// Remote relay (Icecast) errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay target is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("Connection to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to send login request: {0}")]
    SendFailed(String),

    #[error("No reply from relay server after {0} polls")]
    NoReply(u32),

    #[error("Connection to {0} closed during the handshake")]
    Closed(String),

    #[error("No stream header within {0} ms")]
    HeaderTimeout(u64),

    #[error("A connection attempt is already in progress")]
    InProgress,

    #[error("Connect worker failed: {0}")]
    Worker(String),

    #[error("Connection table is full")]
    TableFull,
}

/// Connection table errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("All {0} connection slots are in use")]
    TableFull(usize),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
