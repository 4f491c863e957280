//! Error types for the Wehe client.

use std::io;

use thiserror::Error;

/// Result type alias for Wehe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Wehe client.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("test catalog error: {0}")]
    Catalog(String),

    #[error("invalid trace: {0}")]
    InvalidTrace(String),

    // Bootstrap errors
    #[error("DNS lookup for {host} failed: {reason}")]
    Dns { host: String, reason: String },

    #[error("initialized only {connected}/{wanted} MLab servers; errors:\n{}", .errors.join("\n"))]
    MLabUnavailable {
        connected: usize,
        wanted: usize,
        errors: Vec<String>,
    },

    #[error("must connect to MLab to run more than one concurrent test; currently connected to {0}")]
    SingleServerOnly(String),

    #[error("GET {url} failed with status {status}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    // Side-channel errors
    #[error("side channel error: {0}")]
    SideChannel(String),

    #[error("malformed server reply: {0}")]
    ProtocolMismatch(String),

    #[error("permission denied: {0}")]
    PermissionDenied(#[from] PermissionError),

    // Data-plane errors
    #[error("replay I/O error: {0}")]
    ReplayIo(String),

    // Carriers for external failures
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a server refuses `Ask4Permission` or `DeclareReplay`.
///
/// The numeric codes arrive in the second field of a `"1;<code>"` reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("replay requested does not exist on server")]
    UnknownReplay,

    #[error("a client with this IP is already connected; try again later")]
    IpInUse,

    #[error("server is low on resources; try again later")]
    LowResources,

    #[error("unable to determine server resources; try again later")]
    ResourceLookupFailed,

    #[error("unknown server error: {0}")]
    Unrecognized(String),
}

impl PermissionError {
    /// Maps the wire code from a permission denial to its meaning.
    pub fn from_code(code: &str) -> Self {
        match code {
            "1" => Self::UnknownReplay,
            "2" => Self::IpInUse,
            "3" => Self::LowResources,
            "4" => Self::ResourceLookupFailed,
            other => Self::Unrecognized(other.to_string()),
        }
    }
}
