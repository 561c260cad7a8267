//! Error types for Geofetch

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for Geofetch operations
pub type Result<T> = std::result::Result<T, GeofetchError>;

/// How a failure should be treated by the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection broke; reconnecting and retrying may succeed
    Transient,
    /// Retrying would give the same outcome
    Permanent,
    /// The pools have been terminated
    Terminated,
}

/// The broken-connection signals that are worth a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Peer reset or closed the connection mid-exchange
    ConnectionReset,
    /// Writing the request failed because the peer went away
    BrokenPipe,
    /// The response did not start with a valid status line
    BadStatusLine,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionReset => "connection reset",
            Self::BrokenPipe => "broken pipe",
            Self::BadStatusLine => "bad status line",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in Geofetch
#[derive(Debug, Error)]
pub enum GeofetchError {
    /// URL is not an absolute http(s) URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Caller supplied a header that is not valid HTTP
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Acquisition attempted at or after connection pool termination
    #[error("Pool terminated, acquisition aborted")]
    PoolTerminated,

    /// Worker pool stopped while a request was waiting on it
    #[error("Worker pool closed")]
    PoolClosed,

    /// Could not open a connection to the host
    #[error("Failed to connect to {authority}: {source}")]
    Connect {
        /// Host and port that was dialed
        authority: String,
        /// Underlying socket or TLS error
        #[source]
        source: io::Error,
    },

    /// Connect or exchange did not finish in time
    #[error("Request to {authority} timed out after {after:?}")]
    Timeout {
        /// Host and port of the request
        authority: String,
        /// Timeout that expired
        after: Duration,
    },

    /// Connection broke in a way that a fresh connection may fix
    #[error("Broken connection ({kind}): {message}")]
    Transient {
        /// Which broken-connection signal was seen
        kind: TransientKind,
        /// Description from the transport
        message: String,
    },

    /// Server answered with a non-2xx status
    #[error("Server responded {status}: {reason}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Canonical reason phrase
        reason: String,
    },

    /// Response body exceeded the configured limit
    #[error("Response too large: exceeds limit of {limit} bytes")]
    ResponseTooLarge {
        /// Size limit
        limit: usize,
    },

    /// Protocol-level failure that is not a broken connection
    #[error("HTTP error: {0}")]
    Http(String),

    /// Response text was blank or not valid JSON
    #[error("Failed to decode JSON: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl GeofetchError {
    /// Classify this error for the retry policy
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { .. } => FailureKind::Transient,
            Self::PoolTerminated | Self::PoolClosed => FailureKind::Terminated,
            _ => FailureKind::Permanent,
        }
    }

    /// Build a transient error
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }
}
