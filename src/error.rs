//! Error types for the memcache client core.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the client core.
///
/// Every verb either fails synchronously (validation and lifecycle errors) or
/// delivers exactly one `Result<T>` to its completion handler. The variants
/// below cover both paths; [`Error::class`] tells them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed or missing arguments.
    ///
    /// Raised synchronously while the operation descriptor is being built,
    /// before anything is offloaded. Common causes:
    /// - Empty key, or a key longer than 250 bytes
    /// - Key contains whitespace or control characters (with `verify_key`)
    /// - Negative or out-of-range expiration
    ValidationError(String),

    /// Operation issued after [`Connection::close`](crate::Connection::close).
    ///
    /// No network call is made. The handler fires synchronously with this
    /// error; server management calls return it directly.
    ConnectionClosed,

    /// No endpoint is registered that could own the key.
    ///
    /// **Recovery:** Add a server with `add_server` and retry.
    NoServers,

    /// Key not found on the owning server.
    ///
    /// Returned by GET/GETS on a miss, by INCR/DECR/CAS on an absent key,
    /// and by DELETE when nothing was deleted.
    NotFound,

    /// The item was not stored.
    ///
    /// ADD on an existing key, or REPLACE/APPEND/PREPEND on an absent one.
    NotStored,

    /// CAS token mismatch: the item was modified since it was read.
    ///
    /// **Recovery:** Re-read with `gets` and retry the CAS.
    Exists,

    /// INCR/DECR against a value that is not a decimal counter.
    NonNumeric,

    /// Network or protocol failure reported by the backend.
    ///
    /// Common causes:
    /// - Connection refused or reset
    /// - Server marked dead
    /// - Protocol violation
    ///
    /// **Recovery:** Retry the operation or remove the failing server.
    BackendError(String),

    /// Operation exceeded the configured timeout threshold.
    ///
    /// The offloaded call is not interrupted; its late result is discarded.
    Timeout(String),

    /// Configuration error while creating or reconfiguring a connection.
    ///
    /// Common causes:
    /// - Invalid server list string
    /// - Port out of range
    /// - Removing a server that was never added
    ConfigError(String),

    /// Verb not supported by the selected backend.
    NotImplemented(String),

    /// A completion handler panicked.
    ///
    /// Only ever passed to the fatal-error channel
    /// ([`ConnectionMetrics::report_handler_panic`](crate::observability::ConnectionMetrics::report_handler_panic));
    /// never delivered to a handler.
    HandlerPanicked(String),

    /// Generic error with custom message.
    Other(String),
}

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad arguments, reported synchronously.
    Validation,
    /// Connection closed, reported synchronously.
    Lifecycle,
    /// No endpoint for the key, reported through the completion path.
    Resolution,
    /// Server status, network or protocol failure, reported through the completion path.
    Network,
    /// Panic inside a completion handler.
    Handler,
    /// Configuration and everything else.
    Other,
}

impl Error {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ValidationError(_) => ErrorClass::Validation,
            Error::ConnectionClosed => ErrorClass::Lifecycle,
            Error::NoServers => ErrorClass::Resolution,
            Error::NotFound
            | Error::NotStored
            | Error::Exists
            | Error::NonNumeric
            | Error::BackendError(_)
            | Error::Timeout(_) => ErrorClass::Network,
            Error::HandlerPanicked(_) => ErrorClass::Handler,
            Error::ConfigError(_) | Error::NotImplemented(_) | Error::Other(_) => {
                ErrorClass::Other
            }
        }
    }

    /// True for errors that are reported before any work is offloaded.
    pub fn is_synchronous(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Validation | ErrorClass::Lifecycle
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::NoServers => write!(f, "No servers defined"),
            Error::NotFound => write!(f, "Not found"),
            Error::NotStored => write!(f, "Not stored"),
            Error::Exists => write!(f, "Item exists (CAS mismatch)"),
            Error::NonNumeric => {
                write!(f, "Cannot increment or decrement non-numeric value")
            }
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::HandlerPanicked(msg) => write!(f, "Completion handler panicked: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ConfigError(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            Error::BackendError("offloaded operation panicked".to_string())
        } else {
            Error::Other(format!("offloaded operation cancelled: {}", e))
        }
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
