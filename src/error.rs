//! Error types and result handling for pg-river.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_river::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_transport() => eprintln!("Transport error: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// SQLSTATE reported when an object such as a replication slot already exists.
pub const DUPLICATE_OBJECT: &str = "42710";

/// SQLSTATE reported when an object such as a replication slot does not exist.
pub const UNDEFINED_OBJECT: &str = "42704";

/// The main error type for pg-river operations.
///
/// The variants follow the engine's recovery taxonomy: transport errors are
/// recovered by reconnecting, decode errors skip a single message, sink
/// errors requeue a batch and only configuration or startup errors stop a
/// stream from running.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically a missing or inconsistent setting.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration source could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O error on a socket, pipe or file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error when encoding records for a sink.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Unexpected message sequence on the PostgreSQL wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// ErrorResponse sent by the server.
    #[error("PostgreSQL error {code}: {message}")]
    Server {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Invalid or malformed replication frame.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A WAL change message or dump statement could not be decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the offending content
        message: String,
    },

    /// The historical snapshot could not be exported.
    #[error("Snapshot error: {message}")]
    Snapshot {
        /// Description of the failure
        message: String,
    },

    /// A sink rejected a batch.
    #[error("Sink '{sink}' error: {message}")]
    Sink {
        /// Name of the failing sink
        sink: String,
        /// Description of the failure
        message: String,
    },

    /// The dispatch scheduler is not accepting records.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the replication loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
        }
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }

    /// Whether the connection that produced this error must be considered dead.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Connection(_)
                | Error::Protocol(_)
                | Error::Server { .. }
                | Error::InvalidMessage { .. }
                | Error::Timeout { .. }
        )
    }

    /// Whether the server reported `duplicate_object` (e.g. slot already exists).
    pub fn is_duplicate_object(&self) -> bool {
        matches!(self, Error::Server { code, .. } if code == DUPLICATE_OBJECT)
    }

    pub fn is_undefined_object(&self) -> bool {
        matches!(self, Error::Server { code, .. } if code == UNDEFINED_OBJECT)
    }
}

/// A convenient Result type alias for pg-river operations.
///
/// This is equivalent to `std::result::Result<T, pg_river::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
