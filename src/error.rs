//! Error types and result handling for railgun.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into the classes the pipeline reacts to differently:
//! transient sink failures are absorbed by the dispatcher's retry loop and
//! never surface here, protocol and decode faults stop the current run,
//! configuration faults stop the process before streaming begins, and an
//! exhausted delivery budget halts the pipeline without advancing the
//! checkpoint.
//!
//! # Example
//!
//! ```rust
//! use railgun::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use crate::postgres::LogPosition;
use thiserror::Error;

/// The main error type for railgun operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection string could not be parsed by tokio-postgres.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding checkpoints or sink output.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from checkpoint file operations or the socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The replication connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// ErrorResponse sent by the server.
    #[error("Server error {code}: {message}")]
    Server {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Unexpected message or state on the replication protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A slot with the configured name exists but cannot be used.
    #[error("Replication slot '{slot}' conflicts: {reason}")]
    SlotConflict {
        /// Name of the slot
        slot: String,
        /// What made the existing slot incompatible
        reason: String,
    },

    /// A WAL payload the decoder could not interpret.
    #[error("Decode error at {position}: {message}")]
    Decode {
        /// Position of the offending WAL record
        position: LogPosition,
        /// Description of what was invalid
        message: String,
    },

    /// Begin/change/commit markers arrived out of order.
    #[error("Transaction assembly error: {0}")]
    Assembly(String),

    /// A source transaction grew beyond the configured event limit.
    #[error("Transaction {xid} exceeds the limit of {limit} change events")]
    TransactionTooLarge {
        /// Source transaction id
        xid: u32,
        /// Configured maximum number of change events
        limit: usize,
    },

    /// A sink kept asking for retries after its budget was spent.
    #[error("Sink '{sink}' failed to accept transaction at {position} after {attempts} attempts: {reason}")]
    DeliveryExhausted {
        /// Name of the sink
        sink: String,
        /// Commit position of the transaction
        position: LogPosition,
        /// Total number of delivery attempts
        attempts: u32,
        /// Reason given by the last Retry
        reason: String,
    },

    /// A sink reported an unrecoverable failure.
    #[error("Sink '{sink}' rejected transaction at {position}: {reason}")]
    SinkFatal {
        /// Name of the sink
        sink: String,
        /// Commit position of the transaction
        position: LogPosition,
        /// Reason given by the sink
        reason: String,
    },

    /// Checkpoint persistence failure.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// The other half of the stream buffer went away.
    #[error("Stream buffer closed")]
    BufferClosed,

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit blocking loops.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    pub(crate) fn decode(position: LogPosition, message: impl Into<String>) -> Self {
        Error::Decode {
            position,
            message: message.into(),
        }
    }

    /// Process exit code for a run that ended with this error.
    ///
    /// Configuration problems (including unparsable connection strings and
    /// slot conflicts, which are detected before streaming begins) exit
    /// with 2, every other fault with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) | Error::Postgres(_) | Error::SlotConflict { .. } => 2,
            _ => 1,
        }
    }
}

/// A convenient Result type alias for railgun operations.
///
/// This is equivalent to `std::result::Result<T, railgun::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
