//! Error types for ringmaster

use std::fmt;

/// Result type alias for ringmaster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ringmaster
#[derive(Debug)]
pub enum Error {
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// The ring has no shards
    NoShardsAvailable,
    /// Shard did not respond (transient, retried with backoff)
    ShardUnreachable { shard_id: String, detail: String },
    /// Circuit open for this shard; requests fast-fail until a health check recovers
    ShardDegraded { shard_id: String },
    /// Shard not found
    ShardNotFound(String),
    /// Shard id already registered
    DuplicateShard(String),
    /// A migration overlapping the requested range is already in flight
    MigrationConflict { existing_job: String },
    /// Migration reached a terminal failure; operator intervention required
    MigrationFailed { reason: String },
    /// Migration job not found
    JobNotFound(String),
    /// A participant vetoed the transaction
    TransactionAborted { tx_id: String, reason: String },
    /// A participant was unresponsive during prepare
    TransactionTimeout { tx_id: String },
    /// Cancelled mid-flight; the operation may or may not have applied
    UnknownOutcome { operation: String },
    /// Stale generation (optimistic concurrency)
    StaleGeneration { expected: u64, actual: u64 },
    /// Durable-state conflict (CAS failure)
    Conflict,
    /// Too many retries
    TooManyRetries,
    /// Timeout
    Timeout,
    /// Internal error
    Internal(String),
}

impl Error {
    /// Transient errors are retried locally by the router; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ShardUnreachable { .. } | Error::Timeout)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::NoShardsAvailable => write!(f, "No shards available in the ring"),
            Error::ShardUnreachable { shard_id, detail } => {
                write!(f, "Shard {} unreachable: {}", shard_id, detail)
            }
            Error::ShardDegraded { shard_id } => {
                write!(f, "Shard {} is degraded; circuit open", shard_id)
            }
            Error::ShardNotFound(shard_id) => write!(f, "Shard not found: {}", shard_id),
            Error::DuplicateShard(shard_id) => {
                write!(f, "Shard already registered: {}", shard_id)
            }
            Error::MigrationConflict { existing_job } => {
                write!(f, "Range overlaps in-flight migration {}", existing_job)
            }
            Error::MigrationFailed { reason } => write!(f, "Migration failed: {}", reason),
            Error::JobNotFound(job_id) => write!(f, "Migration job not found: {}", job_id),
            Error::TransactionAborted { tx_id, reason } => {
                write!(f, "Transaction {} aborted: {}", tx_id, reason)
            }
            Error::TransactionTimeout { tx_id } => {
                write!(f, "Transaction {} timed out during prepare", tx_id)
            }
            Error::UnknownOutcome { operation } => {
                write!(f, "Unknown outcome for {}: cancelled mid-flight", operation)
            }
            Error::StaleGeneration { expected, actual } => {
                write!(f, "Stale generation: expected {}, got {}", expected, actual)
            }
            Error::Conflict => write!(f, "Durable-state conflict: concurrent modification detected"),
            Error::TooManyRetries => write!(f, "Too many retries: operation failed after maximum retry attempts"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
