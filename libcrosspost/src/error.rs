//! Error types for Crosspost

use std::time::Duration;

use thiserror::Error;

use crate::types::{ErrorKind, PublishStatus};

pub type Result<T> = std::result::Result<T, CrosspostError>;

/// Result type returned by platform adapters
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

#[derive(Error, Debug)]
pub enum CrosspostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Publish record not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: PublishStatus,
        to: PublishStatus,
    },

    #[error("Publish record {id} is being dispatched by {owner}")]
    Claimed { id: String, owner: String },

    #[error("Executor is shutting down")]
    ShuttingDown,
}

impl CrosspostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CrosspostError::Validation(_)
            | CrosspostError::NotFound(_)
            | CrosspostError::InvalidTransition { .. } => 3,
            CrosspostError::Config(_) => 2,
            CrosspostError::Platform(PlatformError::AuthExpired(_)) => 2,
            CrosspostError::Platform(_) => 1,
            CrosspostError::Store(_) => 1,
            CrosspostError::Claimed { .. } | CrosspostError::ShuttingDown => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record {id} was modified concurrently (expected version {expected})")]
    VersionConflict { id: String, expected: u64 },

    #[error("Record {0} already exists")]
    Duplicate(String),

    #[error("Record {0} kept changing underneath the writer")]
    Contention(String),
}

/// Failure reported by a platform adapter
///
/// Clone is required so per-target retry loops can keep the last error
/// around after the outcome has been written.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Credentials expired: {0}")]
    AuthExpired(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Content rejected: {0}")]
    Rejected(String),

    #[error("Outcome unknown: {0}")]
    Ambiguous(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl PlatformError {
    /// The persisted classification of this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::AuthExpired(_) => ErrorKind::AuthExpired,
            PlatformError::RateLimited { .. } => ErrorKind::RateLimited,
            PlatformError::Rejected(_) => ErrorKind::Rejected,
            PlatformError::Ambiguous(_) => ErrorKind::Ambiguous,
            PlatformError::Network(_) => ErrorKind::Transport,
            PlatformError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
        }
    }

    /// Whether another attempt may succeed
    ///
    /// Authentication, policy and registry failures are final; everything
    /// that looks like a transient condition on the wire is retried.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Delay requested by the platform before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
