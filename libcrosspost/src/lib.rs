//! Crosspost - scheduled multi-platform publishing
//!
//! One piece of content, many social platforms. This library holds the
//! publish record state machine, the per-platform fan-out with retry and
//! backoff, the deferred-publish scheduler and the bounded executor that
//! runs dispatches off the request path. The `crosspost` CLI and the
//! `crosspost-send` daemon are thin layers over [`service::PublishService`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod logging;
pub mod platforms;
pub mod retry;
pub mod schedule_time;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{CrosspostError, PlatformError, Result};
pub use platforms::{Platform, PlatformRegistry};
pub use service::{PublishRequest, PublishService};
pub use store::{MemoryStore, RecordStore, SqliteStore};
pub use types::{ErrorKind, PlatformOutcome, PublishRecord, PublishStatus};
