//! Publish record persistence
//!
//! The store is the source of truth for every record. Writers never
//! overwrite blindly: `update` is a compare-and-swap on the record's
//! `version`, and [`modify`] wraps it in a read-mutate-write loop so
//! concurrent target completions on the same record each land exactly once.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CrosspostError, Result, StoreError};
use crate::types::{PublishRecord, PublishStatus};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// How many times [`modify`] re-reads after losing a race
const MAX_CAS_ATTEMPTS: usize = 32;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record; fails with `StoreError::Duplicate` if the id exists
    async fn insert(&self, record: &PublishRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<PublishRecord>>;

    /// Write `record` if the stored version still equals `record.version`
    ///
    /// Returns the new version. Fails with `StoreError::VersionConflict`
    /// when another writer got there first.
    async fn update(&self, record: &PublishRecord) -> Result<u64>;

    async fn list_by_status(&self, status: PublishStatus) -> Result<Vec<PublishRecord>>;

    async fn list(&self) -> Result<Vec<PublishRecord>>;
}

/// Apply `mutate` to the latest version of a record and write it back
///
/// `mutate` returns `Ok(false)` when it decided nothing needs changing; the
/// current record is then returned without a write. It may run several
/// times if other writers interleave, so it must only depend on the record
/// it is given.
pub async fn modify<F>(store: &dyn RecordStore, id: &str, mut mutate: F) -> Result<PublishRecord>
where
    F: FnMut(&mut PublishRecord) -> Result<bool> + Send,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut record = store
            .get(id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(id.to_string()))?;

        if !mutate(&mut record)? {
            return Ok(record);
        }

        match store.update(&record).await {
            Ok(version) => {
                record.version = version;
                return Ok(record);
            }
            Err(CrosspostError::Store(StoreError::VersionConflict { expected, .. })) => {
                debug!(record_id = %id, expected, "Lost write race, retrying");
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(StoreError::Contention(id.to_string()).into())
}
