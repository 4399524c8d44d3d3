//! In-memory record store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::RecordStore;
use crate::error::{Result, StoreError};
use crate::types::{PublishRecord, PublishStatus};

/// Record store backed by a `HashMap`, used by tests and embedders
/// that bring their own persistence
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, PublishRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: &PublishRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id.clone()).into());
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PublishRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, record: &PublishRecord) -> Result<u64> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| crate::error::CrosspostError::NotFound(record.id.clone()))?;

        if stored.version != record.version {
            return Err(StoreError::VersionConflict {
                id: record.id.clone(),
                expected: record.version,
            }
            .into());
        }

        let mut next = record.clone();
        next.version = record.version + 1;
        *stored = next;
        Ok(record.version + 1)
    }

    async fn list_by_status(&self, status: PublishStatus) -> Result<Vec<PublishRecord>> {
        let mut matching: Vec<PublishRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn list(&self) -> Result<Vec<PublishRecord>> {
        let mut all: Vec<PublishRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrosspostError;
    use crate::types::Content;

    fn record() -> PublishRecord {
        PublishRecord::new(
            1,
            Content {
                title: "t".to_string(),
                body: "b".to_string(),
                media_refs: vec![],
            },
            vec!["a".to_string()],
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let record = record();
        store.insert(&record).await.unwrap();

        assert_eq!(store.get(&record.id).await.unwrap(), Some(record));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let record = record();
        store.insert(&record).await.unwrap();

        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, CrosspostError::Store(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let record = record();
        store.insert(&record).await.unwrap();

        assert_eq!(store.update(&record).await.unwrap(), 1);

        // `record` still carries version 0
        let err = store.update(&record).await.unwrap_err();
        assert!(matches!(
            err,
            CrosspostError::Store(StoreError::VersionConflict { expected: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = MemoryStore::new();
        let draft = record();
        let mut scheduled = record();
        scheduled.status = PublishStatus::Scheduled;
        store.insert(&draft).await.unwrap();
        store.insert(&scheduled).await.unwrap();

        let found = store.list_by_status(PublishStatus::Scheduled).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, scheduled.id);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
