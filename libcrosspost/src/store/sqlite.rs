//! SQLite record store
//!
//! Each record is one row holding the JSON document plus the columns the
//! scheduler and listings filter on.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use super::RecordStore;
use crate::error::{Result, StoreError};
use crate::types::{PublishRecord, PublishStatus};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::IoError)?;
            }
        }

        // Forward slashes work for SQLite URLs on both Windows and Unix
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(StoreError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode(document: &str, version: i64) -> Result<PublishRecord> {
        let mut record: PublishRecord =
            serde_json::from_str(document).map_err(StoreError::Serialization)?;
        record.version = version as u64;
        Ok(record)
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert(&self, record: &PublishRecord) -> Result<()> {
        let document = serde_json::to_string(record).map_err(StoreError::Serialization)?;

        let result = sqlx::query(
            r#"
            INSERT INTO publish_records (id, owner_id, status, scheduled_at, version, document, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.owner_id)
        .bind(record.status.as_str())
        .bind(record.scheduled_at.map(|t| t.timestamp()))
        .bind(record.version as i64)
        .bind(document)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(record.id.clone()).into());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PublishRecord>> {
        let row = sqlx::query(
            r#"
            SELECT document, version FROM publish_records WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        row.map(|r| Self::decode(&r.get::<String, _>("document"), r.get("version")))
            .transpose()
    }

    async fn update(&self, record: &PublishRecord) -> Result<u64> {
        let next_version = record.version + 1;
        let mut stored = record.clone();
        stored.version = next_version;
        let document = serde_json::to_string(&stored).map_err(StoreError::Serialization)?;

        let result = sqlx::query(
            r#"
            UPDATE publish_records
            SET status = ?, scheduled_at = ?, version = ?, document = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.scheduled_at.map(|t| t.timestamp()))
        .bind(next_version as i64)
        .bind(document)
        .bind(&record.id)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        if result.rows_affected() == 0 {
            if self.get(&record.id).await?.is_none() {
                return Err(crate::error::CrosspostError::NotFound(record.id.clone()));
            }
            return Err(StoreError::VersionConflict {
                id: record.id.clone(),
                expected: record.version,
            }
            .into());
        }

        Ok(next_version)
    }

    async fn list_by_status(&self, status: PublishStatus) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT document, version FROM publish_records
            WHERE status = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        rows.iter()
            .map(|r| Self::decode(&r.get::<String, _>("document"), r.get("version")))
            .collect()
    }

    async fn list(&self) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT document, version FROM publish_records
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::SqlxError)?;

        rows.iter()
            .map(|r| Self::decode(&r.get::<String, _>("document"), r.get("version")))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrosspostError;
    use crate::store::modify;
    use crate::types::{Content, ErrorKind, PlatformOutcome};
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, SqliteStore) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("records.db");
        let store = SqliteStore::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, store)
    }

    fn record() -> PublishRecord {
        PublishRecord::new(
            42,
            Content {
                title: "Release notes".to_string(),
                body: "Version 2 is out".to_string(),
                media_refs: vec!["s3://bucket/cover.png".to_string()],
            },
            vec!["facebook".to_string(), "youtube".to_string()],
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_temp, store) = setup_test_db().await;
        let record = record();
        store.insert(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let (_temp, store) = setup_test_db().await;
        let record = record();
        store.insert(&record).await.unwrap();

        let err = store.insert(&record).await.unwrap_err();
        assert!(matches!(err, CrosspostError::Store(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let (_temp, store) = setup_test_db().await;
        let mut record = record();
        store.insert(&record).await.unwrap();

        record.per_platform_results.insert(
            "facebook".to_string(),
            PlatformOutcome::error(ErrorKind::RateLimited, "429".to_string(), 1, false),
        );
        assert_eq!(store.update(&record).await.unwrap(), 1);

        let err = store.update(&record).await.unwrap_err();
        assert!(matches!(
            err,
            CrosspostError::Store(StoreError::VersionConflict { .. })
        ));

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.per_platform_results.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let (_temp, store) = setup_test_db().await;
        let err = store.update(&record()).await.unwrap_err();
        assert!(matches!(err, CrosspostError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_column_tracks_document() {
        let (_temp, store) = setup_test_db().await;
        let record = record();
        store.insert(&record).await.unwrap();

        modify(&store, &record.id, |r| {
            r.scheduled_at = Some(chrono::Utc::now() + chrono::Duration::hours(1));
            r.transition(PublishStatus::Scheduled)?;
            Ok(true)
        })
        .await
        .unwrap();

        let scheduled = store.list_by_status(PublishStatus::Scheduled).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert!(store
            .list_by_status(PublishStatus::Draft)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("records.db");
        let record = record();

        {
            let store = SqliteStore::new(&db_path.to_string_lossy()).await.unwrap();
            store.insert(&record).await.unwrap();
        }

        let store = SqliteStore::new(&db_path.to_string_lossy()).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
