//! Service layer for Crosspost
//!
//! `PublishService` is the single entry point used by the CLI and the
//! daemon. It owns the record store, the platform registry, the scheduler,
//! the executor and the event bus, and implements the inbound operations on
//! top of them.
//!
//! # Example
//!
//! ```no_run
//! use libcrosspost::service::{PublishRequest, PublishService};
//! use libcrosspost::Config;
//!
//! # async fn example() -> libcrosspost::Result<()> {
//! let service = PublishService::from_config(Config::load()?).await?;
//!
//! let id = service
//!     .create_publish(PublishRequest {
//!         owner_id: 1,
//!         title: "Launch day".to_string(),
//!         body: "We are live".to_string(),
//!         targets: vec!["facebook".to_string(), "youtube".to_string()],
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! let record = service.await_settled(&id).await?;
//! println!("{}: {}", record.id, record.status);
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::events::{Event, EventBus, EventReceiver};
use crate::config::{Config, ExecutorConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{CrosspostError, Result};
use crate::executor::Executor;
use crate::platforms::PlatformRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::store::{modify, RecordStore, SqliteStore};
use crate::types::{Content, Metrics, PublishRecord, PublishStatus};

/// How often `await_settled` re-reads storage when no event arrives
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Input for creating a publish record or replacing a draft
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub owner_id: i64,
    pub title: String,
    pub body: String,
    pub media_refs: Vec<String>,
    pub targets: Vec<String>,
    /// Absent or in the past means publish immediately
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Store without publishing
    pub draft: bool,
}

impl PublishRequest {
    fn content(&self) -> Content {
        Content {
            title: self.title.clone(),
            body: self.body.clone(),
            media_refs: self.media_refs.clone(),
        }
    }
}

/// Metrics lookup for one successfully published target
#[derive(Debug, Clone, Serialize)]
pub struct TargetMetrics {
    pub platform: String,
    pub remote_id: String,
    pub metrics: Option<Metrics>,
    pub error: Option<String>,
}

struct Driver {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct PublishService {
    store: Arc<dyn RecordStore>,
    registry: Arc<PlatformRegistry>,
    scheduler: Scheduler,
    executor: Executor,
    events: EventBus,
    driver: Mutex<Option<Driver>>,
}

impl PublishService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: PlatformRegistry,
        executor_config: &ExecutorConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let events = EventBus::default();
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            RetryPolicy::from_config(executor_config),
            events.clone(),
        );
        let executor = Executor::new(
            dispatcher,
            Arc::clone(&store),
            executor_config.workers,
            events.clone(),
        );

        Self {
            store,
            registry,
            scheduler: Scheduler::new(),
            executor,
            events,
            driver: Mutex::new(None),
        }
    }

    /// Open the SQLite store and build adapters from `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated, or if
    /// a platform adapter cannot be built.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = SqliteStore::new(&config.storage.path).await?;
        let registry = PlatformRegistry::from_config(&config)?;
        Ok(Self::new(Arc::new(store), registry, &config.executor))
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Restore pending work from storage and start the scheduler driver
    ///
    /// Records left in `publishing` by an interrupted run are resubmitted;
    /// targets that already succeeded are not attempted again. Calling
    /// `start` twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        if driver.is_some() {
            return Ok(());
        }

        let pending = self.scheduler.restore(self.store.as_ref()).await?;
        let resumed = self.resume_interrupted().await?;

        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.scheduler.clone().run(self.executor.clone(), stop_rx));
        *driver = Some(Driver { stop, handle });

        info!(
            scheduled = pending,
            resumed,
            "Publish service started"
        );
        Ok(())
    }

    /// Submit every `publishing` record nobody holds a live claim on
    ///
    /// Covers runs interrupted in this process or in another one sharing
    /// the store. Returns how many records were submitted.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let now = Utc::now();
        let owner = self.executor.owner();
        let mut submitted = 0;

        for record in self.store.list_by_status(PublishStatus::Publishing).await? {
            if record.leased_to_other(owner, now) {
                debug!(
                    record_id = %record.id,
                    claimed_by = ?record.claimed_by,
                    "Claimed elsewhere"
                );
                continue;
            }
            if self.executor.submit(&record.id)? {
                submitted += 1;
            }
        }
        Ok(submitted)
    }

    /// Re-read `scheduled` records from storage
    ///
    /// Picks up records scheduled or cancelled by another process.
    pub async fn resync(&self) -> Result<usize> {
        self.scheduler.restore(self.store.as_ref()).await
    }

    /// Create a publish record and route it
    ///
    /// Drafts are only stored. A `scheduled_at` in the future registers the
    /// record with the scheduler; otherwise it goes straight to the
    /// executor.
    ///
    /// # Errors
    ///
    /// `Validation` for empty or unknown targets and empty content; nothing
    /// is stored in that case.
    pub async fn create_publish(&self, request: PublishRequest) -> Result<String> {
        validation::validate_request(&request, &self.registry)?;

        let mut record =
            PublishRecord::new(request.owner_id, request.content(), request.targets.clone());
        let now = Utc::now();

        match request.scheduled_at {
            _ if request.draft => {
                self.store.insert(&record).await?;
                info!(record_id = %record.id, "Draft saved");
            }
            Some(at) if at > now => {
                record.scheduled_at = Some(at);
                record.transition(PublishStatus::Scheduled)?;
                self.store.insert(&record).await?;
                self.scheduler.schedule(&record.id, at);
                info!(record_id = %record.id, at = %at, "Publish scheduled");
                self.events.emit(Event::PublishScheduled {
                    record_id: record.id.clone(),
                    at,
                });
            }
            _ => {
                self.store.insert(&record).await?;
                self.executor.submit(&record.id)?;
            }
        }

        Ok(record.id)
    }

    /// Replace the content and targets of a draft
    pub async fn update_draft(&self, id: &str, request: PublishRequest) -> Result<PublishRecord> {
        validation::validate_request(
            &PublishRequest {
                draft: true,
                scheduled_at: None,
                ..request.clone()
            },
            &self.registry,
        )?;
        let replacement = PublishRecord::new(request.owner_id, request.content(), request.targets);

        let record = modify(self.store.as_ref(), id, |record| {
            if record.status != PublishStatus::Draft {
                return Err(CrosspostError::Validation(format!(
                    "Only drafts can be edited; {} is {}",
                    record.id, record.status
                )));
            }
            record.title = replacement.title.clone();
            record.body = replacement.body.clone();
            record.media_refs = replacement.media_refs.clone();
            record.targets = replacement.targets.clone();
            record.updated_at = Utc::now();
            Ok(true)
        })
        .await?;

        debug!(record_id = %id, "Draft updated");
        Ok(record)
    }

    /// Hand a draft or scheduled record to the executor right away
    pub async fn publish_now(&self, id: &str) -> Result<()> {
        let record = self.get_publish(id).await?;

        match record.status {
            PublishStatus::Draft => {}
            PublishStatus::Scheduled => {
                // Not pending here when another process holds the entry
                let _ = self.scheduler.cancel(id);
                let now = Utc::now();
                modify(self.store.as_ref(), id, |record| {
                    match record.status {
                        PublishStatus::Scheduled => {
                            record.scheduled_at = Some(now);
                            record.updated_at = now;
                            Ok(true)
                        }
                        // Already fired; the running job is enough
                        PublishStatus::Publishing => Ok(false),
                        status => Err(CrosspostError::InvalidTransition {
                            from: status,
                            to: PublishStatus::Publishing,
                        }),
                    }
                })
                .await?;
            }
            status => {
                return Err(CrosspostError::InvalidTransition {
                    from: status,
                    to: PublishStatus::Publishing,
                })
            }
        }

        self.executor.submit(id)?;
        Ok(())
    }

    /// Set a new publish time for a draft or scheduled record
    pub async fn reschedule(&self, id: &str, at: DateTime<Utc>) -> Result<PublishRecord> {
        let record = modify(self.store.as_ref(), id, |record| {
            match record.status {
                PublishStatus::Draft => record.transition(PublishStatus::Scheduled)?,
                PublishStatus::Scheduled => {}
                status => {
                    return Err(CrosspostError::InvalidTransition {
                        from: status,
                        to: PublishStatus::Scheduled,
                    })
                }
            }
            record.scheduled_at = Some(at);
            record.updated_at = Utc::now();
            Ok(true)
        })
        .await?;

        self.scheduler.schedule(id, at);
        info!(record_id = %id, at = %at, "Publish rescheduled");
        self.events.emit(Event::PublishScheduled {
            record_id: id.to_string(),
            at,
        });
        Ok(record)
    }

    /// Cancel a scheduled record before it is due
    ///
    /// # Errors
    ///
    /// `NotFound` if the record does not exist, is not `scheduled`, or its
    /// publish time has already passed.
    pub async fn cancel_publish(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let cancellable = |record: &PublishRecord| {
            record.status == PublishStatus::Scheduled
                && record.scheduled_at.map(|at| at > now).unwrap_or(false)
        };

        let record = self.get_publish(id).await?;
        if !cancellable(&record) {
            return Err(CrosspostError::NotFound(id.to_string()));
        }

        let removed = self.scheduler.cancel(id).is_ok();

        let result = modify(self.store.as_ref(), id, |record| {
            if !cancellable(&*record) {
                return Err(CrosspostError::NotFound(record.id.clone()));
            }
            record.transition(PublishStatus::Cancelled)?;
            Ok(true)
        })
        .await;

        match result {
            Ok(_) => {
                info!(record_id = %id, "Publish cancelled");
                self.events.emit(Event::PublishCancelled {
                    record_id: id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                if removed {
                    if let Some(at) = record.scheduled_at {
                        self.scheduler.schedule(id, at);
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn get_publish(&self, id: &str) -> Result<PublishRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(id.to_string()))
    }

    /// All records, or only those in `status`, oldest first
    pub async fn list(&self, status: Option<PublishStatus>) -> Result<Vec<PublishRecord>> {
        match status {
            Some(status) => self.store.list_by_status(status).await,
            None => self.store.list().await,
        }
    }

    /// Fetch engagement counters for every successfully published target
    ///
    /// A failure for one platform is reported in its entry and does not
    /// affect the others.
    pub async fn fetch_metrics(&self, id: &str) -> Result<Vec<TargetMetrics>> {
        let record = self.get_publish(id).await?;

        let lookups = record.targets.iter().filter_map(|platform| {
            let outcome = record.outcome(platform).filter(|o| o.is_success())?;
            let remote_id = outcome.remote_id.clone()?;
            let registry = Arc::clone(&self.registry);
            let platform = platform.clone();

            Some(async move {
                let result = match registry.resolve(&platform) {
                    Ok(adapter) => adapter.fetch_metrics(&remote_id).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(metrics) => TargetMetrics {
                        platform,
                        remote_id,
                        metrics: Some(metrics),
                        error: None,
                    },
                    Err(e) => {
                        warn!(platform = %platform, error = %e, "Metrics lookup failed");
                        TargetMetrics {
                            platform,
                            remote_id,
                            metrics: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
        });

        Ok(join_all(lookups).await)
    }

    /// Wait until the record is terminal and return it
    ///
    /// Wakes on this process's events and re-reads storage periodically,
    /// so records published by another process are observed too. Returns
    /// immediately for records that are already terminal; waits
    /// indefinitely for drafts nobody submits.
    pub async fn await_settled(&self, id: &str) -> Result<PublishRecord> {
        let mut receiver = self.events.subscribe();

        loop {
            let record = self.get_publish(id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }

            // Any event, a lag notice or the timeout all mean "look again"
            let _ = tokio::time::timeout(SETTLE_POLL_INTERVAL, receiver.recv()).await;
        }
    }

    /// Stop the scheduler driver and wait for in-flight dispatches
    ///
    /// Pending scheduled records stay `scheduled` in storage.
    pub async fn shutdown(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            let _ = driver.stop.send(true);
            if let Err(e) = driver.handle.await {
                warn!(error = %e, "Scheduler driver ended abnormally");
            }
        }
        self.executor.shutdown().await;
    }
}
