//! Deferred publish timer
//!
//! Keeps a time-ordered set of `(scheduled_at, record_id)` entries in
//! memory. A single driver task sleeps until the earliest entry is due (or
//! until an earlier entry is inserted), removes every due entry and hands
//! each one to the [`Executor`]. Entries leave the set before handoff, so a
//! due entry fires at most once per process; the claim in the executor is
//! what makes a duplicate fire across processes harmless.
//!
//! The in-memory set is only a view of storage: [`Scheduler::restore`]
//! rebuilds it from `scheduled` records on startup and on every resync.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{CrosspostError, Result};
use crate::executor::Executor;
use crate::store::RecordStore;
use crate::types::PublishStatus;

/// Longest the driver sleeps without re-checking the queue
const MAX_IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct PendingQueue {
    by_time: BTreeSet<(DateTime<Utc>, String)>,
    by_id: HashMap<String, DateTime<Utc>>,
}

impl PendingQueue {
    fn insert(&mut self, record_id: &str, at: DateTime<Utc>) {
        self.remove(record_id);
        self.by_time.insert((at, record_id.to_string()));
        self.by_id.insert(record_id.to_string(), at);
    }

    fn remove(&mut self, record_id: &str) -> Option<DateTime<Utc>> {
        let at = self.by_id.remove(record_id)?;
        self.by_time.remove(&(at, record_id.to_string()));
        Some(at)
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.by_time.iter().next().map(|(at, _)| *at)
    }

    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        while self.earliest().map(|at| at <= now).unwrap_or(false) {
            if let Some((_, id)) = self.by_time.pop_first() {
                self.by_id.remove(&id);
                due.push(id);
            }
        }
        due
    }
}

#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    queue: Mutex<PendingQueue>,
    wake: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, PendingQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `record_id` to fire at `at`, replacing any existing entry
    pub fn schedule(&self, record_id: &str, at: DateTime<Utc>) {
        let wake = {
            let mut queue = self.queue();
            queue.insert(record_id, at);
            queue.earliest() == Some(at)
        };
        debug!(record_id, at = %at, "Scheduled");
        if wake {
            self.inner.wake.notify_one();
        }
    }

    /// Remove a pending entry
    ///
    /// # Errors
    ///
    /// `NotFound` if the record is not pending (never scheduled, already
    /// fired or already cancelled).
    pub fn cancel(&self, record_id: &str) -> Result<()> {
        match self.queue().remove(record_id) {
            Some(_) => {
                debug!(record_id, "Removed from schedule");
                Ok(())
            }
            None => Err(CrosspostError::NotFound(record_id.to_string())),
        }
    }

    pub fn is_pending(&self, record_id: &str) -> bool {
        self.queue().by_id.contains_key(record_id)
    }

    pub fn scheduled_at(&self, record_id: &str) -> Option<DateTime<Utc>> {
        self.queue().by_id.get(record_id).copied()
    }

    pub fn len(&self) -> usize {
        self.queue().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue().earliest()
    }

    /// Remove and return every entry due at `now`, earliest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        self.queue().pop_due(now)
    }

    /// Rebuild the pending set from storage
    ///
    /// Adds every `scheduled` record (updating times that changed) and
    /// drops entries whose record is no longer `scheduled`. Returns the
    /// number of pending entries afterwards.
    pub async fn restore(&self, store: &dyn RecordStore) -> Result<usize> {
        let scheduled = store.list_by_status(PublishStatus::Scheduled).await?;

        let (added, dropped, pending) = {
            let mut queue = self.queue();
            let mut added = 0;

            let live: HashMap<&str, DateTime<Utc>> = scheduled
                .iter()
                .map(|r| (r.id.as_str(), r.scheduled_at.unwrap_or(r.created_at)))
                .collect();

            let stale: Vec<String> = queue
                .by_id
                .keys()
                .filter(|id| !live.contains_key(id.as_str()))
                .cloned()
                .collect();
            for id in &stale {
                queue.remove(id);
            }

            for (id, at) in live {
                if queue.by_id.get(id) != Some(&at) {
                    queue.insert(id, at);
                    added += 1;
                }
            }

            (added, stale.len(), queue.by_id.len())
        };

        if added > 0 || dropped > 0 {
            info!(added, dropped, pending, "Schedule resynced from storage");
            self.inner.wake.notify_one();
        }
        Ok(pending)
    }

    /// Drive the timer until `shutdown` flips to `true`
    ///
    /// Each due entry is submitted to `executor`. If the executor stops
    /// accepting work, the entry is put back and the driver exits; the
    /// record is still `scheduled` in storage for the next run.
    pub async fn run(self, executor: Executor, mut shutdown: watch::Receiver<bool>) {
        info!("Scheduler started");

        'driver: loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let due = self.take_due(now);
            for (index, record_id) in due.iter().enumerate() {
                match executor.submit(record_id) {
                    Ok(_) => info!(record_id = %record_id, "Scheduled publish due"),
                    Err(e) => {
                        warn!(record_id = %record_id, error = %e, "Could not hand off due publish");
                        for unsent in &due[index..] {
                            self.schedule(unsent, now);
                        }
                        break 'driver;
                    }
                }
            }

            let wait = match self.next_due() {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => MAX_IDLE_WAIT,
            }
            .min(MAX_IDLE_WAIT);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.inner.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(pending = self.len(), "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::platforms::mock::MockPlatform;
    use crate::platforms::PlatformRegistry;
    use crate::retry::RetryPolicy;
    use crate::service::events::EventBus;
    use crate::store::MemoryStore;
    use crate::types::{Content, PublishRecord};

    fn at(offset_ms: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(offset_ms)
    }

    fn content() -> Content {
        Content {
            title: "Later".to_string(),
            body: "Posted by the timer".to_string(),
            media_refs: vec![],
        }
    }

    async fn scheduled(store: &MemoryStore, when: DateTime<Utc>) -> PublishRecord {
        let mut record = PublishRecord::new(1, content(), vec!["a".to_string()]);
        record.scheduled_at = Some(when);
        record.transition(PublishStatus::Scheduled).unwrap();
        store.insert(&record).await.unwrap();
        record
    }

    fn executor(store: Arc<MemoryStore>, platform: MockPlatform) -> Executor {
        let mut registry = PlatformRegistry::new();
        registry.register(platform);
        let events = EventBus::default();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            store.clone(),
            RetryPolicy::immediate(3),
            events.clone(),
        );
        Executor::new(dispatcher, store, 2, events)
    }

    #[test]
    fn test_take_due_in_time_order() {
        let scheduler = Scheduler::new();
        scheduler.schedule("late", at(-1_000));
        scheduler.schedule("early", at(-5_000));
        scheduler.schedule("future", at(60_000));

        assert_eq!(scheduler.take_due(Utc::now()), vec!["early", "late"]);
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.is_pending("future"));
        assert!(scheduler.take_due(Utc::now()).is_empty());
    }

    #[test]
    fn test_schedule_replaces_entry() {
        let scheduler = Scheduler::new();
        let first = at(60_000);
        let second = at(120_000);

        scheduler.schedule("r1", first);
        scheduler.schedule("r1", second);

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.scheduled_at("r1"), Some(second));
        assert_eq!(scheduler.next_due(), Some(second));
    }

    #[test]
    fn test_cancel() {
        let scheduler = Scheduler::new();
        scheduler.schedule("r1", at(60_000));

        scheduler.cancel("r1").unwrap();
        assert!(scheduler.is_empty());
        assert!(matches!(
            scheduler.cancel("r1"),
            Err(CrosspostError::NotFound(_))
        ));
    }

    #[test]
    fn test_taken_entry_cannot_be_cancelled() {
        let scheduler = Scheduler::new();
        scheduler.schedule("r1", at(-10));

        assert_eq!(scheduler.take_due(Utc::now()), vec!["r1"]);
        assert!(scheduler.cancel("r1").is_err());
    }

    #[tokio::test]
    async fn test_restore_adds_and_drops() {
        let store = MemoryStore::new();
        let kept = scheduled(&store, at(60_000)).await;
        let draft = PublishRecord::new(1, content(), vec!["a".to_string()]);
        store.insert(&draft).await.unwrap();

        let scheduler = Scheduler::new();
        scheduler.schedule("gone", at(30_000));

        assert_eq!(scheduler.restore(&store).await.unwrap(), 1);
        assert!(scheduler.is_pending(&kept.id));
        assert!(!scheduler.is_pending(&draft.id));
        assert!(!scheduler.is_pending("gone"));
    }

    #[tokio::test]
    async fn test_driver_fires_due_entry_once() {
        let store = Arc::new(MemoryStore::new());
        let platform = MockPlatform::success("a");
        let executor = executor(store.clone(), platform.clone());

        let record = scheduled(&store, at(50)).await;
        let scheduler = Scheduler::new();
        scheduler.restore(&*store).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let driver = tokio::spawn(scheduler.clone().run(executor.clone(), rx));

        tokio::time::sleep(Duration::from_millis(300)).await;
        executor.drain().await;

        // A resync after firing must not bring the entry back
        scheduler.restore(&*store).await.unwrap();
        assert!(scheduler.is_empty());

        tx.send(true).unwrap();
        driver.await.unwrap();

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PublishStatus::Published);
        assert_eq!(platform.publish_call_count(), 1);
    }

    #[tokio::test]
    async fn test_driver_wakes_for_earlier_entry() {
        let store = Arc::new(MemoryStore::new());
        let platform = MockPlatform::success("a");
        let executor = executor(store.clone(), platform.clone());

        let scheduler = Scheduler::new();
        scheduler.schedule("far", at(3_600_000));

        let (tx, rx) = watch::channel(false);
        let driver = tokio::spawn(scheduler.clone().run(executor.clone(), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = scheduled(&store, at(30)).await;
        scheduler.schedule(&record.id, record.scheduled_at.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        executor.drain().await;
        tx.send(true).unwrap();
        driver.await.unwrap();

        assert_eq!(platform.publish_call_count(), 1);
        assert!(scheduler.is_pending("far"));
    }

    #[tokio::test]
    async fn test_cancelled_entry_never_fires() {
        let store = Arc::new(MemoryStore::new());
        let platform = MockPlatform::success("a");
        let executor = executor(store.clone(), platform.clone());

        let record = scheduled(&store, at(100)).await;
        let scheduler = Scheduler::new();
        scheduler.schedule(&record.id, record.scheduled_at.unwrap());

        let (tx, rx) = watch::channel(false);
        let driver = tokio::spawn(scheduler.clone().run(executor.clone(), rx));

        scheduler.cancel(&record.id).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        driver.await.unwrap();

        assert_eq!(platform.publish_call_count(), 0);
    }
}
