//! Bounded background runner for dispatch jobs
//!
//! `submit` never blocks the caller: it registers the record as in flight
//! and spawns a job that waits for one of `workers` permits. A job claims
//! the record (moving it to `publishing`), runs dispatch passes until every
//! target is terminal or the job budget is spent, and then freezes whatever
//! is left. A `publishing` record is only resumed once no other process
//! holds an unexpired claim on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{CrosspostError, Result};
use crate::service::events::{Event, EventBus};
use crate::store::{modify, RecordStore};
use crate::types::{PublishRecord, PublishStatus};

#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    dispatcher: Dispatcher,
    store: Arc<dyn RecordStore>,
    permits: Arc<Semaphore>,
    accepting: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
    idle: Notify,
    events: EventBus,
}

/// Why a submitted record was not dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    NotDue,
    Finished,
    /// Another dispatcher holds the claim
    Claimed,
}

impl Executor {
    pub fn new(
        dispatcher: Dispatcher,
        store: Arc<dyn RecordStore>,
        workers: usize,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                dispatcher,
                store,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                accepting: AtomicBool::new(true),
                in_flight: Mutex::new(HashSet::new()),
                idle: Notify::new(),
                events,
            }),
        }
    }

    /// Queue a record for dispatch
    ///
    /// Returns `Ok(false)` when a job for the record is already in flight.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once [`Executor::shutdown`] has been called.
    pub fn submit(&self, record_id: &str) -> Result<bool> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(CrosspostError::ShuttingDown);
        }

        {
            let mut in_flight = self.in_flight_set();
            if !in_flight.insert(record_id.to_string()) {
                debug!(record_id, "Already in flight, ignoring duplicate submit");
                return Ok(false);
            }
        }

        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            record_id: record_id.to_string(),
        };
        let inner = Arc::clone(&self.inner);
        let record_id = record_id.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            run_job(inner, record_id).await;
        });

        Ok(true)
    }

    /// Owner id this executor's jobs claim records under
    pub fn owner(&self) -> &str {
        self.inner.dispatcher.owner()
    }

    pub fn is_in_flight(&self, record_id: &str) -> bool {
        self.in_flight_set().contains(record_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_set().len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Wait until no job is in flight
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a wakeup between the two is not lost
            notified.as_mut().enable();

            if self.in_flight_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and wait for in-flight ones to finish
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let pending = self.in_flight_count();
        if pending > 0 {
            info!(in_flight = pending, "Waiting for in-flight dispatches");
        }
        self.drain().await;
        info!("Executor stopped");
    }

    fn in_flight_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        lock_in_flight(&self.inner)
    }
}

fn lock_in_flight(inner: &ExecutorInner) -> std::sync::MutexGuard<'_, HashSet<String>> {
    // The set stays consistent even if a holder panicked
    inner
        .in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight entry however the job ends, panics included
struct InFlightGuard {
    inner: Arc<ExecutorInner>,
    record_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let empty = {
            let mut in_flight = lock_in_flight(&self.inner);
            in_flight.remove(&self.record_id);
            in_flight.is_empty()
        };
        if empty {
            self.inner.idle.notify_waiters();
        }
    }
}

async fn run_job(inner: Arc<ExecutorInner>, record_id: String) {
    let _permit = match Arc::clone(&inner.permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let record = match claim(&inner, &record_id).await {
        Ok(Ok(record)) => record,
        Ok(Err(skip)) => {
            debug!(record_id = %record_id, reason = ?skip, "Not dispatching");
            return;
        }
        Err(e) => {
            error!(record_id = %record_id, error = %e, "Failed to claim record");
            return;
        }
    };

    let policy = inner.dispatcher.policy().clone();
    for job_attempt in 1..=policy.max_attempts {
        match inner.dispatcher.dispatch(&record).await {
            Ok(updated) if updated.status.is_terminal() => return,
            Ok(updated) => warn!(
                record_id = %record_id,
                job_attempt,
                pending = ?updated.pending_targets(),
                "Dispatch pass left targets pending"
            ),
            Err(CrosspostError::NotFound(_)) | Err(CrosspostError::InvalidTransition { .. }) => {
                debug!(record_id = %record_id, "Record no longer publishing");
                return;
            }
            Err(CrosspostError::Claimed { owner, .. }) => {
                info!(
                    record_id = %record_id,
                    owner = %owner,
                    "Record taken over by another dispatcher"
                );
                return;
            }
            Err(e) => warn!(
                record_id = %record_id,
                job_attempt,
                error = %e,
                "Dispatch pass failed"
            ),
        }

        if policy.allows_retry(job_attempt) {
            sleep(policy.delay_for(job_attempt, None)).await;
        }
    }

    if let Err(e) = inner.dispatcher.abandon(&record_id).await {
        error!(record_id = %record_id, error = %e, "Failed to freeze abandoned record");
    }
}

/// Move the record to `publishing` and take the claim on it
///
/// A record already in `publishing` was left behind by an earlier run or
/// is being worked on by another process. It is resumed only when its
/// claim is ours or has lapsed.
async fn claim(
    inner: &ExecutorInner,
    record_id: &str,
) -> Result<std::result::Result<PublishRecord, Skip>> {
    let owner = inner.dispatcher.owner();
    let policy = inner.dispatcher.policy();
    let mut skip = None;
    let mut started = false;

    let record = modify(inner.store.as_ref(), record_id, |record| {
        let now = Utc::now();
        skip = None;
        started = false;
        match record.status {
            PublishStatus::Draft => {}
            PublishStatus::Scheduled if record.is_due(now) => {}
            PublishStatus::Scheduled => {
                skip = Some(Skip::NotDue);
                return Ok(false);
            }
            PublishStatus::Publishing if record.leased_to_other(owner, now) => {
                skip = Some(Skip::Claimed);
                return Ok(false);
            }
            PublishStatus::Publishing => {
                record.take_lease(owner, policy.lease_until(now));
                return Ok(true);
            }
            _ => {
                skip = Some(Skip::Finished);
                return Ok(false);
            }
        }
        record.transition(PublishStatus::Publishing)?;
        record.take_lease(owner, policy.lease_until(now));
        started = true;
        Ok(true)
    })
    .await?;

    if let Some(skip) = skip {
        return Ok(Err(skip));
    }

    if started {
        info!(record_id, targets = ?record.targets, "Publishing");
        inner.events.emit(Event::PublishStarted {
            record_id: record.id.clone(),
            targets: record.targets.clone(),
        });
    } else {
        info!(record_id, "Resuming interrupted publish");
    }

    Ok(Ok(record))
}
