//! Multi-platform fan-out for one publish record
//!
//! A dispatch pass publishes every pending target concurrently, each in its
//! own task with its own retry loop. Every attempt is written back as a
//! per-target compare-and-swap that touches only that target's outcome, and
//! the aggregate status is computed and written once, after all targets of
//! the pass are terminal.
//!
//! Each dispatcher has an owner id. A pass starts by taking a time-limited
//! claim on the record and every outcome write renews it, so two processes
//! sharing one store never publish the same record at once. A claim left
//! behind by a crashed process lapses after `RetryPolicy::lease`.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CrosspostError, PlatformError, Result};
use crate::platforms::PlatformRegistry;
use crate::retry::RetryPolicy;
use crate::service::events::{Event, EventBus};
use crate::store::{modify, RecordStore};
use crate::types::{Content, ErrorKind, PlatformOutcome, PublishRecord, PublishStatus};

#[derive(Clone)]
pub struct Dispatcher {
    owner: Arc<str>,
    registry: Arc<PlatformRegistry>,
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        store: Arc<dyn RecordStore>,
        policy: RetryPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            owner: Arc::from(Uuid::new_v4().to_string()),
            registry,
            store,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Id written into `claimed_by` for records this dispatcher works on
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Take or renew the claim on a `publishing` record
    ///
    /// # Errors
    ///
    /// `Claimed` if another dispatcher holds an unexpired claim,
    /// `InvalidTransition` if the record is not in `publishing`.
    pub async fn renew_lease(&self, record_id: &str) -> Result<PublishRecord> {
        let mut holder = None;
        let record = modify(self.store.as_ref(), record_id, |record| {
            holder = None;
            if record.status != PublishStatus::Publishing {
                return Err(CrosspostError::InvalidTransition {
                    from: record.status,
                    to: PublishStatus::Publishing,
                });
            }
            let now = Utc::now();
            if record.leased_to_other(&self.owner, now) {
                holder = record.claimed_by.clone();
                return Ok(false);
            }
            record.take_lease(&self.owner, self.policy.lease_until(now));
            Ok(true)
        })
        .await?;

        match holder {
            Some(owner) => Err(CrosspostError::Claimed {
                id: record.id,
                owner,
            }),
            None => Ok(record),
        }
    }

    /// Run one dispatch pass and return the updated record
    ///
    /// The caller's snapshot only identifies the record: outcomes are read
    /// fresh from the store, so a target that already succeeded is never
    /// attempted again even when `record` is stale.
    ///
    /// # Errors
    ///
    /// `NotFound` if the record vanished, `InvalidTransition` if it is not
    /// in `publishing`, `Claimed` if another dispatcher owns it, or a
    /// storage error. Platform failures never surface here; they are
    /// recorded per target.
    pub async fn dispatch(&self, record: &PublishRecord) -> Result<PublishRecord> {
        let current = self.renew_lease(&record.id).await?;

        let pending = current.pending_targets();
        debug!(record_id = %current.id, pending = ?pending, "Starting dispatch pass");

        let content = Arc::new(current.content());
        let tasks: Vec<_> = pending
            .into_iter()
            .map(|target| {
                let prior_attempts = current
                    .outcome(&target)
                    .map(|o| o.attempt_count)
                    .unwrap_or(0);
                let dispatcher = self.clone();
                let record_id = current.id.clone();
                let content = Arc::clone(&content);
                let platform = target.clone();

                // Spawned so a panicking adapter only takes its own target down
                let handle = tokio::spawn(async move {
                    dispatcher
                        .dispatch_target(&record_id, &platform, &content, prior_attempts)
                        .await
                });
                async move { (target, handle.await) }
            })
            .collect();

        let mut lost = None;
        for (target, joined) in join_all(tasks).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e @ CrosspostError::Claimed { .. })) => lost = Some(e),
                Ok(Err(e)) => warn!(
                    record_id = %current.id,
                    platform = %target,
                    error = %e,
                    "Could not record outcome; target stays pending"
                ),
                Err(e) => error!(
                    record_id = %current.id,
                    platform = %target,
                    error = %e,
                    "Dispatch task failed; target stays pending"
                ),
            }
        }

        if let Some(e) = lost {
            warn!(
                record_id = %current.id,
                error = %e,
                "Claim lapsed mid-pass; leaving record to its new owner"
            );
            return Err(e);
        }

        self.finalize(&current.id).await
    }

    /// Publish to one target until it reaches a terminal outcome
    async fn dispatch_target(
        &self,
        record_id: &str,
        platform_name: &str,
        content: &Content,
        prior_attempts: u32,
    ) -> Result<()> {
        let platform = match self.registry.resolve(platform_name) {
            Ok(platform) => platform,
            Err(e) => {
                warn!(record_id, platform = platform_name, "No adapter registered");
                let outcome = PlatformOutcome::error(e.kind(), e.to_string(), prior_attempts, true);
                return self.record_outcome(record_id, platform_name, outcome).await;
            }
        };

        if prior_attempts > 0 && !self.policy.allows_retry(prior_attempts) {
            let outcome = PlatformOutcome::error(
                ErrorKind::Aborted,
                "retry budget already spent".to_string(),
                prior_attempts,
                true,
            );
            return self.record_outcome(record_id, platform_name, outcome).await;
        }

        let mut attempts = prior_attempts;
        loop {
            attempts += 1;
            debug!(record_id, platform = platform_name, attempt = attempts, "Publishing");

            let result = match timeout(self.policy.attempt_timeout, platform.publish(content)).await
            {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Ambiguous(format!(
                    "no response from {} within {:?}",
                    platform_name, self.policy.attempt_timeout
                ))),
            };

            let error = match result {
                Ok(receipt) => {
                    info!(
                        record_id,
                        platform = platform_name,
                        attempt = attempts,
                        remote_id = %receipt.remote_id,
                        "Published"
                    );
                    let outcome = PlatformOutcome::success(receipt, attempts);
                    return self.record_outcome(record_id, platform_name, outcome).await;
                }
                Err(error) => error,
            };

            let terminal = !error.is_retryable() || !self.policy.allows_retry(attempts);
            let outcome =
                PlatformOutcome::error(error.kind(), error.to_string(), attempts, terminal);
            self.record_outcome(record_id, platform_name, outcome).await?;

            if terminal {
                warn!(
                    record_id,
                    platform = platform_name,
                    attempt = attempts,
                    error_kind = %error.kind(),
                    error = %error,
                    "Target failed terminally"
                );
                return Ok(());
            }

            let delay = self.policy.delay_for(attempts, error.retry_after());
            if let PlatformError::Ambiguous(_) = error {
                warn!(
                    record_id,
                    platform = platform_name,
                    attempt = attempts,
                    "Outcome unknown; retrying may create a duplicate remote post"
                );
            }
            warn!(
                record_id,
                platform = platform_name,
                attempt = attempts,
                max_attempts = self.policy.max_attempts,
                error_kind = %error.kind(),
                delay_ms = delay.as_millis() as u64,
                "Transient failure, backing off"
            );
            sleep(delay).await;
            // Never call the platform again once the claim has moved on
            self.renew_lease(record_id).await?;
        }
    }

    /// Write one target's outcome without touching any other entry
    ///
    /// The write also renews this dispatcher's claim. If another dispatcher
    /// has taken the record over, nothing is written and `Claimed` is
    /// returned so the target loop stops.
    async fn record_outcome(
        &self,
        record_id: &str,
        platform: &str,
        outcome: PlatformOutcome,
    ) -> Result<()> {
        let mut written = false;
        let mut holder = None;
        modify(self.store.as_ref(), record_id, |record| {
            written = false;
            holder = None;
            if record.status != PublishStatus::Publishing
                || !record.targets.iter().any(|t| t == platform)
            {
                return Ok(false);
            }
            let now = Utc::now();
            if record.leased_to_other(&self.owner, now) {
                holder = record.claimed_by.clone();
                return Ok(false);
            }
            if record.outcome(platform).map(|o| o.is_success()).unwrap_or(false) {
                return Ok(false);
            }
            record
                .per_platform_results
                .insert(platform.to_string(), outcome.clone());
            record.take_lease(&self.owner, self.policy.lease_until(now));
            record.updated_at = now;
            written = true;
            Ok(true)
        })
        .await?;

        if let Some(owner) = holder {
            return Err(CrosspostError::Claimed {
                id: record_id.to_string(),
                owner,
            });
        }

        if written {
            self.events.emit(Event::TargetAttempted {
                record_id: record_id.to_string(),
                platform: platform.to_string(),
                attempt: outcome.attempt_count,
                status: outcome.status,
                error_kind: outcome.error_kind,
                terminal: outcome.terminal,
            });
        }
        Ok(())
    }

    /// Write the aggregate status if every target is terminal
    pub async fn finalize(&self, record_id: &str) -> Result<PublishRecord> {
        let mut settled = None;
        let record = modify(self.store.as_ref(), record_id, |record| {
            settled = None;
            if record.status != PublishStatus::Publishing {
                return Ok(false);
            }
            match record.settled_status() {
                Some(status) => {
                    record.transition(status)?;
                    settled = Some(status);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await?;

        if let Some(status) = settled {
            self.announce(&record, status);
        }
        Ok(record)
    }

    /// Freeze every still-pending target as a terminal error and settle
    ///
    /// Used once the job-level retry budget is spent. Targets with a
    /// retryable outcome keep their last error; targets that never produced
    /// one are marked `Aborted`. The frozen outcomes and the aggregate
    /// status are written together. A record claimed by another dispatcher
    /// is left alone.
    pub async fn abandon(&self, record_id: &str) -> Result<PublishRecord> {
        let mut settled = None;
        let record = modify(self.store.as_ref(), record_id, |record| {
            settled = None;
            if record.status != PublishStatus::Publishing
                || record.leased_to_other(&self.owner, Utc::now())
            {
                return Ok(false);
            }

            let now = Utc::now();
            for target in record.pending_targets() {
                let frozen = match record.outcome(&target) {
                    Some(outcome) => PlatformOutcome {
                        terminal: true,
                        updated_at: now,
                        ..outcome.clone()
                    },
                    None => PlatformOutcome::error(
                        ErrorKind::Aborted,
                        "dispatch did not complete within the retry budget".to_string(),
                        0,
                        true,
                    ),
                };
                record.per_platform_results.insert(target, frozen);
            }

            // Every target is terminal now, so this always settles
            let status = record.settled_status().unwrap_or(PublishStatus::Failed);
            record.transition(status)?;
            settled = Some(status);
            Ok(true)
        })
        .await?;

        if let Some(status) = settled {
            warn!(record_id, status = %status, "Retry budget exhausted; remaining targets frozen");
            self.announce(&record, status);
        }
        Ok(record)
    }

    fn announce(&self, record: &PublishRecord, status: PublishStatus) {
        match status {
            PublishStatus::Published => info!(record_id = %record.id, "Publish record completed"),
            _ => warn!(record_id = %record.id, status = %status, "Publish record finished with failures"),
        }
        self.events.emit(Event::PublishFinished {
            record_id: record.id.clone(),
            status,
        });
    }
}
