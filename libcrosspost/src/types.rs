//! Core types for Crosspost

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrosspostError, Result};

/// Lifecycle of a publish record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further transitions are possible from this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Published | Self::PartiallyFailed | Self::Failed | Self::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: PublishStatus) -> bool {
        use PublishStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Publishing)
                | (Scheduled, Publishing)
                | (Scheduled, Cancelled)
                | (Publishing, Published)
                | (Publishing, PartiallyFailed)
                | (Publishing, Failed)
        )
    }
}

impl std::fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PublishStatus {
    type Err = CrosspostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "publishing" => Ok(Self::Publishing),
            "published" => Ok(Self::Published),
            "partially_failed" => Ok(Self::PartiallyFailed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CrosspostError::Validation(format!(
                "Unknown status: '{}'",
                other
            ))),
        }
    }
}

/// Classification of a failed publish attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthExpired,
    RateLimited,
    Rejected,
    Ambiguous,
    Transport,
    UnsupportedPlatform,
    /// The job budget ran out before the target produced an outcome
    Aborted,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Ambiguous | Self::Transport)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AuthExpired => "auth_expired",
            Self::RateLimited => "rate_limited",
            Self::Rejected => "rejected",
            Self::Ambiguous => "ambiguous",
            Self::Transport => "transport",
            Self::UnsupportedPlatform => "unsupported_platform",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Result of publishing a record to one target platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformOutcome {
    pub status: OutcomeStatus,
    pub remote_id: Option<String>,
    pub url: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub attempt_count: u32,
    /// No further attempts will be made for this target
    pub terminal: bool,
    pub updated_at: DateTime<Utc>,
}

impl PlatformOutcome {
    pub fn success(receipt: PublishReceipt, attempt_count: u32) -> Self {
        Self {
            status: OutcomeStatus::Success,
            remote_id: Some(receipt.remote_id),
            url: receipt.url,
            error_kind: None,
            error_message: None,
            attempt_count,
            terminal: true,
            updated_at: Utc::now(),
        }
    }

    pub fn error(kind: ErrorKind, message: String, attempt_count: u32, terminal: bool) -> Self {
        Self {
            status: OutcomeStatus::Error,
            remote_id: None,
            url: None,
            error_kind: Some(kind),
            error_message: Some(message),
            attempt_count,
            terminal,
            updated_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Content handed to platform adapters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub title: String,
    pub body: String,
    /// Opaque references to already-stored media (URLs or handles)
    pub media_refs: Vec<String>,
}

/// What a platform returns after a successful publish
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishReceipt {
    pub remote_id: String,
    pub url: Option<String>,
}

/// Engagement counters reported by a platform for one remote post
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub remote_id: String,
    pub counters: BTreeMap<String, u64>,
}

/// One content item and its per-platform outcome ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRecord {
    pub id: String,
    pub owner_id: i64,
    pub title: String,
    pub body: String,
    pub media_refs: Vec<String>,
    /// Unique platform names in insertion order
    pub targets: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: PublishStatus,
    pub per_platform_results: BTreeMap<String, PlatformOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Dispatcher currently holding the `publishing` claim
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Storage version used for compare-and-swap writes
    #[serde(default)]
    pub version: u64,
}

impl PublishRecord {
    /// Create a new draft record with a fresh id
    ///
    /// Duplicate target names are collapsed, keeping the first occurrence.
    pub fn new(owner_id: i64, content: Content, targets: Vec<String>) -> Self {
        let now = Utc::now();
        let mut unique: Vec<String> = Vec::with_capacity(targets.len());
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }

        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            title: content.title,
            body: content.body,
            media_refs: content.media_refs,
            targets: unique,
            scheduled_at: None,
            status: PublishStatus::Draft,
            per_platform_results: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            claimed_by: None,
            lease_expires_at: None,
            version: 0,
        }
    }

    pub fn content(&self) -> Content {
        Content {
            title: self.title.clone(),
            body: self.body.clone(),
            media_refs: self.media_refs.clone(),
        }
    }

    pub fn outcome(&self, platform: &str) -> Option<&PlatformOutcome> {
        self.per_platform_results.get(platform)
    }

    /// Move to `next`, enforcing the state machine
    pub fn transition(&mut self, next: PublishStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CrosspostError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Targets that still need a dispatch attempt
    pub fn pending_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .filter(|t| !self.outcome(t).map(|o| o.terminal).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Aggregate status once every target is terminal, `None` while any is pending
    pub fn settled_status(&self) -> Option<PublishStatus> {
        if !self.pending_targets().is_empty() {
            return None;
        }

        let successes = self
            .targets
            .iter()
            .filter(|t| self.outcome(t).map(|o| o.is_success()).unwrap_or(false))
            .count();

        Some(if successes == self.targets.len() {
            PublishStatus::Published
        } else if successes > 0 {
            PublishStatus::PartiallyFailed
        } else {
            PublishStatus::Failed
        })
    }

    /// Whether a dispatcher other than `owner` holds an unexpired claim
    pub fn leased_to_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.lease_expires_at) {
            (Some(holder), Some(until)) => holder != owner && until > now,
            _ => false,
        }
    }

    /// Claim the record for `owner` until `until`
    pub fn take_lease(&mut self, owner: &str, until: DateTime<Utc>) {
        self.claimed_by = Some(owner.to_string());
        self.lease_expires_at = Some(until);
    }

    /// Whether a scheduled record may be handed to the executor at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map(|at| at <= now).unwrap_or(true)
    }
}
