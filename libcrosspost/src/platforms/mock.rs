//! Mock platform implementation for testing
//!
//! A configurable platform that can simulate successes, each failure kind,
//! delays and even panics. Responses are scripted per call; once the script
//! runs out the fallback response is used for every further call.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, PlatformResult};
use crate::platforms::Platform;
use crate::types::{Content, Metrics, PublishReceipt};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the mock does on one `publish` call
#[derive(Debug, Clone)]
pub enum MockResponse {
    Succeed,
    Fail(PlatformError),
    /// Panics inside the adapter, for failure-isolation tests
    Panic,
}

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub name: String,

    /// Responses consumed in order, one per publish call
    pub script: Arc<Mutex<VecDeque<MockResponse>>>,

    /// Used once the script is exhausted
    pub fallback: MockResponse,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    pub publish_call_count: Arc<Mutex<usize>>,

    /// Content of every successful publish
    pub published: Arc<Mutex<Vec<Content>>>,

    /// Remote ids handed out so far
    pub remote_ids: Arc<Mutex<Vec<String>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            name: "mock".to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: MockResponse::Succeed,
            delay: Duration::from_millis(0),
            publish_call_count: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
            remote_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock platform for testing
///
/// Clones share counters and script, so a test can keep one handle while
/// the registry owns another.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    config: MockConfig,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A platform that always succeeds
    pub fn success(name: &str) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// A platform that always fails with `error`
    pub fn failing(name: &str, error: PlatformError) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            fallback: MockResponse::Fail(error),
            ..Default::default()
        })
    }

    /// A platform that plays `script` first, then succeeds
    pub fn scripted(name: &str, script: Vec<MockResponse>) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        })
    }

    /// A platform that succeeds after `delay`
    pub fn with_delay(name: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            name: name.to_string(),
            delay,
            ..Default::default()
        })
    }

    pub fn publish_call_count(&self) -> usize {
        *lock(&self.config.publish_call_count)
    }

    pub fn published(&self) -> Vec<Content> {
        lock(&self.config.published).clone()
    }

    fn next_response(&self) -> MockResponse {
        lock(&self.config.script)
            .pop_front()
            .unwrap_or_else(|| self.config.fallback.clone())
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, content: &Content) -> PlatformResult<PublishReceipt> {
        *lock(&self.config.publish_call_count) += 1;
        let response = self.next_response();

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        match response {
            MockResponse::Succeed => {
                lock(&self.config.published).push(content.clone());

                let remote_id = format!("{}:mock-{}", self.config.name, uuid::Uuid::new_v4());
                lock(&self.config.remote_ids).push(remote_id.clone());

                Ok(PublishReceipt {
                    url: Some(format!("https://{}.invalid/p/{}", self.config.name, remote_id)),
                    remote_id,
                })
            }
            MockResponse::Fail(error) => Err(error),
            MockResponse::Panic => panic!("mock platform {} panicked", self.config.name),
        }
    }

    async fn fetch_metrics(&self, remote_id: &str) -> PlatformResult<Metrics> {
        let known = lock(&self.config.remote_ids)
            .iter()
            .any(|id| id == remote_id);

        if !known {
            return Err(PlatformError::Rejected(format!(
                "Unknown post on {}: {}",
                self.config.name, remote_id
            )));
        }

        let mut counters = BTreeMap::new();
        counters.insert("views".to_string(), 1);
        Ok(Metrics {
            remote_id: remote_id.to_string(),
            counters,
        })
    }
}
