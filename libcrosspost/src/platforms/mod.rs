//! Platform adapter abstraction and implementations
//!
//! Every external network is reached through the [`Platform`] trait. The
//! dispatcher never talks to a concrete client; it resolves adapters by
//! name through the [`registry::PlatformRegistry`].
//!
//! # Examples
//!
//! ```no_run
//! use libcrosspost::platforms::{mock::MockPlatform, Platform};
//! use libcrosspost::types::Content;
//!
//! # async fn example() -> libcrosspost::error::PlatformResult<()> {
//! let platform = MockPlatform::success("sandbox");
//! let receipt = platform
//!     .publish(&Content {
//!         title: "Hello".to_string(),
//!         body: "Hello, everyone".to_string(),
//!         media_refs: vec![],
//!     })
//!     .await?;
//! println!("Published as {}", receipt.remote_id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::error::PlatformResult;
use crate::types::{Content, Metrics, PublishReceipt};

pub mod http;
pub mod registry;

// Mock platform is available for all builds (not just tests) to support
// integration tests and `kind = "mock"` sandbox targets
pub mod mock;

pub use registry::PlatformRegistry;

/// Capability set implemented once per external platform
#[async_trait]
pub trait Platform: Send + Sync {
    /// Lowercase identifier this adapter is registered under
    fn name(&self) -> &str;

    /// Publish content and return the platform's id for the new post
    ///
    /// # Errors
    ///
    /// - `PlatformError::AuthExpired` when credentials need refreshing
    /// - `PlatformError::RateLimited` with an optional retry-after hint
    /// - `PlatformError::Rejected` when the content violates platform policy
    /// - `PlatformError::Ambiguous` when the request may or may not have
    ///   been applied remotely (a retry can produce a duplicate post)
    /// - `PlatformError::Network` when the request provably never arrived
    async fn publish(&self, content: &Content) -> PlatformResult<PublishReceipt>;

    /// Fetch engagement counters for a previously published post
    async fn fetch_metrics(&self, remote_id: &str) -> PlatformResult<Metrics>;
}
