//! Name -> adapter resolution

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::http::HttpPlatform;
use super::mock::MockPlatform;
use super::Platform;
use crate::config::{Config, PlatformKind};
use crate::error::{PlatformError, PlatformResult, Result};

/// Fixed mapping from platform name to adapter
///
/// Built once from configuration; request handling only reads it.
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    adapters: BTreeMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every entry under `[platforms]`
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();

        for (name, platform) in &config.platforms {
            let adapter: Arc<dyn Platform> = match platform.kind {
                PlatformKind::Http => Arc::new(HttpPlatform::from_config(name, platform)?),
                PlatformKind::Mock => Arc::new(MockPlatform::success(name)),
            };
            info!(platform = %name, kind = ?platform.kind, "Registered platform");
            registry.register_arc(name.clone(), adapter);
        }

        Ok(registry)
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn register<P: Platform + 'static>(&mut self, platform: P) {
        let name = platform.name().to_string();
        self.adapters.insert(name, Arc::new(platform));
    }

    pub fn register_arc(&mut self, name: String, platform: Arc<dyn Platform>) {
        self.adapters.insert(name, platform);
    }

    pub fn resolve(&self, name: &str) -> PlatformResult<Arc<dyn Platform>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::UnsupportedPlatform(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
