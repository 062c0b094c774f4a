//! Explicit configuration context handed to every orchestrator.

use std::sync::{Arc, RwLock};

use super::settings::ManagerConfig;

/// Shared, immutable view of the manager configuration.
///
/// Orchestrators take a context at construction and read a snapshot per
/// call; production code has no way to swap the configuration underneath.
#[derive(Debug, Clone)]
pub struct ConfigContext {
    inner: Arc<RwLock<Arc<ManagerConfig>>>,
}

impl ConfigContext {
    /// Wraps a configuration.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Returns the current configuration snapshot.
    #[must_use]
    pub fn current(&self) -> Arc<ManagerConfig> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the configuration for every holder of this context.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&self, config: ManagerConfig) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(config);
    }
}

impl Default for ConfigContext {
    fn default() -> Self {
        Self::new(ManagerConfig::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reset_visible_to_clones() {
        let context = ConfigContext::default();
        let clone = context.clone();
        let before = clone.current();

        let mut config = ManagerConfig::new();
        config.set("update_workflow", json!("custom_update")).unwrap();
        context.reset(config);

        assert_eq!(clone.current().update_workflow().unwrap(), "custom_update");
        // snapshots taken earlier keep their values
        assert_eq!(before.update_workflow().unwrap(), "update");
    }
}
