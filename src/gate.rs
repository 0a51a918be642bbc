//! Process-wide feature-flag and kill-switch authority
//!
//! The Gate is constructed once from configuration and passed explicitly
//! (via `Arc`) to every consumer that produces behavior-affecting output.
//! A killed feature stays off for the process lifetime: re-enabling requires
//! a restart. Read-only surfacing of derived data never consults the Gate.

use crate::config::FeatureConfig;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{info, warn};

/// Feature guarding the pipeline runner's write path
pub const FEATURE_LEARNING: &str = "learning";

/// Feature guarding live streaming delivery
pub const FEATURE_STREAMING: &str = "streaming";

#[derive(Debug, Default)]
struct GateInner {
    flags: HashMap<String, bool>,
    killed: HashSet<String>,
}

/// Feature-flag state with irreversible kill semantics
#[derive(Debug, Default)]
pub struct Gate {
    inner: RwLock<GateInner>,
}

impl Gate {
    /// Build a gate from initial flag states
    pub fn new(initial: impl IntoIterator<Item = (String, bool)>) -> Self {
        Self {
            inner: RwLock::new(GateInner {
                flags: initial.into_iter().collect(),
                killed: HashSet::new(),
            }),
        }
    }

    /// Build a gate seeded from the `[features]` configuration table
    pub fn from_config(features: &FeatureConfig) -> Self {
        Self::new([
            (FEATURE_LEARNING.to_string(), features.learning),
            (FEATURE_STREAMING.to_string(), features.streaming),
        ])
    }

    /// Whether `feature` is currently enabled. Unknown features are off.
    pub fn is_enabled(&self, feature: &str) -> bool {
        let inner = self.inner.read().expect("gate lock poisoned");
        !inner.killed.contains(feature) && inner.flags.get(feature).copied().unwrap_or(false)
    }

    /// Enable a feature. A no-op (logged) if the feature has been killed.
    pub fn enable(&self, feature: &str) {
        let mut inner = self.inner.write().expect("gate lock poisoned");
        if inner.killed.contains(feature) {
            warn!(feature, "ignoring enable for killed feature");
            return;
        }
        inner.flags.insert(feature.to_string(), true);
    }

    /// Disable a feature (reversible; use [`Gate::kill`] for the hard stop)
    pub fn disable(&self, feature: &str) {
        let mut inner = self.inner.write().expect("gate lock poisoned");
        inner.flags.insert(feature.to_string(), false);
    }

    /// Force a feature off for the remainder of the process lifetime.
    /// Idempotent; cannot be undone without a restart.
    pub fn kill(&self, feature: &str) {
        let mut inner = self.inner.write().expect("gate lock poisoned");
        inner.flags.insert(feature.to_string(), false);
        if inner.killed.insert(feature.to_string()) {
            info!(feature, "feature killed for process lifetime");
        }
    }

    /// Whether a feature has been killed
    pub fn is_killed(&self, feature: &str) -> bool {
        let inner = self.inner.read().expect("gate lock poisoned");
        inner.killed.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable() {
        let gate = Gate::new([("learning".to_string(), true)]);
        assert!(gate.is_enabled("learning"));

        gate.disable("learning");
        assert!(!gate.is_enabled("learning"));

        gate.enable("learning");
        assert!(gate.is_enabled("learning"));
    }

    #[test]
    fn test_unknown_feature_is_off() {
        let gate = Gate::new([]);
        assert!(!gate.is_enabled("nonexistent"));
    }

    #[test]
    fn test_kill_is_irreversible() {
        let gate = Gate::new([("learning".to_string(), true)]);

        gate.kill("learning");
        assert!(!gate.is_enabled("learning"));
        assert!(gate.is_killed("learning"));

        // enable after kill must have no effect in the same process
        gate.enable("learning");
        assert!(!gate.is_enabled("learning"));
    }

    #[test]
    fn test_kill_is_idempotent() {
        let gate = Gate::new([("streaming".to_string(), true)]);
        gate.kill("streaming");
        gate.kill("streaming");
        assert!(gate.is_killed("streaming"));
    }

    #[test]
    fn test_from_config() {
        let features = crate::config::FeatureConfig {
            learning: true,
            streaming: false,
        };
        let gate = Gate::from_config(&features);
        assert!(gate.is_enabled(FEATURE_LEARNING));
        assert!(!gate.is_enabled(FEATURE_STREAMING));
    }
}
