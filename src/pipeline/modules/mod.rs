//! Built-in deterministic analysis modules
//!
//! Registered once at startup, in a fixed order. Three modules derive
//! patterns from raw events (preference, habit, anomaly rules), one
//! summarizes per-subject activity, and two consume the existing pattern
//! snapshot (preference scoring, volume anomaly flags).

pub mod activity_summary;
pub mod explain_preference;
pub mod explain_preference_score;
pub mod friction_anomaly;
pub mod search_habit;
pub mod volume_anomaly;

use crate::error::Result;
use crate::pipeline::registry::ModuleRegistry;
use crate::types::Event;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use activity_summary::ActivitySummary;
pub use explain_preference::ExplainPreference;
pub use explain_preference_score::ExplainPreferenceScore;
pub use friction_anomaly::FrictionAnomaly;
pub use search_habit::SearchHabit;
pub use volume_anomaly::VolumeAnomaly;

/// Register every built-in module, in the order their evidence should
/// appear in results
pub fn register_builtins(registry: &ModuleRegistry) -> Result<()> {
    registry.register(Arc::new(ExplainPreference))?;
    registry.register(Arc::new(SearchHabit))?;
    registry.register(Arc::new(FrictionAnomaly))?;
    registry.register(Arc::new(ActivitySummary))?;
    registry.register(Arc::new(ExplainPreferenceScore))?;
    registry.register(Arc::new(VolumeAnomaly))?;
    Ok(())
}

/// Group a batch by subject, preserving event order within each group
pub(crate) fn by_subject(events: &[Event]) -> BTreeMap<&str, Vec<&Event>> {
    let mut groups: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for event in events {
        groups.entry(event.subject()).or_default().push(event);
    }
    groups
}

/// Clamp into [0.0, 1.0]
pub(crate) fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}
