//! Interaction-friction anomaly derivation
//!
//! Corrections and frustration signals accumulating in one batch derive a
//! `(subject, anomaly, interaction:high_friction)` pattern. Threshold six;
//! confidence capped at 0.90.

use crate::pipeline::module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleError, ModuleResult, ResultKind,
    ResultStatus,
};
use crate::pipeline::modules::{by_subject, clamp01};
use serde_json::json;
use std::collections::BTreeMap;

pub struct FrictionAnomaly;

impl FrictionAnomaly {
    pub const THRESHOLD: usize = 6;

    const TYPES: [&'static str; 2] = ["correction", "frustration"];
    const TAGS: [&'static str; 3] = ["correction", "frustration", "anomaly:friction"];
}

impl AnalysisModule for FrictionAnomaly {
    fn name(&self) -> &'static str {
        "friction_anomaly"
    }

    fn version(&self) -> &'static str {
        "0.2.0"
    }

    fn input_kinds(&self) -> &'static [&'static str] {
        &["correction", "frustration", "*"]
    }

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError> {
        let mut results = Vec::new();

        for (subject, events) in by_subject(ctx.events) {
            let hits: Vec<i64> = events
                .iter()
                .filter(|e| {
                    Self::TYPES.contains(&e.event_type.as_str())
                        || Self::TAGS.iter().any(|tag| e.has_tag(tag))
                })
                .map(|e| e.id)
                .collect();

            let count = hits.len();
            if count < Self::THRESHOLD {
                continue;
            }

            let confidence = clamp01(
                (0.60 + (count - Self::THRESHOLD) as f64 * 0.05).min(0.90),
            );

            let mut flags = BTreeMap::new();
            flags.insert("high_friction".to_string(), true);

            results.push(ModuleResult {
                module: self.name().to_string(),
                version: self.version().to_string(),
                computed_at: ctx.computed_at,
                subject: subject.to_string(),
                pattern_type: "anomaly".to_string(),
                key: "interaction:high_friction".to_string(),
                kind: ResultKind::Flags,
                status: ResultStatus::Warn,
                score: None,
                flags,
                value: json!({"count": count}),
                confidence,
                evidence: json!({
                    "count": count,
                    "threshold": Self::THRESHOLD,
                    "signals": Self::TYPES,
                    "event_ids": hits,
                }),
                inputs: hits.iter().map(|id| InputRef::event(*id)).collect(),
                explain: Explain::text(format!(
                    "{} correction/frustration signals in the batch (threshold {})",
                    count,
                    Self::THRESHOLD
                )),
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::modules::testing::{event, plain_event};
    use chrono::Utc;
    use serde_json::json;

    fn ctx_events(events: &[crate::types::Event]) -> ModuleContext {
        ModuleContext {
            events,
            patterns: &[],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_threshold_and_warn_status() {
        let mut events: Vec<_> = (0..3)
            .map(|i| plain_event(i, "u1", "correction"))
            .collect();
        events.extend((3..5).map(|i| plain_event(i, "u1", "frustration")));
        events.push(event(5, "u1", "chat", &["anomaly:friction"], json!({})));

        let results = FrictionAnomaly.compute(&ctx_events(&events)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::Warn);
        assert_eq!(results[0].key, "interaction:high_friction");
        assert!((results[0].confidence - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_below_threshold_is_silent() {
        let events: Vec<_> = (0..5)
            .map(|i| plain_event(i, "u1", "correction"))
            .collect();
        assert!(FrictionAnomaly
            .compute(&ctx_events(&events))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_confidence_cap() {
        let events: Vec<_> = (0..20)
            .map(|i| plain_event(i, "u1", "frustration"))
            .collect();
        let results = FrictionAnomaly.compute(&ctx_events(&events)).unwrap();
        assert!((results[0].confidence - 0.90).abs() < 1e-9);
    }
}
