//! Explain-level preference derivation
//!
//! A subject that repeatedly asks for explanations gets a
//! `(subject, preference, explain_level)` pattern. Rule: at least
//! [`ExplainPreference::THRESHOLD`] `ask_explain` events or tags in the
//! batch; confidence grows with the count, capped at 0.95.

use crate::pipeline::module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleError, ModuleResult, ResultKind,
    ResultStatus,
};
use crate::pipeline::modules::{by_subject, clamp01};
use serde_json::json;

pub struct ExplainPreference;

impl ExplainPreference {
    pub const THRESHOLD: usize = 4;

    const SIGNALS: [&'static str; 2] = ["ask_explain", "pref:explain"];
}

impl AnalysisModule for ExplainPreference {
    fn name(&self) -> &'static str {
        "explain_preference"
    }

    fn version(&self) -> &'static str {
        "0.2.0"
    }

    fn input_kinds(&self) -> &'static [&'static str] {
        &["ask_explain", "*"]
    }

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError> {
        let mut results = Vec::new();

        for (subject, events) in by_subject(ctx.events) {
            let hits: Vec<i64> = events
                .iter()
                .filter(|e| {
                    e.event_type == "ask_explain"
                        || Self::SIGNALS.iter().any(|signal| e.has_tag(signal))
                })
                .map(|e| e.id)
                .collect();

            let count = hits.len();
            if count < Self::THRESHOLD {
                continue;
            }

            let confidence = clamp01(
                (0.55 + (count - Self::THRESHOLD) as f64 * 0.08).min(0.95),
            );

            results.push(ModuleResult {
                module: self.name().to_string(),
                version: self.version().to_string(),
                computed_at: ctx.computed_at,
                subject: subject.to_string(),
                pattern_type: "preference".to_string(),
                key: "explain_level".to_string(),
                kind: ResultKind::Suggestion,
                status: ResultStatus::Ok,
                score: None,
                flags: Default::default(),
                value: json!({"level": "high"}),
                confidence,
                evidence: json!({
                    "count": count,
                    "threshold": Self::THRESHOLD,
                    "signals": Self::SIGNALS,
                    "event_ids": hits,
                }),
                inputs: hits.iter().map(|id| InputRef::event(*id)).collect(),
                explain: Explain::text(format!(
                    "{} ask_explain signals in the batch (threshold {}); \
                     subject prefers detailed explanations",
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
    fn test_below_threshold_produces_nothing() {
        let events: Vec<_> = (0..3)
            .map(|i| plain_event(i, "u1", "ask_explain"))
            .collect();
        let results = ExplainPreference.compute(&ctx_events(&events)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_threshold_met_derives_preference() {
        let events: Vec<_> = (0..4)
            .map(|i| plain_event(i, "u1", "ask_explain"))
            .collect();
        let results = ExplainPreference.compute(&ctx_events(&events)).unwrap();

        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.subject, "u1");
        assert_eq!(r.pattern_type, "preference");
        assert_eq!(r.key, "explain_level");
        assert_eq!(r.value, json!({"level": "high"}));
        assert!((r.confidence - 0.55).abs() < 1e-9);
        assert_eq!(r.evidence["count"], json!(4));
        assert_eq!(r.inputs.len(), 4);
    }

    #[test]
    fn test_confidence_is_capped() {
        let events: Vec<_> = (0..50)
            .map(|i| plain_event(i, "u1", "ask_explain"))
            .collect();
        let results = ExplainPreference.compute(&ctx_events(&events)).unwrap();
        assert!((results[0].confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_tag_signals_count_too() {
        let mut events: Vec<_> = (0..2)
            .map(|i| plain_event(i, "u1", "ask_explain"))
            .collect();
        events.push(event(2, "u1", "chat", &["ask_explain"], json!({})));
        events.push(event(3, "u1", "chat", &["pref:explain"], json!({})));

        let results = ExplainPreference.compute(&ctx_events(&events)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].evidence["count"], json!(4));
    }

    #[test]
    fn test_subjects_are_independent() {
        let mut events: Vec<_> = (0..4)
            .map(|i| plain_event(i, "u1", "ask_explain"))
            .collect();
        events.extend((4..6).map(|i| plain_event(i, "u2", "ask_explain")));

        let results = ExplainPreference.compute(&ctx_events(&events)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].subject, "u1");
    }

    #[test]
    fn test_deterministic_output() {
        let events: Vec<_> = (0..5)
            .map(|i| plain_event(i, "u1", "ask_explain"))
            .collect();
        let computed_at = Utc::now();
        let ctx = ModuleContext {
            events: &events,
            patterns: &[],
            computed_at,
        };

        let a = ExplainPreference.compute(&ctx).unwrap();
        let b = ExplainPreference.compute(&ctx).unwrap();
        assert_eq!(a, b);
    }
}
