//! Search-tool habit derivation
//!
//! Counts `tool:search` tags and `payload.action == "search"` per subject;
//! five or more in a batch derive a `(subject, habit, tool_usage:search)`
//! pattern with count-scaled confidence, capped at 0.92.

use crate::pipeline::module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleError, ModuleResult, ResultKind,
    ResultStatus,
};
use crate::pipeline::modules::{by_subject, clamp01};
use serde_json::json;
use std::collections::BTreeMap;

pub struct SearchHabit;

impl SearchHabit {
    pub const THRESHOLD: usize = 5;
}

impl AnalysisModule for SearchHabit {
    fn name(&self) -> &'static str {
        "search_habit"
    }

    fn version(&self) -> &'static str {
        "0.2.0"
    }

    fn input_kinds(&self) -> &'static [&'static str] {
        &["*"]
    }

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError> {
        let mut results = Vec::new();

        for (subject, events) in by_subject(ctx.events) {
            let hits: Vec<i64> = events
                .iter()
                .filter(|e| {
                    e.has_tag("tool:search")
                        || e.payload.get("action").and_then(|v| v.as_str()) == Some("search")
                })
                .map(|e| e.id)
                .collect();

            let count = hits.len();
            if count < Self::THRESHOLD {
                continue;
            }

            let confidence = clamp01(
                (0.50 + (count - Self::THRESHOLD) as f64 * 0.07).min(0.92),
            );

            let mut flags = BTreeMap::new();
            flags.insert("habit_detected".to_string(), true);

            results.push(ModuleResult {
                module: self.name().to_string(),
                version: self.version().to_string(),
                computed_at: ctx.computed_at,
                subject: subject.to_string(),
                pattern_type: "habit".to_string(),
                key: "tool_usage:search".to_string(),
                kind: ResultKind::Flags,
                status: ResultStatus::Ok,
                score: None,
                flags,
                value: json!({"count": count}),
                confidence,
                evidence: json!({
                    "count": count,
                    "threshold": Self::THRESHOLD,
                    "signals": ["tool:search", "payload.action=search"],
                    "event_ids": hits,
                }),
                inputs: hits.iter().map(|id| InputRef::event(*id)).collect(),
                explain: Explain::text(format!(
                    "{} search-tool uses in the batch (threshold {})",
                    count,
                    Self::THRESHOLD
                )),
            });
        }

        Ok(results)
    }
}
