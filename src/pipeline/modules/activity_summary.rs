//! Per-subject activity summary
//!
//! Pure count data: event-type and tag histograms for every subject in the
//! batch, upserted as `(subject, summary, activity)`.

use crate::pipeline::module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleError, ModuleResult, ResultKind,
    ResultStatus,
};
use crate::pipeline::modules::by_subject;
use serde_json::json;
use std::collections::BTreeMap;

pub struct ActivitySummary;

impl AnalysisModule for ActivitySummary {
    fn name(&self) -> &'static str {
        "activity_summary"
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn input_kinds(&self) -> &'static [&'static str] {
        &["*"]
    }

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError> {
        let mut results = Vec::new();

        for (subject, events) in by_subject(ctx.events) {
            let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
            let mut by_tag: BTreeMap<&str, usize> = BTreeMap::new();
            let ids: Vec<i64> = events.iter().map(|e| e.id).collect();

            for event in &events {
                *by_type.entry(event.event_type.as_str()).or_default() += 1;
                for tag in &event.tags {
                    *by_tag.entry(tag.as_str()).or_default() += 1;
                }
            }

            results.push(ModuleResult {
                module: self.name().to_string(),
                version: self.version().to_string(),
                computed_at: ctx.computed_at,
                subject: subject.to_string(),
                pattern_type: "summary".to_string(),
                key: "activity".to_string(),
                kind: ResultKind::Summary,
                status: ResultStatus::Ok,
                score: None,
                flags: Default::default(),
                value: json!({
                    "total": events.len(),
                    "by_type": by_type,
                    "by_tag": by_tag,
                }),
                confidence: 1.0,
                evidence: json!({"event_ids": ids}),
                inputs: ids.iter().map(|id| InputRef::event(*id)).collect(),
                explain: Explain::text(format!(
                    "{} events for {} in this batch",
                    events.len(),
                    subject
                )),
            });
        }

        Ok(results)
    }
}
