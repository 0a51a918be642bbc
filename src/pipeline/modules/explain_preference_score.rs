//! Deterministic score over the explain-level preference pattern
//!
//! Consumes the pattern snapshot, not raw events: for each subject in the
//! batch it reads the `(subject, preference, explain_level)` pattern, maps
//! the level to a base weight and multiplies by the normalized confidence.
//! Subjects without the pattern get a `warn` zero-score result so the
//! absence is visible downstream.

use crate::pipeline::module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleError, ModuleResult, ResultKind,
    ResultStatus,
};
use crate::pipeline::modules::clamp01;
use crate::types::Pattern;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

pub struct ExplainPreferenceScore;

impl ExplainPreferenceScore {
    /// Level weights; unknown levels score zero
    fn level_base(level: &str) -> f64 {
        match level {
            "high" => 1.0,
            "medium" => 0.6,
            "low" => 0.2,
            _ => 0.0,
        }
    }

    /// Extract the level from a normalized pattern value. Writers may have
    /// stored `{"level": "high"}` or a bare string (normalized to `_raw`).
    fn extract_level(value: &Value) -> String {
        if let Some(level) = value.get("level").and_then(|v| v.as_str()) {
            let level = level.trim();
            if !level.is_empty() {
                return level.to_lowercase();
            }
        }
        if let Some(raw) = value.get("_raw").and_then(|v| v.as_str()) {
            let raw = raw.trim();
            if !raw.is_empty() {
                return raw.to_lowercase();
            }
        }
        if let Some(s) = value.as_str() {
            let s = s.trim();
            if !s.is_empty() {
                return s.to_lowercase();
            }
        }
        "unknown".to_string()
    }

    /// Tolerate percentage-style confidences from older writers
    fn normalize_confidence(confidence: f64) -> f64 {
        let c = if confidence > 1.0 {
            confidence / 100.0
        } else {
            confidence
        };
        clamp01(c)
    }

    fn round4(x: f64) -> f64 {
        (x * 10_000.0).round() / 10_000.0
    }

    fn preference_for<'a>(patterns: &'a [Pattern], subject: &str) -> Option<&'a Pattern> {
        patterns.iter().find(|p| {
            p.subject == subject && p.pattern_type == "preference" && p.key == "explain_level"
        })
    }
}

impl AnalysisModule for ExplainPreferenceScore {
    fn name(&self) -> &'static str {
        "explain_preference_score"
    }

    fn version(&self) -> &'static str {
        "0.3.0"
    }

    fn input_kinds(&self) -> &'static [&'static str] {
        &["*"]
    }

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError> {
        let subjects: BTreeSet<&str> = ctx.events.iter().map(|e| e.subject()).collect();
        let mut results = Vec::new();

        for subject in subjects {
            match Self::preference_for(ctx.patterns, subject) {
                Some(pattern) => {
                    let level = Self::extract_level(&pattern.value);
                    let base = Self::level_base(&level);
                    let confidence = Self::normalize_confidence(pattern.confidence);
                    let score = Self::round4(clamp01(base * confidence));

                    let mut flags = BTreeMap::new();
                    flags.insert("has_preference".to_string(), true);
                    flags.insert("pref_high".to_string(), level == "high");
                    flags.insert("pref_medium".to_string(), level == "medium");
                    flags.insert("pref_low".to_string(), level == "low");

                    results.push(ModuleResult {
                        module: self.name().to_string(),
                        version: self.version().to_string(),
                        computed_at: ctx.computed_at,
                        subject: subject.to_string(),
                        pattern_type: "score".to_string(),
                        key: "explain_preference".to_string(),
                        kind: ResultKind::Score,
                        status: ResultStatus::Ok,
                        score: Some(score),
                        flags,
                        value: json!({
                            "level": level,
                            "base_score": base,
                            "confidence": confidence,
                            "score": score,
                        }),
                        confidence,
                        evidence: json!({
                            "pattern_id": pattern.id,
                            "pattern_key": "explain_level",
                            "raw_value": pattern.value,
                            "raw_confidence": pattern.confidence,
                        }),
                        inputs: vec![InputRef::pattern(pattern.id, "explain_level")],
                        explain: Explain {
                            text: format!(
                                "explain preference '{}' with confidence {:.2} gives score \
                                 {:.2} (base {:.2} x confidence)",
                                level, confidence, score, base
                            ),
                            debug: json!({
                                "pattern": {
                                    "id": pattern.id,
                                    "subject": pattern.subject,
                                    "value": pattern.value,
                                    "confidence": pattern.confidence,
                                }
                            }),
                        },
                    });
                }
                None => {
                    let mut flags = BTreeMap::new();
                    flags.insert("has_preference".to_string(), false);

                    results.push(ModuleResult {
                        module: self.name().to_string(),
                        version: self.version().to_string(),
                        computed_at: ctx.computed_at,
                        subject: subject.to_string(),
                        pattern_type: "score".to_string(),
                        key: "explain_preference".to_string(),
                        kind: ResultKind::Score,
                        status: ResultStatus::Warn,
                        score: Some(0.0),
                        flags,
                        value: json!({
                            "level": null,
                            "base_score": 0.0,
                            "confidence": 0.0,
                            "score": 0.0,
                        }),
                        confidence: 0.0,
                        evidence: json!({
                            "searched": {"pattern_type": "preference", "key": "explain_level"},
                        }),
                        inputs: vec![InputRef::custom("no matching preference pattern found")],
                        explain: Explain::text(
                            "no explain_level preference pattern for this subject; score 0.0",
                        ),
                    });
                }
            }
        }

        Ok(results)
    }
}
