//! Pattern-volume anomaly flags
//!
//! Watches the pattern snapshot itself: an empty store or an implausibly
//! large one are both worth flagging. Thresholds are deliberately simple
//! and transparent.

use crate::pipeline::module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleError, ModuleResult, ResultKind,
    ResultStatus,
};
use serde_json::json;
use std::collections::BTreeMap;

pub struct VolumeAnomaly;

impl VolumeAnomaly {
    pub const MIN_EXPECTED: usize = 1;
    pub const HIGH_VOLUME: usize = 100;
}

impl AnalysisModule for VolumeAnomaly {
    fn name(&self) -> &'static str {
        "volume_anomaly"
    }

    fn version(&self) -> &'static str {
        "0.2.0"
    }

    fn input_kinds(&self) -> &'static [&'static str] {
        &["*"]
    }

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError> {
        let total = ctx.patterns.len();

        let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
        for pattern in ctx.patterns {
            *by_type.entry(pattern.pattern_type.as_str()).or_default() += 1;
        }

        let low = total < Self::MIN_EXPECTED;
        let high = total > Self::HIGH_VOLUME;

        let mut flags = BTreeMap::new();
        flags.insert("low_volume".to_string(), low);
        flags.insert("high_volume".to_string(), high);

        let status = if low || high {
            ResultStatus::Warn
        } else {
            ResultStatus::Ok
        };

        let inputs = ctx
            .patterns
            .iter()
            .map(|p| InputRef::pattern(p.id, &p.key))
            .collect();

        Ok(vec![ModuleResult {
            module: self.name().to_string(),
            version: self.version().to_string(),
            computed_at: ctx.computed_at,
            subject: "system".to_string(),
            pattern_type: "anomaly".to_string(),
            key: "patterns_volume".to_string(),
            kind: ResultKind::Flags,
            status,
            score: None,
            flags,
            value: json!({
                "total": total,
                "by_type": by_type,
            }),
            confidence: 1.0,
            evidence: json!({
                "total": total,
                "min_expected": Self::MIN_EXPECTED,
                "high_volume": Self::HIGH_VOLUME,
            }),
            inputs,
            explain: Explain::text(format!(
                "{} patterns in snapshot (expected between {} and {})",
                total,
                Self::MIN_EXPECTED,
                Self::HIGH_VOLUME
            )),
        }])
    }
}
