//! Analysis module contract
//!
//! A module is a pure, versioned function from a bounded event batch (plus
//! the current pattern snapshot for the touched subjects) to zero or more
//! results. No side effects, no network, no randomness, no clock reads
//! besides the `computed_at` supplied in the context: every result must be
//! reconstructable from its inputs and the module's published rule set.

use crate::types::{Event, Pattern};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Result kind discriminant (public contract; changing values requires a
/// module version bump)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Score,
    Flags,
    Suggestion,
    Summary,
}

/// Result status discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Warn,
    Error,
}

/// Reference to a source actually used for a result (audit trail)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRef {
    /// "learning_events", "learning_patterns" or "custom"
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl InputRef {
    pub fn event(id: i64) -> Self {
        Self {
            source: "learning_events".to_string(),
            id: Some(id.to_string()),
            key: None,
            note: None,
        }
    }

    pub fn pattern(id: i64, key: &str) -> Self {
        Self {
            source: "learning_patterns".to_string(),
            id: Some(id.to_string()),
            key: Some(key.to_string()),
            note: None,
        }
    }

    pub fn custom(note: &str) -> Self {
        Self {
            source: "custom".to_string(),
            id: None,
            key: None,
            note: Some(note.to_string()),
        }
    }
}

/// Human-readable rationale, with optional technical details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explain {
    pub text: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub debug: Value,
}

impl Explain {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            debug: Value::Null,
        }
    }
}

/// Standard output of one module invocation (data only, no side effects)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: String,
    pub version: String,
    pub computed_at: DateTime<Utc>,

    /// Pattern identity this result upserts into
    pub subject: String,
    pub pattern_type: String,
    pub key: String,

    pub kind: ResultKind,
    pub status: ResultStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, bool>,
    pub value: Value,
    pub confidence: f64,

    /// Persisted as the pattern's evidence document
    pub evidence: Value,

    /// Sources actually consumed (audit trail)
    pub inputs: Vec<InputRef>,

    pub explain: Explain,
}

/// Static identity a module declares at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    /// Event kinds this module consumes ("*" for all)
    pub input_kinds: Vec<String>,
    pub enabled: bool,
}

/// Read-only context handed to a module: the batch's events, the current
/// pattern set for the subjects touched by the batch, and the run timestamp.
/// Nothing else is reachable from here.
pub struct ModuleContext<'a> {
    pub events: &'a [Event],
    pub patterns: &'a [Pattern],
    pub computed_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("module computation failed: {0}")]
    Failed(String),
}

/// Contract for a deterministic analysis module.
///
/// Implementations must be pure: identical context in, identical results
/// out (modulo `computed_at`, which comes from the context).
pub trait AnalysisModule: Send + Sync {
    /// Unique module name
    fn name(&self) -> &'static str;

    /// Version, bumped on any rule or contract change
    fn version(&self) -> &'static str;

    /// Event kinds this module consumes
    fn input_kinds(&self) -> &'static [&'static str];

    fn compute(&self, ctx: &ModuleContext) -> Result<Vec<ModuleResult>, ModuleError>;
}
