//! Core data types for events and derived patterns
//!
//! Events are immutable, append-only records of raw interactions. Patterns
//! are derived, upsertable facts keyed by `(subject, pattern_type, key)`,
//! produced exclusively by the pipeline runner.

use crate::error::{Result, TraceryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Allowed length range for `event_type`
pub const EVENT_TYPE_MIN: usize = 2;
pub const EVENT_TYPE_MAX: usize = 64;

/// Allowed length range for `source`
pub const SOURCE_MIN: usize = 2;
pub const SOURCE_MAX: usize = 32;

/// Maximum number of tags retained per event
pub const MAX_TAGS: usize = 50;

/// Hard bounds applied to query limits (silent clamping, not an error)
pub const QUERY_LIMIT_MIN: usize = 1;
pub const QUERY_LIMIT_MAX: usize = 200;

/// An immutable interaction event, as stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Server-assigned, strictly increasing id (the pipeline read cursor)
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl Event {
    /// Logical subject this event belongs to: the user if known, otherwise
    /// the session, otherwise the process-wide "user" bucket.
    pub fn subject(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.session_id.as_deref())
            .unwrap_or("user")
    }

    /// True if the event carries `tag` (exact match on sanitized tags)
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// An event as submitted by a caller, before the store assigns identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn default_source() -> String {
    "api".to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl NewEvent {
    /// Minimal constructor for internal logging call sites
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: default_source(),
            user_id: None,
            session_id: None,
            confidence: None,
            tags: Vec::new(),
            payload: empty_object(),
        }
    }

    /// Validate length and range constraints
    pub fn validate(&self) -> Result<()> {
        let type_len = self.event_type.chars().count();
        if !(EVENT_TYPE_MIN..=EVENT_TYPE_MAX).contains(&type_len) {
            return Err(TraceryError::Validation(format!(
                "event_type length must be between {} and {} characters (got {})",
                EVENT_TYPE_MIN, EVENT_TYPE_MAX, type_len
            )));
        }

        let source_len = self.source.chars().count();
        if !(SOURCE_MIN..=SOURCE_MAX).contains(&source_len) {
            return Err(TraceryError::Validation(format!(
                "source length must be between {} and {} characters (got {})",
                SOURCE_MIN, SOURCE_MAX, source_len
            )));
        }

        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(TraceryError::Validation(format!(
                    "confidence must be within [0.0, 1.0] (got {})",
                    c
                )));
            }
        }

        Ok(())
    }

    /// Trim tags, strip blanks and duplicates, preserve first-seen order,
    /// cap at [`MAX_TAGS`]
    pub fn sanitized_tags(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .filter(|t| seen.insert(t.to_string()))
            .take(MAX_TAGS)
            .map(str::to_string)
            .collect()
    }
}

/// A derived, confidence-scored fact with supporting evidence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub id: i64,
    /// Usually a user or session identity
    pub subject: String,
    /// Module-defined type, e.g. "preference", "habit", "anomaly"
    pub pattern_type: String,
    /// Module-defined sub-identity within a type
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    /// References the contributing event ids and rule thresholds
    pub evidence: Value,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    /// Natural identity used by the upsert path
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.subject, &self.pattern_type, &self.key)
    }
}

/// Normalize a pattern `value` read from heterogeneous writers.
///
/// Accepts a native JSON document or a string containing a JSON-encoded
/// document, and returns one canonical in-memory shape so module logic never
/// branches on representation. Unparseable strings are wrapped under `_raw`.
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Null => empty_object(),
        Value::String(s) => {
            let trimmed = s.trim();
            match serde_json::from_str::<Value>(trimmed) {
                Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                _ => serde_json::json!({ "_raw": s }),
            }
        }
        other => other.clone(),
    }
}

/// Clamp a caller-supplied limit into the supported window
pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(QUERY_LIMIT_MIN, QUERY_LIMIT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with(user: Option<&str>, session: Option<&str>) -> Event {
        Event {
            id: 1,
            created_at: Utc::now(),
            user_id: user.map(str::to_string),
            session_id: session.map(str::to_string),
            event_type: "chat".to_string(),
            source: "api".to_string(),
            confidence: None,
            tags: vec!["a".to_string()],
            payload: json!({}),
        }
    }

    #[test]
    fn test_subject_prefers_user_over_session() {
        assert_eq!(event_with(Some("u1"), Some("s1")).subject(), "u1");
        assert_eq!(event_with(None, Some("s1")).subject(), "s1");
        assert_eq!(event_with(None, None).subject(), "user");
    }

    #[test]
    fn test_validate_event_type_length() {
        let mut e = NewEvent::new("x");
        assert!(e.validate().is_err());

        e.event_type = "chat".to_string();
        assert!(e.validate().is_ok());

        e.event_type = "x".repeat(65);
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_validate_confidence_range() {
        let mut e = NewEvent::new("chat");
        e.confidence = Some(1.5);
        assert!(e.validate().is_err());

        e.confidence = Some(0.5);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_sanitized_tags_strips_blanks_and_duplicates() {
        let mut e = NewEvent::new("chat");
        e.tags = vec![
            " a ".to_string(),
            "b".to_string(),
            "".to_string(),
            "  ".to_string(),
            "a".to_string(),
            "c".to_string(),
        ];
        assert_eq!(e.sanitized_tags(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sanitized_tags_caps_count() {
        let mut e = NewEvent::new("chat");
        e.tags = (0..100).map(|i| format!("tag{}", i)).collect();
        assert_eq!(e.sanitized_tags().len(), MAX_TAGS);
    }

    #[test]
    fn test_normalize_value_accepts_both_forms() {
        let native = json!({"level": "high"});
        assert_eq!(normalize_value(&native), native);

        let encoded = Value::String("{\"level\":\"high\"}".to_string());
        assert_eq!(normalize_value(&encoded), native);

        let plain = Value::String("high".to_string());
        assert_eq!(normalize_value(&plain), json!({"_raw": "high"}));

        assert_eq!(normalize_value(&Value::Null), json!({}));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(25), 25);
        assert_eq!(clamp_limit(10_000), 200);
    }
}
