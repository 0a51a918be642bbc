//! Read-only aggregation over recent events
//!
//! Deterministic counts only; ties are broken by name so repeated calls over
//! the same events produce identical output.

use crate::types::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const TOP_TYPES: usize = 10;
const TOP_TAGS: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeCount {
    pub event_type: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub total: usize,
    pub last_created_at: Option<DateTime<Utc>>,
    pub top_event_types: Vec<TypeCount>,
    pub top_tags: Vec<TagCount>,
}

/// Summarize a slice of events: totals, newest timestamp, and the most
/// frequent event types and tags
pub fn summarize(events: &[Event]) -> EventSummary {
    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_tag: BTreeMap<&str, usize> = BTreeMap::new();
    let mut last: Option<DateTime<Utc>> = None;

    for event in events {
        *by_type.entry(event.event_type.as_str()).or_default() += 1;

        for tag in &event.tags {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            *by_tag.entry(tag).or_default() += 1;
        }

        if last.map_or(true, |ts| event.created_at > ts) {
            last = Some(event.created_at);
        }
    }

    // count descending, then name ascending (BTreeMap iteration is already
    // name-ordered, and the sort below is stable)
    let mut types: Vec<TypeCount> = by_type
        .into_iter()
        .map(|(event_type, count)| TypeCount {
            event_type: event_type.to_string(),
            count,
        })
        .collect();
    types.sort_by(|a, b| b.count.cmp(&a.count));
    types.truncate(TOP_TYPES);

    let mut tags: Vec<TagCount> = by_tag
        .into_iter()
        .map(|(tag, count)| TagCount {
            tag: tag.to_string(),
            count,
        })
        .collect();
    tags.sort_by(|a, b| b.count.cmp(&a.count));
    tags.truncate(TOP_TAGS);

    EventSummary {
        total: events.len(),
        last_created_at: last,
        top_event_types: types,
        top_tags: tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, tags: &[&str]) -> Event {
        Event {
            id: 1,
            created_at: Utc::now(),
            user_id: None,
            session_id: None,
            event_type: event_type.to_string(),
            source: "api".to_string(),
            confidence: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            payload: json!({}),
        }
    }

    #[test]
    fn test_empty_summary() {
        let summary = summarize(&[]);
        assert_eq!(summary.total, 0);
        assert!(summary.last_created_at.is_none());
        assert!(summary.top_event_types.is_empty());
    }

    #[test]
    fn test_counts_and_ordering() {
        let events = vec![
            event("chat", &["a", "b"]),
            event("chat", &["a"]),
            event("search", &["a"]),
        ];

        let summary = summarize(&events);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.top_event_types[0].event_type, "chat");
        assert_eq!(summary.top_event_types[0].count, 2);
        assert_eq!(summary.top_tags[0].tag, "a");
        assert_eq!(summary.top_tags[0].count, 3);
    }

    #[test]
    fn test_deterministic_tie_break_by_name() {
        let events = vec![event("zeta", &[]), event("alpha", &[])];
        let summary = summarize(&events);
        // equal counts resolve alphabetically
        assert_eq!(summary.top_event_types[0].event_type, "alpha");
        assert_eq!(summary.top_event_types[1].event_type, "zeta");
    }
}
