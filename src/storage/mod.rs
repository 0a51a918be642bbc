//! Storage layer for events, patterns and the pipeline cursor
//!
//! Provides the store contracts and the libSQL implementation. Events are
//! append-only; patterns are upserted by natural identity; the cursor is the
//! id of the last event the pipeline has consumed.

pub mod libsql;

use crate::error::Result;
use crate::types::{Event, NewEvent, Pattern};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::libsql::{ConnectionMode, LibsqlStorage};

/// Receipt for a durable event append
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appended {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

/// Sort column for pattern queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternOrder {
    Confidence,
    LastSeen,
    CreatedAt,
    UpdatedAt,
}

impl PatternOrder {
    fn column(self) -> &'static str {
        match self {
            PatternOrder::Confidence => "confidence",
            PatternOrder::LastSeen => "last_seen",
            PatternOrder::CreatedAt => "created_at",
            PatternOrder::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn keyword(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// Filters and paging for the pattern query endpoint
#[derive(Debug, Clone)]
pub struct PatternQuery {
    pub limit: usize,
    pub offset: usize,
    pub order: PatternOrder,
    pub direction: SortDirection,
    pub subject: Option<String>,
    pub pattern_type: Option<String>,
    pub min_confidence: f64,
}

impl Default for PatternQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            order: PatternOrder::Confidence,
            direction: SortDirection::Desc,
            subject: None,
            pattern_type: None,
            min_confidence: 0.0,
        }
    }
}

/// One page of pattern results with the unpaged total
#[derive(Debug, Clone)]
pub struct PatternPage {
    pub total: i64,
    pub items: Vec<Pattern>,
}

/// A pattern write keyed by natural identity `(subject, pattern_type, key)`
#[derive(Debug, Clone)]
pub struct PatternUpsert {
    pub subject: String,
    pub pattern_type: String,
    pub key: String,
    pub value: Value,
    pub confidence: f64,
    pub evidence: Value,
    pub last_seen: DateTime<Utc>,
}

/// Append-only event persistence
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably append one event. The write is committed before this returns.
    async fn append(&self, event: &NewEvent) -> Result<Appended>;

    /// Most recent events, newest first. `limit` is clamped into [1, 200].
    async fn recent(&self, limit: usize, event_type: Option<&str>) -> Result<Vec<Event>>;

    /// Events with `id > cursor`, oldest first, bounded by `batch_size`
    /// (the pipeline read path).
    async fn events_after(&self, cursor: i64, batch_size: usize) -> Result<Vec<Event>>;
}

/// Derived-pattern persistence plus the pipeline cursor
#[async_trait]
pub trait PatternStore: Send + Sync {
    /// Insert or update by `(subject, pattern_type, key)`; atomic per row,
    /// last-writer-wins on `updated_at`.
    async fn upsert_pattern(&self, upsert: &PatternUpsert) -> Result<()>;

    /// Full current pattern set for the given subjects (module context)
    async fn patterns_for_subjects(&self, subjects: &[String]) -> Result<Vec<Pattern>>;

    /// Filtered, ordered, paged pattern listing (dashboard read path)
    async fn query_patterns(&self, query: &PatternQuery) -> Result<PatternPage>;

    /// Id of the last event the pipeline has consumed (0 before any run)
    async fn cursor(&self) -> Result<i64>;

    /// Move the cursor forward; ignored if `to` is not ahead of the cursor
    async fn advance_cursor(&self, to: i64) -> Result<()>;
}

/// Combined storage contract used by the API server and pipeline runner
pub trait Storage: EventStore + PatternStore {}

impl<T: EventStore + PatternStore> Storage for T {}
