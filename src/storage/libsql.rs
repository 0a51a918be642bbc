//! LibSQL storage backend implementation
//!
//! Persists events and patterns in a local libSQL database with an embedded
//! schema. The backend holds a single connection: libSQL in-memory databases
//! do not share state across connections, and one serialized writer also
//! gives appends their synchronous-commit semantics.

use crate::error::{Result, TraceryError};
use crate::storage::{
    Appended, EventStore, PatternPage, PatternQuery, PatternStore, PatternUpsert,
};
use crate::types::{clamp_limit, Event, NewEvent, Pattern};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Builder, Connection, Database};
use serde_json::Value;
use tracing::{debug, info};

/// Embedded schema, applied idempotently at connect time
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS learning_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    user_id TEXT,
    session_id TEXT,
    event_type TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'api',
    confidence REAL CHECK(confidence IS NULL OR (confidence BETWEEN 0.0 AND 1.0)),
    tags TEXT NOT NULL DEFAULT '[]',
    payload TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_events_created_at ON learning_events(created_at DESC);

CREATE INDEX IF NOT EXISTS idx_events_type ON learning_events(event_type);

CREATE TABLE IF NOT EXISTS learning_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL,
    pattern_type TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL CHECK(confidence BETWEEN 0.0 AND 1.0),
    evidence TEXT NOT NULL DEFAULT '{}',
    last_seen TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (subject, pattern_type, key)
);

CREATE INDEX IF NOT EXISTS idx_patterns_subject ON learning_patterns(subject);

CREATE TABLE IF NOT EXISTS pipeline_cursor (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_event_id INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

/// Database connection mode
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// In-memory database (for testing)
    InMemory,
}

/// LibSQL storage backend
pub struct LibsqlStorage {
    _db: Database,
    conn: Connection,
}

impl LibsqlStorage {
    /// Connect and apply the embedded schema
    pub async fn connect(mode: ConnectionMode) -> Result<Self> {
        let path = match &mode {
            ConnectionMode::Local(path) => path.as_str(),
            ConnectionMode::InMemory => ":memory:",
        };

        if let ConnectionMode::Local(path) = &mode {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        TraceryError::StoreUnavailable(format!(
                            "failed to create database directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }
        }

        let db = Builder::new_local(path).build().await.map_err(|e| {
            TraceryError::StoreUnavailable(format!("failed to open database {}: {}", path, e))
        })?;

        let conn = db.connect().map_err(|e| {
            TraceryError::StoreUnavailable(format!("failed to connect to database: {}", e))
        })?;

        let storage = Self { _db: db, conn };
        storage.init_schema().await?;

        info!(mode = ?mode, "libSQL storage ready");
        Ok(storage)
    }

    /// Convenience constructor for a local file-based database
    pub async fn open(path: &str) -> Result<Self> {
        Self::connect(ConnectionMode::Local(path.to_string())).await
    }

    /// Convenience constructor for tests
    pub async fn in_memory() -> Result<Self> {
        Self::connect(ConnectionMode::InMemory).await
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();

            if !statement.is_empty() {
                self.conn.execute(&statement, params![]).await.map_err(|e| {
                    TraceryError::Database(format!("schema statement failed: {}", e))
                })?;
            }
        }

        // Seed the single cursor row
        self.conn
            .execute(
                "INSERT OR IGNORE INTO pipeline_cursor (id, last_event_id, updated_at) \
                 VALUES (1, 0, ?)",
                params![Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| TraceryError::Database(format!("cursor seed failed: {}", e)))?;

        debug!("schema initialized");
        Ok(())
    }

    fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TraceryError::Database(format!("invalid timestamp {:?}: {}", raw, e)))
    }

    /// Parse stored JSON text; malformed text survives as a raw string so
    /// readers can still normalize it downstream.
    fn parse_json(raw: String) -> Value {
        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
    }

    fn row_to_event(row: &libsql::Row) -> Result<Event> {
        let id: i64 = row.get(0)?;
        let created_at: String = row.get(1)?;
        let user_id: Option<String> = row.get(2)?;
        let session_id: Option<String> = row.get(3)?;
        let event_type: String = row.get(4)?;
        let source: String = row.get(5)?;
        let confidence: Option<f64> = row.get(6)?;
        let tags_json: String = row.get(7)?;
        let payload_json: String = row.get(8)?;

        let tags: Vec<String> = serde_json::from_str(&tags_json)?;

        Ok(Event {
            id,
            created_at: Self::parse_timestamp(&created_at)?,
            user_id,
            session_id,
            event_type,
            source,
            confidence,
            tags,
            payload: Self::parse_json(payload_json),
        })
    }

    fn row_to_pattern(row: &libsql::Row) -> Result<Pattern> {
        let id: i64 = row.get(0)?;
        let subject: String = row.get(1)?;
        let pattern_type: String = row.get(2)?;
        let key: String = row.get(3)?;
        let value_json: String = row.get(4)?;
        let confidence: f64 = row.get(5)?;
        let evidence_json: String = row.get(6)?;
        let last_seen: String = row.get(7)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Pattern {
            id,
            subject,
            pattern_type,
            key,
            value: Self::parse_json(value_json),
            confidence,
            evidence: Self::parse_json(evidence_json),
            last_seen: Self::parse_timestamp(&last_seen)?,
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
        })
    }
}

const EVENT_COLUMNS: &str =
    "id, created_at, user_id, session_id, event_type, source, confidence, tags, payload";

const PATTERN_COLUMNS: &str =
    "id, subject, pattern_type, key, value, confidence, evidence, last_seen, created_at, updated_at";

#[async_trait]
impl EventStore for LibsqlStorage {
    async fn append(&self, event: &NewEvent) -> Result<Appended> {
        event.validate()?;

        let created_at = Utc::now();
        let tags = serde_json::to_string(&event.sanitized_tags())?;
        let payload = serde_json::to_string(&event.payload)?;

        // RETURNING keeps the id read atomic with the insert under
        // concurrent appends on the shared connection.
        let mut rows = self
            .conn
            .query(
                "INSERT INTO learning_events \
                 (created_at, user_id, session_id, event_type, source, confidence, tags, payload) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
                params![
                    created_at.to_rfc3339(),
                    event.user_id.clone(),
                    event.session_id.clone(),
                    event.event_type.clone(),
                    event.source.clone(),
                    event.confidence,
                    tags,
                    payload
                ],
            )
            .await
            .map_err(|e| TraceryError::StoreUnavailable(format!("event append failed: {}", e)))?;

        let row = rows
            .next()
            .await
            .map_err(|e| TraceryError::StoreUnavailable(format!("event append failed: {}", e)))?
            .ok_or_else(|| TraceryError::Database("append returned no id".to_string()))?;

        let id: i64 = row.get(0)?;
        debug!(id, event_type = %event.event_type, "event appended");

        Ok(Appended { id, created_at })
    }

    async fn recent(&self, limit: usize, event_type: Option<&str>) -> Result<Vec<Event>> {
        let limit = clamp_limit(limit) as i64;

        let mut rows = match event_type {
            Some(event_type) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {} FROM learning_events WHERE event_type = ? \
                             ORDER BY id DESC LIMIT ?",
                            EVENT_COLUMNS
                        ),
                        params![event_type.to_string(), limit],
                    )
                    .await?
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {} FROM learning_events ORDER BY id DESC LIMIT ?",
                            EVENT_COLUMNS
                        ),
                        params![limit],
                    )
                    .await?
            }
        };

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(Self::row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn events_after(&self, cursor: i64, batch_size: usize) -> Result<Vec<Event>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {} FROM learning_events WHERE id > ? ORDER BY id ASC LIMIT ?",
                    EVENT_COLUMNS
                ),
                params![cursor, batch_size as i64],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(Self::row_to_event(&row)?);
        }
        Ok(events)
    }
}

#[async_trait]
impl PatternStore for LibsqlStorage {
    async fn upsert_pattern(&self, upsert: &PatternUpsert) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let value = serde_json::to_string(&upsert.value)?;
        let evidence = serde_json::to_string(&upsert.evidence)?;

        self.conn
            .execute(
                "INSERT INTO learning_patterns \
                 (subject, pattern_type, key, value, confidence, evidence, last_seen, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (subject, pattern_type, key) DO UPDATE SET \
                 value = excluded.value, \
                 confidence = excluded.confidence, \
                 evidence = excluded.evidence, \
                 last_seen = excluded.last_seen, \
                 updated_at = excluded.updated_at",
                params![
                    upsert.subject.clone(),
                    upsert.pattern_type.clone(),
                    upsert.key.clone(),
                    value,
                    upsert.confidence,
                    evidence,
                    upsert.last_seen.to_rfc3339(),
                    now.clone(),
                    now
                ],
            )
            .await
            .map_err(|e| TraceryError::Database(format!("pattern upsert failed: {}", e)))?;

        Ok(())
    }

    async fn patterns_for_subjects(&self, subjects: &[String]) -> Result<Vec<Pattern>> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; subjects.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM learning_patterns WHERE subject IN ({}) ORDER BY id ASC",
            PATTERN_COLUMNS, placeholders
        );

        let args: Vec<libsql::Value> = subjects
            .iter()
            .map(|s| libsql::Value::Text(s.clone()))
            .collect();

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(args))
            .await?;

        let mut patterns = Vec::new();
        while let Some(row) = rows.next().await? {
            patterns.push(Self::row_to_pattern(&row)?);
        }
        Ok(patterns)
    }

    async fn query_patterns(&self, query: &PatternQuery) -> Result<PatternPage> {
        let mut where_clauses = vec!["confidence >= ?".to_string()];
        let mut args: Vec<libsql::Value> = vec![libsql::Value::Real(query.min_confidence)];

        if let Some(subject) = &query.subject {
            where_clauses.push("subject = ?".to_string());
            args.push(libsql::Value::Text(subject.clone()));
        }
        if let Some(pattern_type) = &query.pattern_type {
            where_clauses.push("pattern_type = ?".to_string());
            args.push(libsql::Value::Text(pattern_type.clone()));
        }

        let where_sql = where_clauses.join(" AND ");

        let mut count_rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM learning_patterns WHERE {}", where_sql),
                libsql::params_from_iter(args.clone()),
            )
            .await?;

        let total: i64 = match count_rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };

        let sql = format!(
            "SELECT {} FROM learning_patterns WHERE {} ORDER BY {} {} LIMIT ? OFFSET ?",
            PATTERN_COLUMNS,
            where_sql,
            query.order.column(),
            query.direction.keyword(),
        );

        args.push(libsql::Value::Integer(clamp_limit(query.limit) as i64));
        args.push(libsql::Value::Integer(query.offset as i64));

        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(args))
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(Self::row_to_pattern(&row)?);
        }

        Ok(PatternPage { total, items })
    }

    async fn cursor(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_event_id FROM pipeline_cursor WHERE id = 1",
                params![],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    async fn advance_cursor(&self, to: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pipeline_cursor SET last_event_id = ?, updated_at = ? \
                 WHERE id = 1 AND last_event_id < ?",
                params![to, Utc::now().to_rfc3339(), to],
            )
            .await
            .map_err(|e| TraceryError::Database(format!("cursor advance failed: {}", e)))?;
        Ok(())
    }
}
