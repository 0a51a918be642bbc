//! Tracery - Deterministic Event-Learning Pipeline
//!
//! An append-only ingestion log captures raw interaction events; a registry
//! of pluggable, deterministic analysis modules derives explainable,
//! confidence-scored patterns from them; a streaming broker pushes
//! incremental updates (chat tokens, dashboard refresh signals) to
//! long-lived HTTP connections.
//!
//! # Architecture
//!
//! - **Types**: core data structures (Event, Pattern, value normalization)
//! - **Storage**: libSQL-backed event log, pattern store and cursor
//! - **Pipeline**: module contract, registry and the batch runner
//! - **Stream**: typed envelopes, per-connection queues, fan-out broker
//! - **Gate**: process-wide feature flags with irreversible kill switch
//! - **API**: axum HTTP surface (ingestion, queries, SSE streams)
//!
//! # Example
//!
//! ```ignore
//! use tracery::api::{ApiServer, ApiServerConfig, AppState};
//! use tracery::config::TraceryConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TraceryConfig::default();
//!     let state = AppState::initialize(&config).await?;
//!     ApiServer::new(ApiServerConfig::default(), state).serve().await
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod stream;
pub mod types;

// Re-export commonly used types
pub use config::TraceryConfig;
pub use error::{Result, TraceryError};
pub use gate::Gate;
pub use pipeline::{AnalysisModule, ModuleRegistry, PipelineRunner, RunOutcome, RunReport};
pub use storage::{ConnectionMode, EventStore, LibsqlStorage, PatternStore, Storage};
pub use stream::{StreamBroker, StreamMessage};
pub use types::{Event, NewEvent, Pattern};
