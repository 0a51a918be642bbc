//! Deterministic event-learning pipeline
//!
//! The module contract, the registry, the batch runner and the built-in
//! analysis modules. The pipeline reads events past a durable cursor,
//! derives explainable patterns and upserts them by natural identity; it is
//! strictly read-only with respect to the event log.

pub mod module;
pub mod modules;
pub mod registry;
pub mod runner;
pub mod summary;

pub use module::{
    AnalysisModule, Explain, InputRef, ModuleContext, ModuleDescriptor, ModuleError, ModuleResult,
    ResultKind, ResultStatus,
};
pub use registry::ModuleRegistry;
pub use runner::{PipelineRunner, RunOutcome, RunReport};
pub use summary::{summarize, EventSummary};
