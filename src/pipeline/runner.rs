//! Pipeline runner: bounded, deterministic batch processing
//!
//! Pulls the events past the cursor, snapshots the enabled modules, invokes
//! each with a restricted read-only context, and upserts non-error results
//! into the pattern store. Module failures are contained per module; the
//! cursor advances past the batch regardless. At most one run is in flight
//! at a time: a second trigger coalesces instead of queueing.

use crate::error::{Result, TraceryError};
use crate::gate::{Gate, FEATURE_LEARNING, FEATURE_STREAMING};
use crate::pipeline::module::{ModuleContext, ResultStatus};
use crate::pipeline::registry::ModuleRegistry;
use crate::storage::{EventStore, PatternStore, PatternUpsert, Storage};
use crate::stream::StreamBroker;
use crate::types::{normalize_value, Event};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// A batch was processed (possibly empty)
    Ran,
    /// Another run was in flight; this trigger was a no-op
    Coalesced,
    /// The learning feature is disabled or killed
    Disabled,
}

/// Report for one trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub events_processed: usize,
    pub modules_run: usize,
    pub module_errors: usize,
    pub results_rejected: usize,
    pub patterns_written: usize,
    /// Cursor after this trigger
    pub cursor: i64,
    /// True when a subject filter matched nothing and the unfiltered batch
    /// was used instead
    pub filter_fell_back: bool,
}

impl RunReport {
    fn empty(outcome: RunOutcome, cursor: i64) -> Self {
        Self {
            outcome,
            events_processed: 0,
            modules_run: 0,
            module_errors: 0,
            results_rejected: 0,
            patterns_written: 0,
            cursor,
            filter_fell_back: false,
        }
    }
}

/// Single-slot run lock released on drop, so an aborted run (store failure)
/// never wedges the pipeline
struct RunSlot<'a>(&'a AtomicBool);

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Deterministic pipeline runner
pub struct PipelineRunner {
    storage: Arc<dyn Storage>,
    registry: Arc<ModuleRegistry>,
    gate: Arc<Gate>,
    broker: Arc<StreamBroker>,
    batch_size: usize,
    running: AtomicBool,
}

impl PipelineRunner {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<ModuleRegistry>,
        gate: Arc<Gate>,
        broker: Arc<StreamBroker>,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            registry,
            gate,
            broker,
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
        }
    }

    /// Trigger one batch. `subjects` scopes the batch to those subjects,
    /// but only when the filter matches at least one event ("safe" filter).
    pub async fn trigger(&self, subjects: Option<&[String]>) -> Result<RunReport> {
        if !self.gate.is_enabled(FEATURE_LEARNING) {
            debug!("learning disabled; pipeline trigger is a no-op");
            let cursor = self.storage.cursor().await?;
            return Ok(RunReport::empty(RunOutcome::Disabled, cursor));
        }

        if self.running.swap(true, Ordering::SeqCst) {
            debug!("pipeline run already in flight; trigger coalesced");
            let cursor = self.storage.cursor().await?;
            return Ok(RunReport::empty(RunOutcome::Coalesced, cursor));
        }
        let _slot = RunSlot(&self.running);

        self.run_batch(subjects).await
    }

    async fn run_batch(&self, subjects: Option<&[String]>) -> Result<RunReport> {
        let cursor = self.storage.cursor().await?;
        let batch = self.storage.events_after(cursor, self.batch_size).await?;

        if batch.is_empty() {
            debug!(cursor, "no events past cursor");
            return Ok(RunReport::empty(RunOutcome::Ran, cursor));
        }

        // Safe subject filter: applied only when it matches at least one
        // event, so a typo'd subject never produces a silently empty run.
        let mut filter_fell_back = false;
        let filtered: Option<Vec<Event>> = subjects.and_then(|filter| {
            if filter.is_empty() {
                return None;
            }
            let matched: Vec<Event> = batch
                .iter()
                .filter(|e| filter.iter().any(|s| s == e.subject()))
                .cloned()
                .collect();
            if matched.is_empty() {
                warn!(?filter, "subject filter matched nothing; using full batch");
                filter_fell_back = true;
                None
            } else {
                Some(matched)
            }
        });
        let events: &[Event] = filtered.as_deref().unwrap_or(&batch);

        // Pattern snapshot for the subjects touched by the batch, with
        // values normalized once at the read boundary.
        let touched: Vec<String> = events
            .iter()
            .map(|e| e.subject().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut patterns = self.storage.patterns_for_subjects(&touched).await?;
        for pattern in &mut patterns {
            pattern.value = normalize_value(&pattern.value);
            pattern.evidence = normalize_value(&pattern.evidence);
        }

        // Registry snapshot at batch start: enable/disable flips never
        // affect the in-flight batch.
        let modules = self.registry.snapshot_enabled();
        let computed_at = Utc::now();
        let ctx = ModuleContext {
            events,
            patterns: &patterns,
            computed_at,
        };

        let mut module_errors = 0usize;
        let mut results_rejected = 0usize;
        let mut patterns_written = 0usize;

        for module in &modules {
            let outcome = catch_unwind(AssertUnwindSafe(|| module.compute(&ctx)));

            let results = match outcome {
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(
                        module = module.name(),
                        version = module.version(),
                        %message,
                        "module panicked; batch continues"
                    );
                    module_errors += 1;
                    continue;
                }
                Ok(Err(e)) => {
                    error!(
                        module = module.name(),
                        version = module.version(),
                        error = %e,
                        "module failed; batch continues"
                    );
                    module_errors += 1;
                    continue;
                }
                Ok(Ok(results)) => results,
            };

            for result in results {
                if result.status == ResultStatus::Error {
                    warn!(
                        module = %result.module,
                        key = %result.key,
                        "error-status result not persisted"
                    );
                    module_errors += 1;
                    continue;
                }

                if result.subject.trim().is_empty() {
                    let err = TraceryError::InvalidResult(format!(
                        "module {} produced a result with an empty subject",
                        result.module
                    ));
                    warn!(error = %err, "result rejected");
                    results_rejected += 1;
                    continue;
                }

                // Store-level failures abort the run unmodified; the cursor
                // stays put and the run slot is released by the guard.
                self.storage
                    .upsert_pattern(&PatternUpsert {
                        subject: result.subject.clone(),
                        pattern_type: result.pattern_type.clone(),
                        key: result.key.clone(),
                        value: result.value.clone(),
                        confidence: result.confidence.clamp(0.0, 1.0),
                        evidence: result.evidence.clone(),
                        last_seen: result.computed_at,
                    })
                    .await?;
                patterns_written += 1;
            }
        }

        // The cursor moves past the whole batch even when modules failed:
        // the pipeline never re-runs a module against the same range on its
        // own; callers needing a retry re-submit the range explicitly.
        let max_id = batch.last().map(|e| e.id).unwrap_or(cursor);
        self.storage.advance_cursor(max_id).await?;

        if patterns_written > 0 && self.gate.is_enabled(FEATURE_STREAMING) {
            let delivered = self.broker.notify_refresh().await;
            debug!(delivered, "dashboard refresh broadcast");
        }

        info!(
            events = events.len(),
            modules = modules.len(),
            errors = module_errors,
            rejected = results_rejected,
            written = patterns_written,
            cursor = max_id,
            "pipeline batch complete"
        );

        Ok(RunReport {
            outcome: RunOutcome::Ran,
            events_processed: events.len(),
            modules_run: modules.len(),
            module_errors,
            results_rejected,
            patterns_written,
            cursor: max_id,
            filter_fell_back,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Gate;
    use crate::pipeline::module::{
        AnalysisModule, Explain, InputRef, ModuleError, ModuleResult, ResultKind,
    };
    use crate::storage::LibsqlStorage;
    use crate::types::NewEvent;
    use serde_json::json;

    struct CountingModule;

    impl AnalysisModule for CountingModule {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn version(&self) -> &'static str {
            "0.1.0"
        }
        fn input_kinds(&self) -> &'static [&'static str] {
            &["*"]
        }
        fn compute(&self, ctx: &ModuleContext) -> std::result::Result<Vec<ModuleResult>, ModuleError> {
            Ok(vec![ModuleResult {
                module: "counting".to_string(),
                version: "0.1.0".to_string(),
                computed_at: ctx.computed_at,
                subject: "u1".to_string(),
                pattern_type: "summary".to_string(),
                key: "event_count".to_string(),
                kind: ResultKind::Summary,
                status: ResultStatus::Ok,
                score: None,
                flags: Default::default(),
                value: json!({"count": ctx.events.len()}),
                confidence: 1.0,
                evidence: json!({"count": ctx.events.len()}),
                inputs: ctx.events.iter().map(|e| InputRef::event(e.id)).collect(),
                explain: Explain::text("counts the batch"),
            }])
        }
    }

    struct PanickingModule;

    impl AnalysisModule for PanickingModule {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn version(&self) -> &'static str {
            "0.1.0"
        }
        fn input_kinds(&self) -> &'static [&'static str] {
            &["*"]
        }
        fn compute(&self, _ctx: &ModuleContext) -> std::result::Result<Vec<ModuleResult>, ModuleError> {
            panic!("boom");
        }
    }

    struct EmptySubjectModule;

    impl AnalysisModule for EmptySubjectModule {
        fn name(&self) -> &'static str {
            "empty_subject"
        }
        fn version(&self) -> &'static str {
            "0.1.0"
        }
        fn input_kinds(&self) -> &'static [&'static str] {
            &["*"]
        }
        fn compute(&self, ctx: &ModuleContext) -> std::result::Result<Vec<ModuleResult>, ModuleError> {
            Ok(vec![ModuleResult {
                module: "empty_subject".to_string(),
                version: "0.1.0".to_string(),
                computed_at: ctx.computed_at,
                subject: "".to_string(),
                pattern_type: "summary".to_string(),
                key: "bad".to_string(),
                kind: ResultKind::Summary,
                status: ResultStatus::Ok,
                score: None,
                flags: Default::default(),
                value: json!({}),
                confidence: 1.0,
                evidence: json!({}),
                inputs: Vec::new(),
                explain: Explain::default(),
            }])
        }
    }

    async fn runner_with(
        modules: Vec<Arc<dyn AnalysisModule>>,
    ) -> (PipelineRunner, Arc<LibsqlStorage>) {
        let storage = Arc::new(LibsqlStorage::in_memory().await.unwrap());
        let registry = Arc::new(ModuleRegistry::new());
        for m in modules {
            registry.register(m).unwrap();
        }
        let gate = Arc::new(Gate::new([
            (FEATURE_LEARNING.to_string(), true),
            (FEATURE_STREAMING.to_string(), true),
        ]));
        let broker = Arc::new(StreamBroker::new(8));
        let runner = PipelineRunner::new(storage.clone(), registry, gate, broker, 100);
        (runner, storage)
    }

    async fn seed_events(storage: &LibsqlStorage, n: usize) {
        for _ in 0..n {
            let mut e = NewEvent::new("chat");
            e.user_id = Some("u1".to_string());
            storage.append(&e).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_writes_patterns_and_advances_cursor() {
        let (runner, storage) = runner_with(vec![Arc::new(CountingModule)]).await;
        seed_events(&storage, 3).await;

        let report = runner.trigger(None).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Ran);
        assert_eq!(report.events_processed, 3);
        assert_eq!(report.patterns_written, 1);
        assert_eq!(storage.cursor().await.unwrap(), report.cursor);
        assert!(report.cursor >= 3);
    }

    #[tokio::test]
    async fn test_retrigger_after_completion_is_a_noop() {
        let (runner, storage) = runner_with(vec![Arc::new(CountingModule)]).await;
        seed_events(&storage, 2).await;

        let first = runner.trigger(None).await.unwrap();
        assert_eq!(first.patterns_written, 1);

        // no new events: the cursor already consumed the range
        let second = runner.trigger(None).await.unwrap();
        assert_eq!(second.outcome, RunOutcome::Ran);
        assert_eq!(second.events_processed, 0);
        assert_eq!(second.patterns_written, 0);
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn test_partial_batch_resilience() {
        let (runner, storage) =
            runner_with(vec![Arc::new(PanickingModule), Arc::new(CountingModule)]).await;
        seed_events(&storage, 2).await;

        let report = runner.trigger(None).await.unwrap();
        assert_eq!(report.module_errors, 1);
        // the healthy module still persisted its result
        assert_eq!(report.patterns_written, 1);
        // and the cursor advanced despite the failure
        assert_eq!(storage.cursor().await.unwrap(), report.cursor);
    }

    #[tokio::test]
    async fn test_empty_subject_result_is_rejected() {
        let (runner, storage) = runner_with(vec![Arc::new(EmptySubjectModule)]).await;
        seed_events(&storage, 1).await;

        let report = runner.trigger(None).await.unwrap();
        assert_eq!(report.results_rejected, 1);
        assert_eq!(report.patterns_written, 0);
    }

    #[tokio::test]
    async fn test_disabled_gate_skips_run_and_keeps_cursor() {
        let (runner, storage) = runner_with(vec![Arc::new(CountingModule)]).await;
        seed_events(&storage, 2).await;

        runner.gate.kill(FEATURE_LEARNING);
        let report = runner.trigger(None).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Disabled);
        assert_eq!(storage.cursor().await.unwrap(), 0);

        // enable after kill stays off for the process lifetime
        runner.gate.enable(FEATURE_LEARNING);
        let report = runner.trigger(None).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Disabled);
    }

    #[tokio::test]
    async fn test_subject_filter_safe_fallback() {
        let (runner, storage) = runner_with(vec![Arc::new(CountingModule)]).await;
        seed_events(&storage, 2).await;

        let filter = vec!["nobody".to_string()];
        let report = runner.trigger(Some(&filter)).await.unwrap();
        assert!(report.filter_fell_back);
        assert_eq!(report.events_processed, 2);
    }

    #[tokio::test]
    async fn test_subject_filter_applies_when_matching() {
        let (runner, storage) = runner_with(vec![Arc::new(CountingModule)]).await;
        seed_events(&storage, 2).await;
        let mut other = NewEvent::new("chat");
        other.user_id = Some("u2".to_string());
        storage.append(&other).await.unwrap();

        let filter = vec!["u2".to_string()];
        let report = runner.trigger(Some(&filter)).await.unwrap();
        assert!(!report.filter_fell_back);
        assert_eq!(report.events_processed, 1);
        // the cursor still covers the whole batch
        assert_eq!(report.cursor, storage.cursor().await.unwrap());
        assert!(report.cursor >= 3);
    }
}
