//! Stage invocation with timeouts and lifecycle events.

use super::StageHandler;
use crate::core::{ClassifiedError, ErrorKind, StageName, StageResult, WorkItem};
use crate::errors::FhirflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::pipeline::StageChain;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on one stage invocation.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs the handler registered for a stage against one item.
#[derive(Clone)]
pub struct StageInvoker {
    handlers: HashMap<StageName, Arc<dyn StageHandler>>,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for StageInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<_> = self.handlers.keys().collect();
        stages.sort();
        f.debug_struct("StageInvoker")
            .field("stages", &stages)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for StageInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageInvoker {
    /// Creates an invoker with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Registers the handler for `stage`, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, stage: StageName, handler: Arc<dyn StageHandler>) -> Self {
        self.register(stage, handler);
        self
    }

    /// Registers the handler for `stage`.
    pub fn register(&mut self, stage: StageName, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    /// Sets the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The per-invocation timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true if a handler is registered for `stage`.
    #[must_use]
    pub fn has_handler(&self, stage: StageName) -> bool {
        self.handlers.contains_key(&stage)
    }

    /// Fails with the first chain stage that has no handler.
    pub fn ensure_covers(&self, chain: &StageChain) -> Result<(), FhirflowError> {
        match chain.stages().iter().find(|stage| !self.has_handler(**stage)) {
            Some(stage) => Err(FhirflowError::MissingStageHandler(*stage)),
            None => Ok(()),
        }
    }

    /// Invokes `stage` against `item`.
    ///
    /// A timeout becomes a non-retryable `StageTimeoutError` result. Handler
    /// faults and missing handlers are returned as errors.
    pub async fn invoke(
        &self,
        stage: StageName,
        item: &WorkItem,
    ) -> Result<StageResult, FhirflowError> {
        let handler = self
            .handlers
            .get(&stage)
            .ok_or(FhirflowError::MissingStageHandler(stage))?;

        let timer = SpanTimer::start(stage.as_str());
        self.events
            .emit(
                names::STAGE_STARTED,
                Some(json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "stage": stage,
                    "handler": handler.name(),
                })),
            )
            .await;

        let result = match tokio::time::timeout(self.timeout, handler.handle(item)).await {
            Ok(result) => result.map_err(|err| {
                tracing::error!(
                    item_id = %item.id,
                    batch_id = %item.batch_id,
                    stage = %stage,
                    error = %err,
                    "Stage handler fault"
                );
                err
            })?,
            Err(_) => {
                self.events
                    .emit(
                        names::STAGE_TIMED_OUT,
                        Some(json!({
                            "item_id": item.id,
                            "batch_id": item.batch_id,
                            "stage": stage,
                            "timeout_ms": duration_ms(self.timeout),
                        })),
                    )
                    .await;
                StageResult::Failed(ClassifiedError::new(
                    ErrorKind::StageTimeout,
                    format!(
                        "{} did not finish within {:?}",
                        stage.state_name(),
                        self.timeout
                    ),
                ))
            }
        };

        let elapsed_ms = timer.finish();
        tracing::debug!(
            item_id = %item.id,
            batch_id = %item.batch_id,
            stage = %stage,
            duration_ms = elapsed_ms,
            success = result.is_success(),
            "Stage returned"
        );

        self.events
            .emit(
                names::STAGE_COMPLETED,
                Some(json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "stage": stage,
                    "outcome": outcome_name(&result),
                    "error_kind": result.error().map(|e| e.kind.as_str().to_string()),
                    "duration_ms": elapsed_ms,
                })),
            )
            .await;

        Ok(result)
    }
}

const fn outcome_name(result: &StageResult) -> &'static str {
    match result {
        StageResult::Success { .. } => "success",
        StageResult::Duplicate { .. } => "duplicate",
        StageResult::Failed(_) => "failed",
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemSource;
    use crate::events::CollectingEventSink;
    use crate::stages::FnStageHandler;
    use async_trait::async_trait;
    use serde_json::json;

    fn item() -> WorkItem {
        WorkItem::new(
            ItemSource {
                record_id: "m1".to_string(),
                receipt_handle: None,
                delivery_id: "b1".to_string(),
            },
            "in/a.xml",
        )
    }

    #[derive(Debug)]
    struct SlowStage;

    #[async_trait]
    impl StageHandler for SlowStage {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _item: &WorkItem) -> Result<StageResult, FhirflowError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StageResult::success(json!({})))
        }
    }

    #[derive(Debug)]
    struct BrokenStage;

    #[async_trait]
    impl StageHandler for BrokenStage {
        fn name(&self) -> &str {
            "broken"
        }

        async fn handle(&self, _item: &WorkItem) -> Result<StageResult, FhirflowError> {
            Err(FhirflowError::internal("disk on fire"))
        }
    }

    #[tokio::test]
    async fn test_invoke_emits_events() {
        let events = Arc::new(CollectingEventSink::new());
        let invoker = StageInvoker::new()
            .with_handler(
                StageName::Convert,
                Arc::new(FnStageHandler::new("convert", |_: &WorkItem| {
                    StageResult::success(json!({"converted": true}))
                })),
            )
            .with_event_sink(events.clone());

        let result = invoker.invoke(StageName::Convert, &item()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            events.types_for_item("m1"),
            vec!["item.stage.started", "item.stage.completed"]
        );
        let (_, data) = &events.events()[1];
        assert_eq!(data.as_ref().unwrap()["outcome"], "success");
    }

    #[tokio::test]
    async fn test_missing_handler_is_an_error() {
        let invoker = StageInvoker::new();
        let err = invoker.invoke(StageName::Persist, &item()).await.unwrap_err();
        assert!(matches!(err, FhirflowError::MissingStageHandler(StageName::Persist)));
        assert!(invoker.ensure_covers(&StageChain::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_classified_failure() {
        let invoker = StageInvoker::new()
            .with_handler(StageName::Persist, Arc::new(SlowStage))
            .with_timeout(Duration::from_secs(5));

        let result = invoker.invoke(StageName::Persist, &item()).await.unwrap();
        let err = result.error().unwrap();
        assert_eq!(err.kind, ErrorKind::StageTimeout);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_handler_fault_propagates() {
        let invoker = StageInvoker::new().with_handler(StageName::Convert, Arc::new(BrokenStage));
        assert!(matches!(
            invoker.invoke(StageName::Convert, &item()).await,
            Err(FhirflowError::Internal(_))
        ));
    }
}
