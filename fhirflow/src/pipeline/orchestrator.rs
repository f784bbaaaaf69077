//! Batch orchestration: split, run, finalize.

use super::{BatchMapExecutor, BatchResult, ExceptionHandler, RetryPolicy, StageChain};
use crate::config::PipelineConfig;
use crate::core::{Batch, BatchOutcome, StageName, TriggerEvent};
use crate::errors::FhirflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::stages::{StageHandler, StageInvoker};
use crate::stores::{
    AuditLog, BatchFinalizer, CheckpointStore, DedupStore, ExceptionLog, InMemoryAuditLog,
    InMemoryCheckpointStore, InMemoryDedupStore, InMemoryExceptionLog, LoggingNotificationSink,
    NotificationSink,
};
use serde_json::json;
use std::sync::Arc;

/// Turns trigger deliveries into finalized batches.
pub struct PipelineOrchestrator {
    chain: StageChain,
    executor: BatchMapExecutor,
    audit: Arc<dyn AuditLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    finalizer: Arc<dyn BatchFinalizer>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("chain", &self.chain)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// The stage chain items run through.
    #[must_use]
    pub const fn chain(&self) -> &StageChain {
        &self.chain
    }

    /// Processes one trigger delivery.
    ///
    /// A delivery whose batch id was already finalized is not run again; the
    /// recorded outcome is returned with `already_finalized` set. A batch that
    /// ran but whose finalize never confirmed is finalized again from its
    /// recorded outcome without rerunning the items.
    ///
    /// # Errors
    ///
    /// Returns an error on internal faults: missing handlers, illegal
    /// transitions, store or collaborator failures.
    pub async fn process(&self, trigger: TriggerEvent) -> Result<BatchOutcome, FhirflowError> {
        if let Some(mut recorded) = self.audit.batch_entry(&trigger.delivery_id).await? {
            tracing::info!(
                batch_id = %trigger.delivery_id,
                "Batch already finalized; skipping redelivery"
            );
            recorded.already_finalized = true;
            self.events
                .emit(
                    names::BATCH_SKIPPED,
                    Some(json!({ "batch_id": recorded.batch_id })),
                )
                .await;
            return Ok(recorded);
        }

        if let Some(pending) = self.audit.pending_batch(&trigger.delivery_id).await? {
            tracing::warn!(
                batch_id = %pending.batch_id,
                "Batch finalize was never confirmed; finalizing recorded outcome"
            );
            self.finalize(&pending).await?;
            return Ok(pending);
        }

        let batch = Batch::from_trigger(&trigger);
        let timer = SpanTimer::start("batch");
        tracing::info!(batch_id = %batch.id, items = batch.len(), "Batch started");
        self.events
            .emit(
                names::BATCH_STARTED,
                Some(json!({ "batch_id": batch.id, "items": batch.len() })),
            )
            .await;

        let BatchResult { outcome, .. } = self.executor.run(batch, &self.chain).await?;
        tracing::info!(
            batch_id = %outcome.batch_id,
            status = %outcome.status,
            succeeded = outcome.succeeded,
            duplicates = outcome.duplicates,
            failed = outcome.failed,
            duration_ms = timer.finish(),
            "Batch run finished"
        );

        self.finalize(&outcome).await?;
        Ok(outcome)
    }

    /// Finalizes a batch once per batch id.
    ///
    /// The audit entry is written as pending, then confirmed once the
    /// finalizer returns. Until then every call invokes the finalizer again.
    /// Returns `true` if this call confirmed the batch, `false` if it was
    /// already finalized.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit log or the finalizer fails. The batch
    /// stays pending and a later call retries the finalizer.
    pub async fn finalize(&self, outcome: &BatchOutcome) -> Result<bool, FhirflowError> {
        if self.audit.batch_entry(&outcome.batch_id).await?.is_some() {
            tracing::debug!(batch_id = %outcome.batch_id, "Batch already finalized");
            return Ok(false);
        }
        if !self.audit.insert_batch_if_absent(outcome).await? {
            tracing::info!(batch_id = %outcome.batch_id, "Retrying unconfirmed finalize");
        }

        self.finalizer
            .finalize(outcome)
            .await
            .map_err(|err| match err {
                FhirflowError::Finalize { .. } => err,
                other => FhirflowError::Finalize {
                    batch_id: outcome.batch_id.clone(),
                    message: other.to_string(),
                },
            })?;
        self.audit.confirm_batch(&outcome.batch_id).await?;

        self.events
            .emit(
                names::BATCH_FINALIZED,
                Some(json!({
                    "batch_id": outcome.batch_id,
                    "status": outcome.status,
                    "succeeded": outcome.succeeded,
                    "duplicates": outcome.duplicates,
                    "failed": outcome.failed,
                })),
            )
            .await;
        Ok(true)
    }

    /// Resumes the items of `batch_id` left in the checkpoint store.
    ///
    /// The result only covers the resumed items.
    ///
    /// # Errors
    ///
    /// Returns an error on internal faults while resuming.
    pub async fn recover(&self, batch_id: &str) -> Result<BatchResult, FhirflowError> {
        let checkpoints = self.checkpoints.load_batch(batch_id).await?;
        tracing::info!(batch_id, items = checkpoints.len(), "Recovering batch");
        self.executor.resume(batch_id, checkpoints, &self.chain).await
    }
}

/// Builder for [`PipelineOrchestrator`].
///
/// Stores default to the in-memory implementations, notifications to the
/// logging sink. A finalizer and a handler for every chain stage are required.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    policy: Option<RetryPolicy>,
    invoker: StageInvoker,
    audit: Arc<dyn AuditLog>,
    exceptions: Arc<dyn ExceptionLog>,
    dedup: Arc<dyn DedupStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    notifications: Arc<dyn NotificationSink>,
    finalizer: Option<Arc<dyn BatchFinalizer>>,
    events: Arc<dyn EventSink>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            policy: None,
            invoker: StageInvoker::new(),
            audit: Arc::new(InMemoryAuditLog::new()),
            exceptions: Arc::new(InMemoryExceptionLog::new()),
            dedup: Arc::new(InMemoryDedupStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            notifications: Arc::new(LoggingNotificationSink),
            finalizer: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Uses `config` for the chain, timeout, concurrency and retry rules.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the retry policy built from the configuration.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Registers the handler for `stage`.
    #[must_use]
    pub fn with_handler(mut self, stage: StageName, handler: Arc<dyn StageHandler>) -> Self {
        self.invoker.register(stage, handler);
        self
    }

    /// Sets the audit log.
    #[must_use]
    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Sets the exception log.
    #[must_use]
    pub fn with_exception_log(mut self, exceptions: Arc<dyn ExceptionLog>) -> Self {
        self.exceptions = exceptions;
        self
    }

    /// Sets the dedup store.
    #[must_use]
    pub fn with_dedup_store(mut self, dedup: Arc<dyn DedupStore>) -> Self {
        self.dedup = dedup;
        self
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Sets the notification sink.
    #[must_use]
    pub fn with_notification_sink(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
        self.notifications = notifications;
        self
    }

    /// Sets the finalizer.
    #[must_use]
    pub fn with_finalizer(mut self, finalizer: Arc<dyn BatchFinalizer>) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Sets the event sink shared by every component.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a chain stage has no
    /// handler, or no finalizer was set.
    pub fn build(self) -> Result<PipelineOrchestrator, FhirflowError> {
        self.config.validate()?;
        let chain = self.config.chain.clone();

        let invoker = self
            .invoker
            .with_timeout(self.config.stage_timeout())
            .with_event_sink(self.events.clone());
        invoker.ensure_covers(&chain)?;

        let finalizer = self
            .finalizer
            .ok_or_else(|| FhirflowError::internal("no batch finalizer configured"))?;
        let policy = self.policy.unwrap_or_else(|| self.config.retry_policy());

        let exceptions = ExceptionHandler::new(
            self.exceptions,
            self.dedup,
            self.audit.clone(),
            self.notifications,
        )
        .with_event_sink(self.events.clone());

        let executor = BatchMapExecutor::new(
            invoker,
            policy,
            exceptions,
            self.audit.clone(),
            self.checkpoints.clone(),
        )
        .with_max_concurrency(self.config.max_concurrency)
        .with_event_sink(self.events.clone());

        Ok(PipelineOrchestrator {
            chain,
            executor,
            audit: self.audit,
            checkpoints: self.checkpoints,
            finalizer,
            events: self.events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BatchStatus, InboundRecord};
    use crate::stores::RecordingFinalizer;
    use crate::testing::SucceedingStage;

    fn builder(finalizer: Arc<RecordingFinalizer>) -> OrchestratorBuilder {
        StageName::ALL
            .iter()
            .fold(PipelineOrchestrator::builder(), |builder, stage| {
                let handler = if *stage == StageName::Persist {
                    SucceedingStage::completing()
                } else {
                    SucceedingStage::new()
                };
                builder.with_handler(*stage, Arc::new(handler))
            })
            .with_finalizer(finalizer)
    }

    #[test]
    fn test_build_requires_handlers_and_finalizer() {
        let missing_handler = PipelineOrchestrator::builder()
            .with_finalizer(Arc::new(RecordingFinalizer::new()))
            .build();
        assert!(matches!(
            missing_handler,
            Err(FhirflowError::MissingStageHandler(StageName::Validate))
        ));

        let mut no_finalizer = builder(Arc::new(RecordingFinalizer::new()));
        no_finalizer.finalizer = None;
        tokio_test::assert_err!(no_finalizer.build());
        tokio_test::assert_ok!(builder(Arc::new(RecordingFinalizer::new())).build());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = PipelineConfig::default().with_stage_timeout_seconds(0.0);
        let result = builder(Arc::new(RecordingFinalizer::new()))
            .with_config(config)
            .build();
        assert!(matches!(result, Err(FhirflowError::Config(_))));
    }

    #[tokio::test]
    async fn test_process_then_redelivery_is_skipped() {
        let finalizer = Arc::new(RecordingFinalizer::new());
        let orchestrator = builder(finalizer.clone()).build().unwrap();
        let trigger = TriggerEvent::new("d1", vec![InboundRecord::new("m1", "in/a.xml")]);

        let first = orchestrator.process(trigger.clone()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Completed);
        assert!(!first.already_finalized);

        let second = orchestrator.process(trigger).await.unwrap();
        assert!(second.already_finalized);
        assert_eq!(second.succeeded, 1);
        assert_eq!(finalizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_trigger_finalizes_completed() {
        let finalizer = Arc::new(RecordingFinalizer::new());
        let orchestrator = builder(finalizer.clone()).build().unwrap();

        let outcome = orchestrator.process(TriggerEvent::new("d0", vec![])).await.unwrap();
        assert_eq!(outcome.total, 0);
        assert_eq!(outcome.status, BatchStatus::Completed);
        assert_eq!(finalizer.calls(), 1);
    }
}
