//! Item-parallel execution of a batch through the stage chain.

use super::{BranchEvaluator, ExceptionHandler, NextStep, RetryPolicy, StageChain};
use crate::core::{Batch, BatchOutcome, ItemPhase, StageName, StageResult, WorkItem};
use crate::errors::FhirflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::stages::{StageInvoker, CONTENT_HASH_POINTER};
use crate::stores::{audit_status, AuditLog, CheckpointStore, ResumeCheckpoint};
use crate::utils::timestamps::millis_until;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Items of a finished run and their aggregated outcome.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// The batch with every item in its terminal phase.
    pub batch: Batch,
    /// Aggregated counts.
    pub outcome: BatchOutcome,
}

impl BatchResult {
    fn from_batch(batch: Batch) -> Self {
        let outcome = BatchOutcome::from_items(batch.id.clone(), batch.items());
        Self { batch, outcome }
    }
}

/// Where an item task starts.
enum Entry {
    Fresh(WorkItem),
    Resumed(ResumeCheckpoint),
}

/// Runs every item of a batch through the chain independently.
///
/// Classified failures stay with their item. An internal error in any item
/// aborts the remaining item tasks and fails the run.
#[derive(Clone)]
pub struct BatchMapExecutor {
    invoker: StageInvoker,
    policy: RetryPolicy,
    exceptions: ExceptionHandler,
    audit: Arc<dyn AuditLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
    limit: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for BatchMapExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchMapExecutor")
            .field("invoker", &self.invoker)
            .field("max_concurrency", &self.limit.as_ref().map(|s| s.available_permits()))
            .finish_non_exhaustive()
    }
}

impl BatchMapExecutor {
    /// Creates an executor with unbounded item concurrency.
    #[must_use]
    pub fn new(
        invoker: StageInvoker,
        policy: RetryPolicy,
        exceptions: ExceptionHandler,
        audit: Arc<dyn AuditLog>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            invoker,
            policy,
            exceptions,
            audit,
            checkpoints,
            events: Arc::new(NoOpEventSink),
            limit: None,
        }
    }

    /// Caps the number of items in flight. `None` or zero means unbounded.
    #[must_use]
    pub fn with_max_concurrency(mut self, max: Option<usize>) -> Self {
        self.limit = max.filter(|n| *n > 0).map(|n| Arc::new(Semaphore::new(n)));
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The stage invoker.
    #[must_use]
    pub const fn invoker(&self) -> &StageInvoker {
        &self.invoker
    }

    /// Runs every item of `batch` to a terminal phase.
    pub async fn run(
        &self,
        mut batch: Batch,
        chain: &StageChain,
    ) -> Result<BatchResult, FhirflowError> {
        let items = batch.take_items();
        tracing::info!(batch_id = %batch.id, items = items.len(), "Running batch");

        let results = self
            .run_entries(chain, items.into_iter().map(Entry::Fresh))
            .await?;
        for item in results {
            batch.put_item(item);
        }
        Ok(BatchResult::from_batch(batch))
    }

    /// Continues items recovered from the checkpoint store.
    ///
    /// Each item waits out whatever is left of its delay, then re-invokes the
    /// checkpointed stage.
    pub async fn resume(
        &self,
        batch_id: &str,
        checkpoints: Vec<ResumeCheckpoint>,
        chain: &StageChain,
    ) -> Result<BatchResult, FhirflowError> {
        let mut batch = Batch::new(batch_id);
        let entries: Vec<_> = checkpoints
            .into_iter()
            .filter(|cp| {
                let matches = cp.item.batch_id == batch_id;
                if !matches {
                    tracing::warn!(
                        batch_id,
                        item_id = %cp.item.id,
                        "Skipping checkpoint of another batch"
                    );
                }
                matches
            })
            .map(Entry::Resumed)
            .collect();

        for item in self.run_entries(chain, entries).await? {
            batch.put_item(item);
        }
        Ok(BatchResult::from_batch(batch))
    }

    async fn run_entries(
        &self,
        chain: &StageChain,
        entries: impl IntoIterator<Item = Entry>,
    ) -> Result<Vec<WorkItem>, FhirflowError> {
        let runner = Arc::new(ItemRunner {
            invoker: self.invoker.clone(),
            evaluator: BranchEvaluator::new(chain.clone(), self.policy.clone()),
            exceptions: self.exceptions.clone(),
            audit: self.audit.clone(),
            checkpoints: self.checkpoints.clone(),
            events: self.events.clone(),
            limit: self.limit.clone(),
        });

        let mut tasks: FuturesUnordered<JoinHandle<Result<WorkItem, FhirflowError>>> =
            FuturesUnordered::new();
        for entry in entries {
            tasks.push(tokio::spawn(run_entry(runner.clone(), entry)));
        }

        let mut finished = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.next().await {
            let outcome = joined.map_err(FhirflowError::from).and_then(|r| r);
            match outcome {
                Ok(item) => finished.push(item),
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        remaining = tasks.len(),
                        "Aborting batch run"
                    );
                    for task in tasks.iter() {
                        task.abort();
                    }
                    return Err(err);
                }
            }
        }
        Ok(finished)
    }
}

async fn run_entry(runner: Arc<ItemRunner>, entry: Entry) -> Result<WorkItem, FhirflowError> {
    match entry {
        Entry::Fresh(item) => runner.start(item).await,
        Entry::Resumed(checkpoint) => runner.resume(checkpoint).await,
    }
}

/// Per-run collaborators shared by the item tasks.
struct ItemRunner {
    invoker: StageInvoker,
    evaluator: BranchEvaluator,
    exceptions: ExceptionHandler,
    audit: Arc<dyn AuditLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
    limit: Option<Arc<Semaphore>>,
}

impl ItemRunner {
    fn chain(&self) -> &StageChain {
        self.evaluator.chain()
    }

    /// Takes a concurrency slot. Held only while the item is invoking stages.
    async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, FhirflowError> {
        let Some(semaphore) = &self.limit else {
            return Ok(None);
        };
        semaphore
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|err| FhirflowError::internal(format!("concurrency limit closed: {err}")))
    }

    async fn start(&self, item: WorkItem) -> Result<WorkItem, FhirflowError> {
        self.audit
            .record_item_status(&item.batch_id, &item.id, audit_status::IN_PROGRESS)
            .await?;
        let first = self.chain().first();
        self.drive(item, first).await
    }

    async fn resume(&self, checkpoint: ResumeCheckpoint) -> Result<WorkItem, FhirflowError> {
        let ResumeCheckpoint {
            item,
            stage,
            resume_at,
        } = checkpoint;

        if item.phase != ItemPhase::Retrying(stage) {
            return Err(FhirflowError::InvalidTransition {
                item_id: item.id.clone(),
                from: item.phase,
                to: stage.active_phase(),
            });
        }

        let remaining = millis_until(&resume_at);
        tracing::info!(
            item_id = %item.id,
            batch_id = %item.batch_id,
            stage = %stage,
            delay_ms = remaining,
            "Resuming item from checkpoint"
        );
        tokio::time::sleep(Duration::from_millis(remaining)).await;
        self.checkpoints.remove(&item.batch_id, &item.id).await?;

        self.events
            .emit(
                names::ITEM_RESUMED,
                Some(json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "stage": stage,
                })),
            )
            .await;

        self.drive(item, stage).await
    }

    /// Walks the item through the chain from `stage` until it is terminal.
    async fn drive(
        &self,
        mut item: WorkItem,
        mut stage: StageName,
    ) -> Result<WorkItem, FhirflowError> {
        let mut permit = self.acquire().await?;
        loop {
            item.transition(stage.active_phase(), self.chain())?;
            let result = self.invoker.invoke(stage, &item).await?;
            self.apply(&mut item, stage, &result).await?;

            match self.evaluator.next_step(&item, &result) {
                NextStep::Stage(next) => stage = next,
                NextStep::Wait {
                    stage: retry_stage,
                    delay,
                    attempt,
                } => {
                    drop(permit.take());
                    self.wait(&mut item, retry_stage, delay, attempt).await?;
                    permit = self.acquire().await?;
                    stage = retry_stage;
                }
                NextStep::Complete => {
                    self.complete(&mut item).await?;
                    return Ok(item);
                }
                NextStep::ExceptionHandler(error) => {
                    self.exceptions
                        .handle(&mut item, stage, &error, self.chain())
                        .await?;
                    return Ok(item);
                }
            }
        }
    }

    /// Folds a stage result into the item.
    async fn apply(
        &self,
        item: &mut WorkItem,
        stage: StageName,
        result: &StageResult,
    ) -> Result<(), FhirflowError> {
        match result {
            StageResult::Success { payload, status, .. } => {
                item.payload = payload.clone();
                let hash = payload
                    .pointer(CONTENT_HASH_POINTER)
                    .and_then(|v| v.as_str());
                if let Some(hash) = hash {
                    item.content_hash = Some(hash.to_string());
                }
                if let Some(status) = status {
                    if status != crate::core::COMPLETED_STATUS {
                        self.audit
                            .record_item_status(&item.batch_id, &item.id, status)
                            .await?;
                    }
                }
            }
            StageResult::Duplicate {
                hash,
                original_item,
            } => {
                tracing::info!(
                    item_id = %item.id,
                    batch_id = %item.batch_id,
                    original_item = %original_item,
                    "Item is a duplicate"
                );
                item.content_hash = Some(hash.clone());
                item.duplicate = true;
                self.audit
                    .record_item_status(&item.batch_id, &item.id, audit_status::DUPLICATED)
                    .await?;
            }
            StageResult::Failed(error) => item.record_error(stage, error),
        }
        Ok(())
    }

    async fn wait(
        &self,
        item: &mut WorkItem,
        stage: StageName,
        delay: Duration,
        attempt: u32,
    ) -> Result<(), FhirflowError> {
        let resume_at = item.schedule_retry(stage, delay, self.chain())?.resume_at;
        self.checkpoints
            .save(ResumeCheckpoint {
                item: item.clone(),
                stage,
                resume_at,
            })
            .await?;

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            item_id = %item.id,
            batch_id = %item.batch_id,
            stage = %stage,
            attempt,
            delay_ms,
            "Retry scheduled"
        );
        self.events
            .emit(
                names::RETRY_SCHEDULED,
                Some(json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "stage": stage,
                    "attempt": attempt,
                    "delay_ms": delay_ms,
                })),
            )
            .await;

        tokio::time::sleep(delay).await;
        self.checkpoints.remove(&item.batch_id, &item.id).await?;
        Ok(())
    }

    async fn complete(&self, item: &mut WorkItem) -> Result<(), FhirflowError> {
        item.transition(ItemPhase::Complete, self.chain())?;
        // Duplicates were audited when the duplicate was detected.
        if !item.duplicate {
            self.audit
                .record_item_status(&item.batch_id, &item.id, audit_status::COMPLETED)
                .await?;
        }

        tracing::info!(
            item_id = %item.id,
            batch_id = %item.batch_id,
            duplicate = item.duplicate,
            "Item complete"
        );
        self.events
            .emit(
                names::ITEM_COMPLETED,
                Some(json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "duplicate": item.duplicate,
                })),
            )
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClassifiedError, ErrorKind, InboundRecord, ItemStatus, TriggerEvent};
    use crate::events::CollectingEventSink;
    use crate::stages::FnStageHandler;
    use crate::stores::{
        InMemoryAuditLog, InMemoryCheckpointStore, InMemoryDedupStore, InMemoryExceptionLog,
        RecordingNotificationSink,
    };
    use crate::testing::{RateLimitedStage, ScriptedStage, SucceedingStage};

    struct Fixture {
        audit: Arc<InMemoryAuditLog>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        exceptions: Arc<InMemoryExceptionLog>,
        events: Arc<CollectingEventSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                audit: Arc::new(InMemoryAuditLog::new()),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
                exceptions: Arc::new(InMemoryExceptionLog::new()),
                events: Arc::new(CollectingEventSink::new()),
            }
        }

        fn executor(&self, invoker: StageInvoker) -> BatchMapExecutor {
            let handler = ExceptionHandler::new(
                self.exceptions.clone(),
                Arc::new(InMemoryDedupStore::new()),
                self.audit.clone(),
                Arc::new(RecordingNotificationSink::new()),
            );
            BatchMapExecutor::new(
                invoker,
                RetryPolicy::default(),
                handler,
                self.audit.clone(),
                self.checkpoints.clone(),
            )
            .with_event_sink(self.events.clone())
        }
    }

    fn all_succeed() -> StageInvoker {
        StageName::ALL.iter().fold(StageInvoker::new(), |invoker, stage| {
            let handler: Arc<dyn crate::stages::StageHandler> = if *stage == StageName::Persist {
                Arc::new(SucceedingStage::completing())
            } else {
                Arc::new(SucceedingStage::new())
            };
            invoker.with_handler(*stage, handler)
        })
    }

    fn batch(ids: &[&str]) -> Batch {
        Batch::from_trigger(&TriggerEvent::new(
            "b1",
            ids.iter()
                .map(|id| InboundRecord::new(*id, format!("in/{id}.xml")))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_run_completes_every_item() {
        let f = Fixture::new();
        let result = f
            .executor(all_succeed())
            .with_max_concurrency(Some(1))
            .run(batch(&["m1", "m2", "m3"]), &StageChain::default())
            .await
            .unwrap();

        assert_eq!(result.outcome.succeeded, 3);
        assert_eq!(result.batch.item_ids, vec!["m1", "m2", "m3"]);
        for item in result.batch.items() {
            assert_eq!(item.status(), ItemStatus::Succeeded);
            assert_eq!(item.history.len(), 7);
        }
        let statuses: Vec<_> = f
            .audit
            .item_entries()
            .into_iter()
            .filter(|e| e.key == "m1")
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec!["IN_PROGRESS", "COMPLETED"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_persists_and_clears_checkpoint() {
        let f = Fixture::new();
        let invoker =
            all_succeed().with_handler(StageName::Persist, Arc::new(RateLimitedStage::new(2)));
        let result = f
            .executor(invoker)
            .run(batch(&["m1"]), &StageChain::default())
            .await
            .unwrap();

        let item = result.batch.item("m1").unwrap();
        assert_eq!(item.phase, ItemPhase::Complete);
        assert_eq!(item.retries_for(StageName::Persist), 2);
        assert_eq!(item.retry_delay_ms[&StageName::Persist], 11_000);
        assert!(f.checkpoints.is_empty());
        assert_eq!(f.events.events_of_type("item.retry.scheduled").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_item_frees_its_slot() {
        let f = Fixture::new();
        let throttled = StageResult::Failed(ClassifiedError::rate_limited("429"));
        let persist = ScriptedStage::new("persist", StageResult::completed(json!({})))
            .with_script("m1", vec![throttled.clone(), throttled]);
        let invoker = all_succeed().with_handler(StageName::Persist, Arc::new(persist));
        let result = f
            .executor(invoker)
            .with_max_concurrency(Some(1))
            .run(batch(&["m1", "m2"]), &StageChain::default())
            .await
            .unwrap();
        assert_eq!(result.outcome.succeeded, 2);

        let events = f.events.events();
        let position = |kind: &str, item_id: &str| {
            events
                .iter()
                .rposition(|(name, data)| {
                    name == kind
                        && data
                            .as_ref()
                            .and_then(|d| d.get("item_id"))
                            .and_then(|v| v.as_str())
                            == Some(item_id)
                })
                .unwrap()
        };
        assert!(position("item.completed", "m2") < position("item.retry.scheduled", "m1"));
    }

    #[tokio::test]
    async fn test_internal_error_fails_the_run() {
        let f = Fixture::new();
        let invoker =
            StageInvoker::new().with_handler(StageName::Validate, Arc::new(SucceedingStage::new()));
        let err = f
            .executor(invoker)
            .run(batch(&["m1", "m2"]), &StageChain::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FhirflowError::MissingStageHandler(StageName::Deduplicate)
        ));
    }

    #[tokio::test]
    async fn test_classified_failure_stays_with_item() {
        let f = Fixture::new();
        let invoker = all_succeed().with_handler(
            StageName::Convert,
            Arc::new(FnStageHandler::new("convert", |item: &WorkItem| {
                if item.id == "bad" {
                    StageResult::Failed(ClassifiedError::new(ErrorKind::Converter, "unparseable"))
                } else {
                    StageResult::success(json!({}))
                }
            })),
        );
        let result = f
            .executor(invoker)
            .run(batch(&["ok", "bad"]), &StageChain::default())
            .await
            .unwrap();

        assert_eq!(result.outcome.succeeded, 1);
        assert_eq!(result.outcome.failed, 1);
        assert_eq!(f.exceptions.len(), 1);
        assert_eq!(result.batch.item("bad").unwrap().phase, ItemPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_checkpoint() {
        let f = Fixture::new();
        let chain = StageChain::default();
        let mut item = batch(&["m1"]).take_items().remove(0);
        for stage in chain.stages() {
            item.transition(stage.active_phase(), &chain).unwrap();
        }
        let resume_at = item
            .schedule_retry(StageName::Persist, Duration::from_secs(10), &chain)
            .unwrap()
            .resume_at;
        let checkpoint = ResumeCheckpoint {
            item,
            stage: StageName::Persist,
            resume_at,
        };
        f.checkpoints.save(checkpoint.clone()).await.unwrap();

        let result = f
            .executor(all_succeed())
            .resume("b1", vec![checkpoint], &chain)
            .await
            .unwrap();

        assert_eq!(result.outcome.succeeded, 1);
        assert!(f.checkpoints.is_empty());
        assert_eq!(f.events.types_for_item("m1")[0], "item.resumed");
    }
}
