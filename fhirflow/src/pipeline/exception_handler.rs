//! Terminal failure path.

use super::StageChain;
use crate::core::{
    ClassifiedError, ErrorKind, ExceptionRecord, FailureNotification, ItemPhase, StageName,
    WorkItem,
};
use crate::errors::FhirflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::stores::{audit_status, AuditLog, DedupStore, ExceptionLog, NotificationSink};
use serde_json::json;
use std::sync::Arc;

/// Moves an item to `Failed` and performs the failure bookkeeping.
///
/// For every item that reaches this handler:
/// - the item is marked `Failed` with the error as its last error
/// - one [`ExceptionRecord`] is appended, keyed by (batch, item)
/// - a dedup claim held by the item is released, unless the failure is itself
///   a duplicate
/// - the audit log gets a `FAILED` line
/// - one [`FailureNotification`] is published
///
/// A record that already exists (redelivered item) suppresses the second
/// notification.
#[derive(Clone)]
pub struct ExceptionHandler {
    exceptions: Arc<dyn ExceptionLog>,
    dedup: Arc<dyn DedupStore>,
    audit: Arc<dyn AuditLog>,
    notifications: Arc<dyn NotificationSink>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionHandler").finish_non_exhaustive()
    }
}

impl ExceptionHandler {
    /// Creates a handler over the given stores.
    #[must_use]
    pub fn new(
        exceptions: Arc<dyn ExceptionLog>,
        dedup: Arc<dyn DedupStore>,
        audit: Arc<dyn AuditLog>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            exceptions,
            dedup,
            audit,
            notifications,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Fails `item` at `stage` with `error`.
    pub async fn handle(
        &self,
        item: &mut WorkItem,
        stage: StageName,
        error: &ClassifiedError,
        chain: &StageChain,
    ) -> Result<ExceptionRecord, FhirflowError> {
        item.record_error(stage, error);
        item.transition(ItemPhase::Failed, chain)?;

        let record = ExceptionRecord::new(&item.id, &item.batch_id, stage, error, &item.reference);
        let appended = self.exceptions.append(record.clone()).await?;

        let released = match &item.content_hash {
            Some(hash) if error.kind != ErrorKind::CcdaDuplicated => {
                self.dedup.release(hash, &item.id).await?
            }
            _ => false,
        };

        self.audit
            .record_item_status(&item.batch_id, &item.id, audit_status::FAILED)
            .await?;

        tracing::warn!(
            item_id = %item.id,
            batch_id = %item.batch_id,
            stage = %stage,
            error_kind = %error.kind,
            dedup_hash_released = released,
            "Item failed: {}", error.message
        );

        if appended {
            let notification = FailureNotification::from_record(&record, released);
            self.notifications.publish(&notification).await?;
        } else {
            tracing::info!(
                item_id = %item.id,
                batch_id = %item.batch_id,
                "Exception already recorded; notification suppressed"
            );
        }

        self.events
            .emit(
                names::ITEM_FAILED,
                Some(json!({
                    "item_id": item.id,
                    "batch_id": item.batch_id,
                    "stage": stage,
                    "error_kind": error.kind.as_str(),
                    "dedup_hash_released": released,
                })),
            )
            .await;

        Ok(record)
    }
}
