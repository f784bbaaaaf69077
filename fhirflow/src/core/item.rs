//! Work items: one inbound record moving through the chain.

use super::{ClassifiedError, ErrorKind, ItemPhase, ItemStatus, StageName};
use crate::errors::FhirflowError;
use crate::pipeline::StageChain;
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Where a work item came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSource {
    /// Identifier of the inbound record (queue message id).
    pub record_id: String,
    /// Handle used to acknowledge the inbound record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
    /// Identifier of the trigger delivery.
    pub delivery_id: String,
}

/// The last error observed on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Error kind.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// Stage that produced the error.
    pub stage: StageName,
}

/// Wait state of an item between a failed attempt and the next one.
///
/// Only present while the item is `retrying`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Stage that will be re-invoked.
    pub stage: StageName,
    /// Number of retries scheduled so far for this stage (1-based).
    pub attempt: u32,
    /// Delay of the current wait in milliseconds.
    pub delay_ms: u64,
    /// Sum of all waits for this stage in milliseconds.
    pub cumulative_delay_ms: u64,
    /// When the stage should be re-invoked.
    pub resume_at: Timestamp,
}

/// One inbound record moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique item id (the inbound record id).
    pub id: String,
    /// Owning batch.
    pub batch_id: String,
    /// Provenance.
    pub source: ItemSource,
    /// Object reference (e.g. a storage key).
    pub reference: String,
    /// Document bytes delivered inline with the trigger.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::utils::base64_bytes::option"
    )]
    pub content: Option<Vec<u8>>,
    /// Opaque payload threaded through the stages.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// State-machine position.
    pub phase: ItemPhase,
    /// Stage currently (or last) associated with the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageName>,
    /// Last error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// Consecutive retries per stage.
    #[serde(default)]
    pub retry_counts: HashMap<StageName, u32>,
    /// Total wait per stage in milliseconds.
    #[serde(default)]
    pub retry_delay_ms: HashMap<StageName, u64>,
    /// Active wait, if retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryState>,
    /// MD5 digest of the content, set by deduplication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// True once the item was recognised as a duplicate.
    #[serde(default)]
    pub duplicate: bool,
    /// Phases visited, in order.
    #[serde(default)]
    pub history: Vec<ItemPhase>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
}

impl WorkItem {
    /// Creates a pending work item.
    #[must_use]
    pub fn new(source: ItemSource, reference: impl Into<String>) -> Self {
        let now = now_utc();
        Self {
            id: source.record_id.clone(),
            batch_id: source.delivery_id.clone(),
            source,
            reference: reference.into(),
            content: None,
            payload: serde_json::Value::Null,
            phase: ItemPhase::Pending,
            current_stage: None,
            last_error: None,
            retry_counts: HashMap::new(),
            retry_delay_ms: HashMap::new(),
            retry: None,
            content_hash: None,
            duplicate: false,
            history: vec![ItemPhase::Pending],
            created_at: now,
            updated_at: now,
        }
    }

    /// Attaches inline content.
    #[must_use]
    pub fn with_content(mut self, content: Vec<u8>) -> Self {
        self.content = Some(content);
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Coarse status derived from the phase.
    #[must_use]
    pub const fn status(&self) -> ItemStatus {
        self.phase.status()
    }

    /// Returns true once the item is `Complete` or `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Consecutive retries recorded for `stage`.
    #[must_use]
    pub fn retries_for(&self, stage: StageName) -> u32 {
        self.retry_counts.get(&stage).copied().unwrap_or(0)
    }

    /// Moves the item to `to`, rejecting edges the chain does not allow.
    pub fn transition(&mut self, to: ItemPhase, chain: &StageChain) -> Result<(), FhirflowError> {
        if !chain.allows(self.phase, to) {
            return Err(FhirflowError::InvalidTransition {
                item_id: self.id.clone(),
                from: self.phase,
                to,
            });
        }

        if let Some(stage) = to.stage() {
            if self.current_stage != Some(stage) {
                self.retry_counts.clear();
                self.retry_delay_ms.clear();
            }
            self.current_stage = Some(stage);
        }
        if !matches!(to, ItemPhase::Retrying(_)) {
            self.retry = None;
        }

        self.phase = to;
        self.history.push(to);
        self.updated_at = now_utc();
        Ok(())
    }

    /// Enters the waiting state before `stage` is re-invoked.
    pub fn schedule_retry(
        &mut self,
        stage: StageName,
        delay: Duration,
        chain: &StageChain,
    ) -> Result<&RetryState, FhirflowError> {
        self.transition(ItemPhase::Retrying(stage), chain)?;

        let attempt = self.retries_for(stage) + 1;
        self.retry_counts.insert(stage, attempt);

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let total = self.retry_delay_ms.entry(stage).or_insert(0);
        *total = total.saturating_add(delay_ms);
        let cumulative_delay_ms = *total;
        let resume_at = now_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(self.retry.insert(RetryState {
            stage,
            attempt,
            delay_ms,
            cumulative_delay_ms,
            resume_at,
        }))
    }

    /// Records a classified error observed at `stage`.
    pub fn record_error(&mut self, stage: StageName, error: &ClassifiedError) {
        self.last_error = Some(LastError {
            kind: error.kind.clone(),
            message: error.message.clone(),
            stage,
        });
        self.updated_at = now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new(
            ItemSource {
                record_id: "msg-1".to_string(),
                receipt_handle: Some("rh-1".to_string()),
                delivery_id: "batch-1".to_string(),
            },
            "landing/doc.xml",
        )
    }

    #[test]
    fn test_new_item_is_pending() {
        let item = item();
        assert_eq!(item.id, "msg-1");
        assert_eq!(item.batch_id, "batch-1");
        assert_eq!(item.status(), ItemStatus::Pending);
        assert_eq!(item.history, vec![ItemPhase::Pending]);
    }

    #[test]
    fn test_cannot_skip_validation() {
        let chain = StageChain::default();
        let mut item = item();
        let err = item.transition(ItemPhase::Deduplicating, &chain).unwrap_err();
        assert!(matches!(err, FhirflowError::InvalidTransition { .. }));
        assert_eq!(item.phase, ItemPhase::Pending);
    }

    #[test]
    fn test_retry_counts_track_consecutive_waits() {
        let chain = StageChain::default();
        let mut item = item();
        for phase in [
            ItemPhase::Validating,
            ItemPhase::Deduplicating,
            ItemPhase::Converting,
            ItemPhase::BuildingDataset,
            ItemPhase::Persisting,
        ] {
            item.transition(phase, &chain).unwrap();
        }

        let state = item
            .schedule_retry(StageName::Persist, Duration::from_secs(1), &chain)
            .unwrap();
        assert_eq!(state.attempt, 1);
        assert_eq!(state.delay_ms, 1000);
        assert_eq!(item.status(), ItemStatus::Retrying);

        item.transition(ItemPhase::Persisting, &chain).unwrap();
        assert!(item.retry.is_none());

        let state = item
            .schedule_retry(StageName::Persist, Duration::from_secs(10), &chain)
            .unwrap();
        assert_eq!(state.attempt, 2);
        assert_eq!(state.cumulative_delay_ms, 11_000);
        assert_eq!(item.retries_for(StageName::Persist), 2);
    }

    #[test]
    fn test_record_error() {
        let mut item = item();
        item.record_error(
            StageName::Convert,
            &ClassifiedError::new(ErrorKind::Converter, "500 from converter"),
        );
        let last = item.last_error.unwrap();
        assert_eq!(last.kind, ErrorKind::Converter);
        assert_eq!(last.stage, StageName::Convert);
    }

    #[test]
    fn test_content_serializes_as_base64() {
        let item = item().with_content(b"<ClinicalDocument/>".to_vec());
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["content"], "PENsaW5pY2FsRG9jdW1lbnQvPg==");

        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.content.as_deref(), Some(&b"<ClinicalDocument/>"[..]));
    }
}
