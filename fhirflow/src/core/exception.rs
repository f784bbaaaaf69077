//! Exception records and failure notifications.

use super::{ClassifiedError, ErrorKind, StageName};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};

/// Status carried by every failure notification.
pub const EXCEPTION_STATUS: &str = "EXCEPTION";

/// Durable record of an item that ended in `failed`.
///
/// Records are immutable once created; the fields are only reachable through
/// getters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    item_id: String,
    batch_id: String,
    stage: StageName,
    error_kind: ErrorKind,
    message: String,
    reference: String,
    recorded_at: Timestamp,
}

impl ExceptionRecord {
    /// Creates a record for a terminal failure.
    #[must_use]
    pub fn new(
        item_id: impl Into<String>,
        batch_id: impl Into<String>,
        stage: StageName,
        error: &ClassifiedError,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            batch_id: batch_id.into(),
            stage,
            error_kind: error.kind.clone(),
            message: error.message.clone(),
            reference: reference.into(),
            recorded_at: now_utc(),
        }
    }

    /// Key under which the record is stored; one record per (batch, item).
    #[must_use]
    pub fn key(&self) -> String {
        record_key(&self.batch_id, &self.item_id)
    }

    /// Failed item.
    #[must_use]
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Owning batch.
    #[must_use]
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Stage that produced the terminal error.
    #[must_use]
    pub const fn stage(&self) -> StageName {
        self.stage
    }

    /// Error kind.
    #[must_use]
    pub const fn error_kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Object reference of the failed document.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// When the record was created.
    #[must_use]
    pub const fn recorded_at(&self) -> Timestamp {
        self.recorded_at
    }
}

/// Builds the exception-log key for an item of a batch.
#[must_use]
pub fn record_key(batch_id: &str, item_id: &str) -> String {
    format!("{batch_id}/{item_id}")
}

/// Message published once per terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotification {
    /// Failed item.
    pub item_id: String,
    /// Owning batch.
    pub batch_id: String,
    /// Workflow state name of the failing stage.
    pub stage: String,
    /// Error kind wire name.
    pub error_kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// Object reference of the failed document.
    pub reference: String,
    /// When the failure was recorded.
    pub timestamp: Timestamp,
    /// Whether the item's dedup claim was released.
    pub dedup_hash_released: bool,
    /// Always `EXCEPTION`.
    pub status: String,
}

impl FailureNotification {
    /// Builds the notification for a stored exception record.
    #[must_use]
    pub fn from_record(record: &ExceptionRecord, dedup_hash_released: bool) -> Self {
        Self {
            item_id: record.item_id.clone(),
            batch_id: record.batch_id.clone(),
            stage: record.stage.state_name().to_string(),
            error_kind: record.error_kind.clone(),
            message: record.message.clone(),
            reference: record.reference.clone(),
            timestamp: record.recorded_at,
            dedup_hash_released,
            status: EXCEPTION_STATUS.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_getters_and_key() {
        let err = ClassifiedError::new(ErrorKind::InvalidFile, "not a document");
        let record = ExceptionRecord::new("m1", "b1", StageName::Validate, &err, "in/a.txt");

        assert_eq!(record.key(), "b1/m1");
        assert_eq!(record.item_id(), "m1");
        assert_eq!(record.batch_id(), "b1");
        assert_eq!(record.stage(), StageName::Validate);
        assert_eq!(record.error_kind(), &ErrorKind::InvalidFile);
        assert_eq!(record.message(), "not a document");
        assert_eq!(record.reference(), "in/a.txt");
    }

    #[test]
    fn test_notification_uses_state_name() {
        let err = ClassifiedError::rate_limited("429");
        let record = ExceptionRecord::new("m1", "b1", StageName::Persist, &err, "k");
        let note = FailureNotification::from_record(&record, true);

        assert_eq!(note.stage, "SaveFHIRResources");
        assert_eq!(note.status, "EXCEPTION");
        assert!(note.dedup_hash_released);

        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["error_kind"], "HealthLakePostTooManyRequestsError");
    }
}
