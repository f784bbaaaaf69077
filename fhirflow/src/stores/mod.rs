//! Durable collaborators of the orchestrator.
//!
//! Every store is a trait so deployments can back it with real services; the
//! in-memory implementations in [`memory`] are used by tests and local runs.

pub mod memory;

use crate::core::{BatchOutcome, ExceptionRecord, FailureNotification, StageName, WorkItem};
use crate::errors::{FhirflowError, StoreError};
use crate::utils::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{
    InMemoryAuditLog, InMemoryCheckpointStore, InMemoryDedupStore, InMemoryDocumentStore,
    InMemoryExceptionLog, LoggingNotificationSink, RecordingFinalizer, RecordingNotificationSink,
};

/// Status strings written to the audit log.
pub mod audit_status {
    /// The item entered the chain.
    pub const IN_PROGRESS: &str = "IN_PROGRESS";
    /// Validation passed.
    pub const VALID: &str = "VALID";
    /// The content was already processed.
    pub const DUPLICATED: &str = "DUPLICATED";
    /// The item finished the chain.
    pub const COMPLETED: &str = "COMPLETED";
    /// The item ended in the exception path.
    pub const FAILED: &str = "FAILED";
    /// The batch was finalized.
    pub const FINALIZED: &str = "FINALIZED";
}

/// Source of document bytes for references that carry no inline content.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches the document behind `reference`.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, StoreError>;
}

/// Result of claiming a content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the hash.
    Claimed,
    /// The caller already owned the hash (redelivery of the same item).
    AlreadyOwned,
    /// Another item owns the hash.
    Duplicate {
        /// The owning item.
        owner: String,
    },
}

impl ClaimOutcome {
    /// Returns true if the caller owns the hash after the claim.
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        matches!(self, Self::Claimed | Self::AlreadyOwned)
    }
}

/// Compare-and-set ownership of content hashes.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Claims `hash` for `item_id`; only the first claimant owns it.
    async fn claim(&self, hash: &str, item_id: &str) -> Result<ClaimOutcome, StoreError>;

    /// Releases `hash` if `item_id` owns it. Returns true if released.
    async fn release(&self, hash: &str, item_id: &str) -> Result<bool, StoreError>;

    /// Returns the owner of `hash`.
    async fn owner(&self, hash: &str) -> Result<Option<String>, StoreError>;
}

/// One audit-log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Item or batch id.
    pub key: String,
    /// Owning batch.
    pub batch_id: String,
    /// Status written.
    pub status: String,
    /// When it was written.
    pub recorded_at: Timestamp,
}

/// Message/batch audit log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Appends a status line for an item.
    async fn record_item_status(
        &self,
        batch_id: &str,
        item_id: &str,
        status: &str,
    ) -> Result<(), StoreError>;

    /// Status lines written for an item, oldest first.
    async fn item_history(&self, item_id: &str) -> Result<Vec<AuditEntry>, StoreError>;

    /// Writes a pending batch entry unless one exists. Returns true if written.
    async fn insert_batch_if_absent(&self, outcome: &BatchOutcome) -> Result<bool, StoreError>;

    /// Marks the batch entry as finalized.
    async fn confirm_batch(&self, batch_id: &str) -> Result<(), StoreError>;

    /// The recorded outcome of a finalized batch.
    async fn batch_entry(&self, batch_id: &str) -> Result<Option<BatchOutcome>, StoreError>;

    /// The recorded outcome of a batch whose finalize never confirmed.
    async fn pending_batch(&self, batch_id: &str) -> Result<Option<BatchOutcome>, StoreError>;
}

/// Append-only log of terminal failures, one record per (batch, item).
#[async_trait]
pub trait ExceptionLog: Send + Sync {
    /// Appends `record` unless its key exists. Returns true if appended.
    async fn append(&self, record: ExceptionRecord) -> Result<bool, StoreError>;

    /// Looks up a record by key.
    async fn get(&self, key: &str) -> Result<Option<ExceptionRecord>, StoreError>;

    /// Records of a batch, in append order.
    async fn records_for_batch(&self, batch_id: &str) -> Result<Vec<ExceptionRecord>, StoreError>;
}

/// An item waiting to re-invoke a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    /// Snapshot of the item at the time the wait began.
    pub item: WorkItem,
    /// Stage to re-invoke.
    pub stage: StageName,
    /// When the stage should be re-invoked.
    pub resume_at: Timestamp,
}

impl ResumeCheckpoint {
    /// Storage key of the checkpoint.
    #[must_use]
    pub fn key(&self) -> String {
        crate::core::record_key(&self.item.batch_id, &self.item.id)
    }
}

/// Persisted scheduled resumptions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stores (or replaces) a checkpoint.
    async fn save(&self, checkpoint: ResumeCheckpoint) -> Result<(), StoreError>;

    /// Removes the checkpoint of an item.
    async fn remove(&self, batch_id: &str, item_id: &str) -> Result<(), StoreError>;

    /// Checkpoints left for a batch.
    async fn load_batch(&self, batch_id: &str) -> Result<Vec<ResumeCheckpoint>, StoreError>;
}

/// Destination of failure notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publishes one notification.
    async fn publish(&self, notification: &FailureNotification) -> Result<(), FhirflowError>;
}

/// Collaborator invoked once per finalized batch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchFinalizer: Send + Sync {
    /// Handles the outcome of a finished batch.
    async fn finalize(&self, outcome: &BatchOutcome) -> Result<(), FhirflowError>;
}
