//! In-memory store implementations.

use super::{
    AuditEntry, AuditLog, BatchFinalizer, CheckpointStore, ClaimOutcome, DedupStore,
    DocumentStore, ExceptionLog, NotificationSink, ResumeCheckpoint,
};
use crate::core::{record_key, BatchOutcome, ExceptionRecord, FailureNotification};
use crate::errors::{FhirflowError, StoreError};
use crate::utils::now_utc;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Documents keyed by reference.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a document.
    pub fn insert(&self, reference: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.documents.write().insert(reference.into(), content.into());
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with_document(self, reference: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.insert(reference, content);
        self
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        self.documents
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::DocumentNotFound(reference.to_string()))
    }
}

/// Hash ownership backed by a concurrent map; claims go through the entry
/// API so the check and the insert are one step.
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    owners: DashMap<String, String>,
}

impl InMemoryDedupStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of claimed hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Returns true if no hash is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn claim(&self, hash: &str, item_id: &str) -> Result<ClaimOutcome, StoreError> {
        Ok(match self.owners.entry(hash.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(item_id.to_string());
                ClaimOutcome::Claimed
            }
            Entry::Occupied(slot) if slot.get() == item_id => ClaimOutcome::AlreadyOwned,
            Entry::Occupied(slot) => ClaimOutcome::Duplicate {
                owner: slot.get().clone(),
            },
        })
    }

    async fn release(&self, hash: &str, item_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .owners
            .remove_if(hash, |_, owner| owner == item_id)
            .is_some())
    }

    async fn owner(&self, hash: &str) -> Result<Option<String>, StoreError> {
        Ok(self.owners.get(hash).map(|owner| owner.value().clone()))
    }
}

#[derive(Debug, Clone)]
struct BatchRow {
    outcome: BatchOutcome,
    finalized: bool,
}

/// Audit log kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    items: RwLock<Vec<AuditEntry>>,
    batches: Mutex<HashMap<String, BatchRow>>,
}

impl InMemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of finalized batches recorded.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.lock().values().filter(|row| row.finalized).count()
    }

    /// All item lines, oldest first.
    #[must_use]
    pub fn item_entries(&self) -> Vec<AuditEntry> {
        self.items.read().clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record_item_status(
        &self,
        batch_id: &str,
        item_id: &str,
        status: &str,
    ) -> Result<(), StoreError> {
        self.items.write().push(AuditEntry {
            key: item_id.to_string(),
            batch_id: batch_id.to_string(),
            status: status.to_string(),
            recorded_at: now_utc(),
        });
        Ok(())
    }

    async fn item_history(&self, item_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .items
            .read()
            .iter()
            .filter(|entry| entry.key == item_id)
            .cloned()
            .collect())
    }

    async fn insert_batch_if_absent(&self, outcome: &BatchOutcome) -> Result<bool, StoreError> {
        let mut batches = self.batches.lock();
        if batches.contains_key(&outcome.batch_id) {
            return Ok(false);
        }
        batches.insert(
            outcome.batch_id.clone(),
            BatchRow {
                outcome: outcome.clone(),
                finalized: false,
            },
        );
        Ok(true)
    }

    async fn confirm_batch(&self, batch_id: &str) -> Result<(), StoreError> {
        match self.batches.lock().get_mut(batch_id) {
            Some(row) => {
                row.finalized = true;
                Ok(())
            }
            None => Err(StoreError::unavailable(
                "audit",
                format!("no batch entry for {batch_id}"),
            )),
        }
    }

    async fn batch_entry(&self, batch_id: &str) -> Result<Option<BatchOutcome>, StoreError> {
        Ok(self
            .batches
            .lock()
            .get(batch_id)
            .filter(|row| row.finalized)
            .map(|row| row.outcome.clone()))
    }

    async fn pending_batch(&self, batch_id: &str) -> Result<Option<BatchOutcome>, StoreError> {
        Ok(self
            .batches
            .lock()
            .get(batch_id)
            .filter(|row| !row.finalized)
            .map(|row| row.outcome.clone()))
    }
}

/// Exception log kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryExceptionLog {
    records: Mutex<Vec<ExceptionRecord>>,
}

impl InMemoryExceptionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if no record was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// All records in append order.
    #[must_use]
    pub fn records(&self) -> Vec<ExceptionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ExceptionLog for InMemoryExceptionLog {
    async fn append(&self, record: ExceptionRecord) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        let key = record.key();
        if records.iter().any(|existing| existing.key() == key) {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<ExceptionRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .find(|record| record.key() == key)
            .cloned())
    }

    async fn records_for_batch(&self, batch_id: &str) -> Result<Vec<ExceptionRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| record.batch_id() == batch_id)
            .cloned()
            .collect())
    }
}

/// Checkpoints kept in memory, keyed by (batch, item).
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<String, ResumeCheckpoint>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: ResumeCheckpoint) -> Result<(), StoreError> {
        self.checkpoints.insert(checkpoint.key(), checkpoint);
        Ok(())
    }

    async fn remove(&self, batch_id: &str, item_id: &str) -> Result<(), StoreError> {
        self.checkpoints.remove(&record_key(batch_id, item_id));
        Ok(())
    }

    async fn load_batch(&self, batch_id: &str) -> Result<Vec<ResumeCheckpoint>, StoreError> {
        let mut found: Vec<ResumeCheckpoint> = self
            .checkpoints
            .iter()
            .filter(|entry| entry.value().item.batch_id == batch_id)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.resume_at.cmp(&b.resume_at).then_with(|| a.item.id.cmp(&b.item.id)));
        Ok(found)
    }
}

/// Forwards notifications to the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn publish(&self, notification: &FailureNotification) -> Result<(), FhirflowError> {
        tracing::warn!(
            item_id = %notification.item_id,
            batch_id = %notification.batch_id,
            stage = %notification.stage,
            error_kind = %notification.error_kind,
            dedup_hash_released = notification.dedup_hash_released,
            "Item failed: {}", notification.message
        );
        Ok(())
    }
}

/// Keeps every published notification.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    published: RwLock<Vec<FailureNotification>>,
}

impl RecordingNotificationSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications published so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<FailureNotification> {
        self.published.read().clone()
    }

    /// Number of notifications published.
    #[must_use]
    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    /// Returns true if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.published.read().is_empty()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn publish(&self, notification: &FailureNotification) -> Result<(), FhirflowError> {
        self.published.write().push(notification.clone());
        Ok(())
    }
}

/// Keeps every finalized outcome.
#[derive(Debug, Default)]
pub struct RecordingFinalizer {
    outcomes: RwLock<Vec<BatchOutcome>>,
}

impl RecordingFinalizer {
    /// Creates an empty finalizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes finalized so far.
    #[must_use]
    pub fn outcomes(&self) -> Vec<BatchOutcome> {
        self.outcomes.read().clone()
    }

    /// Number of finalize calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.outcomes.read().len()
    }
}

#[async_trait]
impl BatchFinalizer for RecordingFinalizer {
    async fn finalize(&self, outcome: &BatchOutcome) -> Result<(), FhirflowError> {
        tracing::info!(
            batch_id = %outcome.batch_id,
            status = %outcome.status,
            "Batch finalized"
        );
        self.outcomes.write().push(outcome.clone());
        Ok(())
    }
}
