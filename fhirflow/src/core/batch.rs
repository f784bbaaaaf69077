//! Trigger events, batches and batch outcomes.

use super::{BatchStatus, ItemSource, ItemStatus, WorkItem};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One record reference inside a trigger delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRecord {
    /// Record identifier, unique within the source queue.
    pub record_id: String,
    /// Handle used to acknowledge the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
    /// Object reference (e.g. a storage key).
    pub reference: String,
    /// Inline document bytes, base64 on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::utils::base64_bytes::option"
    )]
    pub content: Option<Vec<u8>>,
    /// Extra attributes copied into the item payload.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundRecord {
    /// Creates a record pointing at `reference`.
    #[must_use]
    pub fn new(record_id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            receipt_handle: None,
            reference: reference.into(),
            content: None,
            metadata: HashMap::new(),
        }
    }

    /// Attaches inline content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Sets the receipt handle.
    #[must_use]
    pub fn with_receipt_handle(mut self, handle: impl Into<String>) -> Self {
        self.receipt_handle = Some(handle.into());
        self
    }
}

/// A batch-shaped trigger delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Delivery identifier; becomes the batch id.
    pub delivery_id: String,
    /// Records carried by the delivery.
    #[serde(default)]
    pub records: Vec<InboundRecord>,
}

impl TriggerEvent {
    /// Creates a trigger with the given delivery id.
    #[must_use]
    pub fn new(delivery_id: impl Into<String>, records: Vec<InboundRecord>) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            records,
        }
    }

    /// Creates a trigger with a generated delivery id.
    #[must_use]
    pub fn with_generated_id(records: Vec<InboundRecord>) -> Self {
        Self::new(crate::utils::generate_uuid().to_string(), records)
    }
}

/// The set of work items derived from one trigger delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Batch id.
    pub id: String,
    /// Item ids in delivery order.
    pub item_ids: Vec<String>,
    items: HashMap<String, WorkItem>,
    /// When the batch was created.
    pub created_at: Timestamp,
}

impl Batch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            item_ids: Vec::new(),
            items: HashMap::new(),
            created_at: now_utc(),
        }
    }

    /// Splits a trigger into one pending item per record.
    ///
    /// Records repeating an earlier record id are dropped so each item is
    /// owned exactly once.
    #[must_use]
    pub fn from_trigger(trigger: &TriggerEvent) -> Self {
        let mut item_ids = Vec::with_capacity(trigger.records.len());
        let mut items = HashMap::with_capacity(trigger.records.len());

        for record in &trigger.records {
            if items.contains_key(&record.record_id) {
                tracing::warn!(
                    batch_id = %trigger.delivery_id,
                    record_id = %record.record_id,
                    "Dropping repeated record in trigger"
                );
                continue;
            }

            let source = ItemSource {
                record_id: record.record_id.clone(),
                receipt_handle: record.receipt_handle.clone(),
                delivery_id: trigger.delivery_id.clone(),
            };
            let payload = serde_json::json!({
                "Object": { "key": record.reference },
                "Metadata": record.metadata,
            });
            let mut item = WorkItem::new(source, record.reference.clone()).with_payload(payload);
            item.content.clone_from(&record.content);

            item_ids.push(item.id.clone());
            items.insert(item.id.clone(), item);
        }

        Self {
            id: trigger.delivery_id.clone(),
            item_ids,
            items,
            created_at: now_utc(),
        }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Returns true if the batch has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Returns an item by id.
    #[must_use]
    pub fn item(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    /// Items in delivery order.
    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.item_ids.iter().filter_map(|id| self.items.get(id))
    }

    /// Takes the items out in delivery order, leaving the id list intact.
    pub fn take_items(&mut self) -> Vec<WorkItem> {
        let mut items = std::mem::take(&mut self.items);
        self.item_ids
            .iter()
            .filter_map(|id| items.remove(id))
            .collect()
    }

    /// Replaces (or puts back) an item.
    pub fn put_item(&mut self, item: WorkItem) {
        if !self.item_ids.contains(&item.id) {
            self.item_ids.push(item.id.clone());
        }
        self.items.insert(item.id.clone(), item);
    }

    /// Status derived from the owned items.
    #[must_use]
    pub fn status(&self) -> BatchStatus {
        derive_status(self.items().map(WorkItem::status))
    }

    /// Returns true iff every owned item is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.items().all(WorkItem::is_terminal)
    }
}

/// Derives a batch status from item statuses.
pub(crate) fn derive_status(statuses: impl Iterator<Item = ItemStatus>) -> BatchStatus {
    let mut total = 0usize;
    let mut pending = 0usize;
    let mut failed = 0usize;
    let mut terminal = 0usize;

    for status in statuses {
        total += 1;
        match status {
            ItemStatus::Pending => pending += 1,
            ItemStatus::Failed => {
                failed += 1;
                terminal += 1;
            }
            ItemStatus::Succeeded => terminal += 1,
            ItemStatus::InProgress | ItemStatus::Retrying => {}
        }
    }

    if terminal == total {
        if failed == 0 {
            BatchStatus::Completed
        } else if failed == total {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyFailed
        }
    } else if pending == total {
        BatchStatus::Pending
    } else {
        BatchStatus::Running
    }
}

/// Aggregated outcome of a processed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Batch id.
    pub batch_id: String,
    /// Number of items.
    pub total: usize,
    /// Items that completed through the full chain.
    pub succeeded: usize,
    /// Items that completed as duplicates.
    pub duplicates: usize,
    /// Items that failed.
    pub failed: usize,
    /// Derived batch status.
    pub status: BatchStatus,
    /// True when the batch had already been finalized by an earlier delivery.
    #[serde(default)]
    pub already_finalized: bool,
}

impl BatchOutcome {
    /// Builds the outcome from terminal items.
    #[must_use]
    pub fn from_items<'a>(
        batch_id: impl Into<String>,
        items: impl IntoIterator<Item = &'a WorkItem>,
    ) -> Self {
        let mut outcome = Self {
            batch_id: batch_id.into(),
            total: 0,
            succeeded: 0,
            duplicates: 0,
            failed: 0,
            status: BatchStatus::Pending,
            already_finalized: false,
        };
        let mut statuses = Vec::new();

        for item in items {
            outcome.total += 1;
            statuses.push(item.status());
            match item.status() {
                ItemStatus::Succeeded if item.duplicate => outcome.duplicates += 1,
                ItemStatus::Succeeded => outcome.succeeded += 1,
                ItemStatus::Failed => outcome.failed += 1,
                _ => {}
            }
        }

        outcome.status = derive_status(statuses.into_iter());
        outcome
    }

    /// Items that reached `succeeded`, duplicates included.
    #[must_use]
    pub const fn total_succeeded(&self) -> usize {
        self.succeeded + self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ItemPhase;
    use crate::pipeline::StageChain;

    fn trigger() -> TriggerEvent {
        TriggerEvent::new(
            "delivery-1",
            vec![
                InboundRecord::new("m1", "a.xml").with_content("<a/>"),
                InboundRecord::new("m2", "b.xml"),
                InboundRecord::new("m1", "a-again.xml"),
            ],
        )
    }

    #[test]
    fn test_split_one_item_per_record() {
        let batch = Batch::from_trigger(&trigger());
        assert_eq!(batch.id, "delivery-1");
        assert_eq!(batch.item_ids, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(batch.item("m1").unwrap().content.as_deref(), Some(&b"<a/>"[..]));
        assert_eq!(batch.item("m2").unwrap().payload["Object"]["key"], "b.xml");
        assert_eq!(batch.status(), BatchStatus::Pending);
        assert!(!batch.is_terminal());
    }

    #[test]
    fn test_take_and_put_back() {
        let mut batch = Batch::from_trigger(&trigger());
        let items = batch.take_items();
        assert_eq!(items.len(), 2);
        assert_eq!(batch.len(), 2);
        for item in items {
            batch.put_item(item);
        }
        assert_eq!(batch.items().count(), 2);
    }

    #[test]
    fn test_derive_status() {
        use ItemStatus::*;
        assert_eq!(derive_status([Succeeded, Succeeded].into_iter()), BatchStatus::Completed);
        assert_eq!(derive_status([Succeeded, Failed].into_iter()), BatchStatus::PartiallyFailed);
        assert_eq!(derive_status([Failed].into_iter()), BatchStatus::Failed);
        assert_eq!(derive_status([Failed, InProgress].into_iter()), BatchStatus::Running);
        assert_eq!(derive_status([Pending, Pending].into_iter()), BatchStatus::Pending);
        assert_eq!(derive_status(std::iter::empty()), BatchStatus::Completed);
    }

    #[test]
    fn test_outcome_counts_duplicates_separately() {
        let chain = StageChain::default();
        let batch = Batch::from_trigger(&trigger());
        let mut items: Vec<WorkItem> = batch.items().cloned().collect();

        items[0].transition(ItemPhase::Validating, &chain).unwrap();
        items[0].transition(ItemPhase::Deduplicating, &chain).unwrap();
        items[0].transition(ItemPhase::Complete, &chain).unwrap();
        items[0].duplicate = true;

        items[1].transition(ItemPhase::Validating, &chain).unwrap();
        items[1].transition(ItemPhase::Failed, &chain).unwrap();

        let outcome = BatchOutcome::from_items("delivery-1", &items);
        assert_eq!(outcome.total, 2);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.succeeded, 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.total_succeeded(), 1);
        assert_eq!(outcome.status, BatchStatus::PartiallyFailed);
    }

    #[test]
    fn test_trigger_deserializes_base64_content() {
        let json = serde_json::json!({
            "delivery_id": "d",
            "records": [{"record_id": "r", "reference": "k.xml", "content": "PGEvPg=="}]
        });
        let trigger: TriggerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(trigger.records[0].content.as_deref(), Some(&b"<a/>"[..]));
    }
}
