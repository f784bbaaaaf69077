//! Content deduplication.

use super::validate::load_content;
use super::StageHandler;
use crate::core::{StageResult, WorkItem};
use crate::errors::FhirflowError;
use crate::stores::{audit_status, ClaimOutcome, DedupStore, DocumentStore};
use crate::utils::content_hash;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// JSON pointer of the content hash inside the item payload.
pub const CONTENT_HASH_POINTER: &str = "/Object/md5_digest";

/// The `Deduplicate` stage: hashes the content and claims the hash.
///
/// The first item to claim a hash owns it; any other item with the same
/// content is reported as a duplicate of the owner. An item re-claiming its
/// own hash (redelivery) keeps ownership.
#[derive(Clone)]
pub struct DeduplicateStage {
    documents: Arc<dyn DocumentStore>,
    dedup: Arc<dyn DedupStore>,
}

impl fmt::Debug for DeduplicateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeduplicateStage").finish_non_exhaustive()
    }
}

impl DeduplicateStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(documents: Arc<dyn DocumentStore>, dedup: Arc<dyn DedupStore>) -> Self {
        Self { documents, dedup }
    }
}

#[async_trait]
impl StageHandler for DeduplicateStage {
    fn name(&self) -> &str {
        "deduplicate"
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        let content = match load_content(self.documents.as_ref(), item).await? {
            Ok(content) => content,
            Err(failed) => return Ok(failed),
        };

        let hash = content_hash(&content);
        match self.dedup.claim(&hash, &item.id).await? {
            ClaimOutcome::Duplicate { owner } => {
                tracing::info!(
                    item_id = %item.id,
                    batch_id = %item.batch_id,
                    hash = %hash,
                    owner = %owner,
                    "Duplicate document"
                );
                Ok(StageResult::duplicate(hash, owner))
            }
            ClaimOutcome::Claimed | ClaimOutcome::AlreadyOwned => {
                let mut payload = item.payload.clone();
                if !payload.is_object() {
                    payload = serde_json::json!({});
                }
                payload["Object"]["md5_digest"] = serde_json::Value::String(hash);
                Ok(StageResult::success_with_status(payload, audit_status::VALID))
            }
        }
    }
}
