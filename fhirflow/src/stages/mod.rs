//! Stage handlers and their invocation.
//!
//! A stage handler is an opaque capability registered for one
//! [`StageName`](crate::core::StageName). Handlers report every foreseeable
//! failure as a classified [`StageResult::Failed`]; an `Err` is reserved for
//! internal faults and fails the whole batch.

mod dedup;
#[cfg(feature = "http")]
mod http;
mod invoker;
mod validate;

pub use dedup::{DeduplicateStage, CONTENT_HASH_POINTER};
#[cfg(feature = "http")]
pub use http::HttpStage;
pub use invoker::StageInvoker;
pub use validate::{detect_document_type, DocumentType, ValidateStage};

use crate::core::{StageResult, WorkItem};
use crate::errors::FhirflowError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for the capability behind one stage.
#[async_trait]
pub trait StageHandler: Send + Sync + Debug {
    /// Returns the name of the handler.
    fn name(&self) -> &str;

    /// Runs the stage against a snapshot of the item.
    ///
    /// # Returns
    ///
    /// The new payload on success, a duplicate marker, or a classified failure.
    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError>;
}

/// A simple function-based handler.
pub struct FnStageHandler<F>
where
    F: Fn(&WorkItem) -> StageResult + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStageHandler<F>
where
    F: Fn(&WorkItem) -> StageResult + Send + Sync,
{
    /// Creates a new function-based handler.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStageHandler<F>
where
    F: Fn(&WorkItem) -> StageResult + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStageHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> StageHandler for FnStageHandler<F>
where
    F: Fn(&WorkItem) -> StageResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        Ok((self.func)(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorKind, ItemSource};
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

    #[tokio::test]
    async fn test_fn_stage_handler() {
        let handler = FnStageHandler::new("convert", |item: &WorkItem| {
            StageResult::success_with_status(json!({"key": item.reference}), "CONVERTED")
        });

        assert_eq!(handler.name(), "convert");
        let result = handler.handle(&item()).await.unwrap();
        assert_eq!(
            result,
            StageResult::success_with_status(json!({"key": "in/a.xml"}), "CONVERTED")
        );
        assert!(format!("{handler:?}").contains("convert"));
    }

    #[test]
    fn test_fn_stage_handler_failure() {
        let handler = FnStageHandler::new("build", |_: &WorkItem| {
            StageResult::failed(ErrorKind::FhirDatasetsGeneration, "x")
        });
        let result = tokio_test::block_on(handler.handle(&item())).unwrap();
        assert_eq!(result.error().unwrap().kind, ErrorKind::FhirDatasetsGeneration);
    }
}
