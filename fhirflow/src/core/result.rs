//! Outcome of a single stage invocation.

use super::{ClassifiedError, ErrorKind, StageName};
use serde::{Deserialize, Serialize};

/// Status value a stage reports when the item needs no further stages.
pub const COMPLETED_STATUS: &str = "COMPLETED";

/// The result of invoking one stage against one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageResult {
    /// The stage succeeded.
    Success {
        /// Updated item payload.
        payload: serde_json::Value,
        /// Status reported by the stage (e.g. `VALID`, `COMPLETED`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Stage the handler suggests running next.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_hint: Option<StageName>,
    },
    /// The content was already processed by another item.
    Duplicate {
        /// Content hash that matched.
        hash: String,
        /// Item that owns the hash.
        original_item: String,
    },
    /// The stage failed with a classified error.
    Failed(ClassifiedError),
}

impl StageResult {
    /// Creates a success result carrying a payload.
    #[must_use]
    pub const fn success(payload: serde_json::Value) -> Self {
        Self::Success {
            payload,
            status: None,
            next_hint: None,
        }
    }

    /// Creates a success result with a reported status.
    #[must_use]
    pub fn success_with_status(payload: serde_json::Value, status: impl Into<String>) -> Self {
        Self::Success {
            payload,
            status: Some(status.into()),
            next_hint: None,
        }
    }

    /// Creates a success result that signals completion.
    #[must_use]
    pub fn completed(payload: serde_json::Value) -> Self {
        Self::success_with_status(payload, COMPLETED_STATUS)
    }

    /// Creates a non-retryable failure.
    #[must_use]
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed(ClassifiedError::new(kind, message))
    }

    /// Creates a duplicate result.
    #[must_use]
    pub fn duplicate(hash: impl Into<String>, original_item: impl Into<String>) -> Self {
        Self::Duplicate {
            hash: hash.into(),
            original_item: original_item.into(),
        }
    }

    /// Sets the next-stage hint on a success result.
    #[must_use]
    pub fn with_next_hint(mut self, stage: StageName) -> Self {
        if let Self::Success { next_hint, .. } = &mut self {
            *next_hint = Some(stage);
        }
        self
    }

    /// Returns true if the result signals that the item is complete.
    #[must_use]
    pub fn is_completion(&self) -> bool {
        match self {
            Self::Success { status, .. } => status.as_deref() == Some(COMPLETED_STATUS),
            Self::Duplicate { .. } => true,
            Self::Failed(_) => false,
        }
    }

    /// Returns the classified error, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if the stage succeeded (including duplicates).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

impl From<ClassifiedError> for StageResult {
    fn from(err: ClassifiedError) -> Self {
        Self::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_signal() {
        assert!(StageResult::completed(json!({})).is_completion());
        assert!(!StageResult::success(json!({})).is_completion());
        assert!(!StageResult::success_with_status(json!({}), "CONVERTED").is_completion());
        assert!(StageResult::duplicate("abc", "item-1").is_completion());
        assert!(!StageResult::failed(ErrorKind::Converter, "boom").is_completion());
    }

    #[test]
    fn test_error_accessor() {
        let result = StageResult::from(ClassifiedError::rate_limited("slow down"));
        assert!(!result.is_success());
        assert_eq!(
            result.error().map(|e| e.kind.clone()),
            Some(ErrorKind::HealthLakePostTooManyRequests)
        );
        assert!(StageResult::success(json!(null)).error().is_none());
    }

    #[test]
    fn test_next_hint_only_applies_to_success() {
        let result = StageResult::success(json!({})).with_next_hint(StageName::Persist);
        assert!(matches!(
            result,
            StageResult::Success { next_hint: Some(StageName::Persist), .. }
        ));

        let failed =
            StageResult::failed(ErrorKind::Converter, "x").with_next_hint(StageName::Persist);
        assert!(matches!(failed, StageResult::Failed(_)));
    }

    #[test]
    fn test_serialization_is_tagged() {
        let json = serde_json::to_value(StageResult::duplicate("h", "i")).unwrap();
        assert_eq!(json["outcome"], "duplicate");
        assert_eq!(json["hash"], "h");
    }
}
