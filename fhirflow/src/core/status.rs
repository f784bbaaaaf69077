//! Stage names, item statuses and state-machine phases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One named step of the processing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Checks that the document is a supported type.
    Validate,
    /// Hashes the content and claims it in the dedup store.
    Deduplicate,
    /// Converts the document to FHIR.
    Convert,
    /// Builds the FHIR datasets.
    BuildDataset,
    /// Persists the FHIR bundle downstream.
    Persist,
}

impl StageName {
    /// All stages in their default chain order.
    pub const ALL: [Self; 5] = [
        Self::Validate,
        Self::Deduplicate,
        Self::Convert,
        Self::BuildDataset,
        Self::Persist,
    ];

    /// Short identifier used in configuration files and event payloads.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Deduplicate => "deduplicate",
            Self::Convert => "convert",
            Self::BuildDataset => "build_dataset",
            Self::Persist => "persist",
        }
    }

    /// Workflow state name recorded in exception records and notifications.
    #[must_use]
    pub const fn state_name(&self) -> &'static str {
        match self {
            Self::Validate => "ValidateFile",
            Self::Deduplicate => "Deduplication",
            Self::Convert => "ConvertToFHIR",
            Self::BuildDataset => "BuildFHIRDatasets",
            Self::Persist => "SaveFHIRResources",
        }
    }

    /// The phase an item is in while this stage runs.
    #[must_use]
    pub const fn active_phase(&self) -> ItemPhase {
        match self {
            Self::Validate => ItemPhase::Validating,
            Self::Deduplicate => ItemPhase::Deduplicating,
            Self::Convert => ItemPhase::Converting,
            Self::BuildDataset => ItemPhase::BuildingDataset,
            Self::Persist => ItemPhase::Persisting,
        }
    }

    /// Parses either the short identifier or the workflow state name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value || stage.state_name() == value)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// A stage is running.
    InProgress,
    /// Reached `Complete` (including duplicates).
    Succeeded,
    /// Reached `Failed`.
    Failed,
    /// Waiting before a stage is re-invoked.
    Retrying,
}

impl ItemStatus {
    /// Returns true if no further transitions can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// Position of a work item in the per-item state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPhase {
    /// Created, no stage entered.
    #[default]
    Pending,
    /// Running `Validate`.
    Validating,
    /// Running `Deduplicate`.
    Deduplicating,
    /// Running `Convert`.
    Converting,
    /// Running `BuildDataset`.
    BuildingDataset,
    /// Running `Persist`.
    Persisting,
    /// Waiting to re-invoke the given stage.
    Retrying(StageName),
    /// Terminal success.
    Complete,
    /// Terminal failure.
    Failed,
}

impl ItemPhase {
    /// Returns true for `Complete` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// The stage that runs in this phase, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<StageName> {
        match self {
            Self::Validating => Some(StageName::Validate),
            Self::Deduplicating => Some(StageName::Deduplicate),
            Self::Converting => Some(StageName::Convert),
            Self::BuildingDataset => Some(StageName::BuildDataset),
            Self::Persisting => Some(StageName::Persist),
            Self::Pending | Self::Retrying(_) | Self::Complete | Self::Failed => None,
        }
    }

    /// The item status implied by this phase.
    #[must_use]
    pub const fn status(&self) -> ItemStatus {
        match self {
            Self::Pending => ItemStatus::Pending,
            Self::Retrying(_) => ItemStatus::Retrying,
            Self::Complete => ItemStatus::Succeeded,
            Self::Failed => ItemStatus::Failed,
            Self::Validating
            | Self::Deduplicating
            | Self::Converting
            | Self::BuildingDataset
            | Self::Persisting => ItemStatus::InProgress,
        }
    }
}

impl fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Validating => write!(f, "Validating"),
            Self::Deduplicating => write!(f, "Deduplicating"),
            Self::Converting => write!(f, "Converting"),
            Self::BuildingDataset => write!(f, "BuildingDataset"),
            Self::Persisting => write!(f, "Persisting"),
            Self::Retrying(StageName::Persist) => write!(f, "RetryingPersist"),
            Self::Retrying(stage) => write!(f, "Retrying({})", stage.state_name()),
            Self::Complete => write!(f, "Complete"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Overall status of a batch, derived from its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// No item has started.
    Pending,
    /// At least one item is not terminal.
    Running,
    /// Every item succeeded.
    Completed,
    /// Every item is terminal, some failed.
    PartiallyFailed,
    /// Every item failed.
    Failed,
}

impl BatchStatus {
    /// Returns true once every item is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::PartiallyFailed => write!(f, "partially_failed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
