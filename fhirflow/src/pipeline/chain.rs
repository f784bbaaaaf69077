//! The explicit ordered stage chain and the item state machine it implies.

use crate::core::{ItemPhase, StageName};
use crate::errors::FhirflowError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ordered list of stages every item walks through.
///
/// The chain always starts with [`StageName::Validate`] and names each stage
/// at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StageName>", into = "Vec<StageName>")]
pub struct StageChain {
    stages: Vec<StageName>,
}

impl Default for StageChain {
    /// `Validate -> Deduplicate -> Convert -> BuildDataset -> Persist`.
    fn default() -> Self {
        Self {
            stages: StageName::ALL.to_vec(),
        }
    }
}

impl StageChain {
    /// Creates a chain, rejecting empty chains, repeated stages and chains
    /// that do not start with validation.
    pub fn new(stages: Vec<StageName>) -> Result<Self, FhirflowError> {
        match stages.first() {
            None => return Err(FhirflowError::InvalidChain("chain is empty".to_string())),
            Some(StageName::Validate) => {}
            Some(other) => {
                return Err(FhirflowError::InvalidChain(format!(
                    "chain must start with validate, found {other}"
                )))
            }
        }

        let mut seen = HashSet::new();
        if let Some(dup) = stages.iter().find(|stage| !seen.insert(**stage)) {
            return Err(FhirflowError::InvalidChain(format!(
                "stage {dup} appears more than once"
            )));
        }

        Ok(Self { stages })
    }

    /// Stages in order.
    #[must_use]
    pub fn stages(&self) -> &[StageName] {
        &self.stages
    }

    /// First stage of the chain.
    #[must_use]
    pub fn first(&self) -> StageName {
        self.stages.first().copied().unwrap_or(StageName::Validate)
    }

    /// Last stage of the chain.
    #[must_use]
    pub fn last(&self) -> StageName {
        self.stages.last().copied().unwrap_or(StageName::Validate)
    }

    /// Position of `stage`, if it is part of the chain.
    #[must_use]
    pub fn position(&self, stage: StageName) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }

    /// Returns true if the chain contains `stage`.
    #[must_use]
    pub fn contains(&self, stage: StageName) -> bool {
        self.position(stage).is_some()
    }

    /// Stage that follows `stage`, or `None` at the end of the chain.
    #[must_use]
    pub fn next_after(&self, stage: StageName) -> Option<StageName> {
        self.position(stage)
            .and_then(|idx| self.stages.get(idx + 1))
            .copied()
    }

    /// Returns true if an item may move from `from` to `to`.
    ///
    /// Legal edges:
    /// - `Pending` to the first stage
    /// - an active stage to the stage right after it, `Complete`, `Failed`, or
    ///   its own retry wait
    /// - a retry wait back to its stage, or to `Failed`
    #[must_use]
    pub fn allows(&self, from: ItemPhase, to: ItemPhase) -> bool {
        match (from, to) {
            (ItemPhase::Pending, to) => to.stage() == Some(self.first()),
            (ItemPhase::Retrying(waiting), to) => {
                to == ItemPhase::Failed || (to.stage() == Some(waiting) && self.contains(waiting))
            }
            (from, to) => {
                let Some(current) = from.stage().filter(|s| self.contains(*s)) else {
                    return false;
                };
                match to {
                    ItemPhase::Complete | ItemPhase::Failed => true,
                    ItemPhase::Retrying(stage) => stage == current,
                    to => to.stage().is_some() && to.stage() == self.next_after(current),
                }
            }
        }
    }
}

impl TryFrom<Vec<StageName>> for StageChain {
    type Error = FhirflowError;

    fn try_from(stages: Vec<StageName>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

impl From<StageChain> for Vec<StageName> {
    fn from(chain: StageChain) -> Self {
        chain.stages
    }
}
