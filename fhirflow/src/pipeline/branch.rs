//! Selection of the next step after a stage invocation.

use super::{RetryDecision, RetryPolicy, StageChain};
use crate::core::{ClassifiedError, ErrorKind, StageName, StageResult, WorkItem};
use std::time::Duration;

/// What an item does after a stage returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Invoke the given stage.
    Stage(StageName),
    /// Wait, then invoke `stage` again.
    Wait {
        /// Stage to re-invoke.
        stage: StageName,
        /// How long to wait.
        delay: Duration,
        /// Retry number (1-based).
        attempt: u32,
    },
    /// The item is done.
    Complete,
    /// The item failed terminally.
    ExceptionHandler(ClassifiedError),
}

impl NextStep {
    /// Returns true for `Complete` and `ExceptionHandler`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::ExceptionHandler(_))
    }
}

/// Evaluates the ordered branch rules against a stage result.
#[derive(Debug, Clone, Default)]
pub struct BranchEvaluator {
    chain: StageChain,
    policy: RetryPolicy,
}

impl BranchEvaluator {
    /// Creates an evaluator over `chain` using `policy` for failures.
    #[must_use]
    pub const fn new(chain: StageChain, policy: RetryPolicy) -> Self {
        Self { chain, policy }
    }

    /// The chain being evaluated.
    #[must_use]
    pub const fn chain(&self) -> &StageChain {
        &self.chain
    }

    /// The retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Picks the next step for `item` given the result of its current stage.
    ///
    /// Rules, first match wins:
    /// 1. a `COMPLETED` status or a duplicate completes the item
    /// 2. a failure the policy retries at this attempt waits and re-runs the stage
    /// 3. any other failure goes to the exception handler
    /// 4. a success moves on to the next stage in chain order; past the last
    ///    stage there is nowhere to go and the item is handed to the exception
    ///    handler. A `next_hint` never changes the target stage.
    #[must_use]
    pub fn next_step(&self, item: &WorkItem, result: &StageResult) -> NextStep {
        let stage = item.current_stage.unwrap_or_else(|| self.chain.first());

        if result.is_completion() {
            return NextStep::Complete;
        }

        match result {
            StageResult::Failed(error) => self.on_failure(item, stage, error),
            StageResult::Success { next_hint, .. } => self.on_success(item, stage, *next_hint),
            StageResult::Duplicate { .. } => NextStep::Complete,
        }
    }

    fn on_failure(&self, item: &WorkItem, stage: StageName, error: &ClassifiedError) -> NextStep {
        let attempt = item.retries_for(stage) + 1;

        match self.policy.decide(stage, attempt, error) {
            RetryDecision::Retry(delay) => NextStep::Wait {
                stage,
                delay,
                attempt,
            },
            RetryDecision::GiveUp => {
                tracing::warn!(
                    item_id = %item.id,
                    stage = %stage,
                    error_kind = %error.kind,
                    retries = attempt - 1,
                    "Retries exhausted"
                );
                NextStep::ExceptionHandler(error.clone())
            }
            RetryDecision::NotRetryable => NextStep::ExceptionHandler(error.clone()),
        }
    }

    fn on_success(&self, item: &WorkItem, stage: StageName, hint: Option<StageName>) -> NextStep {
        let next = self.chain.next_after(stage);
        if let Some(hint) = hint.filter(|hint| Some(*hint) != next) {
            tracing::warn!(
                item_id = %item.id,
                stage = %stage,
                hint = %hint,
                "Ignoring next-stage hint that is not the following stage"
            );
        }

        match next {
            Some(next) => NextStep::Stage(next),
            None => NextStep::ExceptionHandler(ClassifiedError::new(
                ErrorKind::NoChoiceMatched,
                format!(
                    "{} succeeded without reporting COMPLETED",
                    stage.state_name()
                ),
            )),
        }
    }
}
