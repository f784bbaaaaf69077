//! Chain definition, retry policy, branching and batch execution.
//!
//! This module provides:
//! - The ordered stage chain and its transition rules
//! - The table-driven retry policy
//! - The branch evaluator picking each item's next step
//! - The batch map executor and the exception path
//! - The orchestrator tying them to trigger deliveries

mod branch;
mod chain;
mod exception_handler;
mod executor;
mod orchestrator;
mod retry;


pub use branch::{BranchEvaluator, NextStep};
pub use chain::StageChain;
pub use exception_handler::ExceptionHandler;
pub use executor::{BatchMapExecutor, BatchResult};
pub use orchestrator::{OrchestratorBuilder, PipelineOrchestrator};
pub use retry::{
    BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryRule,
    DEFAULT_RATE_LIMIT_INITIAL_DELAY_MS, DEFAULT_RATE_LIMIT_MAX_RETRIES, DEFAULT_RATE_LIMIT_WAIT_MS,
};
