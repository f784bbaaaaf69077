//! Testing utilities for fhirflow pipelines.
//!
//! Scripted stage handlers that stand in for the real converter, dataset
//! builder and downstream store in tests.

mod mocks;

pub use mocks::{RateLimitedStage, ScriptedStage, SucceedingStage};
