//! Mock stage handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::core::{ClassifiedError, StageResult, WorkItem};
use crate::errors::FhirflowError;
use crate::stages::StageHandler;

/// A handler that always succeeds, passing the payload through.
#[derive(Debug, Default)]
pub struct SucceedingStage {
    completing: bool,
    calls: Mutex<Vec<String>>,
}

impl SucceedingStage {
    /// Creates a handler that succeeds without signalling completion.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler that reports `COMPLETED`.
    #[must_use]
    pub fn completing() -> Self {
        Self {
            completing: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Item ids seen, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StageHandler for SucceedingStage {
    fn name(&self) -> &str {
        "succeeding"
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        self.calls.lock().push(item.id.clone());
        let payload = item.payload.clone();
        Ok(if self.completing {
            StageResult::completed(payload)
        } else {
            StageResult::success(payload)
        })
    }
}

/// A handler replaying a per-item script of results.
///
/// Each call pops the next scripted result for the item. Once an item's
/// script runs out the fallback is returned.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<StageResult>>>,
    fallback: StageResult,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedStage {
    /// Creates a handler whose unscripted calls return `fallback`.
    #[must_use]
    pub fn new(name: impl Into<String>, fallback: StageResult) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Queues results for `item_id`.
    #[must_use]
    pub fn with_script(self, item_id: impl Into<String>, results: Vec<StageResult>) -> Self {
        self.scripts
            .lock()
            .entry(item_id.into())
            .or_default()
            .extend(results);
        self
    }

    /// Number of calls made for `item_id`.
    #[must_use]
    pub fn call_count(&self, item_id: &str) -> usize {
        self.calls.lock().get(item_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StageHandler for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        *self.calls.lock().entry(item.id.clone()).or_insert(0) += 1;
        let next = self
            .scripts
            .lock()
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// A persist handler answering HTTP 429 a fixed number of times per item.
#[derive(Debug)]
pub struct RateLimitedStage {
    failures: usize,
    calls: Mutex<HashMap<String, usize>>,
}

impl RateLimitedStage {
    /// Rate limits the first `failures` calls of every item, then completes.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Rate limits every call.
    #[must_use]
    pub fn always() -> Self {
        Self::new(usize::MAX)
    }

    /// Number of calls made for `item_id`.
    #[must_use]
    pub fn call_count(&self, item_id: &str) -> usize {
        self.calls.lock().get(item_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StageHandler for RateLimitedStage {
    fn name(&self) -> &str {
        "rate_limited"
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(item.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if call <= self.failures {
            Ok(ClassifiedError::rate_limited(format!("throttled (call {call})")).into())
        } else {
            Ok(StageResult::completed(item.payload.clone()))
        }
    }
}
