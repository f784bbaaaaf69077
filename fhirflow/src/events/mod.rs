//! Lifecycle event emission.
//!
//! The orchestrator and executor report what happens to items and batches
//! through an injected [`EventSink`]. Event payloads always carry `item_id`
//! and `batch_id` where they apply.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A stage invocation began.
    pub const STAGE_STARTED: &str = "item.stage.started";
    /// A stage invocation returned.
    pub const STAGE_COMPLETED: &str = "item.stage.completed";
    /// A stage invocation timed out.
    pub const STAGE_TIMED_OUT: &str = "item.stage.timed_out";
    /// A wait before re-invoking a stage was scheduled.
    pub const RETRY_SCHEDULED: &str = "item.retry.scheduled";
    /// An item resumed from a checkpoint.
    pub const ITEM_RESUMED: &str = "item.resumed";
    /// An item reached `Complete`.
    pub const ITEM_COMPLETED: &str = "item.completed";
    /// An item reached `Failed`.
    pub const ITEM_FAILED: &str = "item.failed";
    /// A batch run started.
    pub const BATCH_STARTED: &str = "batch.started";
    /// A batch was finalized.
    pub const BATCH_FINALIZED: &str = "batch.finalized";
    /// A redelivered batch was skipped.
    pub const BATCH_SKIPPED: &str = "batch.skipped";
}
