//! Core domain model types for fhirflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage names, item phases and statuses
//! - Work items, batches and trigger events
//! - Stage results and classified errors
//! - Exception records and failure notifications

mod batch;
mod error_kind;
mod exception;
mod item;
mod result;
mod status;

pub use batch::{Batch, BatchOutcome, InboundRecord, TriggerEvent};
pub(crate) use batch::derive_status;
pub use error_kind::{ClassifiedError, ErrorKind};
pub use exception::{record_key, ExceptionRecord, FailureNotification, EXCEPTION_STATUS};
pub use item::{ItemSource, LastError, RetryState, WorkItem};
pub use result::{StageResult, COMPLETED_STATUS};
pub use status::{BatchStatus, ItemPhase, ItemStatus, StageName};
