//! # Fhirflow
//!
//! Batch orchestration for clinical document to FHIR conversion pipelines.
//!
//! A trigger delivery carries references to uploaded documents. Fhirflow
//! splits it into one work item per document and runs every item
//! independently through a fixed chain of stages:
//!
//! - **Validate**: CCD or supported HL7 message, compressed uploads rejected
//! - **Deduplicate**: content hash claimed in the dedup store
//! - **Convert**, **BuildDataset**, **Persist**: pluggable stage handlers
//!
//! Rate-limited persists wait and retry under a table-driven policy. Items
//! that fail terminally get one exception record and one notification, and
//! the batch is finalized exactly once per delivery id.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fhirflow::prelude::*;
//! use std::sync::Arc;
//!
//! let documents = Arc::new(InMemoryDocumentStore::new());
//! let dedup = Arc::new(InMemoryDedupStore::new());
//!
//! let orchestrator = PipelineOrchestrator::builder()
//!     .with_config(PipelineConfig::load("fhirflow.toml")?)
//!     .with_handler(StageName::Validate, Arc::new(ValidateStage::new(documents.clone())))
//!     .with_handler(
//!         StageName::Deduplicate,
//!         Arc::new(DeduplicateStage::new(documents, dedup.clone())),
//!     )
//!     .with_handler(StageName::Convert, converter)
//!     .with_handler(StageName::BuildDataset, dataset_builder)
//!     .with_handler(StageName::Persist, persister)
//!     .with_dedup_store(dedup)
//!     .with_finalizer(finalizer)
//!     .build()?;
//!
//! let outcome = orchestrator.process(trigger).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod stores;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{LoggingConfig, PipelineConfig, RetryRuleConfig};
    pub use crate::core::{
        Batch, BatchOutcome, BatchStatus, ClassifiedError, ErrorKind, InboundRecord, ItemPhase,
        ItemStatus, StageName, StageResult, TriggerEvent, WorkItem,
    };
    pub use crate::errors::{ConfigError, FhirflowError, StoreError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        BatchMapExecutor, BranchEvaluator, NextStep, PipelineOrchestrator, RetryDecision,
        RetryPolicy, RetryRule, StageChain,
    };
    pub use crate::stages::{DeduplicateStage, StageHandler, StageInvoker, ValidateStage};
    pub use crate::stores::{
        AuditLog, BatchFinalizer, CheckpointStore, DedupStore, DocumentStore, ExceptionLog,
        InMemoryAuditLog, InMemoryCheckpointStore, InMemoryDedupStore, InMemoryDocumentStore,
        InMemoryExceptionLog, NotificationSink,
    };
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
