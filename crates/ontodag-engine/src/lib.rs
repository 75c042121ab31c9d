//! Orchestration engine for ontology extraction pipelines.
//!
//! An [`Engine`] owns the lifecycle of persisted DAG executions: it creates
//! or reuses the active DAG of a datasource, walks its nodes in order on a
//! background task, persists progress, and honours cancellation, deletion
//! and shutdown requests. Relationship inference lives in [`discovery`];
//! the concrete pipeline stages live in [`stages`].

#![warn(clippy::pedantic)]

pub mod config;
pub mod discovery;
pub mod errors;
pub mod executor;
pub mod orchestrator;
pub mod resolve;
pub(crate) mod runner;
pub mod stages;

// Re-export public API for convenience
pub use errors::{EngineError, StageError};
pub use executor::{NodeExecutor, PipelineContext, ProgressReporter, StageOutput};
pub use orchestrator::{Engine, EngineSettings};
pub use resolve::build_engine;
