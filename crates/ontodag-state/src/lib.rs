//! Durable state for ontodag pipeline runs.
//!
//! Provides the [`DagStore`] and [`OntologyStore`] traits (combined as
//! [`StateStore`]) and two implementations: [`SqliteStateStore`] for
//! single-node deployments and tests, and [`PostgresStateStore`] for
//! shared deployments where several engine replicas poll the same DAGs.

#![warn(clippy::pedantic)]

pub mod backend;
mod codec;
pub mod error;
pub mod postgres;
pub mod schema;
pub mod sqlite;

pub use backend::{
    CancelOutcome, CreateOutcome, DagStore, DeleteOutcome, DeleteSummary, OntologyStore,
    StateStore,
};
pub use error::StateError;
pub use postgres::PostgresStateStore;
pub use sqlite::SqliteStateStore;

/// Common imports for store consumers.
pub mod prelude {
    pub use crate::backend::{
        CancelOutcome, CreateOutcome, DagStore, DeleteOutcome, OntologyStore, StateStore,
    };
    pub use crate::sqlite::SqliteStateStore;
    pub use ontodag_types::{
        Cardinality, Dag, DagId, DagStatus, DatasourceId, InferenceMethod, NodeProgress,
        NodeStatus, ProjectId, Relationship,
    };
}
