//! Shared ontodag domain model.
//!
//! Pure data types used by the state backends, the engine and the CLI.
//! Kept dependency-light so every crate in the workspace can share them
//! without circular dependencies.

#![warn(clippy::pedantic)]

pub mod dag;
pub mod ids;
pub mod ontology;
pub mod relationship;
pub mod schema;
pub mod view;

pub use dag::{Dag, DagNode, DagStatus, NodeProgress, NodeStatus};
pub use ids::{DagId, DatasourceId, NodeId, OntologyId, ProjectId};
pub use relationship::{Cardinality, InferenceMethod, Relationship, RelationshipKey, RelationshipSet};
pub use schema::{ColumnSchema, ForeignKey, SchemaSnapshot, TableSchema};
