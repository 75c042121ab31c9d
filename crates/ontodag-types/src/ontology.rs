//! Ontology artifacts.
//!
//! Ontology-scoped data ([`OntologyDocument`], [`GlossaryTerm`]) is removed
//! together with its ontology. Project-scoped data ([`KnowledgeFact`])
//! outlives any single ontology.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DagId, DatasourceId, OntologyId, ProjectId};
use crate::relationship::Relationship;

/// Entity description for one table of the datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

/// The semantic model emitted when a pipeline finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyDocument {
    pub entities: Vec<EntityDescriptor>,
    pub relationships: Vec<Relationship>,
}

/// Persisted ontology row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ontology {
    pub id: OntologyId,
    pub project_id: ProjectId,
    pub datasource_id: DatasourceId,
    pub dag_id: DagId,
    pub document: OntologyDocument,
    pub created_at: DateTime<Utc>,
}

/// Business term tied to one ontology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub definition: String,
}

/// Accumulated project knowledge, independent of any ontology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeFact {
    pub id: i64,
    pub project_id: ProjectId,
    pub fact: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}
