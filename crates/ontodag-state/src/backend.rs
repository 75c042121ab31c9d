//! Store trait definitions.
//!
//! [`DagStore`] holds pipeline executions; [`OntologyStore`] holds what
//! those executions produce. Model types live in [`ontodag_types`].
//!
//! Every mutating DAG operation is a compare-and-set against the DAG's
//! current status and returns `false` when the precondition no longer
//! holds (typically because the DAG was cancelled or reconciled
//! concurrently). Callers treat `false` as "stop", not as an error.

use chrono::{DateTime, Utc};
use ontodag_types::ontology::{GlossaryTerm, KnowledgeFact, Ontology};
use ontodag_types::{
    Dag, DagId, DagStatus, DatasourceId, InferenceMethod, NodeProgress, OntologyId, ProjectId,
    Relationship,
};

use crate::error;

/// Result of an atomic get-or-create of the active DAG for a datasource.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// No non-terminal DAG existed; this one was inserted as `pending`.
    Created(Dag),
    /// A non-terminal DAG already existed and is returned unchanged.
    Existing(Dag),
}

impl CreateOutcome {
    #[must_use]
    pub fn dag(&self) -> &Dag {
        match self {
            Self::Created(dag) | Self::Existing(dag) => dag,
        }
    }

    #[must_use]
    pub fn into_dag(self) -> Dag {
        match self {
            Self::Created(dag) | Self::Existing(dag) => dag,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The DAG was already terminal; nothing was written.
    NotRunning(DagStatus),
}

/// Rows removed by a project ontology deletion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub dags: u64,
    pub ontologies: u64,
    pub glossary_terms: u64,
    pub relationships: u64,
}

/// Result of a project ontology deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(DeleteSummary),
    /// A DAG of the project is still pending or running; nothing was removed.
    Blocked { active_dag: DagId },
}

/// Storage contract for DAG executions.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
pub trait DagStore: Send + Sync {
    /// Return the non-terminal DAG of `datasource`, or insert a new
    /// `pending` one with `node_names` as its nodes. Check and insert are
    /// one atomic step: two concurrent calls never yield two active DAGs.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn create_or_get_active(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        node_names: &[String],
    ) -> error::Result<CreateOutcome>;

    /// Transition `pending → running` and set `started_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn mark_running(&self, dag: &DagId) -> error::Result<bool>;

    /// Read one DAG with all of its nodes as a single consistent snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_dag(&self, dag: &DagId) -> error::Result<Option<Dag>>;

    /// Most recently created DAG for `datasource`, active or terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn latest_dag(&self, datasource: &DatasourceId) -> error::Result<Option<Dag>>;

    /// Bump the heartbeat of a running DAG. Returns `false` once the DAG is
    /// no longer running, which the engine treats as a remote cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn heartbeat(&self, dag: &DagId) -> error::Result<bool>;

    /// Status only, for cheap cancellation polling.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn dag_status(&self, dag: &DagId) -> error::Result<Option<DagStatus>>;

    /// Mark node `order` running and make it the DAG's `current_node`.
    ///
    /// Applies only while the DAG is running, the node is pending and its
    /// predecessor (if any) is completed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_node(&self, dag: &DagId, order: u32) -> error::Result<bool>;

    /// Overwrite the progress of a running node.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn record_progress(&self, dag: &DagId, order: u32, progress: &NodeProgress)
        -> error::Result<bool>;

    /// Mark a running node completed and clear its progress.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_node(&self, dag: &DagId, order: u32) -> error::Result<bool>;

    /// Mark a running node failed with `message` and the DAG failed, in
    /// one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn fail_node(&self, dag: &DagId, order: u32, message: &str) -> error::Result<bool>;

    /// Move a non-terminal DAG to the terminal `status`, setting
    /// `completed_at` and, when given, `ontology_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn finish_dag(
        &self,
        dag: &DagId,
        status: DagStatus,
        ontology: Option<&OntologyId>,
    ) -> error::Result<bool>;

    /// Durably cancel a non-terminal DAG.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn cancel_dag(&self, dag: &DagId) -> error::Result<CancelOutcome>;

    /// Fail every non-terminal DAG whose heartbeat is older than `cutoff`,
    /// failing its running node (if any) with `message`. Returns the ids of
    /// the DAGs that were reconciled.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn fail_stale_dags(&self, cutoff: DateTime<Utc>, message: &str) -> error::Result<Vec<DagId>>;
}

/// Storage contract for relationships, ontologies and knowledge.
pub trait OntologyStore: Send + Sync {
    /// Record a user-defined relationship. Replaces an inferred row for
    /// the same column pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn add_manual_relationship(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        relationship: &Relationship,
    ) -> error::Result<()>;

    /// All relationships of a datasource, ordered by column pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn relationships(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
    ) -> error::Result<Vec<Relationship>>;

    /// Atomically replace every row produced by `method` with
    /// `relationships`. A pair already recorded by another inferred method
    /// is taken over; a manual pair is kept and the record skipped. Returns
    /// the count written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure,
    /// or [`StateError::Corrupt`](crate::error::StateError::Corrupt) if
    /// `method` is [`InferenceMethod::Manual`].
    fn replace_inferred_relationships(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        method: InferenceMethod,
        relationships: &[Relationship],
    ) -> error::Result<u64>;

    /// Persist an ontology and its glossary terms in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn save_ontology(&self, ontology: &Ontology, terms: &[GlossaryTerm]) -> error::Result<()>;

    /// Most recent ontology for a datasource.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn latest_ontology(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
    ) -> error::Result<Option<Ontology>>;

    /// Glossary terms of every ontology of the project.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn glossary_terms(&self, project: &ProjectId) -> error::Result<Vec<GlossaryTerm>>;

    /// Record a project-scoped fact. Returns `None` if the same fact is
    /// already known.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn add_knowledge_fact(
        &self,
        project: &ProjectId,
        fact: &str,
        source: &str,
    ) -> error::Result<Option<i64>>;

    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn knowledge_facts(&self, project: &ProjectId) -> error::Result<Vec<KnowledgeFact>>;

    /// Remove the project's DAGs, ontologies, glossary terms and inferred
    /// relationships, provided no DAG of the project is active. Knowledge
    /// facts and manual relationships are kept.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn delete_project_ontology(&self, project: &ProjectId) -> error::Result<DeleteOutcome>;
}

/// Everything the engine needs from durable storage.
pub trait StateStore: DagStore + OntologyStore {}

impl<T: DagStore + OntologyStore + ?Sized> StateStore for T {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the traits are object-safe (can be used as `dyn StateStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateStore) {}
    }

    #[test]
    fn create_outcome_exposes_dag() {
        let dag = Dag::new_pending(
            ProjectId::new("p"),
            DatasourceId::new("ds"),
            &["FKDiscovery"],
            Utc::now(),
        );
        let created = CreateOutcome::Created(dag.clone());
        assert_eq!(created.dag().id, dag.id);
        assert_eq!(CreateOutcome::Existing(dag.clone()).into_dag(), dag);
    }
}
