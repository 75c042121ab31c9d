//! The contract between the engine and the stages it runs.

use std::sync::Arc;

use ontodag_types::{
    DagId, DatasourceId, InferenceMethod, NodeProgress, OntologyId, ProjectId, Relationship,
    SchemaSnapshot,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::StageError;

/// One stage of an extraction pipeline.
///
/// Implementations must poll `cancel` at least once per natural unit of
/// work (a table, a column batch) and return [`StageError::Cancelled`]
/// promptly once it fires. Progress may be reported any number of times;
/// the last report before returning wins.
#[async_trait::async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Node name persisted on the DAG, e.g. `FKDiscovery`.
    fn name(&self) -> &str;

    /// Run the stage.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Cancelled`] when `cancel` fired, or
    /// [`StageError::Failed`] with a user-displayable message.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PipelineContext,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError>;
}

/// What a successful stage hands to the stages after it.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Done,
    /// The stage fetched the datasource schema; later stages reuse it.
    Schema(Arc<SchemaSnapshot>),
    Relationships {
        schema: Arc<SchemaSnapshot>,
        method: InferenceMethod,
        relationships: Vec<Relationship>,
    },
    Ontology(OntologyId),
}

/// State threaded through one DAG execution.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub project_id: ProjectId,
    pub datasource_id: DatasourceId,
    pub dag_id: DagId,
    /// Free-text project description supplied at Start.
    pub overview: Option<String>,
    /// Snapshot captured by the first stage that needed it.
    pub schema: Option<Arc<SchemaSnapshot>>,
    /// Relationships inferred by earlier stages of this run.
    pub relationships: Vec<Relationship>,
    pub ontology_id: Option<OntologyId>,
}

impl PipelineContext {
    #[must_use]
    pub fn new(
        project_id: ProjectId,
        datasource_id: DatasourceId,
        dag_id: DagId,
        overview: Option<String>,
    ) -> Self {
        Self {
            project_id,
            datasource_id,
            dag_id,
            overview,
            schema: None,
            relationships: Vec::new(),
            ontology_id: None,
        }
    }

    /// Fold a stage's output into the context.
    pub fn absorb(&mut self, output: StageOutput) {
        match output {
            StageOutput::Done => {}
            StageOutput::Schema(schema) => {
                self.schema.get_or_insert(schema);
            }
            StageOutput::Relationships {
                schema,
                method,
                relationships,
            } => {
                self.schema.get_or_insert(schema);
                self.relationships.retain(|r| r.inference_method != method);
                self.relationships.extend(relationships);
            }
            StageOutput::Ontology(id) => self.ontology_id = Some(id),
        }
    }

    /// Relationships of this run produced by `method`.
    pub fn relationships_by(&self, method: InferenceMethod) -> impl Iterator<Item = &Relationship> {
        self.relationships
            .iter()
            .filter(move |r| r.inference_method == method)
    }
}

/// Progress sink handed to a running stage.
///
/// Backed by a `watch` channel: the engine persists updates in order but
/// may coalesce bursts, always writing the most recent one.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<Option<NodeProgress>>,
}

impl ProgressReporter {
    /// Reporter paired with the receiver the engine's progress writer drains.
    pub(crate) fn channel() -> (Self, watch::Receiver<Option<NodeProgress>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Reporter whose updates are only observable through [`Self::last`].
    #[must_use]
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn report(&self, current: u64, total: u64, message: impl Into<String>) {
        self.tx
            .send_replace(Some(NodeProgress::new(current, total, message)));
    }

    #[must_use]
    pub fn last(&self) -> Option<NodeProgress> {
        self.tx.borrow().clone()
    }
}
