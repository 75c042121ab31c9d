//! Built-in pipeline stages and the pipeline builder.

mod enrichment;
mod finalization;
mod knowledge;
mod relationships;

use std::sync::Arc;

use ontodag_state::StateStore;
use ontodag_types::SchemaSnapshot;
use serde::{Deserialize, Serialize};

use crate::discovery::SchemaDiscovery;
use crate::errors::StageError;
use crate::executor::{NodeExecutor, PipelineContext};

pub use enrichment::{EnrichmentKind, EnrichmentStage, Enricher, NoopEnricher};
pub use finalization::OntologyFinalizationStage;
pub use knowledge::KnowledgeSeedingStage;
pub use relationships::{FkDiscoveryStage, PkMatchDiscoveryStage};

/// Stage kinds selectable in configuration, in their usual order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    KnowledgeSeeding,
    ColumnFeatureExtraction,
    FkDiscovery,
    TableFeatureExtraction,
    PkMatchDiscovery,
    RelationshipEnrichment,
    OntologyFinalization,
}

impl StageKind {
    /// Node name persisted on the DAG.
    #[must_use]
    pub fn node_name(self) -> &'static str {
        match self {
            Self::KnowledgeSeeding => "KnowledgeSeeding",
            Self::ColumnFeatureExtraction => "ColumnFeatureExtraction",
            Self::FkDiscovery => "FKDiscovery",
            Self::TableFeatureExtraction => "TableFeatureExtraction",
            Self::PkMatchDiscovery => "PKMatchDiscovery",
            Self::RelationshipEnrichment => "RelationshipEnrichment",
            Self::OntologyFinalization => "OntologyFinalization",
        }
    }

    /// The default six-stage extraction pipeline.
    #[must_use]
    pub fn default_pipeline() -> Vec<Self> {
        vec![
            Self::KnowledgeSeeding,
            Self::ColumnFeatureExtraction,
            Self::FkDiscovery,
            Self::TableFeatureExtraction,
            Self::PkMatchDiscovery,
            Self::OntologyFinalization,
        ]
    }
}

/// Collaborators shared by the built-in stages.
#[derive(Clone)]
pub struct StageDeps {
    pub store: Arc<dyn StateStore>,
    pub schema_source: Arc<dyn SchemaDiscovery>,
    pub enricher: Arc<dyn Enricher>,
}

impl StageDeps {
    pub fn new(store: Arc<dyn StateStore>, schema_source: Arc<dyn SchemaDiscovery>) -> Self {
        Self {
            store,
            schema_source,
            enricher: Arc::new(NoopEnricher),
        }
    }

    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Schema captured earlier in this run, or a fresh snapshot.
    ///
    /// Returns the snapshot and whether it was fetched by this call.
    pub(crate) async fn schema(
        &self,
        ctx: &PipelineContext,
    ) -> Result<(Arc<SchemaSnapshot>, bool), StageError> {
        if let Some(schema) = &ctx.schema {
            return Ok((Arc::clone(schema), false));
        }
        let snapshot = self.schema_source.snapshot(&ctx.datasource_id).await?;
        Ok((Arc::new(snapshot), true))
    }

    /// Run a synchronous store call on the blocking pool.
    pub(crate) async fn store_call<T, F>(&self, f: F) -> Result<T, StageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StateStore) -> ontodag_state::error::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| StageError::failed(format!("state store task failed: {e}")))?
            .map_err(StageError::from)
    }
}

/// Instantiate the stages for `kinds`, in order.
#[must_use]
pub fn build_pipeline(kinds: &[StageKind], deps: &StageDeps) -> Vec<Arc<dyn NodeExecutor>> {
    kinds
        .iter()
        .map(|kind| -> Arc<dyn NodeExecutor> {
            match kind {
                StageKind::KnowledgeSeeding => Arc::new(KnowledgeSeedingStage::new(deps.clone())),
                StageKind::ColumnFeatureExtraction => Arc::new(EnrichmentStage::new(
                    EnrichmentKind::Columns,
                    deps.clone(),
                )),
                StageKind::TableFeatureExtraction => {
                    Arc::new(EnrichmentStage::new(EnrichmentKind::Tables, deps.clone()))
                }
                StageKind::RelationshipEnrichment => Arc::new(EnrichmentStage::new(
                    EnrichmentKind::Relationships,
                    deps.clone(),
                )),
                StageKind::FkDiscovery => Arc::new(FkDiscoveryStage::new(deps.clone())),
                StageKind::PkMatchDiscovery => Arc::new(PkMatchDiscoveryStage::new(deps.clone())),
                StageKind::OntologyFinalization => {
                    Arc::new(OntologyFinalizationStage::new(deps.clone()))
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::UnconfiguredSchema;
    use ontodag_state::SqliteStateStore;

    #[test]
    fn default_pipeline_node_names() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
        let deps = StageDeps::new(store, Arc::new(UnconfiguredSchema));
        let stages = build_pipeline(&StageKind::default_pipeline(), &deps);
        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "KnowledgeSeeding",
                "ColumnFeatureExtraction",
                "FKDiscovery",
                "TableFeatureExtraction",
                "PKMatchDiscovery",
                "OntologyFinalization",
            ]
        );
    }

    #[test]
    fn stage_kinds_use_snake_case_in_config() {
        let kinds: Vec<StageKind> =
            serde_yaml::from_str("[fk_discovery, pk_match_discovery, relationship_enrichment]")
                .unwrap();
        assert_eq!(
            kinds,
            [
                StageKind::FkDiscovery,
                StageKind::PkMatchDiscovery,
                StageKind::RelationshipEnrichment
            ]
        );
    }
}
