//! Per-table enrichment stages.
//!
//! The semantic work (column and table descriptions, relationship
//! labelling) is delegated to an [`Enricher`]. The stage owns iteration,
//! progress and cancellation, so any enricher gets the same cooperative
//! behaviour.

use ontodag_state::OntologyStore;
use ontodag_types::{ColumnSchema, Relationship, TableSchema};
use tokio_util::sync::CancellationToken;

use super::StageDeps;
use crate::errors::StageError;
use crate::executor::{NodeExecutor, PipelineContext, ProgressReporter, StageOutput};

/// Produces semantic annotations for schema elements.
#[async_trait::async_trait]
pub trait Enricher: Send + Sync {
    /// # Errors
    ///
    /// Returns [`StageError::Failed`] if the table's columns cannot be enriched.
    async fn enrich_columns(&self, table: &TableSchema, columns: &[ColumnSchema])
        -> Result<(), StageError>;

    /// # Errors
    ///
    /// Returns [`StageError::Failed`] if the table cannot be enriched.
    async fn enrich_table(&self, table: &TableSchema) -> Result<(), StageError>;

    /// # Errors
    ///
    /// Returns [`StageError::Failed`] if the relationship cannot be enriched.
    async fn enrich_relationship(&self, relationship: &Relationship) -> Result<(), StageError>;
}

/// Enricher that accepts everything and annotates nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEnricher;

#[async_trait::async_trait]
impl Enricher for NoopEnricher {
    async fn enrich_columns(&self, _: &TableSchema, _: &[ColumnSchema]) -> Result<(), StageError> {
        Ok(())
    }

    async fn enrich_table(&self, _: &TableSchema) -> Result<(), StageError> {
        Ok(())
    }

    async fn enrich_relationship(&self, _: &Relationship) -> Result<(), StageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentKind {
    Columns,
    Tables,
    Relationships,
}

pub struct EnrichmentStage {
    kind: EnrichmentKind,
    deps: StageDeps,
}

impl EnrichmentStage {
    pub fn new(kind: EnrichmentKind, deps: StageDeps) -> Self {
        Self { kind, deps }
    }

    async fn enrich_relationships(
        &self,
        cancel: &CancellationToken,
        ctx: &PipelineContext,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        let project = ctx.project_id.clone();
        let datasource = ctx.datasource_id.clone();
        let relationships = self
            .deps
            .store_call(move |s| s.relationships(&project, &datasource))
            .await?;

        let total = relationships.len() as u64;
        for (done, relationship) in (0u64..).zip(&relationships) {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            progress.report(done, total, format!("enriching {}", relationship.key()));
            self.deps.enricher.enrich_relationship(relationship).await?;
        }
        progress.report(total, total, format!("enriched {total} relationships"));
        Ok(StageOutput::Done)
    }
}

#[async_trait::async_trait]
impl NodeExecutor for EnrichmentStage {
    fn name(&self) -> &str {
        match self.kind {
            EnrichmentKind::Columns => "ColumnFeatureExtraction",
            EnrichmentKind::Tables => "TableFeatureExtraction",
            EnrichmentKind::Relationships => "RelationshipEnrichment",
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PipelineContext,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        if self.kind == EnrichmentKind::Relationships {
            return self.enrich_relationships(cancel, ctx, progress).await;
        }

        let (schema, fetched) = self.deps.schema(ctx).await?;
        let total = schema.tables.len() as u64;
        for (done, table) in (0u64..).zip(&schema.tables) {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            progress.report(done, total, format!("enriching {}", table.name));
            match self.kind {
                EnrichmentKind::Columns => {
                    self.deps
                        .enricher
                        .enrich_columns(table, &table.columns)
                        .await?;
                }
                _ => self.deps.enricher.enrich_table(table).await?,
            }
        }
        progress.report(total, total, format!("enriched {total} tables"));

        Ok(if fetched {
            StageOutput::Schema(schema)
        } else {
            StageOutput::Done
        })
    }
}
