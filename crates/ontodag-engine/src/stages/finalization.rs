use chrono::Utc;
use ontodag_state::OntologyStore;
use ontodag_types::ontology::{EntityDescriptor, GlossaryTerm, Ontology, OntologyDocument};
use ontodag_types::{OntologyId, SchemaSnapshot, TableSchema};
use tokio_util::sync::CancellationToken;

use super::StageDeps;
use crate::discovery::naming::singular;
use crate::errors::StageError;
use crate::executor::{NodeExecutor, PipelineContext, ProgressReporter, StageOutput};

/// Assembles the ontology from the schema and every recorded relationship.
pub struct OntologyFinalizationStage {
    deps: StageDeps,
}

impl OntologyFinalizationStage {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

fn entity(table: &TableSchema) -> EntityDescriptor {
    EntityDescriptor {
        table: table.name.clone(),
        columns: table.columns.iter().map(|c| c.name.clone()).collect(),
        primary_key: table.primary_key.clone(),
    }
}

/// `order_items` → `Order Item`.
fn term_for(table: &str) -> String {
    singular(table)
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn glossary(schema: &SchemaSnapshot) -> Vec<GlossaryTerm> {
    schema
        .tables
        .iter()
        .map(|table| GlossaryTerm {
            term: term_for(&table.name),
            definition: format!(
                "A record of the `{}` table ({} columns).",
                table.name,
                table.columns.len()
            ),
        })
        .collect()
}

#[async_trait::async_trait]
impl NodeExecutor for OntologyFinalizationStage {
    fn name(&self) -> &str {
        "OntologyFinalization"
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &PipelineContext,
        progress: &ProgressReporter,
    ) -> Result<StageOutput, StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        let (schema, _) = self.deps.schema(ctx).await?;
        progress.report(0, 2, "collecting relationships");

        let project = ctx.project_id.clone();
        let datasource = ctx.datasource_id.clone();
        let relationships = self
            .deps
            .store_call(move |s| s.relationships(&project, &datasource))
            .await?;

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        progress.report(1, 2, "saving ontology");

        let ontology = Ontology {
            id: OntologyId::generate(),
            project_id: ctx.project_id.clone(),
            datasource_id: ctx.datasource_id.clone(),
            dag_id: ctx.dag_id.clone(),
            document: OntologyDocument {
                entities: schema.tables.iter().map(entity).collect(),
                relationships,
            },
            created_at: Utc::now(),
        };
        let terms = glossary(&schema);
        let id = ontology.id.clone();
        let entities = ontology.document.entities.len();
        let relationship_count = ontology.document.relationships.len();
        self.deps
            .store_call(move |s| s.save_ontology(&ontology, &terms))
            .await?;

        tracing::info!(
            dag_id = ctx.dag_id.as_str(),
            ontology_id = id.as_str(),
            entities,
            relationships = relationship_count,
            "Ontology saved"
        );
        progress.report(2, 2, format!("saved ontology {id}"));
        Ok(StageOutput::Ontology(id))
    }
}
