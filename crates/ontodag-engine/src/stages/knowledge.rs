use ontodag_state::OntologyStore;
use tokio_util::sync::CancellationToken;

use super::StageDeps;
use crate::errors::StageError;
use crate::executor::{NodeExecutor, PipelineContext, ProgressReporter, StageOutput};

/// Source label recorded on facts seeded from the Start request.
pub const OVERVIEW_SOURCE: &str = "project_overview";

/// Records the project overview as a project-scoped knowledge fact.
pub struct KnowledgeSeedingStage {
    deps: StageDeps,
}

impl KnowledgeSeedingStage {
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for KnowledgeSeedingStage {
    fn name(&self) -> &str {
        "KnowledgeSeeding"
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
        let overview = ctx
            .overview
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty());
        let Some(overview) = overview else {
            progress.report(0, 0, "no project overview supplied");
            return Ok(StageOutput::Done);
        };

        progress.report(0, 1, "seeding project overview");
        let project = ctx.project_id.clone();
        let fact = overview.to_string();
        let inserted = self
            .deps
            .store_call(move |s| s.add_knowledge_fact(&project, &fact, OVERVIEW_SOURCE))
            .await?;
        if inserted.is_none() {
            tracing::debug!(
                project = ctx.project_id.as_str(),
                "Project overview already known"
            );
        }
        progress.report(1, 1, "seeded project overview");
        Ok(StageOutput::Done)
    }
}
