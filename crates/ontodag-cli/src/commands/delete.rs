use std::path::Path;

use anyhow::Result;
use ontodag_types::ProjectId;

use super::load_engine;

/// Execute the `delete` command.
pub async fn execute(config_path: &Path, project: String) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let project = ProjectId::new(project);
    let summary = engine.delete(&project).await?;

    println!("Deleted ontology data of project {project}.");
    println!("  DAGs:                   {}", summary.dags);
    println!("  Ontologies:             {}", summary.ontologies);
    println!("  Glossary terms:         {}", summary.glossary_terms);
    println!("  Inferred relationships: {}", summary.relationships);
    Ok(())
}
