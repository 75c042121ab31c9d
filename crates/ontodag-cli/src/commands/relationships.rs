use std::path::Path;

use anyhow::Result;
use ontodag_types::{DatasourceId, ProjectId};

use super::load_engine;

/// Execute the `relationships` command.
pub async fn execute(
    config_path: &Path,
    project: String,
    datasource: String,
    json: bool,
) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let relationships = engine
        .relationships(&ProjectId::new(project), &DatasourceId::new(datasource))
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&relationships)?);
        return Ok(());
    }
    if relationships.is_empty() {
        println!("No relationships recorded.");
        return Ok(());
    }
    for rel in &relationships {
        println!(
            "{:<48} {:<4} {:.2}  {}",
            rel.key().to_string(),
            rel.cardinality,
            rel.confidence,
            rel.inference_method
        );
    }
    Ok(())
}
