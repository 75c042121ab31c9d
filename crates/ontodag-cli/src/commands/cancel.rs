use std::path::Path;

use anyhow::Result;
use ontodag_types::DagId;

use super::load_engine;

/// Execute the `cancel` command. An engine running the DAG in another
/// process stops at its next heartbeat.
pub async fn execute(config_path: &Path, dag: String) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let dag_id = DagId::new(dag);
    engine.cancel(&dag_id).await?;
    println!("Extraction {dag_id} cancelled.");
    Ok(())
}
