use std::path::Path;

use anyhow::Result;

use super::load_engine;

/// Execute the `reconcile` command.
///
/// Building the engine already reconciles once; the explicit pass reports
/// what was failed.
pub async fn execute(config_path: &Path) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let failed = engine.reconcile().await?;
    if failed.is_empty() {
        println!("No abandoned extractions.");
    } else {
        println!("Failed {} abandoned extraction(s):", failed.len());
        for dag_id in failed {
            println!("  {dag_id}");
        }
    }
    Ok(())
}
