use std::path::Path;

use anyhow::Result;
use ontodag_types::view::StatusResponse;
use ontodag_types::DatasourceId;

use super::{load_engine, print_dag};

/// Execute the `status` command.
pub async fn execute(config_path: &Path, datasource: String, json: bool, check: bool) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let datasource = DatasourceId::new(datasource);
    let dag = engine.get_status(&datasource).await?;

    if json {
        let response = StatusResponse::from(dag.as_ref());
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else if let Some(dag) = &dag {
        print_dag(dag);
    } else {
        println!("No extraction has run for datasource {datasource}.");
    }

    if check {
        if let Some(dag) = &dag {
            let violations = dag.invariant_violations();
            if !violations.is_empty() {
                anyhow::bail!(
                    "DAG {} violates its invariants:\n  - {}",
                    dag.id,
                    violations.join("\n  - ")
                );
            }
            eprintln!("DAG {} is consistent.", dag.id);
        }
    }
    Ok(())
}
