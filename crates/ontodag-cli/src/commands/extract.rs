use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use ontodag_types::{DagStatus, DatasourceId, NodeStatus, ProjectId};

use super::{format_node, load_engine, print_dag};

const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Execute the `extract` command: start (or join) an extraction and print
/// node transitions until it finishes. Ctrl-C shuts the engine down, which
/// records the interrupted node as failed.
pub async fn execute(
    config_path: &Path,
    project: String,
    datasource: String,
    overview: Option<String>,
) -> Result<()> {
    let engine = load_engine(config_path).await?;
    let dag = engine
        .start(ProjectId::new(project), DatasourceId::new(datasource), overview)
        .await?;
    println!("Extraction {} is {}.", dag.id, dag.status);

    let mut shown: HashMap<u32, (NodeStatus, Option<u64>)> = HashMap::new();
    let final_dag = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                eprintln!("Interrupted, shutting down...");
                engine.shutdown().await;
                break engine.get_dag(&dag.id).await?;
            }
            () = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }

        let Some(current) = engine.get_dag(&dag.id).await? else {
            anyhow::bail!("Extraction {} disappeared while running", dag.id);
        };
        for node in &current.nodes {
            let seen = (node.status, node.progress.as_ref().map(|p| p.current));
            if node.status != NodeStatus::Pending && shown.get(&node.order) != Some(&seen) {
                println!("{}", format_node(node));
                shown.insert(node.order, seen);
            }
        }
        if current.is_terminal() {
            break Some(current);
        }
    };

    let Some(final_dag) = final_dag else {
        anyhow::bail!("Extraction {} disappeared while running", dag.id);
    };
    println!();
    print_dag(&final_dag);
    engine.shutdown().await;

    match final_dag.status {
        DagStatus::Completed => {
            println!("Extraction completed successfully.");
            Ok(())
        }
        DagStatus::Cancelled => {
            println!("Extraction was cancelled.");
            Ok(())
        }
        status => {
            let failed = final_dag
                .nodes
                .iter()
                .find(|n| n.status == NodeStatus::Failed);
            match failed {
                Some(node) => anyhow::bail!(
                    "Extraction {status} at node {}: {}",
                    node.name,
                    node.error_message.as_deref().unwrap_or("no error recorded")
                ),
                None => anyhow::bail!("Extraction ended as {status}"),
            }
        }
    }
}
