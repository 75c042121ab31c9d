pub mod cancel;
pub mod delete;
pub mod extract;
pub mod reconcile;
pub mod relationships;
pub mod status;

use std::path::Path;

use anyhow::{Context, Result};
use ontodag_engine::config::{parser, validator};
use ontodag_engine::Engine;
use ontodag_types::{Dag, DagNode};

/// Parse and validate the config file, then start an engine over it.
pub async fn load_engine(config_path: &Path) -> Result<Engine> {
    let config = parser::parse_config(config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    validator::validate_config(&config)?;

    tracing::debug!(
        backend = ?config.state.backend,
        stages = config.pipeline.stages.len(),
        "Config validated"
    );

    ontodag_engine::build_engine(&config).await
}

pub fn format_node(node: &DagNode) -> String {
    let mut line = format!("  {}. {:<26} {}", node.order, node.name, node.status);
    if let Some(progress) = &node.progress {
        line.push_str(&format!(
            "  [{}/{}] {}",
            progress.current, progress.total, progress.message
        ));
    }
    if let Some(error) = &node.error_message {
        line.push_str(&format!("  error: {error}"));
    }
    line
}

pub fn print_dag(dag: &Dag) {
    println!("DAG {} ({})", dag.id, dag.status);
    println!("  Project:    {}", dag.project_id);
    println!("  Datasource: {}", dag.datasource_id);
    if let Some(started) = dag.started_at {
        println!("  Started:    {}", started.to_rfc3339());
    }
    if let Some(completed) = dag.completed_at {
        println!("  Finished:   {}", completed.to_rfc3339());
    }
    if let Some(ontology) = &dag.ontology_id {
        println!("  Ontology:   {ontology}");
    }
    for node in &dag.nodes {
        println!("{}", format_node(node));
    }
}
