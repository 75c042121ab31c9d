//! State store, schema source and engine construction from configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ontodag_state::{PostgresStateStore, SqliteStateStore, StateStore};

use crate::config::types::{OntodagConfig, SchemaConfig, StateBackendKind, StateConfig};
use crate::discovery::{FileSchemaDiscovery, SchemaDiscovery, UnconfiguredSchema};
use crate::orchestrator::{Engine, EngineSettings};
use crate::stages::{build_pipeline, StageDeps};

/// Default `SQLite` location when `state.connection` is not set.
#[must_use]
pub fn default_state_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ontodag").join("state.db")
}

/// Open the configured state store.
///
/// Blocking: the Postgres client runs its own runtime, so call this from
/// a blocking context when inside an async one.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or initialized.
pub fn create_state_store(config: &StateConfig) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackendKind::Sqlite => {
            let store = if let Some(path) = &config.connection {
                SqliteStateStore::open(Path::new(path)).context("Failed to open state DB")?
            } else {
                SqliteStateStore::open(&default_state_path())
                    .context("Failed to open default state DB")?
            };
            Ok(Arc::new(store) as Arc<dyn StateStore>)
        }
        StateBackendKind::Postgres => {
            let connstr = config
                .connection
                .as_deref()
                .unwrap_or("host=localhost dbname=ontodag_state");
            let store = PostgresStateStore::open(connstr)
                .map_err(|e| anyhow::anyhow!("failed to open Postgres state store: {e}"))?;
            Ok(Arc::new(store) as Arc<dyn StateStore>)
        }
    }
}

/// Schema source for the configured snapshot location.
#[must_use]
pub fn create_schema_source(config: Option<&SchemaConfig>) -> Arc<dyn SchemaDiscovery> {
    match config {
        Some(schema) => Arc::new(FileSchemaDiscovery::new(&schema.snapshot)),
        None => {
            tracing::warn!("No schema snapshot configured, schema-dependent stages will fail");
            Arc::new(UnconfiguredSchema)
        }
    }
}

/// Build a ready [`Engine`] from a parsed configuration.
///
/// # Errors
///
/// Returns an error if the state store cannot be opened or the engine
/// fails its startup reconciliation.
pub async fn build_engine(config: &OntodagConfig) -> Result<Engine> {
    let state = config.state.clone();
    let store = tokio::task::spawn_blocking(move || create_state_store(&state))
        .await
        .context("state store initialization task failed")??;
    tracing::info!(backend = ?config.state.backend, "Opened state store");

    let deps = StageDeps::new(
        Arc::clone(&store),
        create_schema_source(config.schema.as_ref()),
    );
    let stages = build_pipeline(&config.pipeline.stages, &deps);
    let engine = Engine::new(store, stages, EngineSettings::from(&config.engine))
        .await
        .context("Failed to start engine")?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_config_str;

    #[test]
    fn default_state_path_lives_under_home() {
        assert!(default_state_path().ends_with(".ontodag/state.db"));
    }

    #[tokio::test]
    async fn builds_engine_over_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "version: \"1.0\"\nstate:\n  connection: {}\npipeline:\n  stages: [fk_discovery, pk_match_discovery]\n",
            dir.path().join("state.db").display()
        );
        let config = parse_config_str(&yaml).unwrap();
        let engine = build_engine(&config).await.unwrap();
        assert_eq!(engine.node_names(), ["FKDiscovery", "PKMatchDiscovery"]);
        engine.shutdown().await;
    }
}
