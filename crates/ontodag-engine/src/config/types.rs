//! Typed engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::stages::StageKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntodagConfig {
    pub version: String,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// File-backed schema source. Without it, stages that need a schema fail.
    #[serde(default)]
    pub schema: Option<SchemaConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// SQLite path or Postgres connection string.
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,
    #[serde(default = "default_status_write_retries")]
    pub status_write_retries: u32,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_cancel_poll_interval_ms() -> u64 {
    1000
}
fn default_status_write_retries() -> u32 {
    3
}
fn default_reconcile_interval_secs() -> u64 {
    60
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
            status_write_retries: default_status_write_retries(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "StageKind::default_pipeline")]
    pub stages: Vec<StageKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: StageKind::default_pipeline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// A snapshot file, or a directory of `<datasource>.yaml|.yml|.json`.
    pub snapshot: PathBuf,
}
