//! Semantic validation for parsed engine configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{OntodagConfig, StateBackendKind};

/// Validate a parsed engine configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the config.
pub fn validate_config(config: &OntodagConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported config version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.state.backend == StateBackendKind::Postgres
        && config
            .state
            .connection
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
    {
        errors.push("state.connection must not be empty".to_string());
    }

    let stages = &config.pipeline.stages;
    if stages.is_empty() {
        errors.push("pipeline.stages must list at least one stage".to_string());
    }
    let mut seen = HashSet::new();
    for stage in stages {
        if !seen.insert(stage) {
            errors.push(format!(
                "pipeline.stages lists '{}' more than once",
                stage.node_name()
            ));
        }
    }

    let engine = &config.engine;
    if engine.cancel_poll_interval_ms == 0 {
        errors.push("engine.cancel_poll_interval_ms must be > 0".to_string());
    }
    if engine.reconcile_interval_secs == 0 {
        errors.push("engine.reconcile_interval_secs must be > 0".to_string());
    }
    // Running DAGs heartbeat once per poll; a shorter window would fail them.
    if u128::from(engine.stale_after_secs) * 1000 <= 2 * u128::from(engine.cancel_poll_interval_ms)
    {
        errors.push(
            "engine.stale_after_secs must exceed twice the cancel poll interval".to_string(),
        );
    }

    if let Some(schema) = &config.schema {
        if schema.snapshot.as_os_str().is_empty() {
            errors.push("schema.snapshot must not be empty".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Config validation failed:\n  - {}", errors.join("\n  - "));
    }
}
