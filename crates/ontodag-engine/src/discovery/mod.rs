//! Deterministic relationship inference over a schema snapshot.
//!
//! [`fk`] turns declared foreign keys into relationships; [`pk_match`]
//! infers the undeclared ones from column naming conventions and type
//! compatibility. Both are pure functions of the snapshot and the set of
//! already known relationships.
//!
//! Schema metadata comes from a [`SchemaDiscovery`] source. Reading live
//! catalogs is left to the host application; the built-in
//! [`FileSchemaDiscovery`] loads snapshots exported to YAML or JSON.

pub mod fk;
pub mod naming;
pub mod pk_match;

use std::path::{Path, PathBuf};

use ontodag_types::{DatasourceId, SchemaSnapshot};

pub use fk::discover_foreign_keys;
pub use pk_match::discover_pk_matches;

/// Errors raised while obtaining a schema snapshot.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to read schema snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid schema snapshot {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("no schema snapshot for datasource {0}")]
    NotFound(DatasourceId),

    #[error("datasource id '{0}' cannot name a snapshot file")]
    InvalidDatasource(DatasourceId),

    #[error("schema discovery is not configured")]
    Unconfigured,
}

/// Source of schema snapshots for a datasource.
#[async_trait::async_trait]
pub trait SchemaDiscovery: Send + Sync {
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the snapshot cannot be produced.
    async fn snapshot(&self, datasource: &DatasourceId) -> Result<SchemaSnapshot, DiscoveryError>;
}

/// Serves one fixed snapshot for every datasource.
#[derive(Debug, Clone, Default)]
pub struct StaticSchema(pub SchemaSnapshot);

#[async_trait::async_trait]
impl SchemaDiscovery for StaticSchema {
    async fn snapshot(&self, _datasource: &DatasourceId) -> Result<SchemaSnapshot, DiscoveryError> {
        Ok(self.0.clone())
    }
}

/// Placeholder used when no schema source is configured; every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredSchema;

#[async_trait::async_trait]
impl SchemaDiscovery for UnconfiguredSchema {
    async fn snapshot(&self, _datasource: &DatasourceId) -> Result<SchemaSnapshot, DiscoveryError> {
        Err(DiscoveryError::Unconfigured)
    }
}

/// Loads snapshots from disk.
///
/// `path` is either a single snapshot file used for every datasource, or
/// a directory holding `<datasource>.yaml`, `<datasource>.yml` or
/// `<datasource>.json`.
#[derive(Debug, Clone)]
pub struct FileSchemaDiscovery {
    path: PathBuf,
}

impl FileSchemaDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn resolve(&self, datasource: &DatasourceId) -> Result<PathBuf, DiscoveryError> {
        if !self.path.is_dir() {
            return Ok(self.path.clone());
        }
        if !is_plain_file_stem(datasource.as_str()) {
            return Err(DiscoveryError::InvalidDatasource(datasource.clone()));
        }
        ["yaml", "yml", "json"]
            .iter()
            .map(|ext| self.path.join(format!("{}.{ext}", datasource.as_str())))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| DiscoveryError::NotFound(datasource.clone()))
    }
}

/// A single path component that stays inside the snapshot directory.
fn is_plain_file_stem(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains(['/', '\\', '\0'])
        && !id.contains("..")
}

/// Parse snapshot text, choosing JSON or YAML by file extension.
///
/// # Errors
///
/// Returns [`DiscoveryError::Parse`] if the content does not decode.
pub fn parse_snapshot(path: &Path, content: &str) -> Result<SchemaSnapshot, DiscoveryError> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str(content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| DiscoveryError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

#[async_trait::async_trait]
impl SchemaDiscovery for FileSchemaDiscovery {
    async fn snapshot(&self, datasource: &DatasourceId) -> Result<SchemaSnapshot, DiscoveryError> {
        let path = self.resolve(datasource)?;
        let read_path = path.clone();
        let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(read_path))
            .await
            .map_err(|e| DiscoveryError::Io {
                path: path.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| DiscoveryError::Io {
                path: path.clone(),
                source,
            })?;
        let snapshot = parse_snapshot(&path, &content)?;
        tracing::debug!(
            datasource = datasource.as_str(),
            path = %path.display(),
            tables = snapshot.tables.len(),
            "Loaded schema snapshot"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT_YAML: &str = r"
tables:
  - name: users
    columns:
      - { name: id, data_type: integer, nullable: false }
      - { name: email, data_type: text, unique: true }
    primary_key: [id]
  - name: orders
    columns:
      - { name: id, data_type: integer }
      - { name: user_id, data_type: integer }
    primary_key: [id]
    foreign_keys:
      - constraint: orders_user_id_fkey
        column: user_id
        references_table: users
        references_column: id
";

    #[tokio::test]
    async fn loads_single_file_for_any_datasource() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.yaml");
        std::fs::write(&path, SNAPSHOT_YAML).unwrap();

        let source = FileSchemaDiscovery::new(&path);
        let snapshot = source.snapshot(&DatasourceId::new("any")).await.unwrap();
        assert_eq!(snapshot.tables.len(), 2);
        assert_eq!(snapshot.table("orders").unwrap().foreign_keys.len(), 1);
        assert!(snapshot.table("users").unwrap().is_unique_column("email"));
    }

    #[tokio::test]
    async fn directory_lookup_by_datasource() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot: SchemaSnapshot = serde_yaml::from_str(SNAPSHOT_YAML).unwrap();
        std::fs::write(
            dir.path().join("warehouse.json"),
            serde_json::to_string(&snapshot).unwrap(),
        )
        .unwrap();

        let source = FileSchemaDiscovery::new(dir.path());
        let loaded = source
            .snapshot(&DatasourceId::new("warehouse"))
            .await
            .unwrap();
        assert_eq!(loaded, snapshot);

        let missing = source.snapshot(&DatasourceId::new("crm")).await;
        assert!(matches!(missing, Err(DiscoveryError::NotFound(_))));
    }

    #[tokio::test]
    async fn directory_lookup_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("snapshots");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("secret.yaml"), SNAPSHOT_YAML).unwrap();

        let source = FileSchemaDiscovery::new(&nested);
        for id in ["../secret", "a/b", "a\\b", "..", ""] {
            let err = source.snapshot(&DatasourceId::new(id)).await.unwrap_err();
            assert!(
                matches!(err, DiscoveryError::InvalidDatasource(_)),
                "{id:?} gave {err}"
            );
        }
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let source = FileSchemaDiscovery::new("/nonexistent/schema.yaml");
        let err = source.snapshot(&DatasourceId::new("ds")).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Io { .. }));
    }

    #[test]
    fn malformed_snapshot_is_parse_error() {
        let err = parse_snapshot(Path::new("s.json"), "{not json").unwrap_err();
        assert!(err.to_string().contains("invalid schema snapshot"));
    }

    #[tokio::test]
    async fn unconfigured_source_always_fails() {
        let err = UnconfiguredSchema
            .snapshot(&DatasourceId::new("ds"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Unconfigured));
    }
}
