//! `SQLite`-backed implementation of [`DagStore`] and [`OntologyStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Writers open
//! `IMMEDIATE` transactions so check-then-write sequences stay atomic
//! even when another process shares the database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use ontodag_types::ontology::{GlossaryTerm, KnowledgeFact, Ontology, OntologyDocument};
use ontodag_types::{
    Dag, DagId, DagStatus, DatasourceId, InferenceMethod, NodeProgress, OntologyId, ProjectId,
    Relationship,
};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::backend::{
    CancelOutcome, CreateOutcome, DagStore, DeleteOutcome, DeleteSummary, OntologyStore,
};
use crate::codec::{
    format_ts, now_ts, parse_dag_status, parse_ts, progress_i64, DagRow, NodeRow, RelationshipRow,
};
use crate::error::{self, StateError};
use crate::schema::SQLITE_DDL;

const DAG_COLUMNS: &str = "id, project_id, datasource_id, ontology_id, status, current_node, \
     created_at, updated_at, started_at, completed_at";

const NODE_COLUMNS: &str = "id, name, node_order, status, progress_current, progress_total, \
     progress_message, error_message, started_at, completed_at";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence
/// or [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(StateError::backend)?;
        conn.execute_batch(SQLITE_DDL)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Begin a write transaction that takes the database write lock up front.
    fn write_tx<'c>(conn: &'c mut Connection, op: &str) -> error::Result<Transaction<'c>> {
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StateError::backend_context(format!("{op}: begin tx"), e))
    }

    fn commit(tx: Transaction<'_>, op: &str) -> error::Result<()> {
        tx.commit()
            .map_err(|e| StateError::backend_context(format!("{op}: commit"), e))
    }

    fn load_dag(conn: &Connection, dag: &str) -> error::Result<Option<Dag>> {
        let row = conn
            .query_row(
                &format!("SELECT {DAG_COLUMNS} FROM dags WHERE id = ?1"),
                [dag],
                read_dag_row,
            )
            .optional()
            .map_err(|e| StateError::backend_context("load dag", e))?;

        match row {
            Some(row) => {
                let nodes = Self::load_nodes(conn, &row.id)?;
                row.into_dag(nodes).map(Some)
            }
            None => Ok(None),
        }
    }

    fn load_nodes(conn: &Connection, dag: &str) -> error::Result<Vec<NodeRow>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM dag_nodes WHERE dag_id = ?1 ORDER BY node_order"
            ))
            .map_err(|e| StateError::backend_context("load nodes: prepare", e))?;
        let rows = stmt
            .query_map([dag], read_node_row)
            .map_err(|e| StateError::backend_context("load nodes: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("load nodes: read", e))
    }

    fn active_dag_id(conn: &Connection, datasource: &DatasourceId) -> error::Result<Option<String>> {
        conn.query_row(
            "SELECT id FROM dags WHERE datasource_id = ?1 AND status IN ('pending', 'running')",
            [datasource.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StateError::backend_context("active dag lookup", e))
    }

    fn insert_dag(tx: &Transaction<'_>, dag: &Dag) -> error::Result<()> {
        tx.execute(
            "INSERT INTO dags (id, project_id, datasource_id, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![
                dag.id.as_str(),
                dag.project_id.as_str(),
                dag.datasource_id.as_str(),
                dag.status.as_str(),
                format_ts(dag.created_at),
            ],
        )
        .map_err(|e| StateError::backend_context("insert dag", e))?;

        let mut stmt = tx
            .prepare(
                "INSERT INTO dag_nodes (id, dag_id, name, node_order, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(|e| StateError::backend_context("insert nodes: prepare", e))?;
        for node in &dag.nodes {
            stmt.execute(rusqlite::params![
                node.id.as_str(),
                dag.id.as_str(),
                node.name,
                node.order,
                node.status.as_str(),
            ])
            .map_err(|e| StateError::backend_context("insert nodes: execute", e))?;
        }
        Ok(())
    }

    /// Bump the DAG heartbeat inside an open transaction.
    fn touch(tx: &Transaction<'_>, dag: &str, now: &str) -> error::Result<()> {
        tx.execute("UPDATE dags SET updated_at = ?1 WHERE id = ?2", [now, dag])
            .map_err(|e| StateError::backend_context("touch dag", e))?;
        Ok(())
    }

    #[cfg(test)]
    fn count_rows(&self, table: &str) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .map_err(StateError::backend)
    }

    #[cfg(test)]
    fn set_heartbeat(&self, dag: &DagId, at: DateTime<Utc>) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE dags SET updated_at = ?1 WHERE id = ?2",
            [format_ts(at), dag.as_str().to_string()],
        )
        .map_err(StateError::backend)?;
        Ok(())
    }
}

fn read_dag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DagRow> {
    Ok(DagRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        datasource_id: row.get(2)?,
        ontology_id: row.get(3)?,
        status: row.get(4)?,
        current_node: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn read_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        id: row.get(0)?,
        name: row.get(1)?,
        order: row.get(2)?,
        status: row.get(3)?,
        progress_current: row.get(4)?,
        progress_total: row.get(5)?,
        progress_message: row.get(6)?,
        error_message: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn read_relationship_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelationshipRow> {
    Ok(RelationshipRow {
        source_table: row.get(0)?,
        source_column: row.get(1)?,
        target_table: row.get(2)?,
        target_column: row.get(3)?,
        cardinality: row.get(4)?,
        confidence: row.get(5)?,
        inference_method: row.get(6)?,
    })
}

impl DagStore for SqliteStateStore {
    fn create_or_get_active(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        node_names: &[String],
    ) -> error::Result<CreateOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "create_or_get_active")?;

        if let Some(active) = Self::active_dag_id(&tx, datasource)? {
            let dag = Self::load_dag(&tx, &active)?
                .ok_or_else(|| StateError::Corrupt(format!("active dag {active} vanished")))?;
            Self::commit(tx, "create_or_get_active")?;
            return Ok(CreateOutcome::Existing(dag));
        }

        let dag = Dag::new_pending(project.clone(), datasource.clone(), node_names, Utc::now());
        Self::insert_dag(&tx, &dag)?;
        Self::commit(tx, "create_or_get_active")?;
        Ok(CreateOutcome::Created(dag))
    }

    fn mark_running(&self, dag: &DagId) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let now = now_ts();
        let changed = conn
            .execute(
                "UPDATE dags SET status = 'running', started_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                [now.as_str(), dag.as_str()],
            )
            .map_err(|e| StateError::backend_context("mark_running", e))?;
        Ok(changed > 0)
    }

    fn get_dag(&self, dag: &DagId) -> error::Result<Option<Dag>> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("get_dag: begin tx", e))?;
        let loaded = Self::load_dag(&tx, dag.as_str())?;
        tx.commit()
            .map_err(|e| StateError::backend_context("get_dag: commit", e))?;
        Ok(loaded)
    }

    fn latest_dag(&self, datasource: &DatasourceId) -> error::Result<Option<Dag>> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("latest_dag: begin tx", e))?;
        let latest: Option<String> = tx
            .query_row(
                "SELECT id FROM dags WHERE datasource_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [datasource.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("latest_dag", e))?;
        let loaded = match latest {
            Some(id) => Self::load_dag(&tx, &id)?,
            None => None,
        };
        tx.commit()
            .map_err(|e| StateError::backend_context("latest_dag: commit", e))?;
        Ok(loaded)
    }

    fn heartbeat(&self, dag: &DagId) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE dags SET updated_at = ?1 WHERE id = ?2 AND status = 'running'",
                [now_ts().as_str(), dag.as_str()],
            )
            .map_err(|e| StateError::backend_context("heartbeat", e))?;
        Ok(changed > 0)
    }

    fn dag_status(&self, dag: &DagId) -> error::Result<Option<DagStatus>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT status FROM dags WHERE id = ?1", [dag.as_str()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StateError::backend_context("dag_status", e))?;
        raw.as_deref().map(parse_dag_status).transpose()
    }

    fn start_node(&self, dag: &DagId, order: u32) -> error::Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "start_node")?;
        let now = now_ts();

        let changed = tx
            .execute(
                "UPDATE dag_nodes SET status = 'running', started_at = ?1 \
                 WHERE dag_id = ?2 AND node_order = ?3 AND status = 'pending' \
                   AND EXISTS (SELECT 1 FROM dags WHERE id = ?2 AND status = 'running') \
                   AND (?3 = 1 OR EXISTS (SELECT 1 FROM dag_nodes p \
                        WHERE p.dag_id = ?2 AND p.node_order = ?3 - 1 AND p.status = 'completed'))",
                rusqlite::params![now, dag.as_str(), order],
            )
            .map_err(|e| StateError::backend_context("start_node", e))?;
        if changed == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE dags SET current_node = \
                (SELECT name FROM dag_nodes WHERE dag_id = ?1 AND node_order = ?2), \
             updated_at = ?3 WHERE id = ?1",
            rusqlite::params![dag.as_str(), order, now],
        )
        .map_err(|e| StateError::backend_context("start_node: current_node", e))?;
        Self::commit(tx, "start_node")?;
        Ok(true)
    }

    fn record_progress(
        &self,
        dag: &DagId,
        order: u32,
        progress: &NodeProgress,
    ) -> error::Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "record_progress")?;
        let changed = tx
            .execute(
                "UPDATE dag_nodes SET progress_current = ?1, progress_total = ?2, \
                 progress_message = ?3 \
                 WHERE dag_id = ?4 AND node_order = ?5 AND status = 'running' \
                   AND EXISTS (SELECT 1 FROM dags WHERE id = ?4 AND status = 'running')",
                rusqlite::params![
                    progress_i64(progress.current),
                    progress_i64(progress.total),
                    progress.message,
                    dag.as_str(),
                    order,
                ],
            )
            .map_err(|e| StateError::backend_context("record_progress", e))?;
        if changed > 0 {
            Self::touch(&tx, dag.as_str(), &now_ts())?;
        }
        Self::commit(tx, "record_progress")?;
        Ok(changed > 0)
    }

    fn complete_node(&self, dag: &DagId, order: u32) -> error::Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "complete_node")?;
        let now = now_ts();
        let changed = tx
            .execute(
                "UPDATE dag_nodes SET status = 'completed', completed_at = ?1, \
                 progress_current = NULL, progress_total = NULL, progress_message = NULL \
                 WHERE dag_id = ?2 AND node_order = ?3 AND status = 'running' \
                   AND EXISTS (SELECT 1 FROM dags WHERE id = ?2 AND status = 'running')",
                rusqlite::params![now, dag.as_str(), order],
            )
            .map_err(|e| StateError::backend_context("complete_node", e))?;
        if changed > 0 {
            Self::touch(&tx, dag.as_str(), &now)?;
        }
        Self::commit(tx, "complete_node")?;
        Ok(changed > 0)
    }

    fn fail_node(&self, dag: &DagId, order: u32, message: &str) -> error::Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "fail_node")?;
        let now = now_ts();
        let changed = tx
            .execute(
                "UPDATE dag_nodes SET status = 'failed', error_message = ?1, completed_at = ?2 \
                 WHERE dag_id = ?3 AND node_order = ?4 AND status = 'running' \
                   AND EXISTS (SELECT 1 FROM dags WHERE id = ?3 AND status = 'running')",
                rusqlite::params![message, now, dag.as_str(), order],
            )
            .map_err(|e| StateError::backend_context("fail_node", e))?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE dags SET status = 'failed', completed_at = ?1, updated_at = ?1 WHERE id = ?2",
            [now.as_str(), dag.as_str()],
        )
        .map_err(|e| StateError::backend_context("fail_node: dag", e))?;
        Self::commit(tx, "fail_node")?;
        Ok(true)
    }

    fn finish_dag(
        &self,
        dag: &DagId,
        status: DagStatus,
        ontology: Option<&OntologyId>,
    ) -> error::Result<bool> {
        if !status.is_terminal() {
            return Err(StateError::Corrupt(format!(
                "finish_dag called with non-terminal status {status}"
            )));
        }
        let conn = self.lock_conn()?;
        let now = now_ts();
        let changed = conn
            .execute(
                "UPDATE dags SET status = ?1, completed_at = ?2, updated_at = ?2, \
                 ontology_id = COALESCE(?3, ontology_id) \
                 WHERE id = ?4 AND status IN ('pending', 'running')",
                rusqlite::params![
                    status.as_str(),
                    now,
                    ontology.map(OntologyId::as_str),
                    dag.as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("finish_dag", e))?;
        Ok(changed > 0)
    }

    fn cancel_dag(&self, dag: &DagId) -> error::Result<CancelOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "cancel_dag")?;
        let raw: Option<String> = tx
            .query_row("SELECT status FROM dags WHERE id = ?1", [dag.as_str()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StateError::backend_context("cancel_dag: lookup", e))?;
        let Some(raw) = raw else {
            return Ok(CancelOutcome::NotFound);
        };
        let status = parse_dag_status(&raw)?;
        if status.is_terminal() {
            return Ok(CancelOutcome::NotRunning(status));
        }
        let now = now_ts();
        tx.execute(
            "UPDATE dags SET status = 'cancelled', completed_at = ?1, updated_at = ?1 \
             WHERE id = ?2",
            [now.as_str(), dag.as_str()],
        )
        .map_err(|e| StateError::backend_context("cancel_dag", e))?;
        Self::commit(tx, "cancel_dag")?;
        Ok(CancelOutcome::Cancelled)
    }

    fn fail_stale_dags(&self, cutoff: DateTime<Utc>, message: &str) -> error::Result<Vec<DagId>> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "fail_stale_dags")?;
        let stale: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM dags WHERE status IN ('pending', 'running') \
                     AND updated_at < ?1 ORDER BY created_at",
                )
                .map_err(|e| StateError::backend_context("fail_stale_dags: prepare", e))?;
            let rows = stmt
                .query_map([format_ts(cutoff)], |row| row.get(0))
                .map_err(|e| StateError::backend_context("fail_stale_dags: query", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StateError::backend_context("fail_stale_dags: read", e))?
        };

        let now = now_ts();
        for id in &stale {
            tx.execute(
                "UPDATE dag_nodes SET status = 'failed', error_message = ?1, completed_at = ?2 \
                 WHERE dag_id = ?3 AND status = 'running'",
                [message, now.as_str(), id.as_str()],
            )
            .map_err(|e| StateError::backend_context("fail_stale_dags: node", e))?;
            tx.execute(
                "UPDATE dags SET status = 'failed', completed_at = ?1, updated_at = ?1 \
                 WHERE id = ?2",
                [now.as_str(), id.as_str()],
            )
            .map_err(|e| StateError::backend_context("fail_stale_dags: dag", e))?;
        }
        Self::commit(tx, "fail_stale_dags")?;
        Ok(stale.into_iter().map(DagId::new).collect())
    }
}

impl OntologyStore for SqliteStateStore {
    fn add_manual_relationship(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        relationship: &Relationship,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO relationships (project_id, datasource_id, source_table, source_column, \
             target_table, target_column, cardinality, confidence, inference_method, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'manual', ?9) \
             ON CONFLICT (project_id, datasource_id, source_table, source_column, target_table, \
                          target_column) \
             DO UPDATE SET cardinality = ?7, confidence = ?8, inference_method = 'manual'",
            rusqlite::params![
                project.as_str(),
                datasource.as_str(),
                relationship.source_table,
                relationship.source_column,
                relationship.target_table,
                relationship.target_column,
                relationship.cardinality.as_str(),
                relationship.confidence,
                now_ts(),
            ],
        )
        .map_err(|e| StateError::backend_context("add_manual_relationship", e))?;
        Ok(())
    }

    fn relationships(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
    ) -> error::Result<Vec<Relationship>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT source_table, source_column, target_table, target_column, cardinality, \
                 confidence, inference_method FROM relationships \
                 WHERE project_id = ?1 AND datasource_id = ?2 \
                 ORDER BY source_table, source_column, target_table, target_column",
            )
            .map_err(|e| StateError::backend_context("relationships: prepare", e))?;
        let rows = stmt
            .query_map([project.as_str(), datasource.as_str()], read_relationship_row)
            .map_err(|e| StateError::backend_context("relationships: query", e))?;
        rows.map(|row| {
            row.map_err(|e| StateError::backend_context("relationships: read", e))
                .and_then(RelationshipRow::into_relationship)
        })
        .collect()
    }

    fn replace_inferred_relationships(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        method: InferenceMethod,
        relationships: &[Relationship],
    ) -> error::Result<u64> {
        if !method.is_inferred() {
            return Err(StateError::Corrupt(
                "manual relationships cannot be replaced by discovery".to_string(),
            ));
        }
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "replace_inferred_relationships")?;
        tx.execute(
            "DELETE FROM relationships \
             WHERE project_id = ?1 AND datasource_id = ?2 AND inference_method = ?3",
            [project.as_str(), datasource.as_str(), method.as_str()],
        )
        .map_err(|e| StateError::backend_context("replace_inferred_relationships: delete", e))?;

        let now = now_ts();
        let mut inserted = 0u64;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO relationships (project_id, datasource_id, source_table, \
                     source_column, target_table, target_column, cardinality, confidence, \
                     inference_method, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT (project_id, datasource_id, source_table, source_column, \
                     target_table, target_column) DO UPDATE SET \
                     cardinality = excluded.cardinality, confidence = excluded.confidence, \
                     inference_method = excluded.inference_method, created_at = excluded.created_at \
                     WHERE relationships.inference_method <> 'manual'",
                )
                .map_err(|e| {
                    StateError::backend_context("replace_inferred_relationships: prepare", e)
                })?;
            for rel in relationships {
                let changed = stmt
                    .execute(rusqlite::params![
                        project.as_str(),
                        datasource.as_str(),
                        rel.source_table,
                        rel.source_column,
                        rel.target_table,
                        rel.target_column,
                        rel.cardinality.as_str(),
                        rel.confidence,
                        method.as_str(),
                        now,
                    ])
                    .map_err(|e| {
                        StateError::backend_context("replace_inferred_relationships: insert", e)
                    })?;
                inserted += changed as u64;
            }
        }
        Self::commit(tx, "replace_inferred_relationships")?;
        Ok(inserted)
    }

    fn save_ontology(&self, ontology: &Ontology, terms: &[GlossaryTerm]) -> error::Result<()> {
        let document = serde_json::to_string(&ontology.document)?;
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "save_ontology")?;
        tx.execute(
            "INSERT INTO ontologies (id, project_id, datasource_id, dag_id, document, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                ontology.id.as_str(),
                ontology.project_id.as_str(),
                ontology.datasource_id.as_str(),
                ontology.dag_id.as_str(),
                document,
                format_ts(ontology.created_at),
            ],
        )
        .map_err(|e| StateError::backend_context("save_ontology", e))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO glossary_terms (ontology_id, term, definition) \
                     VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| StateError::backend_context("save_ontology: terms prepare", e))?;
            for term in terms {
                stmt.execute([ontology.id.as_str(), &term.term, &term.definition])
                    .map_err(|e| StateError::backend_context("save_ontology: term", e))?;
            }
        }
        Self::commit(tx, "save_ontology")
    }

    fn latest_ontology(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
    ) -> error::Result<Option<Ontology>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, dag_id, document, created_at FROM ontologies \
                 WHERE project_id = ?1 AND datasource_id = ?2 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [project.as_str(), datasource.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StateError::backend_context("latest_ontology", e))?;

        row.map(|(id, dag_id, document, created_at)| {
            let document: OntologyDocument = serde_json::from_str(&document)?;
            Ok(Ontology {
                id: OntologyId::new(id),
                project_id: project.clone(),
                datasource_id: datasource.clone(),
                dag_id: DagId::new(dag_id),
                document,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    fn glossary_terms(&self, project: &ProjectId) -> error::Result<Vec<GlossaryTerm>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT g.term, g.definition FROM glossary_terms g \
                 JOIN ontologies o ON o.id = g.ontology_id \
                 WHERE o.project_id = ?1 ORDER BY g.term",
            )
            .map_err(|e| StateError::backend_context("glossary_terms: prepare", e))?;
        let rows = stmt
            .query_map([project.as_str()], |row| {
                Ok(GlossaryTerm {
                    term: row.get(0)?,
                    definition: row.get(1)?,
                })
            })
            .map_err(|e| StateError::backend_context("glossary_terms: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("glossary_terms: read", e))
    }

    fn add_knowledge_fact(
        &self,
        project: &ProjectId,
        fact: &str,
        source: &str,
    ) -> error::Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO knowledge_facts (project_id, fact, source, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                [project.as_str(), fact, source, now_ts().as_str()],
            )
            .map_err(|e| StateError::backend_context("add_knowledge_fact", e))?;
        Ok((changed > 0).then(|| conn.last_insert_rowid()))
    }

    fn knowledge_facts(&self, project: &ProjectId) -> error::Result<Vec<KnowledgeFact>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, fact, source, created_at FROM knowledge_facts \
                 WHERE project_id = ?1 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("knowledge_facts: prepare", e))?;
        let rows = stmt
            .query_map([project.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| StateError::backend_context("knowledge_facts: query", e))?;
        rows.map(|row| {
            let (id, fact, source, created_at) =
                row.map_err(|e| StateError::backend_context("knowledge_facts: read", e))?;
            Ok(KnowledgeFact {
                id,
                project_id: project.clone(),
                fact,
                source,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
    }

    fn delete_project_ontology(&self, project: &ProjectId) -> error::Result<DeleteOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = Self::write_tx(&mut conn, "delete_project_ontology")?;

        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM dags WHERE project_id = ?1 AND status IN ('pending', 'running') \
                 LIMIT 1",
                [project.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("delete_project_ontology: check", e))?;
        if let Some(active) = active {
            return Ok(DeleteOutcome::Blocked {
                active_dag: DagId::new(active),
            });
        }

        let step = |sql: &str, what: &str| -> error::Result<u64> {
            tx.execute(sql, [project.as_str()])
                .map(|n| n as u64)
                .map_err(|e| StateError::backend_context(format!("delete_project_ontology: {what}"), e))
        };

        let glossary_terms = step(
            "DELETE FROM glossary_terms WHERE ontology_id IN \
             (SELECT id FROM ontologies WHERE project_id = ?1)",
            "glossary terms",
        )?;
        let ontologies = step("DELETE FROM ontologies WHERE project_id = ?1", "ontologies")?;
        let relationships = step(
            "DELETE FROM relationships WHERE project_id = ?1 AND inference_method <> 'manual'",
            "relationships",
        )?;
        step(
            "DELETE FROM dag_nodes WHERE dag_id IN (SELECT id FROM dags WHERE project_id = ?1)",
            "nodes",
        )?;
        let dags = step("DELETE FROM dags WHERE project_id = ?1", "dags")?;

        Self::commit(tx, "delete_project_ontology")?;
        Ok(DeleteOutcome::Deleted(DeleteSummary {
            dags,
            ontologies,
            glossary_terms,
            relationships,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ontodag_types::ontology::EntityDescriptor;
    use ontodag_types::{Cardinality, NodeStatus};

    fn pid(name: &str) -> ProjectId {
        ProjectId::new(name)
    }

    fn ds(name: &str) -> DatasourceId {
        DatasourceId::new(name)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn running_dag(store: &SqliteStateStore, datasource: &str) -> Dag {
        let dag = store
            .create_or_get_active(&pid("p"), &ds(datasource), &names(&["A", "B", "C"]))
            .unwrap()
            .into_dag();
        assert!(store.mark_running(&dag.id).unwrap());
        dag
    }

    fn relationship(src: &str, col: &str, dst: &str, method: InferenceMethod) -> Relationship {
        Relationship {
            source_table: src.into(),
            source_column: col.into(),
            target_table: dst.into(),
            target_column: "id".into(),
            cardinality: Cardinality::ManyToOne,
            confidence: if method == InferenceMethod::PkMatch { 0.9 } else { 1.0 },
            inference_method: method,
        }
    }

    fn sample_ontology(dag: &Dag) -> Ontology {
        Ontology {
            id: OntologyId::generate(),
            project_id: dag.project_id.clone(),
            datasource_id: dag.datasource_id.clone(),
            dag_id: dag.id.clone(),
            document: OntologyDocument {
                entities: vec![EntityDescriptor {
                    table: "users".into(),
                    columns: vec!["id".into()],
                    primary_key: vec!["id".into()],
                }],
                relationships: vec![],
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_then_get_returns_same_active_dag() {
        let store = SqliteStateStore::in_memory().unwrap();
        let first = store
            .create_or_get_active(&pid("p"), &ds("ds"), &names(&["A", "B"]))
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let second = store
            .create_or_get_active(&pid("p"), &ds("ds"), &names(&["A", "B"]))
            .unwrap();
        assert!(matches!(second, CreateOutcome::Existing(_)));
        assert_eq!(first.dag().id, second.dag().id);
        assert_eq!(store.count_rows("dags").unwrap(), 1);
    }

    #[test]
    fn unique_index_rejects_second_active_dag() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        let conn = store.lock_conn().unwrap();
        let err = conn.execute(
            "INSERT INTO dags (id, project_id, datasource_id, status, created_at, updated_at) \
             VALUES ('other', 'p', 'ds', 'pending', 'x', 'x')",
            [],
        );
        assert!(err.is_err(), "second active dag for {} must be rejected", dag.id);
    }

    #[test]
    fn terminal_dag_allows_new_active_dag() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        assert!(store.finish_dag(&dag.id, DagStatus::Completed, None).unwrap());
        let next = store
            .create_or_get_active(&pid("p"), &ds("ds"), &names(&["A"]))
            .unwrap();
        assert!(matches!(next, CreateOutcome::Created(_)));
        assert_ne!(next.dag().id, dag.id);
        assert_eq!(store.latest_dag(&ds("ds")).unwrap().unwrap().id, next.dag().id);
    }

    #[test]
    fn node_lifecycle_enforces_order() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");

        assert!(!store.start_node(&dag.id, 2).unwrap(), "B must wait for A");
        assert!(store.start_node(&dag.id, 1).unwrap());
        assert!(!store.start_node(&dag.id, 1).unwrap(), "already running");

        let progress = NodeProgress::new(1, 4, "scanning users");
        assert!(store.record_progress(&dag.id, 1, &progress).unwrap());
        let loaded = store.get_dag(&dag.id).unwrap().unwrap();
        assert_eq!(loaded.current_node.as_deref(), Some("A"));
        assert_eq!(loaded.nodes[0].progress, Some(progress));

        assert!(store.complete_node(&dag.id, 1).unwrap());
        assert!(store.start_node(&dag.id, 2).unwrap());
        let loaded = store.get_dag(&dag.id).unwrap().unwrap();
        assert_eq!(loaded.nodes[0].status, NodeStatus::Completed);
        assert!(loaded.nodes[0].progress.is_none());
        assert_eq!(loaded.current_node.as_deref(), Some("B"));
        assert!(loaded.invariant_violations().is_empty());
    }

    #[test]
    fn fail_node_fails_dag_atomically() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        store.start_node(&dag.id, 1).unwrap();
        store.complete_node(&dag.id, 1).unwrap();
        store.start_node(&dag.id, 2).unwrap();

        assert!(store.fail_node(&dag.id, 2, "LLM request timed out").unwrap());
        let loaded = store.get_dag(&dag.id).unwrap().unwrap();
        assert_eq!(loaded.status, DagStatus::Failed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.nodes[1].status, NodeStatus::Failed);
        assert_eq!(
            loaded.nodes[1].error_message.as_deref(),
            Some("LLM request timed out")
        );
        assert_eq!(loaded.nodes[2].status, NodeStatus::Pending);
        assert_eq!(loaded.current_node.as_deref(), Some("B"));
        assert!(!store.start_node(&dag.id, 3).unwrap());
    }

    #[test]
    fn cancel_is_rejected_once_terminal() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        store.start_node(&dag.id, 1).unwrap();

        assert_eq!(store.cancel_dag(&dag.id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            store.cancel_dag(&dag.id).unwrap(),
            CancelOutcome::NotRunning(DagStatus::Cancelled)
        );
        assert_eq!(
            store.cancel_dag(&DagId::new("missing")).unwrap(),
            CancelOutcome::NotFound
        );

        // Writes racing the cancellation no longer apply.
        assert!(!store.complete_node(&dag.id, 1).unwrap());
        assert!(!store
            .record_progress(&dag.id, 1, &NodeProgress::new(2, 3, "late"))
            .unwrap());
        assert!(!store.finish_dag(&dag.id, DagStatus::Completed, None).unwrap());
        let loaded = store.get_dag(&dag.id).unwrap().unwrap();
        assert_eq!(loaded.status, DagStatus::Cancelled);
        assert_eq!(loaded.nodes[0].status, NodeStatus::Running);
    }

    #[test]
    fn finish_dag_attaches_ontology() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        let ontology = OntologyId::generate();
        assert!(store
            .finish_dag(&dag.id, DagStatus::Completed, Some(&ontology))
            .unwrap());
        let loaded = store.get_dag(&dag.id).unwrap().unwrap();
        assert_eq!(loaded.ontology_id, Some(ontology));
        assert!(loaded.completed_at.is_some());
        assert!(store.finish_dag(&dag.id, DagStatus::Running, None).is_err());
    }

    #[test]
    fn stale_dags_are_failed() {
        let store = SqliteStateStore::in_memory().unwrap();
        let stale = running_dag(&store, "ds-stale");
        store.start_node(&stale.id, 1).unwrap();
        store
            .set_heartbeat(&stale.id, Utc::now() - Duration::hours(2))
            .unwrap();
        let fresh = running_dag(&store, "ds-fresh");
        store
            .set_heartbeat(&fresh.id, Utc::now() - Duration::hours(2))
            .unwrap();
        assert!(store.heartbeat(&fresh.id).unwrap());

        let reconciled = store
            .fail_stale_dags(Utc::now() - Duration::minutes(15), "execution abandoned")
            .unwrap();
        assert_eq!(reconciled, vec![stale.id.clone()]);

        let loaded = store.get_dag(&stale.id).unwrap().unwrap();
        assert_eq!(loaded.status, DagStatus::Failed);
        assert_eq!(
            loaded.nodes[0].error_message.as_deref(),
            Some("execution abandoned")
        );
        assert!(loaded.invariant_violations().is_empty());
        assert_eq!(
            store.dag_status(&fresh.id).unwrap(),
            Some(DagStatus::Running)
        );
        assert!(!store.heartbeat(&stale.id).unwrap());
    }

    #[test]
    fn inferred_replace_keeps_manual_rows() {
        let store = SqliteStateStore::in_memory().unwrap();
        let manual = relationship("orders", "user_id", "users", InferenceMethod::Manual);
        store
            .add_manual_relationship(&pid("p"), &ds("ds"), &manual)
            .unwrap();

        let inserted = store
            .replace_inferred_relationships(
                &pid("p"),
                &ds("ds"),
                InferenceMethod::ForeignKey,
                &[
                    relationship("orders", "user_id", "users", InferenceMethod::ForeignKey),
                    relationship("orders", "shop_id", "shops", InferenceMethod::ForeignKey),
                ],
            )
            .unwrap();
        assert_eq!(inserted, 1, "manual pair must not be superseded");

        // A second run replaces, it does not accumulate.
        store
            .replace_inferred_relationships(
                &pid("p"),
                &ds("ds"),
                InferenceMethod::ForeignKey,
                &[relationship("orders", "shop_id", "shops", InferenceMethod::ForeignKey)],
            )
            .unwrap();

        let all = store.relationships(&pid("p"), &ds("ds")).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].inference_method, InferenceMethod::Manual);
        assert!(store
            .replace_inferred_relationships(&pid("p"), &ds("ds"), InferenceMethod::Manual, &[])
            .is_err());
    }

    #[test]
    fn declared_key_takes_over_pattern_matched_row() {
        let store = SqliteStateStore::in_memory().unwrap();
        store
            .replace_inferred_relationships(
                &pid("p"),
                &ds("ds"),
                InferenceMethod::PkMatch,
                &[relationship("orders", "user_id", "users", InferenceMethod::PkMatch)],
            )
            .unwrap();

        let written = store
            .replace_inferred_relationships(
                &pid("p"),
                &ds("ds"),
                InferenceMethod::ForeignKey,
                &[relationship("orders", "user_id", "users", InferenceMethod::ForeignKey)],
            )
            .unwrap();
        assert_eq!(written, 1);

        // The pattern-match rerun finds nothing left to replace.
        store
            .replace_inferred_relationships(&pid("p"), &ds("ds"), InferenceMethod::PkMatch, &[])
            .unwrap();

        let all = store.relationships(&pid("p"), &ds("ds")).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].inference_method, InferenceMethod::ForeignKey);
        assert!((all[0].confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn knowledge_facts_are_deduplicated() {
        let store = SqliteStateStore::in_memory().unwrap();
        let first = store
            .add_knowledge_fact(&pid("p"), "We sell shoes", "project_overview")
            .unwrap();
        assert!(first.is_some());
        let again = store
            .add_knowledge_fact(&pid("p"), "We sell shoes", "project_overview")
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.knowledge_facts(&pid("p")).unwrap().len(), 1);
    }

    #[test]
    fn delete_blocked_while_running() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        let outcome = store.delete_project_ontology(&pid("p")).unwrap();
        assert_eq!(
            outcome,
            DeleteOutcome::Blocked {
                active_dag: dag.id.clone()
            }
        );
        assert!(store.get_dag(&dag.id).unwrap().is_some());
    }

    #[test]
    fn delete_removes_ontology_scoped_data_only() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        let ontology = sample_ontology(&dag);
        store
            .save_ontology(
                &ontology,
                &[GlossaryTerm {
                    term: "User".into(),
                    definition: "A customer account".into(),
                }],
            )
            .unwrap();
        store
            .finish_dag(&dag.id, DagStatus::Completed, Some(&ontology.id))
            .unwrap();
        store
            .add_knowledge_fact(&pid("p"), "Fiscal year starts in April", "user")
            .unwrap();
        store
            .add_manual_relationship(
                &pid("p"),
                &ds("ds"),
                &relationship("a", "b_id", "b", InferenceMethod::Manual),
            )
            .unwrap();
        store
            .replace_inferred_relationships(
                &pid("p"),
                &ds("ds"),
                InferenceMethod::PkMatch,
                &[relationship("c", "d_id", "d", InferenceMethod::PkMatch)],
            )
            .unwrap();

        let outcome = store.delete_project_ontology(&pid("p")).unwrap();
        assert_eq!(
            outcome,
            DeleteOutcome::Deleted(DeleteSummary {
                dags: 1,
                ontologies: 1,
                glossary_terms: 1,
                relationships: 1,
            })
        );
        assert!(store.glossary_terms(&pid("p")).unwrap().is_empty());
        assert!(store.latest_ontology(&pid("p"), &ds("ds")).unwrap().is_none());
        assert!(store.latest_dag(&ds("ds")).unwrap().is_none());
        assert_eq!(store.knowledge_facts(&pid("p")).unwrap().len(), 1);
        assert_eq!(store.relationships(&pid("p"), &ds("ds")).unwrap().len(), 1);
        assert_eq!(store.count_rows("dag_nodes").unwrap(), 0);
    }

    #[test]
    fn ontology_roundtrip() {
        let store = SqliteStateStore::in_memory().unwrap();
        let dag = running_dag(&store, "ds");
        let ontology = sample_ontology(&dag);
        store.save_ontology(&ontology, &[]).unwrap();
        let loaded = store.latest_ontology(&pid("p"), &ds("ds")).unwrap().unwrap();
        assert_eq!(loaded.id, ontology.id);
        assert_eq!(loaded.document, ontology.document);
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let dag_id = {
            let store = SqliteStateStore::open(&path).unwrap();
            let dag = running_dag(&store, "ds");
            store.start_node(&dag.id, 1).unwrap();
            dag.id
        };
        let reopened = SqliteStateStore::open(&path).unwrap();
        let dag = reopened.latest_dag(&ds("ds")).unwrap().unwrap();
        assert_eq!(dag.id, dag_id);
        assert_eq!(dag.status, DagStatus::Running);
        assert_eq!(dag.nodes[0].status, NodeStatus::Running);
    }
}
