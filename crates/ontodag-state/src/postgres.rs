//! `PostgreSQL`-backed implementation of [`DagStore`] and [`OntologyStore`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` per store.
//! Several engine replicas may share one database: DAG writes lock the
//! DAG row (`SELECT ... FOR UPDATE`) before checking its status, and
//! project-level create/delete take a transaction-scoped advisory lock
//! keyed on the project id.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use ontodag_types::ontology::{GlossaryTerm, KnowledgeFact, Ontology, OntologyDocument};
use ontodag_types::{
    Dag, DagId, DagStatus, DatasourceId, InferenceMethod, NodeProgress, OntologyId, ProjectId,
    Relationship,
};
use postgres::{Client, GenericClient, NoTls, Row, Transaction};

use crate::backend::{
    CancelOutcome, CreateOutcome, DagStore, DeleteOutcome, DeleteSummary, OntologyStore,
};
use crate::codec::{
    format_ts, now_ts, parse_dag_status, parse_ts, progress_i64, DagRow, NodeRow, RelationshipRow,
};
use crate::error::{self, StateError};
use crate::schema::POSTGRES_DDL;

/// `PostgreSQL`-backed state storage.
///
/// Create with [`PostgresStateStore::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=ontodag user=postgres"`).
pub struct PostgresStateStore {
    client: Mutex<Client>,
}

impl PostgresStateStore {
    /// Connect to a `PostgreSQL` database and initialize state tables.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client = Client::connect(connstr, NoTls).map_err(StateError::backend)?;
        client
            .batch_execute(POSTGRES_DDL)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn begin<'c>(client: &'c mut Client, op: &str) -> error::Result<Transaction<'c>> {
        client
            .transaction()
            .map_err(|e| StateError::backend_context(format!("{op}: begin tx"), e))
    }

    fn commit(tx: Transaction<'_>, op: &str) -> error::Result<()> {
        tx.commit()
            .map_err(|e| StateError::backend_context(format!("{op}: commit"), e))
    }

    /// Serialize project-level create/delete across replicas until commit.
    fn lock_project(tx: &mut Transaction<'_>, project: &ProjectId) -> error::Result<()> {
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1))",
            &[&project.as_str()],
        )
        .map_err(|e| StateError::backend_context("project advisory lock", e))?;
        Ok(())
    }

    /// Lock the DAG row and return its status.
    fn lock_dag(tx: &mut Transaction<'_>, dag: &DagId) -> error::Result<Option<DagStatus>> {
        let row = tx
            .query_opt(
                "SELECT status FROM dags WHERE id = $1 FOR UPDATE",
                &[&dag.as_str()],
            )
            .map_err(|e| StateError::backend_context("lock dag", e))?;
        row.map(|row| parse_dag_status(row.get::<_, &str>(0)))
            .transpose()
    }

    fn load_dag(client: &mut impl GenericClient, dag: &str) -> error::Result<Option<Dag>> {
        let row = client
            .query_opt(
                "SELECT id, project_id, datasource_id, ontology_id, status, current_node, \
                 created_at, updated_at, started_at, completed_at FROM dags WHERE id = $1",
                &[&dag],
            )
            .map_err(|e| StateError::backend_context("load dag", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let dag_row = DagRow {
            id: row.get(0),
            project_id: row.get(1),
            datasource_id: row.get(2),
            ontology_id: row.get(3),
            status: row.get(4),
            current_node: row.get(5),
            created_at: row.get(6),
            updated_at: row.get(7),
            started_at: row.get(8),
            completed_at: row.get(9),
        };

        let nodes = client
            .query(
                "SELECT id, name, node_order, status, progress_current, progress_total, \
                 progress_message, error_message, started_at, completed_at \
                 FROM dag_nodes WHERE dag_id = $1 ORDER BY node_order",
                &[&dag],
            )
            .map_err(|e| StateError::backend_context("load nodes", e))?
            .iter()
            .map(read_node_row)
            .collect();
        dag_row.into_dag(nodes).map(Some)
    }

    fn touch(tx: &mut Transaction<'_>, dag: &DagId, now: &str) -> error::Result<()> {
        tx.execute(
            "UPDATE dags SET updated_at = $1 WHERE id = $2",
            &[&now, &dag.as_str()],
        )
        .map_err(|e| StateError::backend_context("touch dag", e))?;
        Ok(())
    }
}

fn read_node_row(row: &Row) -> NodeRow {
    NodeRow {
        id: row.get(0),
        name: row.get(1),
        order: i64::from(row.get::<_, i32>(2)),
        status: row.get(3),
        progress_current: row.get(4),
        progress_total: row.get(5),
        progress_message: row.get(6),
        error_message: row.get(7),
        started_at: row.get(8),
        completed_at: row.get(9),
    }
}

fn read_relationship_row(row: &Row) -> RelationshipRow {
    RelationshipRow {
        source_table: row.get(0),
        source_column: row.get(1),
        target_table: row.get(2),
        target_column: row.get(3),
        cardinality: row.get(4),
        confidence: row.get(5),
        inference_method: row.get(6),
    }
}

/// Node orders are stored as `INTEGER`.
fn order_i32(order: u32) -> error::Result<i32> {
    i32::try_from(order).map_err(|_| StateError::Corrupt(format!("node order {order} too large")))
}

fn node_status(tx: &mut Transaction<'_>, dag: &DagId, order: i32) -> error::Result<Option<String>> {
    tx.query_opt(
        "SELECT status FROM dag_nodes WHERE dag_id = $1 AND node_order = $2",
        &[&dag.as_str(), &order],
    )
    .map(|row| row.map(|row| row.get(0)))
    .map_err(|e| StateError::backend_context("node status", e))
}

impl DagStore for PostgresStateStore {
    fn create_or_get_active(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        node_names: &[String],
    ) -> error::Result<CreateOutcome> {
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "create_or_get_active")?;
        Self::lock_project(&mut tx, project)?;

        let active = tx
            .query_opt(
                "SELECT id FROM dags WHERE datasource_id = $1 AND status IN ('pending', 'running')",
                &[&datasource.as_str()],
            )
            .map_err(|e| StateError::backend_context("active dag lookup", e))?;
        if let Some(row) = active {
            let id: String = row.get(0);
            let dag = Self::load_dag(&mut tx, &id)?
                .ok_or_else(|| StateError::Corrupt(format!("active dag {id} vanished")))?;
            Self::commit(tx, "create_or_get_active")?;
            return Ok(CreateOutcome::Existing(dag));
        }

        let dag = Dag::new_pending(project.clone(), datasource.clone(), node_names, Utc::now());
        let created = format_ts(dag.created_at);
        tx.execute(
            "INSERT INTO dags (id, project_id, datasource_id, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $5)",
            &[
                &dag.id.as_str(),
                &project.as_str(),
                &datasource.as_str(),
                &dag.status.as_str(),
                &created,
            ],
        )
        .map_err(|e| StateError::backend_context("insert dag", e))?;
        for node in &dag.nodes {
            tx.execute(
                "INSERT INTO dag_nodes (id, dag_id, name, node_order, status) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &node.id.as_str(),
                    &dag.id.as_str(),
                    &node.name,
                    &order_i32(node.order)?,
                    &node.status.as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("insert node", e))?;
        }
        Self::commit(tx, "create_or_get_active")?;
        Ok(CreateOutcome::Created(dag))
    }

    fn mark_running(&self, dag: &DagId) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let now = now_ts();
        let changed = client
            .execute(
                "UPDATE dags SET status = 'running', started_at = $1, updated_at = $1 \
                 WHERE id = $2 AND status = 'pending'",
                &[&now, &dag.as_str()],
            )
            .map_err(|e| StateError::backend_context("mark_running", e))?;
        Ok(changed > 0)
    }

    fn get_dag(&self, dag: &DagId) -> error::Result<Option<Dag>> {
        let mut client = self.lock_client()?;
        let mut tx = client
            .build_transaction()
            .isolation_level(postgres::IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .map_err(|e| StateError::backend_context("get_dag: begin tx", e))?;
        let loaded = Self::load_dag(&mut tx, dag.as_str())?;
        Self::commit(tx, "get_dag")?;
        Ok(loaded)
    }

    fn latest_dag(&self, datasource: &DatasourceId) -> error::Result<Option<Dag>> {
        let mut client = self.lock_client()?;
        let mut tx = client
            .build_transaction()
            .isolation_level(postgres::IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .map_err(|e| StateError::backend_context("latest_dag: begin tx", e))?;
        let latest = tx
            .query_opt(
                "SELECT id FROM dags WHERE datasource_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                &[&datasource.as_str()],
            )
            .map_err(|e| StateError::backend_context("latest_dag", e))?;
        let loaded = match latest {
            Some(row) => Self::load_dag(&mut tx, row.get::<_, &str>(0))?,
            None => None,
        };
        Self::commit(tx, "latest_dag")?;
        Ok(loaded)
    }

    fn heartbeat(&self, dag: &DagId) -> error::Result<bool> {
        let mut client = self.lock_client()?;
        let changed = client
            .execute(
                "UPDATE dags SET updated_at = $1 WHERE id = $2 AND status = 'running'",
                &[&now_ts(), &dag.as_str()],
            )
            .map_err(|e| StateError::backend_context("heartbeat", e))?;
        Ok(changed > 0)
    }

    fn dag_status(&self, dag: &DagId) -> error::Result<Option<DagStatus>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt("SELECT status FROM dags WHERE id = $1", &[&dag.as_str()])
            .map_err(|e| StateError::backend_context("dag_status", e))?;
        row.map(|row| parse_dag_status(row.get::<_, &str>(0)))
            .transpose()
    }

    fn start_node(&self, dag: &DagId, order: u32) -> error::Result<bool> {
        let order = order_i32(order)?;
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "start_node")?;
        if Self::lock_dag(&mut tx, dag)? != Some(DagStatus::Running) {
            return Ok(false);
        }
        if node_status(&mut tx, dag, order)?.as_deref() != Some("pending") {
            return Ok(false);
        }
        if order > 1 && node_status(&mut tx, dag, order - 1)?.as_deref() != Some("completed") {
            return Ok(false);
        }

        let now = now_ts();
        tx.execute(
            "UPDATE dag_nodes SET status = 'running', started_at = $1 \
             WHERE dag_id = $2 AND node_order = $3",
            &[&now, &dag.as_str(), &order],
        )
        .map_err(|e| StateError::backend_context("start_node", e))?;
        tx.execute(
            "UPDATE dags SET current_node = \
                (SELECT name FROM dag_nodes WHERE dag_id = $1 AND node_order = $2), \
             updated_at = $3 WHERE id = $1",
            &[&dag.as_str(), &order, &now],
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
        let order = order_i32(order)?;
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "record_progress")?;
        if Self::lock_dag(&mut tx, dag)? != Some(DagStatus::Running) {
            return Ok(false);
        }
        let changed = tx
            .execute(
                "UPDATE dag_nodes SET progress_current = $1, progress_total = $2, \
                 progress_message = $3 \
                 WHERE dag_id = $4 AND node_order = $5 AND status = 'running'",
                &[
                    &progress_i64(progress.current),
                    &progress_i64(progress.total),
                    &progress.message,
                    &dag.as_str(),
                    &order,
                ],
            )
            .map_err(|e| StateError::backend_context("record_progress", e))?;
        if changed > 0 {
            Self::touch(&mut tx, dag, &now_ts())?;
        }
        Self::commit(tx, "record_progress")?;
        Ok(changed > 0)
    }

    fn complete_node(&self, dag: &DagId, order: u32) -> error::Result<bool> {
        let order = order_i32(order)?;
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "complete_node")?;
        if Self::lock_dag(&mut tx, dag)? != Some(DagStatus::Running) {
            return Ok(false);
        }
        let now = now_ts();
        let changed = tx
            .execute(
                "UPDATE dag_nodes SET status = 'completed', completed_at = $1, \
                 progress_current = NULL, progress_total = NULL, progress_message = NULL \
                 WHERE dag_id = $2 AND node_order = $3 AND status = 'running'",
                &[&now, &dag.as_str(), &order],
            )
            .map_err(|e| StateError::backend_context("complete_node", e))?;
        if changed > 0 {
            Self::touch(&mut tx, dag, &now)?;
        }
        Self::commit(tx, "complete_node")?;
        Ok(changed > 0)
    }

    fn fail_node(&self, dag: &DagId, order: u32, message: &str) -> error::Result<bool> {
        let order = order_i32(order)?;
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "fail_node")?;
        if Self::lock_dag(&mut tx, dag)? != Some(DagStatus::Running) {
            return Ok(false);
        }
        let now = now_ts();
        let changed = tx
            .execute(
                "UPDATE dag_nodes SET status = 'failed', error_message = $1, completed_at = $2 \
                 WHERE dag_id = $3 AND node_order = $4 AND status = 'running'",
                &[&message, &now, &dag.as_str(), &order],
            )
            .map_err(|e| StateError::backend_context("fail_node", e))?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE dags SET status = 'failed', completed_at = $1, updated_at = $1 WHERE id = $2",
            &[&now, &dag.as_str()],
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
        let mut client = self.lock_client()?;
        let now = now_ts();
        let changed = client
            .execute(
                "UPDATE dags SET status = $1, completed_at = $2, updated_at = $2, \
                 ontology_id = COALESCE($3, ontology_id) \
                 WHERE id = $4 AND status IN ('pending', 'running')",
                &[
                    &status.as_str(),
                    &now,
                    &ontology.map(OntologyId::as_str),
                    &dag.as_str(),
                ],
            )
            .map_err(|e| StateError::backend_context("finish_dag", e))?;
        Ok(changed > 0)
    }

    fn cancel_dag(&self, dag: &DagId) -> error::Result<CancelOutcome> {
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "cancel_dag")?;
        let Some(status) = Self::lock_dag(&mut tx, dag)? else {
            return Ok(CancelOutcome::NotFound);
        };
        if status.is_terminal() {
            return Ok(CancelOutcome::NotRunning(status));
        }
        let now = now_ts();
        tx.execute(
            "UPDATE dags SET status = 'cancelled', completed_at = $1, updated_at = $1 \
             WHERE id = $2",
            &[&now, &dag.as_str()],
        )
        .map_err(|e| StateError::backend_context("cancel_dag", e))?;
        Self::commit(tx, "cancel_dag")?;
        Ok(CancelOutcome::Cancelled)
    }

    fn fail_stale_dags(&self, cutoff: DateTime<Utc>, message: &str) -> error::Result<Vec<DagId>> {
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "fail_stale_dags")?;
        let stale: Vec<String> = tx
            .query(
                "SELECT id FROM dags WHERE status IN ('pending', 'running') \
                 AND updated_at < $1 ORDER BY created_at FOR UPDATE SKIP LOCKED",
                &[&format_ts(cutoff)],
            )
            .map_err(|e| StateError::backend_context("fail_stale_dags: query", e))?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let now = now_ts();
        for id in &stale {
            tx.execute(
                "UPDATE dag_nodes SET status = 'failed', error_message = $1, completed_at = $2 \
                 WHERE dag_id = $3 AND status = 'running'",
                &[&message, &now, id],
            )
            .map_err(|e| StateError::backend_context("fail_stale_dags: node", e))?;
            tx.execute(
                "UPDATE dags SET status = 'failed', completed_at = $1, updated_at = $1 \
                 WHERE id = $2",
                &[&now, id],
            )
            .map_err(|e| StateError::backend_context("fail_stale_dags: dag", e))?;
        }
        Self::commit(tx, "fail_stale_dags")?;
        Ok(stale.into_iter().map(DagId::new).collect())
    }
}

impl OntologyStore for PostgresStateStore {
    fn add_manual_relationship(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
        relationship: &Relationship,
    ) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "INSERT INTO relationships (project_id, datasource_id, source_table, \
                 source_column, target_table, target_column, cardinality, confidence, \
                 inference_method, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'manual', $9) \
                 ON CONFLICT (project_id, datasource_id, source_table, source_column, \
                              target_table, target_column) \
                 DO UPDATE SET cardinality = $7, confidence = $8, inference_method = 'manual'",
                &[
                    &project.as_str(),
                    &datasource.as_str(),
                    &relationship.source_table,
                    &relationship.source_column,
                    &relationship.target_table,
                    &relationship.target_column,
                    &relationship.cardinality.as_str(),
                    &relationship.confidence,
                    &now_ts(),
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
        let mut client = self.lock_client()?;
        client
            .query(
                "SELECT source_table, source_column, target_table, target_column, cardinality, \
                 confidence, inference_method FROM relationships \
                 WHERE project_id = $1 AND datasource_id = $2 \
                 ORDER BY source_table, source_column, target_table, target_column",
                &[&project.as_str(), &datasource.as_str()],
            )
            .map_err(|e| StateError::backend_context("relationships", e))?
            .iter()
            .map(|row| read_relationship_row(row).into_relationship())
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
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "replace_inferred_relationships")?;
        tx.execute(
            "DELETE FROM relationships \
             WHERE project_id = $1 AND datasource_id = $2 AND inference_method = $3",
            &[&project.as_str(), &datasource.as_str(), &method.as_str()],
        )
        .map_err(|e| StateError::backend_context("replace_inferred_relationships: delete", e))?;

        let now = now_ts();
        let mut inserted = 0u64;
        for rel in relationships {
            inserted += tx
                .execute(
                    "INSERT INTO relationships (project_id, datasource_id, source_table, \
                     source_column, target_table, target_column, cardinality, confidence, \
                     inference_method, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                     ON CONFLICT (project_id, datasource_id, source_table, source_column, \
                     target_table, target_column) DO UPDATE SET \
                     cardinality = EXCLUDED.cardinality, confidence = EXCLUDED.confidence, \
                     inference_method = EXCLUDED.inference_method, created_at = EXCLUDED.created_at \
                     WHERE relationships.inference_method <> 'manual'",
                    &[
                        &project.as_str(),
                        &datasource.as_str(),
                        &rel.source_table,
                        &rel.source_column,
                        &rel.target_table,
                        &rel.target_column,
                        &rel.cardinality.as_str(),
                        &rel.confidence,
                        &method.as_str(),
                        &now,
                    ],
                )
                .map_err(|e| {
                    StateError::backend_context("replace_inferred_relationships: insert", e)
                })?;
        }
        Self::commit(tx, "replace_inferred_relationships")?;
        Ok(inserted)
    }

    fn save_ontology(&self, ontology: &Ontology, terms: &[GlossaryTerm]) -> error::Result<()> {
        let document = serde_json::to_string(&ontology.document)?;
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "save_ontology")?;
        tx.execute(
            "INSERT INTO ontologies (id, project_id, datasource_id, dag_id, document, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &ontology.id.as_str(),
                &ontology.project_id.as_str(),
                &ontology.datasource_id.as_str(),
                &ontology.dag_id.as_str(),
                &document,
                &format_ts(ontology.created_at),
            ],
        )
        .map_err(|e| StateError::backend_context("save_ontology", e))?;
        for term in terms {
            tx.execute(
                "INSERT INTO glossary_terms (ontology_id, term, definition) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                &[&ontology.id.as_str(), &term.term, &term.definition],
            )
            .map_err(|e| StateError::backend_context("save_ontology: term", e))?;
        }
        Self::commit(tx, "save_ontology")
    }

    fn latest_ontology(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
    ) -> error::Result<Option<Ontology>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt(
                "SELECT id, dag_id, document, created_at FROM ontologies \
                 WHERE project_id = $1 AND datasource_id = $2 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                &[&project.as_str(), &datasource.as_str()],
            )
            .map_err(|e| StateError::backend_context("latest_ontology", e))?;
        row.map(|row| {
            let document: OntologyDocument = serde_json::from_str(row.get::<_, &str>(2))?;
            Ok(Ontology {
                id: OntologyId::new(row.get::<_, String>(0)),
                project_id: project.clone(),
                datasource_id: datasource.clone(),
                dag_id: DagId::new(row.get::<_, String>(1)),
                document,
                created_at: parse_ts(row.get::<_, &str>(3))?,
            })
        })
        .transpose()
    }

    fn glossary_terms(&self, project: &ProjectId) -> error::Result<Vec<GlossaryTerm>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT g.term, g.definition FROM glossary_terms g \
                 JOIN ontologies o ON o.id = g.ontology_id \
                 WHERE o.project_id = $1 ORDER BY g.term",
                &[&project.as_str()],
            )
            .map_err(|e| StateError::backend_context("glossary_terms", e))?;
        Ok(rows
            .iter()
            .map(|row| GlossaryTerm {
                term: row.get(0),
                definition: row.get(1),
            })
            .collect())
    }

    fn add_knowledge_fact(
        &self,
        project: &ProjectId,
        fact: &str,
        source: &str,
    ) -> error::Result<Option<i64>> {
        let mut client = self.lock_client()?;
        let row = client
            .query_opt(
                "INSERT INTO knowledge_facts (project_id, fact, source, created_at) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING RETURNING id",
                &[&project.as_str(), &fact, &source, &now_ts()],
            )
            .map_err(|e| StateError::backend_context("add_knowledge_fact", e))?;
        Ok(row.map(|row| row.get(0)))
    }

    fn knowledge_facts(&self, project: &ProjectId) -> error::Result<Vec<KnowledgeFact>> {
        let mut client = self.lock_client()?;
        client
            .query(
                "SELECT id, fact, source, created_at FROM knowledge_facts \
                 WHERE project_id = $1 ORDER BY id",
                &[&project.as_str()],
            )
            .map_err(|e| StateError::backend_context("knowledge_facts", e))?
            .iter()
            .map(|row| {
                Ok(KnowledgeFact {
                    id: row.get(0),
                    project_id: project.clone(),
                    fact: row.get(1),
                    source: row.get(2),
                    created_at: parse_ts(row.get::<_, &str>(3))?,
                })
            })
            .collect()
    }

    fn delete_project_ontology(&self, project: &ProjectId) -> error::Result<DeleteOutcome> {
        let mut client = self.lock_client()?;
        let mut tx = Self::begin(&mut client, "delete_project_ontology")?;
        Self::lock_project(&mut tx, project)?;

        let active = tx
            .query_opt(
                "SELECT id FROM dags WHERE project_id = $1 AND status IN ('pending', 'running') \
                 LIMIT 1",
                &[&project.as_str()],
            )
            .map_err(|e| StateError::backend_context("delete_project_ontology: check", e))?;
        if let Some(row) = active {
            return Ok(DeleteOutcome::Blocked {
                active_dag: DagId::new(row.get::<_, String>(0)),
            });
        }

        let mut step = |sql: &str, what: &str| -> error::Result<u64> {
            tx.execute(sql, &[&project.as_str()]).map_err(|e| {
                StateError::backend_context(format!("delete_project_ontology: {what}"), e)
            })
        };
        let glossary_terms = step(
            "DELETE FROM glossary_terms WHERE ontology_id IN \
             (SELECT id FROM ontologies WHERE project_id = $1)",
            "glossary terms",
        )?;
        let ontologies = step("DELETE FROM ontologies WHERE project_id = $1", "ontologies")?;
        let relationships = step(
            "DELETE FROM relationships WHERE project_id = $1 AND inference_method <> 'manual'",
            "relationships",
        )?;
        step(
            "DELETE FROM dag_nodes WHERE dag_id IN (SELECT id FROM dags WHERE project_id = $1)",
            "nodes",
        )?;
        let dags = step("DELETE FROM dags WHERE project_id = $1", "dags")?;

        Self::commit(tx, "delete_project_ontology")?;
        Ok(DeleteOutcome::Deleted(DeleteSummary {
            dags,
            ontologies,
            glossary_terms,
            relationships,
        }))
    }
}
