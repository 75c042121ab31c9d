//! Engine lifecycle: start, observe, cancel, delete and shut down DAG runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use ontodag_state::{
    CancelOutcome, CreateOutcome, DagStore, DeleteOutcome, DeleteSummary, OntologyStore,
    StateStore,
};
use ontodag_types::view::StatusResponse;
use ontodag_types::{Dag, DagId, DagStatus, DatasourceId, NodeStatus, ProjectId, Relationship};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::types::EngineConfig;
use crate::errors::EngineError;
use crate::executor::{NodeExecutor, PipelineContext};
use crate::runner::{DagRun, SHUTDOWN_MESSAGE};

/// Error recorded on nodes of DAGs whose execution disappeared.
pub const ABANDONED_MESSAGE: &str = "execution abandoned";

/// Timing knobs of an [`Engine`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Heartbeat and remote-cancellation polling period of a running DAG.
    pub cancel_poll_interval: Duration,
    /// Retries of a failed status write before the run is abandoned.
    pub status_write_retries: u32,
    pub reconcile_interval: Duration,
    /// Heartbeat age after which a non-terminal DAG is considered abandoned.
    pub stale_after: Duration,
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            cancel_poll_interval: Duration::from_millis(config.cancel_poll_interval_ms),
            status_write_retries: config.status_write_retries,
            reconcile_interval: Duration::from_secs(config.reconcile_interval_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

type Registry = Arc<Mutex<HashMap<DagId, CancellationToken>>>;

struct Inner {
    store: Arc<dyn StateStore>,
    stages: Arc<[Arc<dyn NodeExecutor>]>,
    settings: EngineSettings,
    shutdown: CancellationToken,
    /// Cancellation tokens of the executions owned by this process.
    running: Registry,
    tasks: Mutex<JoinSet<()>>,
}

/// Runs extraction pipelines as persisted DAGs.
///
/// Cheap to clone; clones share the same executions.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn blocking<T, F>(store: &Arc<dyn StateStore>, f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&dyn StateStore) -> ontodag_state::error::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| EngineError::Infrastructure(anyhow::anyhow!("state store task failed: {e}")))?;
    Ok(result?)
}

async fn reconcile_stale(
    store: &Arc<dyn StateStore>,
    stale_after: Duration,
) -> Result<Vec<DagId>, EngineError> {
    let window = chrono::Duration::from_std(stale_after)
        .map_err(|e| EngineError::Infrastructure(anyhow::anyhow!("invalid staleness window: {e}")))?;
    let cutoff = Utc::now() - window;
    let reconciled =
        blocking(store, move |s| s.fail_stale_dags(cutoff, ABANDONED_MESSAGE)).await?;
    for dag_id in &reconciled {
        tracing::warn!(dag_id = %dag_id, "Failed abandoned DAG");
    }
    Ok(reconciled)
}

impl Engine {
    /// Build an engine over `store` running `stages` in order.
    ///
    /// Reconciles abandoned DAGs once before returning and keeps doing so
    /// every `settings.reconcile_interval` until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if `stages` is empty or the initial reconciliation
    /// fails.
    pub async fn new(
        store: Arc<dyn StateStore>,
        stages: Vec<Arc<dyn NodeExecutor>>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        if stages.is_empty() {
            return Err(EngineError::Infrastructure(anyhow::anyhow!(
                "pipeline must contain at least one stage"
            )));
        }

        let engine = Self {
            inner: Arc::new(Inner {
                store,
                stages: stages.into(),
                settings,
                shutdown: CancellationToken::new(),
                running: Registry::default(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        };

        engine.reconcile().await?;
        engine.spawn_reconciler();

        tracing::info!(
            stages = engine.inner.stages.len(),
            stale_after_secs = settings.stale_after.as_secs(),
            "Engine started"
        );
        Ok(engine)
    }

    fn spawn_reconciler(&self) {
        let store = Arc::clone(&self.inner.store);
        let shutdown = self.inner.shutdown.clone();
        let settings = self.inner.settings;
        lock(&self.inner.tasks).spawn(async move {
            let mut ticker = tokio::time::interval(settings.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = reconcile_stale(&store, settings.stale_after).await {
                    tracing::warn!(error = %e, "Periodic reconciliation failed");
                }
            }
        });
    }

    /// Node names of the configured pipeline, in order.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.inner
            .stages
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Start an extraction for `datasource`, or return the one already
    /// active. A new DAG is returned in `running` state while its nodes
    /// execute in the background.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] after [`Engine::shutdown`], or
    /// a storage error.
    pub async fn start(
        &self,
        project: ProjectId,
        datasource: DatasourceId,
        overview: Option<String>,
    ) -> Result<Dag, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let names = self.node_names();
        let outcome = {
            let (project, datasource) = (project.clone(), datasource.clone());
            blocking(&self.inner.store, move |s| {
                s.create_or_get_active(&project, &datasource, &names)
            })
            .await?
        };
        let dag = match outcome {
            CreateOutcome::Existing(dag) => {
                tracing::info!(
                    dag_id = %dag.id,
                    datasource = %datasource,
                    status = %dag.status,
                    "Extraction already active, returning it"
                );
                return Ok(dag);
            }
            CreateOutcome::Created(dag) => dag,
        };

        let id = dag.id.clone();
        let marked = {
            let id = id.clone();
            blocking(&self.inner.store, move |s| s.mark_running(&id)).await?
        };
        let dag = {
            let id = id.clone();
            blocking(&self.inner.store, move |s| s.get_dag(&id)).await?
        }
        .ok_or_else(|| EngineError::DagNotFound(id.clone()))?;
        if !marked {
            // Cancelled between creation and start.
            return Ok(dag);
        }

        tracing::info!(
            dag_id = %id,
            project = %project,
            datasource = %datasource,
            nodes = dag.nodes.len(),
            "Extraction started"
        );
        self.spawn_run(PipelineContext::new(project, datasource, id, overview));
        Ok(dag)
    }

    fn spawn_run(&self, ctx: PipelineContext) {
        let cancel = self.inner.shutdown.child_token();
        lock(&self.inner.running).insert(ctx.dag_id.clone(), cancel.clone());

        let run = DagRun {
            store: Arc::clone(&self.inner.store),
            stages: Arc::clone(&self.inner.stages),
            settings: self.inner.settings,
            cancel,
            shutdown: self.inner.shutdown.clone(),
        };
        let running = Arc::clone(&self.inner.running);
        let dag_id = ctx.dag_id.clone();

        let mut tasks = lock(&self.inner.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            run.run(ctx).await;
            lock(&running).remove(&dag_id);
        });
    }

    /// Latest DAG of `datasource`, active or most recently finished.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_status(&self, datasource: &DatasourceId) -> Result<Option<Dag>, EngineError> {
        let datasource = datasource.clone();
        blocking(&self.inner.store, move |s| s.latest_dag(&datasource)).await
    }

    /// [`Engine::get_status`] shaped for a transport layer.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn status_view(&self, datasource: &DatasourceId) -> Result<StatusResponse, EngineError> {
        let dag = self.get_status(datasource).await?;
        Ok(StatusResponse::from(dag.as_ref()))
    }

    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn get_dag(&self, dag_id: &DagId) -> Result<Option<Dag>, EngineError> {
        let dag_id = dag_id.clone();
        blocking(&self.inner.store, move |s| s.get_dag(&dag_id)).await
    }

    /// Relationships recorded for a datasource, inferred and manual.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn relationships(
        &self,
        project: &ProjectId,
        datasource: &DatasourceId,
    ) -> Result<Vec<Relationship>, EngineError> {
        let (project, datasource) = (project.clone(), datasource.clone());
        blocking(&self.inner.store, move |s| s.relationships(&project, &datasource)).await
    }

    /// Durably cancel a pending or running DAG and signal its execution if
    /// this process owns it. Executions in other processes notice on their
    /// next heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DagNotFound`] for an unknown id and
    /// [`EngineError::NotRunning`] for a terminal DAG.
    pub async fn cancel(&self, dag_id: &DagId) -> Result<(), EngineError> {
        let outcome = {
            let dag_id = dag_id.clone();
            blocking(&self.inner.store, move |s| s.cancel_dag(&dag_id)).await?
        };
        match outcome {
            CancelOutcome::Cancelled => {
                let local = lock(&self.inner.running).get(dag_id).cloned();
                if let Some(token) = &local {
                    token.cancel();
                }
                tracing::info!(dag_id = %dag_id, local = local.is_some(), "Extraction cancelled");
                Ok(())
            }
            CancelOutcome::NotFound => Err(EngineError::DagNotFound(dag_id.clone())),
            CancelOutcome::NotRunning(status) => Err(EngineError::NotRunning {
                dag_id: dag_id.clone(),
                status,
            }),
        }
    }

    /// Remove everything extraction produced for `project`. Knowledge facts
    /// and manual relationships are kept.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ExtractionRunning`] while a DAG of the project
    /// is pending or running.
    pub async fn delete(&self, project: &ProjectId) -> Result<DeleteSummary, EngineError> {
        let outcome = {
            let project = project.clone();
            blocking(&self.inner.store, move |s| s.delete_project_ontology(&project)).await?
        };
        match outcome {
            DeleteOutcome::Deleted(summary) => {
                tracing::info!(
                    project = %project,
                    dags = summary.dags,
                    ontologies = summary.ontologies,
                    glossary_terms = summary.glossary_terms,
                    relationships = summary.relationships,
                    "Project ontology deleted"
                );
                Ok(summary)
            }
            DeleteOutcome::Blocked { active_dag } => Err(EngineError::ExtractionRunning {
                project: project.clone(),
                active_dag,
            }),
        }
    }

    /// Fail non-terminal DAGs whose heartbeat is older than the staleness
    /// window. Returns the ids of the DAGs that were failed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn reconcile(&self) -> Result<Vec<DagId>, EngineError> {
        reconcile_stale(&self.inner.store, self.inner.settings.stale_after).await
    }

    /// Stop accepting new extractions, cancel the running ones and wait up
    /// to the grace period for them to record their interruption. Runs that
    /// outlast the grace period are aborted and failed here.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(
            running = lock(&self.inner.running).len(),
            "Engine shutting down"
        );
        self.inner.shutdown.cancel();

        let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        let drained = tokio::time::timeout(self.inner.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return;
        }

        tracing::warn!(
            remaining = tasks.len(),
            "Shutdown grace period elapsed, aborting executions"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let leftover: Vec<DagId> = lock(&self.inner.running).drain().map(|(id, _)| id).collect();
        for dag_id in leftover {
            if let Err(e) = self.fail_interrupted(&dag_id).await {
                tracing::error!(dag_id = %dag_id, error = %e, "Failed to record interrupted DAG");
            }
        }
    }

    /// Record an aborted execution as failed: its running node (if any)
    /// and the DAG.
    async fn fail_interrupted(&self, dag_id: &DagId) -> Result<(), EngineError> {
        let Some(dag) = self.get_dag(dag_id).await? else {
            return Ok(());
        };
        if dag.status != DagStatus::Running {
            return Ok(());
        }
        let id = dag_id.clone();
        match dag.nodes.iter().find(|n| n.status == NodeStatus::Running) {
            Some(node) => {
                let order = node.order;
                blocking(&self.inner.store, move |s| {
                    s.fail_node(&id, order, SHUTDOWN_MESSAGE)
                })
                .await?;
            }
            None => {
                blocking(&self.inner.store, move |s| {
                    s.finish_dag(&id, DagStatus::Failed, None)
                })
                .await?;
            }
        }
        Ok(())
    }
}
