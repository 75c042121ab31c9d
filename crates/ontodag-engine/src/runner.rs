//! Sequential execution of one DAG.
//!
//! Nodes run strictly in order: node N+1 is started only after node N's
//! completion has been written. Every stage runs on its own task so that a
//! panic is recorded as a node failure instead of taking the runner down.
//! Status writes are retried with backoff; progress writes are best effort.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use ontodag_state::{DagStore, StateError, StateStore};
use ontodag_types::{DagId, DagStatus, NodeProgress};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::{compute_backoff, StageError};
use crate::executor::{NodeExecutor, PipelineContext, ProgressReporter, StageOutput};
use crate::orchestrator::EngineSettings;

/// Error recorded on the running node when the engine shuts down under it.
pub(crate) const SHUTDOWN_MESSAGE: &str = "interrupted by engine shutdown";

/// How a DAG execution ended, from the runner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
    /// Stopped by engine shutdown; the DAG was recorded as failed.
    Interrupted,
    /// A compare-and-set write was rejected: another actor (Cancel, the
    /// reconciler) moved the DAG on.
    Superseded,
    /// A status write kept failing; the reconciler will fail the DAG once
    /// its heartbeat goes stale.
    Abandoned,
}

pub(crate) struct DagRun {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) stages: Arc<[Arc<dyn NodeExecutor>]>,
    pub(crate) settings: EngineSettings,
    /// Fires on Cancel, on remote cancellation and on shutdown.
    pub(crate) cancel: CancellationToken,
    pub(crate) shutdown: CancellationToken,
}

impl DagRun {
    pub(crate) async fn run(self, mut ctx: PipelineContext) -> RunOutcome {
        let watcher = tokio::spawn(watch_dag(
            Arc::clone(&self.store),
            ctx.dag_id.clone(),
            self.cancel.clone(),
            self.settings.cancel_poll_interval,
        ));

        let outcome = match self.walk(&mut ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    dag_id = %ctx.dag_id,
                    error = %e,
                    "Status write failed after retries, abandoning DAG"
                );
                RunOutcome::Abandoned
            }
        };
        watcher.abort();

        tracing::info!(
            dag_id = %ctx.dag_id,
            datasource = %ctx.datasource_id,
            outcome = ?outcome,
            "DAG execution finished"
        );
        outcome
    }

    async fn walk(&self, ctx: &mut PipelineContext) -> Result<RunOutcome, StateError> {
        let dag = ctx.dag_id.clone();

        for (order, stage) in (1u32..).zip(self.stages.iter()) {
            if self.cancel.is_cancelled() {
                return self.stop_between_nodes(&dag).await;
            }

            let started = self
                .status_write("start_node", {
                    let dag = dag.clone();
                    move |s: &dyn StateStore| s.start_node(&dag, order)
                })
                .await?;
            if !started {
                return Ok(RunOutcome::Superseded);
            }
            tracing::info!(dag_id = %dag, node = stage.name(), order, "Node started");

            match self.run_stage(stage, ctx, order).await {
                Ok(output) => {
                    ctx.absorb(output);
                    let completed = self
                        .status_write("complete_node", {
                            let dag = dag.clone();
                            move |s: &dyn StateStore| s.complete_node(&dag, order)
                        })
                        .await?;
                    if !completed {
                        return Ok(RunOutcome::Superseded);
                    }
                    tracing::info!(dag_id = %dag, node = stage.name(), order, "Node completed");
                }
                Err(StageError::Cancelled) => return self.stop_in_node(&dag, order).await,
                Err(StageError::Failed(message)) => {
                    tracing::error!(
                        dag_id = %dag,
                        node = stage.name(),
                        order,
                        error = %message,
                        "Node failed"
                    );
                    let dag = dag.clone();
                    self.status_write("fail_node", move |s: &dyn StateStore| {
                        s.fail_node(&dag, order, &message)
                    })
                    .await?;
                    return Ok(RunOutcome::Failed);
                }
            }
        }

        let ontology = ctx.ontology_id.clone();
        let finished = self
            .status_write("finish_dag", move |s: &dyn StateStore| {
                s.finish_dag(&dag, DagStatus::Completed, ontology.as_ref())
            })
            .await?;
        Ok(if finished {
            RunOutcome::Completed
        } else {
            RunOutcome::Superseded
        })
    }

    /// The stage observed cancellation while node `order` was running.
    async fn stop_in_node(&self, dag: &DagId, order: u32) -> Result<RunOutcome, StateError> {
        if self.shutdown.is_cancelled() {
            let dag = dag.clone();
            self.status_write("fail_node", move |s: &dyn StateStore| {
                s.fail_node(&dag, order, SHUTDOWN_MESSAGE)
            })
            .await?;
            return Ok(RunOutcome::Interrupted);
        }
        // Usually already durable through Engine::cancel; the write matters
        // when the token fired for another reason.
        let dag = dag.clone();
        self.status_write("finish_dag", move |s: &dyn StateStore| {
            s.finish_dag(&dag, DagStatus::Cancelled, None)
        })
        .await?;
        Ok(RunOutcome::Cancelled)
    }

    async fn stop_between_nodes(&self, dag: &DagId) -> Result<RunOutcome, StateError> {
        let (status, outcome) = if self.shutdown.is_cancelled() {
            (DagStatus::Failed, RunOutcome::Interrupted)
        } else {
            (DagStatus::Cancelled, RunOutcome::Cancelled)
        };
        let dag = dag.clone();
        self.status_write("finish_dag", move |s: &dyn StateStore| {
            s.finish_dag(&dag, status, None)
        })
        .await?;
        Ok(outcome)
    }

    /// Run one stage on its own task, persisting its progress as it goes.
    /// The last reported progress is written before this returns.
    async fn run_stage(
        &self,
        stage: &Arc<dyn NodeExecutor>,
        ctx: &PipelineContext,
        order: u32,
    ) -> Result<StageOutput, StageError> {
        let (reporter, progress_rx) = ProgressReporter::channel();
        let persister = tokio::spawn(persist_progress(
            Arc::clone(&self.store),
            ctx.dag_id.clone(),
            order,
            progress_rx,
        ));

        let task = {
            let stage = Arc::clone(stage);
            let cancel = self.cancel.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { stage.execute(&cancel, &ctx, &reporter).await })
        };

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(StageError::failed(format!(
                "stage panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))),
            Err(e) => Err(StageError::failed(format!("stage task aborted: {e}"))),
        };

        if let Err(e) = persister.await {
            tracing::warn!(dag_id = %ctx.dag_id, order, error = %e, "Progress writer task failed");
        }
        result
    }

    /// Apply a compare-and-set status write, retrying storage errors with
    /// exponential backoff. `Ok(false)` means the precondition no longer
    /// holds and is never retried.
    async fn status_write<F>(&self, op: &'static str, write: F) -> Result<bool, StateError>
    where
        F: Fn(&dyn StateStore) -> ontodag_state::error::Result<bool> + Clone + Send + 'static,
    {
        let max_retries = self.settings.status_write_retries;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let store = Arc::clone(&self.store);
            let call = write.clone();
            let err = match tokio::task::spawn_blocking(move || call(store.as_ref())).await {
                Ok(Ok(applied)) => return Ok(applied),
                Ok(Err(e)) => e,
                Err(e) => StateError::backend_context(op, e),
            };
            if attempt > max_retries {
                return Err(err);
            }
            let delay = compute_backoff(attempt);
            #[allow(clippy::cast_possible_truncation)]
            // Safety: the backoff is capped at a few seconds
            let delay_ms = delay.as_millis() as u64;
            tracing::warn!(
                op,
                attempt,
                max_retries,
                delay_ms,
                error = %err,
                "Status write failed, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Drain progress updates until the reporter is dropped.
async fn persist_progress(
    store: Arc<dyn StateStore>,
    dag: DagId,
    order: u32,
    mut rx: watch::Receiver<Option<NodeProgress>>,
) {
    let mut written = None;
    while rx.changed().await.is_ok() {
        let latest = rx.borrow_and_update().clone();
        write_progress(&store, &dag, order, latest, &mut written).await;
    }
    let latest = rx.borrow().clone();
    write_progress(&store, &dag, order, latest, &mut written).await;
}

async fn write_progress(
    store: &Arc<dyn StateStore>,
    dag: &DagId,
    order: u32,
    latest: Option<NodeProgress>,
    written: &mut Option<NodeProgress>,
) {
    let Some(progress) = latest else {
        return;
    };
    if written.as_ref() == Some(&progress) {
        return;
    }

    let store = Arc::clone(store);
    let dag_id = dag.clone();
    let update = progress.clone();
    match tokio::task::spawn_blocking(move || store.record_progress(&dag_id, order, &update)).await
    {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            tracing::debug!(dag_id = %dag, order, "Progress dropped, node no longer running");
        }
        Ok(Err(e)) => {
            tracing::warn!(dag_id = %dag, order, error = %e, "Failed to persist node progress");
        }
        Err(e) => {
            tracing::warn!(dag_id = %dag, order, error = %e, "Progress write task failed");
        }
    }
    *written = Some(progress);
}

/// Heartbeat the DAG once per `interval` and fire `cancel` when the DAG is
/// no longer running in the store (cancelled by another replica, or
/// reconciled as abandoned).
async fn watch_dag(
    store: Arc<dyn StateStore>,
    dag: DagId,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }

        let s = Arc::clone(&store);
        let id = dag.clone();
        match tokio::task::spawn_blocking(move || s.heartbeat(&id)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                tracing::info!(dag_id = %dag, "DAG no longer running in the store, stopping execution");
                cancel.cancel();
                return;
            }
            Ok(Err(e)) => tracing::warn!(dag_id = %dag, error = %e, "DAG heartbeat failed"),
            Err(e) => tracing::warn!(dag_id = %dag, error = %e, "DAG heartbeat task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontodag_state::{DagStore, SqliteStateStore};
    use ontodag_types::{DatasourceId, NodeStatus, ProjectId};

    struct Reporting;

    #[async_trait::async_trait]
    impl NodeExecutor for Reporting {
        fn name(&self) -> &str {
            "Reporting"
        }

        async fn execute(
            &self,
            _: &CancellationToken,
            _: &PipelineContext,
            progress: &ProgressReporter,
        ) -> Result<StageOutput, StageError> {
            for i in 0..=10 {
                progress.report(i, 10, format!("step {i}"));
            }
            Ok(StageOutput::Done)
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl NodeExecutor for Panicking {
        fn name(&self) -> &str {
            "Panicking"
        }

        async fn execute(
            &self,
            _: &CancellationToken,
            _: &PipelineContext,
            progress: &ProgressReporter,
        ) -> Result<StageOutput, StageError> {
            progress.report(1, 3, "about to fail");
            panic!("boom");
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            cancel_poll_interval: Duration::from_millis(20),
            ..EngineSettings::default()
        }
    }

    fn start(store: &SqliteStateStore, names: &[&str]) -> PipelineContext {
        let names: Vec<String> = names.iter().map(ToString::to_string).collect();
        let dag = store
            .create_or_get_active(&ProjectId::new("p"), &DatasourceId::new("ds"), &names)
            .unwrap()
            .into_dag();
        assert!(store.mark_running(&dag.id).unwrap());
        PipelineContext::new(dag.project_id, dag.datasource_id, dag.id, None)
    }

    fn run_with(store: Arc<SqliteStateStore>, stages: Vec<Arc<dyn NodeExecutor>>) -> DagRun {
        DagRun {
            store,
            stages: stages.into(),
            settings: settings(),
            cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn completed_node_keeps_no_progress_and_dag_completes() {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        let ctx = start(&store, &["Reporting"]);
        let id = ctx.dag_id.clone();

        let outcome = run_with(Arc::clone(&store), vec![Arc::new(Reporting)])
            .run(ctx)
            .await;

        assert_eq!(outcome, RunOutcome::Completed);
        let dag = store.get_dag(&id).unwrap().unwrap();
        assert_eq!(dag.status, DagStatus::Completed);
        assert!(dag.completed_at.is_some());
        assert_eq!(dag.nodes[0].status, NodeStatus::Completed);
        assert!(dag.nodes[0].progress.is_none());
        assert!(dag.invariant_violations().is_empty());
    }

    #[tokio::test]
    async fn panic_is_recorded_as_node_failure() {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        let ctx = start(&store, &["Reporting", "Panicking", "Reporting"]);
        let id = ctx.dag_id.clone();

        let outcome = run_with(
            Arc::clone(&store),
            vec![Arc::new(Reporting), Arc::new(Panicking), Arc::new(Reporting)],
        )
        .run(ctx)
        .await;

        assert_eq!(outcome, RunOutcome::Failed);
        let dag = store.get_dag(&id).unwrap().unwrap();
        assert_eq!(dag.status, DagStatus::Failed);
        let failed = &dag.nodes[1];
        assert_eq!(failed.status, NodeStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("stage panicked: boom"));
        assert_eq!(failed.progress.as_ref().unwrap().message, "about to fail");
        assert_eq!(dag.nodes[2].status, NodeStatus::Pending);
        assert!(dag.invariant_violations().is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_run_cancels_without_starting_nodes() {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        let ctx = start(&store, &["Reporting"]);
        let id = ctx.dag_id.clone();
        let run = run_with(Arc::clone(&store), vec![Arc::new(Reporting)]);
        run.cancel.cancel();

        assert_eq!(run.run(ctx).await, RunOutcome::Cancelled);
        let dag = store.get_dag(&id).unwrap().unwrap();
        assert_eq!(dag.status, DagStatus::Cancelled);
        assert_eq!(dag.nodes[0].status, NodeStatus::Pending);
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic payload");
    }
}
