//! Engine and stage error model, plus the status-write backoff policy.

use std::time::Duration;

use ontodag_state::StateError;
use ontodag_types::{DagId, DagStatus, ProjectId};

use crate::discovery::DiscoveryError;

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 5_000;

/// Errors surfaced to callers of [`Engine`](crate::Engine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("DAG {0} not found")]
    DagNotFound(DagId),

    #[error("DAG {dag_id} is not running (status: {status})")]
    NotRunning { dag_id: DagId, status: DagStatus },

    #[error(
        "cannot delete ontology of project {project} while extraction {active_dag} is running; \
         cancel it first"
    )]
    ExtractionRunning {
        project: ProjectId,
        active_dag: DagId,
    },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    State(#[from] StateError),

    /// Host-side failures: blocking pool join errors, configuration, etc.
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl EngineError {
    /// HTTP status a transport layer should answer with.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::DagNotFound(_) => 404,
            Self::NotRunning { .. } => 400,
            Self::ShuttingDown => 503,
            Self::ExtractionRunning { .. } | Self::State(_) | Self::Infrastructure(_) => 500,
        }
    }
}

/// Outcome of a failed [`NodeExecutor`](crate::NodeExecutor) run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// The cancellation signal was observed; partial work is abandoned.
    #[error("stage cancelled")]
    Cancelled,

    /// User-displayable failure; recorded as the node's error message.
    #[error("{0}")]
    Failed(String),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<StateError> for StageError {
    fn from(e: StateError) -> Self {
        Self::Failed(e.to_string())
    }
}

impl From<DiscoveryError> for StageError {
    fn from(e: DiscoveryError) -> Self {
        Self::Failed(format!("schema discovery failed: {e}"))
    }
}

/// Delay before retry `attempt` (1-based) of a status write.
pub(crate) fn compute_backoff(attempt: u32) -> Duration {
    let delay_ms = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}
