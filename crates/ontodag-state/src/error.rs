//! State store error types.

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by [`DagStore`](crate::DagStore) and
/// [`OntologyStore`](crate::OntologyStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying database failure.
    #[error("state backend error: {0}")]
    Backend(#[source] BoxError),

    /// Database failure annotated with the operation that hit it.
    #[error("{context}: {source}")]
    BackendContext {
        context: String,
        #[source]
        source: BoxError,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded into the domain model.
    #[error("corrupt state record: {0}")]
    Corrupt(String),

    /// JSON document (de)serialization failure.
    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,
}

impl StateError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    pub fn backend_context(
        context: impl Into<String>,
        err: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendContext {
            context: context.into(),
            source: Box::new(err),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
