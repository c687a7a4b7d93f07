//! Typed engine errors.
//!
//! Orchestration code uses `anyhow` at the boundaries (CLI, batch loop) but
//! the engine contracts surface these kinds so callers can branch on them:
//! per-mention resolution failures are skipped, conflict exhaustion and
//! upstream timeouts are retryable, and query errors map to empty results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or unresolvable mention. The mention is logged and skipped;
    /// the batch continues.
    #[error("malformed mention: {0}")]
    Resolution(String),

    /// Entity-creation race did not converge within the retry budget. The
    /// batch item can be re-queued; reprocessing is idempotent.
    #[error("entity creation for ({name}, {entity_type}) did not converge after {attempts} attempts")]
    ConflictRetryExhausted {
        name: String,
        entity_type: String,
        attempts: u32,
    },

    /// Query references an entity that does not exist. Callers receive an
    /// empty result set, never this error.
    #[error("query references unknown entity: {0}")]
    Query(String),

    /// External collaborator call exceeded its deadline after bounded
    /// retries. The item is parked for later reprocessing.
    #[error("upstream call timed out after {attempts} attempts: {context}")]
    UpstreamTimeout { context: String, attempts: u32 },

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
