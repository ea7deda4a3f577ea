use thiserror::Error;

/// Failure taxonomy for the reconciliation engine.
///
/// `StoreUnavailable` wraps substrate faults and is always safe to retry;
/// everything else describes a problem with the request itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or schema-incomplete proposal, caught at ingestion.
    #[error("invalid proposal: {0}")]
    Validation(String),

    /// Edit/delete target missing. The proposal stays Pending.
    #[error("not found: {0}")]
    NotFound(String),

    /// Edit whose payload would not change target state.
    #[error("edit would not change target state")]
    NoOpEdit,

    /// The underlying key-value substrate failed. Safe to retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),

    /// The proposal already left Pending; its effect must not be repeated.
    #[error("proposal {0} is already resolved")]
    AlreadyResolved(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
