use thiserror::Error;

/// Domain-level error shared by the store, the providers, and the
/// reconciliation loops. Anything that crosses a component boundary comes
/// back as one of these rather than a bare `sqlx::Error` or `String`.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cloud request failed ({code}): {message}")]
    CloudRequest { code: String, message: String },

    #[error("cloud request timed out after {0:?}")]
    CloudTimeout(std::time::Duration),

    #[error("duplicate event, already recorded")]
    Dedup,

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("transient error, retry: {0}")]
    Transient(String),
}

impl FleetError {
    /// Whether a caller should treat this as worth retrying rather than
    /// escalating. Used by the Iterator loop to decide whether a failed
    /// pass counts against `maxConsecutiveFailures`.
    pub fn is_transient(&self) -> bool {
        match self {
            FleetError::Transient(_) | FleetError::CloudTimeout(_) => true,
            FleetError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// True when a Postgres unique-violation (SQLSTATE 23505) underlies this
    /// error — the shape every dedup/idempotent-insert call site checks for.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            FleetError::Database(sqlx::Error::Database(db)) => {
                db.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
