use thiserror::Error;

/// Why a single target failed within a cycle. None of these abort the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited by target site")]
    RateLimited,

    #[error("blocked by verification challenge")]
    Blocked,

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("persistence failed after {attempts} attempt(s): {reason}")]
    Persistence { attempts: u32, reason: String },
}

impl TargetError {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetError::Authentication(_) => "auth",
            TargetError::RateLimited => "rate_limited",
            TargetError::Blocked => "blocked",
            TargetError::Transient(_) => "transient",
            TargetError::Persistence { .. } => "persistence",
        }
    }
}

/// Preconditions whose failure aborts a whole cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("another cycle holds the run lock at {0} (pid {1})")]
    LockHeld(String, String),

    #[error("could not manage run lock: {0}")]
    Lock(#[from] std::io::Error),
}
