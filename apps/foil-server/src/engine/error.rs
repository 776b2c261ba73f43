/// Failure taxonomy for engine operations. API handlers translate these into
/// problem+json responses; workers use them to decide between retry and DLQ.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("case {case_id} already has an active run {active_run_id} ({status})")]
    Conflict {
        case_id: String,
        active_run_id: String,
        status: String,
    },
    #[error("expected status {expected}, found {current}")]
    StaleState { expected: String, current: String },
    #[error("proposal was already executed at {executed_at}")]
    AlreadyExecuted {
        executed_at: String,
        job_id: Option<String>,
    },
    #[error("blocked by policy: {}", violations.join("; "))]
    PolicyBlocked { violations: Vec<String> },
    #[error("case lock is contended")]
    LockContention,
    #[error("work submission failed: {0}")]
    Submission(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Contention is the only variant worth retrying blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockContention)
    }
}
