//! Error taxonomy for the scheduler, task pools, and fences.

/// Failure modes surfaced by scheduler construction and task-pool operations.
///
/// Task-pool operations additionally record the same information as a
/// per-pool error tag (see [`crate::task_pool::TaskPool::get_pool_error`])
/// since the original interface returns a sentinel id rather than a `Result`
/// — callers that want the reason call `get_pool_error` after seeing
/// `INVALID_TASK_ID` come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("task pool has no free slots")]
    PoolFull,
    #[error("task id is stale or malformed")]
    InvalidId,
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("arena exhausted")]
    OutOfMemory,
    #[error("worker thread init callback failed")]
    InitFailed,
    #[error("operation attempted after scheduler shutdown began")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
