//! Engine error types
//!
//! Errors fall into three families: structural errors (bad composition,
//! unknown names) surface immediately from `run`; branch execution errors
//! are captured on the failing node and never propagate past the stage;
//! unsupported operations (async work on a sync-only executor) surface
//! immediately as well.

use thiserror::Error;

/// Boxed error type used at the task-callable boundary.
///
/// Task functions return whatever error they like behind this alias; the
/// engine only ever records the rendered message on the failing node.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by workflow construction and execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A workflow was run with no stages.
    #[error("workflow `{0}` has no stages to run")]
    EmptyWorkflow(String),

    /// A name lookup did not match any task or workflow in the running tree.
    #[error("no task or workflow named `{0}` is reachable from the running tree")]
    UnknownTask(String),

    /// Every live branch of a stage failed, so nothing can proceed.
    #[error("stage {stage} of workflow `{workflow}` failed: {error}")]
    StageFailed {
        workflow: String,
        stage: usize,
        error: String,
    },

    /// Async execution was requested where only synchronous branches run.
    #[error("async execution is not supported here: {0}")]
    AsyncUnsupported(String),

    /// A `starmap` item was neither a positional array nor a kwargs object.
    #[error("starmap items must be arrays or objects, got {0}")]
    InvalidStarArgs(String),

    /// A task name was not found in the process registry.
    #[error("task `{0}` is not registered for process execution")]
    UnregisteredTask(String),

    /// The process pool was given a branch it cannot ship to a worker.
    #[error("the process pool can only run registry-backed tasks, found `{0}`")]
    ProcessPoolBranch(String),

    /// A worker process died or misbehaved.
    #[error("worker process error: {0}")]
    Worker(String),

    /// The worker wire protocol produced an unexpected message.
    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// A context operation failed (remote transport or invalid target).
    #[error("context error: {0}")]
    Context(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
