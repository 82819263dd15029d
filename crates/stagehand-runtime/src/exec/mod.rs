//! Stage execution backends
//!
//! Three executors share one contract: run every branch of a stage, capture
//! per-branch outcomes without letting one failure cancel siblings, and hand
//! results back in declaration order.
//!
//! - [`Executor::Sequential`]: branches run one after another in the calling
//!   thread (default).
//! - [`Executor::Threads`]: branches run on a bounded pool of worker
//!   threads.
//! - [`Executor::Processes`]: each branch runs in a pooled worker process;
//!   only registry-backed tasks can cross the process boundary.

pub mod process_pool;
pub mod thread_pool;
pub mod worker;

use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::error::{BoxError, EngineError};
use crate::node::Node;
use crate::task::{Kwargs, TaskState};

pub use process_pool::{ProcessPool, WorkerCommand};
pub use thread_pool::ThreadPool;

/// One branch of a stage, ready to execute: the node plus the input computed
/// from the previous stage's flattened results and any explicit runtime
/// arguments.
pub(crate) struct BranchJob {
    pub node: Node,
    pub input: Vec<Value>,
    pub kwargs: Kwargs,
}

/// What happened to a stage: how many branches ran and how many succeeded.
#[derive(Debug, Default)]
pub(crate) struct StageOutcome {
    pub executed: usize,
    pub succeeded: usize,
    pub first_error: Option<String>,
}

/// Pluggable concurrency backend for a workflow.
#[derive(Clone, Default)]
pub enum Executor {
    #[default]
    Sequential,
    Threads(Arc<ThreadPool>),
    Processes(Arc<ProcessPool>),
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executor::Sequential => write!(f, "Sequential"),
            Executor::Threads(pool) => write!(f, "Threads(size={})", pool.size()),
            Executor::Processes(pool) => write!(f, "Processes(size={})", pool.size()),
        }
    }
}

impl Executor {
    /// Convenience constructor for a thread-pool executor.
    pub fn threads(size: usize) -> Self {
        Executor::Threads(Arc::new(ThreadPool::new(size)))
    }

    /// Convenience constructor for a process-pool executor.
    pub fn processes(pool: ProcessPool) -> Self {
        Executor::Processes(Arc::new(pool))
    }

    /// Run one stage synchronously.
    pub(crate) fn run_stage(
        &self,
        ctx: &Context,
        jobs: Vec<BranchJob>,
    ) -> Result<StageOutcome, EngineError> {
        match self {
            Executor::Sequential => {
                reject_async(&jobs, "synchronous run")?;
                run_sequential(ctx, jobs)
            }
            Executor::Threads(pool) => {
                reject_async(&jobs, "the thread-pool executor")?;
                pool.run_stage(ctx, jobs)
            }
            Executor::Processes(pool) => pool.run_stage(ctx, jobs),
        }
    }

    /// Run one stage awaiting async-capable branches. Sequential only.
    pub(crate) async fn run_stage_async(
        &self,
        ctx: &Context,
        jobs: Vec<BranchJob>,
    ) -> Result<StageOutcome, EngineError> {
        match self {
            Executor::Sequential => run_sequential_async(ctx, jobs).await,
            Executor::Threads(_) => Err(EngineError::AsyncUnsupported(
                "the thread-pool executor is sync-only".to_string(),
            )),
            Executor::Processes(_) => Err(EngineError::AsyncUnsupported(
                "the process-pool executor is sync-only".to_string(),
            )),
        }
    }
}

/// Async branches fail immediately on sync-only paths rather than surfacing
/// as ordinary branch failures.
fn reject_async(jobs: &[BranchJob], location: &str) -> Result<(), EngineError> {
    for job in jobs {
        if job.node.is_async() {
            return Err(EngineError::AsyncUnsupported(format!(
                "async task `{}` cannot run on {location}",
                job.node.name()
            )));
        }
    }
    Ok(())
}

/// Execute one branch: dispatch on node kind, returning the raw outcome.
pub(crate) fn execute_branch(
    node: &Node,
    ctx: &Context,
    input: &[Value],
    kwargs: &Kwargs,
) -> Result<Value, BoxError> {
    match node {
        Node::Task(task) => task.invoke(Some(ctx), input, kwargs),
        Node::Workflow(workflow) => workflow
            .run_as_branch(ctx, input.to_vec(), kwargs.clone())
            .map_err(|e| Box::new(e) as BoxError),
    }
}

/// Record one branch outcome on its node, in declaration order.
pub(crate) fn apply_outcome(
    node: &Node,
    outcome: Result<Value, String>,
    stage: &mut StageOutcome,
) {
    stage.executed += 1;
    match outcome {
        Ok(value) => {
            node.complete(value);
            stage.succeeded += 1;
        }
        Err(error) => {
            tracing::warn!(branch = %node.name(), error = %error, "branch failed");
            if stage.first_error.is_none() {
                stage.first_error = Some(error.clone());
            }
            node.fail(error);
        }
    }
}

fn run_sequential(ctx: &Context, jobs: Vec<BranchJob>) -> Result<StageOutcome, EngineError> {
    let mut stage = StageOutcome::default();
    for job in jobs {
        job.node.set_state(TaskState::Running);
        let outcome =
            execute_branch(&job.node, ctx, &job.input, &job.kwargs).map_err(|e| e.to_string());
        apply_outcome(&job.node, outcome, &mut stage);
    }
    Ok(stage)
}

async fn run_sequential_async(
    ctx: &Context,
    jobs: Vec<BranchJob>,
) -> Result<StageOutcome, EngineError> {
    let mut stage = StageOutcome::default();
    for job in jobs {
        job.node.set_state(TaskState::Running);
        let outcome = match &job.node {
            Node::Task(task) if task.is_async() => task
                .invoke_async(Some(ctx), job.input.clone(), job.kwargs.clone())
                .await
                .map_err(|e| e.to_string()),
            Node::Task(task) => task
                .invoke(Some(ctx), &job.input, &job.kwargs)
                .map_err(|e| e.to_string()),
            Node::Workflow(workflow) => workflow
                .async_run_as_branch(ctx, job.input.clone(), job.kwargs.clone())
                .await
                .map_err(|e| e.to_string()),
        };
        apply_outcome(&job.node, outcome, &mut stage);
    }
    Ok(stage)
}
