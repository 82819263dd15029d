//! Composable workflow execution runtime
//!
//! This crate provides a generic task/stage scheduling engine:
//!
//! - [`Task`]: an atomic unit of work wrapping a callable plus bound
//!   arguments, with mutable or immutable binding semantics
//! - [`Workflow`]: an ordered list of stages, each a list of parallel
//!   branches (tasks or nested workflows), composed with `>>` / `|` or
//!   `chain` / `group` / `map` / `starmap`
//! - [`Context`]: the shared execution environment: key/value store,
//!   task lookup, per-workflow cursors, coordination primitives
//! - [`Executor`]: pluggable concurrency backends: sequential (default),
//!   thread pool, process pool
//! - control-flow helpers ([`for_loop`], [`while_loop`], [`branch_on`])
//!   built as ordinary context-aware tasks that rewrite cursors
//!
//! # Example
//!
//! ```
//! use serde_json::{json, Value};
//! use stagehand_runtime::{Kwargs, Task, Workflow};
//!
//! let add = |name: &str| {
//!     Task::new(name, |args: &[Value], _: &Kwargs| {
//!         Ok(json!(args.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
//!     })
//! };
//!
//! let flow = add("f").with_args(vec![json!(1), json!(2)]).immutable()
//!     >> add("g").with_args(vec![json!(3)])
//!     >> add("h").with_args(vec![json!(5)]);
//!
//! let result = flow.run(vec![], Kwargs::new()).unwrap();
//! assert_eq!(result, json!(11));
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod context;
pub mod control;
pub mod error;
pub mod exec;
pub mod node;
pub mod registry;
pub mod task;
mod util;
pub mod workflow;


pub use context::{Context, ContextLockGuard};
pub use control::{branch_on, for_loop, while_loop, JumpTarget};
pub use error::{BoxError, EngineError};
pub use exec::{worker, Executor, ProcessPool, ThreadPool, WorkerCommand};
pub use node::Node;
pub use registry::{register_task, register_task_with_context};
pub use task::{Kwargs, Task, TaskFuture, TaskState};
pub use workflow::Workflow;

/// Initialize a tracing subscriber writing to stderr, with the level taken
/// from `RUST_LOG` (defaulting to `info`).
///
/// For standalone binaries and examples; embedders with their own
/// subscriber should skip this.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
