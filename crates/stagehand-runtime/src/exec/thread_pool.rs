//! Thread-pool stage execution
//!
//! A bounded set of scoped worker threads pulls branch indices off a shared
//! counter, so a stage with more branches than threads still completes with
//! at most `size` branches in flight. Results land in declaration-order
//! slots; completion order never affects aggregation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use typed_builder::TypedBuilder;

use crate::context::Context;
use crate::error::EngineError;
use crate::task::TaskState;
use crate::util::lock;

use super::{apply_outcome, execute_branch, BranchJob, StageOutcome};

/// Bounded worker-thread executor.
#[derive(Debug, TypedBuilder)]
pub struct ThreadPool {
    #[builder(default = 4)]
    size: usize,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn run_stage(
        &self,
        ctx: &Context,
        jobs: Vec<BranchJob>,
    ) -> Result<StageOutcome, EngineError> {
        // Lifecycle transitions happen here in the orchestrating thread,
        // never inside the workers.
        for job in &jobs {
            job.node.set_state(TaskState::Running);
        }

        let slots: Vec<Mutex<Option<Result<Value, String>>>> =
            jobs.iter().map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..self.size.max(1).min(jobs.len()) {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    if index >= jobs.len() {
                        break;
                    }
                    let job = &jobs[index];
                    let outcome = execute_branch(&job.node, ctx, &job.input, &job.kwargs)
                        .map_err(|e| e.to_string());
                    *lock(&slots[index]) = Some(outcome);
                });
            }
        });

        let mut stage = StageOutcome::default();
        for (job, slot) in jobs.iter().zip(slots) {
            let outcome = slot
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .unwrap_or_else(|| Err("branch produced no outcome".to_string()));
            apply_outcome(&job.node, outcome, &mut stage);
        }
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::task::{Kwargs, Task};
    use crate::Node;

    fn job(task: Task, input: Vec<Value>) -> BranchJob {
        BranchJob {
            node: Node::Task(task),
            input,
            kwargs: Kwargs::new(),
        }
    }

    #[test]
    fn test_results_keep_declaration_order() {
        let pool = ThreadPool::new(2);
        let ctx = Context::new();

        let slow = Task::new("slow", |_: &[Value], _: &Kwargs| {
            std::thread::sleep(std::time::Duration::from_millis(30));
            Ok(json!("slow"))
        });
        let fast = Task::new("fast", |_: &[Value], _: &Kwargs| Ok(json!("fast")));

        let outcome = pool
            .run_stage(&ctx, vec![job(slow.clone(), vec![]), job(fast.clone(), vec![])])
            .unwrap();
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(slow.result(), Some(json!("slow")));
        assert_eq!(fast.result(), Some(json!("fast")));
    }

    #[test]
    fn test_more_branches_than_threads() {
        let pool = ThreadPool::new(2);
        let ctx = Context::new();

        let tasks: Vec<Task> = (0..7)
            .map(|i| {
                Task::new(format!("t{i}"), move |_: &[Value], _: &Kwargs| Ok(json!(i)))
            })
            .collect();
        let jobs = tasks.iter().map(|t| job(t.clone(), vec![])).collect();

        let outcome = pool.run_stage(&ctx, jobs).unwrap();
        assert_eq!(outcome.executed, 7);
        assert_eq!(outcome.succeeded, 7);
        for (i, task) in tasks.iter().enumerate() {
            assert_eq!(task.result(), Some(json!(i)));
        }
    }

    #[test]
    fn test_one_failure_does_not_cancel_siblings() {
        let pool = ThreadPool::new(4);
        let ctx = Context::new();

        let ok = Task::new("ok", |_: &[Value], _: &Kwargs| Ok(json!(1)));
        let bad = Task::new("bad", |_: &[Value], _: &Kwargs| {
            Err::<Value, crate::BoxError>("nope".into())
        });

        let outcome = pool
            .run_stage(&ctx, vec![job(bad.clone(), vec![]), job(ok.clone(), vec![])])
            .unwrap();
        assert_eq!(outcome.executed, 2);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(ok.result(), Some(json!(1)));
        assert_eq!(bad.error(), Some("nope".to_string()));
    }
}
