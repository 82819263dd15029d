//! Workflow execution: the stepping engine
//!
//! One `step` runs one stage: persist the cursor, flatten the previous
//! stage's results into the input, execute every live branch through the
//! installed executor, then re-read the (possibly rewritten) cursor and
//! advance past it. `run` drives steps until the cursor leaves the stage
//! list, the state leaves Running, or the context is ended.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::context::Context;
use crate::error::EngineError;
use crate::exec::{BranchJob, Executor, StageOutcome};
use crate::node::Node;
use crate::task::{Kwargs, TaskState};

use super::Workflow;

/// Flatten one stage's branch results into the next stage's input.
///
/// A flat-result branch splices each element of a list result individually;
/// any other branch contributes one value. Branches without a cached result
/// (failed, or never run) contribute nothing.
pub(crate) fn flatten_stage(stage: &[Node]) -> Vec<Value> {
    let mut out = Vec::new();
    for node in stage {
        let Some(value) = node.result() else { continue };
        match value {
            Value::Array(items) if node.flat_result() => out.extend(items),
            value => out.push(value),
        }
    }
    out
}

struct PreparedStage {
    name: String,
    cursor: usize,
    executor: Executor,
    jobs: Vec<BranchJob>,
}

impl Workflow {
    fn ensure_context(&self) -> Context {
        let mut inner = self.lock_inner();
        match &inner.context {
            Some(context) => context.clone(),
            None => {
                let context = Context::new();
                inner.context = Some(context.clone());
                context
            }
        }
    }

    /// Execute the workflow to completion and return the flattened result of
    /// the last-executed stage (a single value is unwrapped from its
    /// one-element container).
    ///
    /// Branch failures are captured on the failing node and do not surface
    /// here unless an entire stage fails; structural problems (no stages,
    /// async branches on a sync-only executor, unshippable process-pool
    /// branches) error immediately.
    pub fn run(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EngineError> {
        let ctx = self.ensure_context();
        ctx.reset_ended();
        self.run_with_ctx(&ctx, args, kwargs)
    }

    /// Run as a branch of an owning workflow, sharing its context.
    pub(crate) fn run_as_branch(
        &self,
        ctx: &Context,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, EngineError> {
        self.run_with_ctx(ctx, args, kwargs)
    }

    fn run_with_ctx(
        &self,
        ctx: &Context,
        caller_args: Vec<Value>,
        caller_kwargs: Kwargs,
    ) -> Result<Value, EngineError> {
        let (name, stage_count, immutable, bound_args, bound_kwargs) = {
            let inner = self.lock_inner();
            (
                inner.name.clone(),
                inner.stages.len(),
                inner.immutable,
                inner.args.clone(),
                inner.kwargs.clone(),
            )
        };
        if stage_count == 0 {
            return Err(EngineError::EmptyWorkflow(name));
        }
        ctx.install_root(Node::Workflow(self.clone()));

        // The same workflow instance may run repeatedly against one shared
        // context (e.g. as a map branch); remember the persisted cursor so
        // this run cannot leak state into the next one.
        let saved_cursor = ctx.cursor(&name)?;

        {
            let mut inner = self.lock_inner();
            inner.state = TaskState::Running;
            inner.cursor = 0;
            inner.last_stage = None;
        }
        let (first_args, first_kwargs) =
            merge_first_call(immutable, bound_args, bound_kwargs, caller_args, caller_kwargs);

        tracing::debug!(workflow = %name, stages = stage_count, "workflow started");
        let mut first = true;
        let mut failure: Option<EngineError> = None;
        loop {
            let (cursor, state) = {
                let inner = self.lock_inner();
                (inner.cursor, inner.state)
            };
            if cursor >= stage_count || state != TaskState::Running || ctx.is_ended()? {
                break;
            }
            let step = if first {
                self.step_with(ctx, &first_args, &first_kwargs)
            } else {
                self.step_with(ctx, &[], &Kwargs::new())
            };
            first = false;
            if let Some(err) = check_step(&name, cursor, step) {
                failure = Some(err);
                break;
            }
        }

        match saved_cursor {
            Some(value) => ctx.set_cursor(&name, value)?,
            None => ctx.clear_cursor(&name)?,
        }

        if let Some(err) = failure {
            self.fail(err.to_string());
            return Err(err);
        }

        let result = self.aggregate_last_stage();
        self.complete(result.clone());
        tracing::debug!(workflow = %name, "workflow completed");
        Ok(result)
    }

    /// Run one stage. Public so embedders can single-step a workflow; the
    /// context is created on first use, exactly as in `run`.
    pub fn step(&self) -> Result<(), EngineError> {
        let ctx = self.ensure_context();
        self.step_with(&ctx, &[], &Kwargs::new()).map(|_| ())
    }

    pub(crate) fn step_with(
        &self,
        ctx: &Context,
        runtime_args: &[Value],
        runtime_kwargs: &Kwargs,
    ) -> Result<StageOutcome, EngineError> {
        let Some(prepared) = self.prepare_stage(ctx, runtime_args, runtime_kwargs)? else {
            return Ok(StageOutcome::default());
        };
        let outcome = prepared.executor.run_stage(ctx, prepared.jobs)?;
        self.finish_stage(ctx, &prepared.name, prepared.cursor)?;
        Ok(outcome)
    }

    async fn step_with_async(
        &self,
        ctx: &Context,
        runtime_args: &[Value],
        runtime_kwargs: &Kwargs,
    ) -> Result<StageOutcome, EngineError> {
        let Some(prepared) = self.prepare_stage(ctx, runtime_args, runtime_kwargs)? else {
            return Ok(StageOutcome::default());
        };
        let outcome = prepared.executor.run_stage_async(ctx, prepared.jobs).await?;
        self.finish_stage(ctx, &prepared.name, prepared.cursor)?;
        Ok(outcome)
    }

    /// Steps 1-4 of the stage algorithm: no-op past the end, persist the
    /// cursor, flatten upstream results into the input, and collect the live
    /// (non-skipped) branches.
    fn prepare_stage(
        &self,
        ctx: &Context,
        runtime_args: &[Value],
        runtime_kwargs: &Kwargs,
    ) -> Result<Option<PreparedStage>, EngineError> {
        let (name, cursor, executor, previous, current) = {
            let inner = self.lock_inner();
            if inner.cursor >= inner.stages.len() {
                return Ok(None);
            }
            let previous = if inner.cursor == 0 {
                None
            } else {
                Some(inner.stages[inner.cursor - 1].clone())
            };
            (
                inner.name.clone(),
                inner.cursor,
                inner.executor.clone(),
                previous,
                inner.stages[inner.cursor].clone(),
            )
        };

        ctx.set_cursor(&name, cursor as i64)?;

        let mut input = previous
            .map(|stage| flatten_stage(&stage))
            .unwrap_or_default();
        input.extend(runtime_args.iter().cloned());

        let mut jobs = Vec::with_capacity(current.len());
        for node in current {
            if node.take_skip_request() {
                // Bypassed for this encounter only; previous result stays.
                tracing::debug!(branch = %node.name(), "branch skipped");
                continue;
            }
            jobs.push(BranchJob {
                node,
                input: input.clone(),
                kwargs: runtime_kwargs.clone(),
            });
        }

        Ok(Some(PreparedStage {
            name,
            cursor,
            executor,
            jobs,
        }))
    }

    /// Step 5: re-read the possibly-rewritten cursor and advance past it.
    fn finish_stage(&self, ctx: &Context, name: &str, cursor: usize) -> Result<(), EngineError> {
        let rewritten = ctx.cursor(name)?.unwrap_or(cursor as i64);
        let mut inner = self.lock_inner();
        inner.last_stage = Some(cursor);
        let next = rewritten + 1;
        inner.cursor = if next < 0 { 0 } else { next as usize };
        Ok(())
    }

    fn aggregate_last_stage(&self) -> Value {
        let (stages, last_stage) = {
            let inner = self.lock_inner();
            (inner.stages.clone(), inner.last_stage)
        };
        let mut values = match last_stage {
            Some(index) => flatten_stage(&stages[index]),
            None => Vec::new(),
        };
        match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        }
    }

    /// Async mirror of [`Workflow::run`]: async-capable branches are
    /// awaited, synchronous branches run inline. Sequential executor only.
    pub async fn async_run(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, EngineError> {
        if !matches!(self.lock_inner().executor, Executor::Sequential) {
            return Err(EngineError::AsyncUnsupported(
                "async_run requires the sequential executor".to_string(),
            ));
        }
        let ctx = self.ensure_context();
        ctx.reset_ended();
        self.async_run_with_ctx(&ctx, args, kwargs).await
    }

    pub(crate) async fn async_run_as_branch(
        &self,
        ctx: &Context,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, EngineError> {
        let sequential = matches!(self.lock_inner().executor, Executor::Sequential);
        if sequential {
            self.async_run_with_ctx(ctx, args, kwargs).await
        } else {
            // Non-sequential nested workflows are sync-only; drive them
            // inline.
            self.run_as_branch(ctx, args, kwargs)
        }
    }

    fn async_run_with_ctx<'a>(
        &'a self,
        ctx: &'a Context,
        caller_args: Vec<Value>,
        caller_kwargs: Kwargs,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let (name, stage_count, immutable, bound_args, bound_kwargs) = {
                let inner = self.lock_inner();
                (
                    inner.name.clone(),
                    inner.stages.len(),
                    inner.immutable,
                    inner.args.clone(),
                    inner.kwargs.clone(),
                )
            };
            if stage_count == 0 {
                return Err(EngineError::EmptyWorkflow(name));
            }
            ctx.install_root(Node::Workflow(self.clone()));
            let saved_cursor = ctx.cursor(&name)?;

            {
                let mut inner = self.lock_inner();
                inner.state = TaskState::Running;
                inner.cursor = 0;
                inner.last_stage = None;
            }
            let (first_args, first_kwargs) =
                merge_first_call(immutable, bound_args, bound_kwargs, caller_args, caller_kwargs);

            let mut first = true;
            let mut failure: Option<EngineError> = None;
            loop {
                let (cursor, state) = {
                    let inner = self.lock_inner();
                    (inner.cursor, inner.state)
                };
                if cursor >= stage_count || state != TaskState::Running || ctx.is_ended()? {
                    break;
                }
                let step = if first {
                    self.step_with_async(ctx, &first_args, &first_kwargs).await
                } else {
                    self.step_with_async(ctx, &[], &Kwargs::new()).await
                };
                first = false;
                if let Some(err) = check_step(&name, cursor, step) {
                    failure = Some(err);
                    break;
                }
            }

            match saved_cursor {
                Some(value) => ctx.set_cursor(&name, value)?,
                None => ctx.clear_cursor(&name)?,
            }

            if let Some(err) = failure {
                self.fail(err.to_string());
                return Err(err);
            }

            let result = self.aggregate_last_stage();
            self.complete(result.clone());
            Ok(result)
        })
    }
}

/// Bound and caller arguments for the first stage: an immutable workflow
/// ignores the caller's, a mutable one prepends them to its own.
fn merge_first_call(
    immutable: bool,
    bound_args: Vec<Value>,
    bound_kwargs: Kwargs,
    caller_args: Vec<Value>,
    caller_kwargs: Kwargs,
) -> (Vec<Value>, Kwargs) {
    if immutable {
        return (bound_args, bound_kwargs);
    }
    let mut args = caller_args;
    args.extend(bound_args);
    let mut kwargs = bound_kwargs;
    for (k, v) in caller_kwargs {
        kwargs.insert(k, v);
    }
    (args, kwargs)
}

/// A stage where every live branch failed leaves nothing for the next stage
/// to consume; surface that as the run's error.
fn check_step(
    workflow: &str,
    cursor: usize,
    step: Result<StageOutcome, EngineError>,
) -> Option<EngineError> {
    match step {
        Ok(outcome) if outcome.executed > 0 && outcome.succeeded == 0 => {
            Some(EngineError::StageFailed {
                workflow: workflow.to_string(),
                stage: cursor,
                error: outcome
                    .first_error
                    .unwrap_or_else(|| "all branches failed".to_string()),
            })
        }
        Ok(_) => None,
        Err(err) => Some(err),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::error::BoxError;
    use crate::task::{Task, TaskFuture};

    fn add(name: &str) -> Task {
        Task::new(name, |args: &[Value], _: &Kwargs| {
            Ok(json!(args.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
        })
    }

    #[test]
    fn test_sequential_chain_threads_results_through() {
        let flow = Workflow::chain(vec![
            add("f").with_args(vec![json!(1), json!(2)]).immutable().into(),
            add("g").with_args(vec![json!(3)]).into(),
            add("h").with_args(vec![json!(5)]).into(),
        ]);
        let result = flow.run(vec![], Kwargs::new()).unwrap();
        assert_eq!(result, json!(11));
        assert_eq!(flow.state(), TaskState::Completed);
    }

    #[test]
    fn test_single_branch_result_is_unwrapped_to_scalar() {
        let flow = Workflow::group(vec![add("only").with_args(vec![json!(4)]).into()]);
        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!(4));
    }

    #[test]
    fn test_multi_branch_result_stays_a_list() {
        let flow = Workflow::group(vec![
            add("a").with_args(vec![json!(1), json!(2)]).immutable().into(),
            add("b").with_args(vec![json!(3), json!(4)]).immutable().into(),
        ]);
        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!([3, 7]));
    }

    #[test]
    fn test_fan_in_flattens_upstream_results() {
        let fan = Workflow::group(vec![
            add("a").with_args(vec![json!(1), json!(2)]).immutable().into(),
            add("b").with_args(vec![json!(3), json!(4)]).immutable().into(),
        ]);
        let flow = fan >> add("sum");
        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!(10));
    }

    #[test]
    fn test_flat_result_splices_list_elements() {
        let list = Task::new("list", |_: &[Value], _: &Kwargs| Ok(json!([1, 2, 3])))
            .with_flat_result(true);
        let nested = Task::new("nested", |_: &[Value], _: &Kwargs| Ok(json!([1, 2, 3])));

        let flat_flow = list >> add("sum");
        assert_eq!(flat_flow.run(vec![], Kwargs::new()).unwrap(), json!(6));

        // without the flag the list arrives as one value and sums to zero
        let nested_flow = nested >> add("sum2");
        assert_eq!(nested_flow.run(vec![], Kwargs::new()).unwrap(), json!(0));
    }

    #[test]
    fn test_caller_args_reach_the_first_stage() {
        let flow = Workflow::chain(vec![add("f").with_args(vec![json!(10)]).into()]);
        assert_eq!(flow.run(vec![json!(5)], Kwargs::new()).unwrap(), json!(15));
    }

    #[test]
    fn test_immutable_workflow_ignores_caller_args() {
        let flow = Workflow::chain(vec![add("f").into()])
            .with_args(vec![json!(1), json!(2)])
            .immutable();
        assert_eq!(flow.run(vec![json!(100)], Kwargs::new()).unwrap(), json!(3));
    }

    #[test]
    fn test_rerun_after_reset_is_idempotent() {
        let flow = Workflow::chain(vec![
            add("f").with_args(vec![json!(1), json!(2)]).immutable().into(),
            add("g").with_args(vec![json!(3)]).into(),
        ]);
        let first = flow.run(vec![], Kwargs::new()).unwrap();
        flow.reset();
        assert_eq!(flow.state(), TaskState::Pending);
        let second = flow.run(vec![], Kwargs::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_workflow_fails_fast() {
        let flow = Workflow::new();
        assert!(matches!(
            flow.run(vec![], Kwargs::new()),
            Err(EngineError::EmptyWorkflow(_))
        ));
    }

    #[test]
    fn test_failure_isolation_within_a_stage() {
        let ok = add("ok").with_args(vec![json!(2), json!(3)]).immutable();
        let bad = Task::new("bad", |_: &[Value], _: &Kwargs| {
            Err::<Value, BoxError>("broken".into())
        });
        let flow = Workflow::group(vec![bad.clone().into(), ok.clone().into()]) >> add("sum");

        let result = flow.run(vec![], Kwargs::new()).unwrap();
        // only the surviving branch feeds the next stage
        assert_eq!(result, json!(5));
        assert_eq!(bad.state(), TaskState::Failure);
        assert_eq!(bad.error(), Some("broken".to_string()));
        assert_eq!(ok.state(), TaskState::Completed);
    }

    #[test]
    fn test_stage_with_no_surviving_branch_fails_the_run() {
        let bad = Task::new("bad", |_: &[Value], _: &Kwargs| {
            Err::<Value, BoxError>("broken".into())
        });
        let flow = Workflow::chain(vec![bad.into(), add("after").into()]);
        assert!(matches!(
            flow.run(vec![], Kwargs::new()),
            Err(EngineError::StageFailed { stage: 0, .. })
        ));
        assert_eq!(flow.state(), TaskState::Failure);
    }

    #[test]
    fn test_cursor_rewrite_jumps_backward() {
        // counter task runs, then a context-aware task jumps back twice
        let counter = Task::with_context("count", |ctx: &Context, _: &[Value], _: &Kwargs| {
            let n = ctx.get_item("n")?.and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            ctx.set_item("n", json!(n))?;
            Ok(json!(n))
        });
        let looper = Task::with_context("loop", |ctx: &Context, args: &[Value], _: &Kwargs| {
            let n = ctx.get_item("n")?.and_then(|v| v.as_i64()).unwrap_or(0);
            if n < 3 {
                // resume at stage 0: the workflow advances to value + 1
                ctx.set_cursor("loop-flow", -1)?;
            }
            Ok(args.first().cloned().unwrap_or(Value::Null))
        });

        let flow = Workflow::named("loop-flow").then(counter).then(looper);
        let result = flow.run(vec![], Kwargs::new()).unwrap();
        assert_eq!(result, json!(3));
        assert_eq!(
            flow.context().unwrap().get_item("n").unwrap(),
            Some(json!(3))
        );
    }

    #[test]
    fn test_end_terminates_between_stages() {
        let first = add("first").with_args(vec![json!(1)]).immutable();
        let ender = Task::with_context("ender", |ctx: &Context, args: &[Value], _: &Kwargs| {
            ctx.end()?;
            Ok(args.first().cloned().unwrap_or(Value::Null))
        });
        let never = Task::new("never", |_: &[Value], _: &Kwargs| Ok(json!("ran")));

        let flow = Workflow::chain(vec![first.into(), ender.into(), never.clone().into()]);
        let result = flow.run(vec![], Kwargs::new()).unwrap();
        assert_eq!(result, json!(1));
        assert_eq!(flow.state(), TaskState::Completed);
        assert_eq!(never.state(), TaskState::Pending);
    }

    #[test]
    fn test_skip_bypasses_one_encounter_and_keeps_result() {
        let a = add("a").with_args(vec![json!(1)]).immutable();
        let b = add("b").with_args(vec![json!(2)]).immutable();
        let flow = Workflow::group(vec![a.clone().into(), b.clone().into()]);

        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!([1, 2]));

        let ctx = flow.context().unwrap();
        ctx.skip("a").unwrap();
        assert_eq!(a.state(), TaskState::Skipped);

        // rerun: `a` is bypassed but its previous result still aggregates
        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!([1, 2]));
        assert_eq!(a.state(), TaskState::Skipped);
        assert_eq!(a.result(), Some(json!(1)));

        // the skip was one-shot: the following run executes `a` again
        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!([1, 2]));
        assert_eq!(a.state(), TaskState::Completed);
    }

    #[test]
    fn test_stage_of_only_skipped_branches_still_advances() {
        let a = add("a").with_args(vec![json!(1)]).immutable();
        let after = add("after").with_args(vec![json!(9)]).immutable();
        let flow = Workflow::chain(vec![a.clone().into(), after.into()]);

        let ctx = Context::new();
        let flow = flow.with_context(ctx.clone());
        ctx.install_root(Node::Workflow(flow.clone()));
        ctx.skip("a").unwrap();

        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!(9));
    }

    #[test]
    fn test_nested_workflow_shares_the_context() {
        let inner_task = Task::with_context("stash", |ctx: &Context, args: &[Value], _: &Kwargs| {
            ctx.set_item("seen", json!(args))?;
            Ok(json!(args.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
        });
        let inner = Workflow::named("inner").then(inner_task);
        let outer = Workflow::named("outer")
            .then(add("src").with_args(vec![json!(2), json!(3)]).immutable())
            .then(inner);

        let result = outer.run(vec![], Kwargs::new()).unwrap();
        assert_eq!(result, json!(5));
        let ctx = outer.context().unwrap();
        assert_eq!(ctx.get_item("seen").unwrap(), Some(json!([5])));
        assert_eq!(ctx.state_of("inner").unwrap(), TaskState::Completed);
    }

    #[test]
    fn test_map_re_entrancy_preserves_cursors() {
        // two clones of the same two-stage workflow run against one shared
        // context; neither leaks cursor state into the other
        let template = Workflow::named("body")
            .then(add("one").with_args(vec![json!(1)]))
            .then(add("two").with_args(vec![json!(10)]));
        let flow = Workflow::map(template, vec![json!(100), json!(200)]);

        let result = flow.run(vec![], Kwargs::new()).unwrap();
        assert_eq!(result, json!([111, 211]));
    }

    #[test]
    fn test_manual_stepping_advances_one_stage_at_a_time() {
        let f = add("f").with_args(vec![json!(1), json!(2)]).immutable();
        let g = add("g").with_args(vec![json!(3)]);
        let flow = Workflow::chain(vec![f.clone().into(), g.clone().into()]);

        flow.step().unwrap();
        assert_eq!(f.result(), Some(json!(3)));
        assert_eq!(g.result(), None);

        flow.step().unwrap();
        assert_eq!(g.result(), Some(json!(6)));

        // past the end: a no-op
        flow.step().unwrap();
        assert_eq!(g.result(), Some(json!(6)));
    }

    #[test]
    fn test_run_kwargs_reach_the_first_stage() {
        let pick = Task::new("pick", |_: &[Value], kwargs: &Kwargs| {
            Ok(kwargs.get("mode").cloned().unwrap_or(Value::Null))
        });
        let flow = Workflow::chain(vec![pick.into()]);
        let mut kwargs = Kwargs::new();
        kwargs.insert("mode".to_string(), json!("fast"));
        assert_eq!(flow.run(vec![], kwargs).unwrap(), json!("fast"));
    }

    #[test]
    fn test_nested_workflow_flat_result_splices_into_next_stage() {
        let pair = Workflow::group(vec![
            add("x").with_args(vec![json!(1)]).immutable().into(),
            add("y").with_args(vec![json!(2)]).immutable().into(),
        ])
        .with_flat_result(true);
        let flow = Workflow::named("outer-flat").then(pair).then(add("sum"));

        assert_eq!(flow.run(vec![], Kwargs::new()).unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_async_run_awaits_async_branches() {
        let async_task = Task::new_async("delayed", |args: Vec<Value>, _: Kwargs| -> TaskFuture {
            Box::pin(async move {
                let base: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
                Ok(json!(base + 1))
            })
        });
        let flow = Workflow::chain(vec![
            add("seed").with_args(vec![json!(41)]).immutable().into(),
            async_task.into(),
        ]);
        assert_eq!(flow.async_run(vec![], Kwargs::new()).await.unwrap(), json!(42));
    }

    #[test]
    fn test_async_branch_fails_fast_on_sync_run() {
        let async_task = Task::new_async("delayed", |_: Vec<Value>, _: Kwargs| -> TaskFuture {
            Box::pin(async { Ok(Value::Null) })
        });
        let flow = Workflow::chain(vec![async_task.into()]);
        assert!(matches!(
            flow.run(vec![], Kwargs::new()),
            Err(EngineError::AsyncUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_async_run_rejects_thread_executor() {
        let flow = Workflow::chain(vec![add("f").into()])
            .with_executor(Executor::threads(2));
        assert!(matches!(
            flow.async_run(vec![], Kwargs::new()).await,
            Err(EngineError::AsyncUnsupported(_))
        ));
    }
}
