//! Control-flow helpers
//!
//! Loops and conditionals are ordinary context-aware tasks: they rewrite the
//! owning workflow's cursor (or request skips) through the shared
//! [`Context`], and pass their upstream input through unchanged so the data
//! flow is undisturbed. Place a helper as the last stage of the region it
//! controls.

use serde_json::Value;

use crate::context::Context;
use crate::error::EngineError;
use crate::task::{Kwargs, Task};

/// Where a loop helper jumps when it decides to iterate again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    /// Re-enter at an absolute stage index.
    Stage(usize),
    /// Re-enter `n` stages before the helper's own stage.
    Back(usize),
}

fn jump(ctx: &Context, workflow: &str, target: JumpTarget) -> Result<(), EngineError> {
    let next = match target {
        JumpTarget::Stage(stage) => stage as i64,
        JumpTarget::Back(offset) => {
            let current = ctx.cursor(workflow)?.unwrap_or(0);
            current - offset as i64
        }
    };
    // the workflow resumes at value + 1
    ctx.set_cursor(workflow, next - 1)
}

/// Forward the upstream input unchanged.
fn passthrough(args: &[Value]) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args[0].clone(),
        _ => Value::Array(args.to_vec()),
    }
}

/// Bounded loop: jump back to `target` in `workflow` until the stages
/// between target and helper have run `times` times.
///
/// The iteration counter lives in the context under `loop.<name>` and is
/// removed once the loop completes.
pub fn for_loop(
    name: impl Into<String>,
    workflow: impl Into<String>,
    target: JumpTarget,
    times: u64,
) -> Task {
    let name = name.into();
    let workflow = workflow.into();
    let key = format!("loop.{name}");
    Task::with_context(name.clone(), move |ctx: &Context, args: &[Value], _: &Kwargs| {
        let completed = ctx
            .get_item(&key)?
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        if completed < times {
            ctx.set_item(&key, Value::from(completed))?;
            jump(ctx, &workflow, target)?;
        } else {
            ctx.remove_item(&key)?;
        }
        Ok(passthrough(args))
    })
}

/// Unbounded loop: jump back to `target` in `workflow` for as long as
/// `predicate` holds.
pub fn while_loop(
    name: impl Into<String>,
    workflow: impl Into<String>,
    target: JumpTarget,
    predicate: impl Fn(&Context) -> bool + Clone + Send + Sync + 'static,
) -> Task {
    let workflow = workflow.into();
    Task::with_context(name, move |ctx: &Context, args: &[Value], _: &Kwargs| {
        if predicate(ctx) {
            jump(ctx, &workflow, target)?;
        }
        Ok(passthrough(args))
    })
}

/// Two-way conditional: evaluate `predicate` and skip the branch not taken
/// at its next encounter. Place ahead of a stage containing both named
/// branches.
pub fn branch_on(
    name: impl Into<String>,
    predicate: impl Fn(&Context) -> bool + Clone + Send + Sync + 'static,
    when_true: impl Into<String>,
    when_false: impl Into<String>,
) -> Task {
    let when_true = when_true.into();
    let when_false = when_false.into();
    Task::with_context(name, move |ctx: &Context, args: &[Value], _: &Kwargs| {
        let not_taken = if predicate(ctx) { &when_false } else { &when_true };
        ctx.skip(not_taken)?;
        Ok(passthrough(args))
    })
}
