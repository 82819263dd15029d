//! Workflows: composable stage/branch scheduling
//!
//! A [`Workflow`] is an ordered list of *stages*; each stage is a list of
//! parallel *branches* (tasks or nested workflows). Stages are
//! synchronization barriers: every branch of stage `i` finishes before
//! stage `i + 1` begins. Within that flat list, a running branch may rewrite
//! the workflow's cursor through the shared context to jump forward or
//! backward; loops and conditionals are built from exactly that.
//!
//! Composition:
//! - `a >> b` / [`Workflow::then`]: sequential append
//! - `a | b` / [`Workflow::with_branch`]: another branch in the last stage
//! - [`Workflow::chain`], [`Workflow::group`], [`Workflow::map`],
//!   [`Workflow::starmap`]
//!
//! Execution lives in the sibling module (`run`): `run`, `async_run`,
//! `step`.

mod run;

use std::ops::{BitOr, Shr};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::context::Context;
use crate::error::EngineError;
use crate::exec::Executor;
use crate::node::Node;
use crate::task::{Kwargs, Task, TaskState};
use crate::util::{lock, short_id};

pub(crate) struct FlowInner {
    pub(crate) name: String,
    pub(crate) stages: Vec<Vec<Node>>,
    pub(crate) cursor: usize,
    pub(crate) last_stage: Option<usize>,
    pub(crate) state: TaskState,
    pub(crate) context: Option<Context>,
    pub(crate) executor: Executor,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Kwargs,
    pub(crate) immutable: bool,
    pub(crate) flat_result: bool,
    pub(crate) skip_requested: bool,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<String>,
}

/// Composite scheduler node. `Clone` is shallow and shares execution state;
/// use [`Workflow::map`]-style fan-out (or `deep_clone_with_name`) for
/// independent copies.
#[derive(Clone)]
pub struct Workflow {
    pub(crate) inner: Arc<Mutex<FlowInner>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Workflow")
            .field("name", &inner.name)
            .field("stages", &inner.stages.len())
            .field("cursor", &inner.cursor)
            .field("state", &inner.state)
            .field("executor", &inner.executor)
            .finish()
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    /// Empty workflow with a generated unique name.
    pub fn new() -> Self {
        Self::named(format!("workflow-{}", short_id()))
    }

    /// Empty workflow with an explicit name. Names key cursor and lookup
    /// state in the context, so they must be unique within one tree.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FlowInner {
                name: name.into(),
                stages: Vec::new(),
                cursor: 0,
                last_stage: None,
                state: TaskState::Pending,
                context: None,
                executor: Executor::Sequential,
                args: Vec::new(),
                kwargs: Kwargs::new(),
                immutable: false,
                flat_result: false,
                skip_requested: false,
                result: None,
                error: None,
            })),
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, FlowInner> {
        lock(&self.inner)
    }

    /// Sequential composition: one stage per node.
    pub fn chain(nodes: Vec<Node>) -> Self {
        let workflow = Self::new();
        for node in nodes {
            workflow.lock_inner().stages.push(vec![node]);
        }
        workflow
    }

    /// Parallel composition: one stage with every node as a branch.
    pub fn group(nodes: Vec<Node>) -> Self {
        let workflow = Self::new();
        workflow.lock_inner().stages.push(nodes);
        workflow
    }

    /// Fan a node out over `items`: one stage of deep clones, each bound
    /// positionally to one item and given a fresh unique name.
    pub fn map(node: impl Into<Node>, items: Vec<Value>) -> Self {
        let template = node.into();
        let workflow = Self::new();
        let mut branches = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let branch = template.fanout_clone(index);
            branch.push_bound_arg(item);
            branches.push(branch);
        }
        workflow.lock_inner().stages.push(branches);
        workflow
    }

    /// Like [`Workflow::map`], but each item is unpacked: an array becomes
    /// positional arguments, an object becomes keyword arguments.
    pub fn starmap(node: impl Into<Node>, items: Vec<Value>) -> Result<Self, EngineError> {
        let template = node.into();
        let workflow = Self::new();
        let mut branches = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let branch = template.fanout_clone(index);
            match item {
                Value::Array(args) => branch.extend_bound_args(args),
                Value::Object(kwargs) => branch.merge_bound_kwargs(kwargs),
                other => {
                    return Err(EngineError::InvalidStarArgs(
                        serde_json::to_string(&other).unwrap_or_else(|_| "?".to_string()),
                    ))
                }
            }
            branches.push(branch);
        }
        workflow.lock_inner().stages.push(branches);
        Ok(workflow)
    }

    /// Append `node` as the next stage (the `>>` operator).
    pub fn then(self, node: impl Into<Node>) -> Self {
        self.lock_inner().stages.push(vec![node.into()]);
        self
    }

    /// Add `node` as another branch of the last stage (the `|` operator).
    pub fn with_branch(self, node: impl Into<Node>) -> Self {
        {
            let mut inner = self.lock_inner();
            match inner.stages.last_mut() {
                Some(stage) => stage.push(node.into()),
                None => inner.stages.push(vec![node.into()]),
            }
        }
        self
    }

    /// Select the concurrency backend for this workflow's stages.
    pub fn with_executor(self, executor: Executor) -> Self {
        self.lock_inner().executor = executor;
        self
    }

    /// Install a context up front instead of letting `run` create one.
    pub fn with_context(self, context: Context) -> Self {
        self.lock_inner().context = Some(context);
        self
    }

    /// Bind positional arguments passed to the first stage.
    pub fn with_args(self, args: Vec<Value>) -> Self {
        self.lock_inner().args = args;
        self
    }

    pub fn with_kwargs(self, kwargs: Kwargs) -> Self {
        self.lock_inner().kwargs = kwargs;
        self
    }

    /// Ignore caller arguments and always run with the bound ones.
    pub fn immutable(self) -> Self {
        self.lock_inner().immutable = true;
        self
    }

    /// When this workflow is itself a branch, splice a list-valued result
    /// into the next stage's input element by element.
    pub fn with_flat_result(self, flat: bool) -> Self {
        self.lock_inner().flat_result = flat;
        self
    }

    pub fn name(&self) -> String {
        self.lock_inner().name.clone()
    }

    pub fn state(&self) -> TaskState {
        self.lock_inner().state
    }

    pub fn result(&self) -> Option<Value> {
        self.lock_inner().result.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock_inner().error.clone()
    }

    pub fn stage_count(&self) -> usize {
        self.lock_inner().stages.len()
    }

    pub fn flat_result(&self) -> bool {
        self.lock_inner().flat_result
    }

    /// The context installed on this workflow, if any.
    pub fn context(&self) -> Option<Context> {
        self.lock_inner().context.clone()
    }

    /// Clear cached state recursively so the workflow can run again.
    pub fn reset(&self) {
        let nodes: Vec<Node> = {
            let mut inner = self.lock_inner();
            inner.cursor = 0;
            inner.last_stage = None;
            inner.state = TaskState::Pending;
            inner.result = None;
            inner.error = None;
            inner.skip_requested = false;
            inner.stages.iter().flatten().cloned().collect()
        };
        for node in nodes {
            node.reset();
        }
    }

    /// Deep copy with fresh names at every level and pristine state.
    pub fn deep_clone_with_name(&self, name: impl Into<String>) -> Self {
        let inner = self.lock_inner();
        let copy = Self::named(name);
        {
            let mut copy_inner = copy.lock_inner();
            copy_inner.stages = inner
                .stages
                .iter()
                .map(|stage| stage.iter().map(Node::clone_fresh).collect())
                .collect();
            copy_inner.executor = inner.executor.clone();
            copy_inner.args = inner.args.clone();
            copy_inner.kwargs = inner.kwargs.clone();
            copy_inner.immutable = inner.immutable;
            copy_inner.flat_result = inner.flat_result;
        }
        copy
    }

    /// Recursive lookup by name: this workflow or anything below it.
    pub(crate) fn find(&self, name: &str) -> Option<Node> {
        if self.lock_inner().name == name {
            return Some(Node::Workflow(self.clone()));
        }
        let nodes: Vec<Node> = self.lock_inner().stages.iter().flatten().cloned().collect();
        nodes.iter().find_map(|node| node.find(name))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.lock_inner().state = state;
    }

    pub(crate) fn complete(&self, result: Value) {
        let mut inner = self.lock_inner();
        inner.state = TaskState::Completed;
        inner.result = Some(result);
        inner.error = None;
    }

    pub(crate) fn fail(&self, error: String) {
        let mut inner = self.lock_inner();
        inner.state = TaskState::Failure;
        inner.result = None;
        inner.error = Some(error);
    }

    pub(crate) fn set_result(&self, result: Value) {
        self.lock_inner().result = Some(result);
    }

    pub(crate) fn request_skip(&self) {
        let mut inner = self.lock_inner();
        inner.skip_requested = true;
        inner.state = TaskState::Skipped;
    }

    pub(crate) fn take_skip_request(&self) -> bool {
        let mut inner = self.lock_inner();
        std::mem::take(&mut inner.skip_requested)
    }

    pub(crate) fn push_arg(&self, value: Value) {
        self.lock_inner().args.push(value);
    }

    pub(crate) fn extend_args(&self, values: Vec<Value>) {
        self.lock_inner().args.extend(values);
    }

    pub(crate) fn merge_kwargs(&self, kwargs: Kwargs) {
        let mut inner = self.lock_inner();
        for (k, v) in kwargs {
            inner.kwargs.insert(k, v);
        }
    }
}

// Composition operators. They consume their operands, which is what makes
// in-place stage mutation safe: no other handle can observe it.

impl<R: Into<Node>> Shr<R> for Task {
    type Output = Workflow;

    fn shr(self, rhs: R) -> Workflow {
        Workflow::chain(vec![self.into(), rhs.into()])
    }
}

impl<R: Into<Node>> Shr<R> for Workflow {
    type Output = Workflow;

    fn shr(self, rhs: R) -> Workflow {
        self.then(rhs)
    }
}

impl<R: Into<Node>> Shr<R> for Node {
    type Output = Workflow;

    fn shr(self, rhs: R) -> Workflow {
        match self {
            Node::Task(task) => task >> rhs,
            Node::Workflow(workflow) => workflow >> rhs,
        }
    }
}

impl<R: Into<Node>> BitOr<R> for Task {
    type Output = Workflow;

    fn bitor(self, rhs: R) -> Workflow {
        Workflow::group(vec![self.into(), rhs.into()])
    }
}

impl<R: Into<Node>> BitOr<R> for Workflow {
    type Output = Workflow;

    fn bitor(self, rhs: R) -> Workflow {
        self.with_branch(rhs)
    }
}

impl<R: Into<Node>> BitOr<R> for Node {
    type Output = Workflow;

    fn bitor(self, rhs: R) -> Workflow {
        match self {
            Node::Task(task) => task | rhs,
            Node::Workflow(workflow) => workflow | rhs,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn noop(name: &str) -> Task {
        Task::new(name, |_: &[Value], _: &Kwargs| Ok(Value::Null))
    }

    #[test]
    fn test_chain_builds_one_stage_per_node() {
        let flow = Workflow::chain(vec![noop("a").into(), noop("b").into(), noop("c").into()]);
        assert_eq!(flow.stage_count(), 3);
    }

    #[test]
    fn test_group_builds_a_single_stage() {
        let flow = Workflow::group(vec![noop("a").into(), noop("b").into()]);
        assert_eq!(flow.stage_count(), 1);
        assert_eq!(flow.lock_inner().stages[0].len(), 2);
    }

    #[test]
    fn test_operators_compose_stages_and_branches() {
        let flow = (noop("a") >> noop("b")) | noop("c");
        let inner = flow.lock_inner();
        assert_eq!(inner.stages.len(), 2);
        assert_eq!(inner.stages[0].len(), 1);
        assert_eq!(inner.stages[1].len(), 2);
    }

    #[test]
    fn test_task_or_task_groups_in_one_stage() {
        let flow = noop("a") | noop("b");
        let inner = flow.lock_inner();
        assert_eq!(inner.stages.len(), 1);
        assert_eq!(inner.stages[0].len(), 2);
    }

    #[test]
    fn test_map_clones_get_fresh_names_and_bindings() {
        let template = Task::new("square", |args: &[Value], _: &Kwargs| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n * n))
        });
        let flow = Workflow::map(template.clone(), vec![json!(2), json!(3)]);

        let inner = flow.lock_inner();
        let stage = &inner.stages[0];
        assert_eq!(stage.len(), 2);
        assert_ne!(stage[0].name(), stage[1].name());
        assert_ne!(stage[0].name(), template.name());
        // the template keeps its own (empty) binding
        drop(inner);
        assert!(template.result().is_none());
    }

    #[test]
    fn test_starmap_rejects_scalar_items() {
        let template = noop("t");
        let result = Workflow::starmap(template, vec![json!(5)]);
        assert!(matches!(result, Err(EngineError::InvalidStarArgs(_))));
    }

    #[test]
    fn test_deep_clone_renames_recursively() {
        let nested = Workflow::named("inner").then(noop("leaf"));
        let outer = Workflow::named("outer").then(nested);
        let copy = outer.deep_clone_with_name("outer-copy");

        assert_eq!(copy.name(), "outer-copy");
        let copied_child = &copy.lock_inner().stages[0][0];
        assert_ne!(copied_child.name(), "inner");
    }

    #[test]
    fn test_find_traverses_nested_workflows() {
        let nested = Workflow::named("inner").then(noop("leaf"));
        let outer = Workflow::named("outer").then(nested);

        assert!(outer.find("outer").is_some());
        assert!(outer.find("inner").is_some());
        assert!(outer.find("leaf").is_some());
        assert!(outer.find("ghost").is_none());
    }
}
