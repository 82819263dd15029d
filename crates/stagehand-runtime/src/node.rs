//! Runnable nodes
//!
//! A [`Node`] is one slot in a stage: either a [`Task`] or a nested
//! [`Workflow`]. The enum gives both kinds one dispatch surface for the
//! capabilities the engine needs: name, state, result, reset, flat-result,
//! skip handling, and deep fan-out cloning.

use serde_json::Value;

use crate::task::{Task, TaskState};
use crate::util::short_id;
use crate::workflow::Workflow;

/// A task or nested workflow occupying one branch slot within a stage.
#[derive(Clone, Debug)]
pub enum Node {
    Task(Task),
    Workflow(Workflow),
}

impl From<Task> for Node {
    fn from(task: Task) -> Self {
        Node::Task(task)
    }
}

impl From<Workflow> for Node {
    fn from(workflow: Workflow) -> Self {
        Node::Workflow(workflow)
    }
}

impl Node {
    pub fn name(&self) -> String {
        match self {
            Node::Task(task) => task.name(),
            Node::Workflow(workflow) => workflow.name(),
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            Node::Task(task) => task.state(),
            Node::Workflow(workflow) => workflow.state(),
        }
    }

    pub fn result(&self) -> Option<Value> {
        match self {
            Node::Task(task) => task.result(),
            Node::Workflow(workflow) => workflow.result(),
        }
    }

    pub fn flat_result(&self) -> bool {
        match self {
            Node::Task(task) => task.flat_result(),
            Node::Workflow(workflow) => workflow.flat_result(),
        }
    }

    /// Clear cached state recursively so the node can run again.
    pub fn reset(&self) {
        match self {
            Node::Task(task) => task.reset(),
            Node::Workflow(workflow) => workflow.reset(),
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        match self {
            Node::Task(task) => task.set_state(state),
            Node::Workflow(workflow) => workflow.set_state(state),
        }
    }

    pub(crate) fn complete(&self, result: Value) {
        match self {
            Node::Task(task) => task.complete(result),
            Node::Workflow(workflow) => workflow.complete(result),
        }
    }

    pub(crate) fn fail(&self, error: String) {
        match self {
            Node::Task(task) => task.fail(error),
            Node::Workflow(workflow) => workflow.fail(error),
        }
    }

    /// Error text from the most recent failure, if any.
    pub fn error(&self) -> Option<String> {
        match self {
            Node::Task(task) => task.error(),
            Node::Workflow(workflow) => workflow.error(),
        }
    }

    pub(crate) fn request_skip(&self) {
        match self {
            Node::Task(task) => task.request_skip(),
            Node::Workflow(workflow) => workflow.request_skip(),
        }
    }

    pub(crate) fn take_skip_request(&self) -> bool {
        match self {
            Node::Task(task) => task.take_skip_request(),
            Node::Workflow(workflow) => workflow.take_skip_request(),
        }
    }

    pub(crate) fn is_async(&self) -> bool {
        match self {
            Node::Task(task) => task.is_async(),
            // A nested workflow is driven through its own run loop, which
            // performs its own async validation.
            Node::Workflow(_) => false,
        }
    }

    /// Recursive lookup by name through this node and everything below it.
    pub(crate) fn find(&self, name: &str) -> Option<Node> {
        match self {
            Node::Task(task) => (task.name() == name).then(|| self.clone()),
            Node::Workflow(workflow) => workflow.find(name),
        }
    }

    /// Deep copy for `map`/`starmap` fan-out: independent bindings and a
    /// fresh unique name at every level, so context-keyed state (cursors,
    /// lookup by name) never collides between sibling clones.
    pub(crate) fn fanout_clone(&self, index: usize) -> Node {
        match self {
            Node::Task(task) => {
                let name = format!("{}-{}-{}", task.name(), index, short_id());
                Node::Task(task.clone_with_name(name))
            }
            Node::Workflow(workflow) => {
                let name = format!("{}-{}-{}", workflow.name(), index, short_id());
                Node::Workflow(workflow.deep_clone_with_name(name))
            }
        }
    }

    /// Deep copy with a fresh generated name (recursive for workflows).
    pub(crate) fn clone_fresh(&self) -> Node {
        match self {
            Node::Task(task) => {
                let name = format!("{}-{}", task.name(), short_id());
                Node::Task(task.clone_with_name(name))
            }
            Node::Workflow(workflow) => {
                let name = format!("{}-{}", workflow.name(), short_id());
                Node::Workflow(workflow.deep_clone_with_name(name))
            }
        }
    }

    pub(crate) fn set_result(&self, value: Value) {
        match self {
            Node::Task(task) => task.set_result(value),
            Node::Workflow(workflow) => workflow.set_result(value),
        }
    }

    /// Append one positional argument to the node's binding (fan-out).
    pub(crate) fn push_bound_arg(&self, value: Value) {
        match self {
            Node::Task(task) => task.push_arg(value),
            Node::Workflow(workflow) => workflow.push_arg(value),
        }
    }

    pub(crate) fn extend_bound_args(&self, values: Vec<Value>) {
        match self {
            Node::Task(task) => task.extend_args(values),
            Node::Workflow(workflow) => workflow.extend_args(values),
        }
    }

    pub(crate) fn merge_bound_kwargs(&self, kwargs: crate::task::Kwargs) {
        match self {
            Node::Task(task) => task.merge_kwargs(kwargs),
            Node::Workflow(workflow) => workflow.merge_kwargs(kwargs),
        }
    }
}
