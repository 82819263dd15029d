//! Shared execution context
//!
//! One [`Context`] is shared by a root workflow and every nested workflow
//! reachable from it. It carries:
//!
//! - a key/value item store for user data
//! - the per-workflow cursor map that drives loop/conditional jumps
//! - the installed node tree, for lookup by name (state, result, skip)
//! - an ended flag for cooperative early termination
//! - a user lock bracketing cross-branch read-modify-write sequences
//!
//! Two backends implement the same contract. `Local` is plain in-process
//! state behind a mutex, used by the sequential and thread-pool executors.
//! `Remote` proxies every operation over the worker wire protocol back to
//! the owning process, which services it against its local context, so worker
//! processes get identical semantics, with the parent-side user lock acting
//! as the cross-process mutex.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BoxError, EngineError};
use crate::node::Node;
use crate::task::{Kwargs, TaskState};
use crate::util::lock;

/// One context operation, as carried over the worker wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum CtxRequest {
    GetItem { key: String },
    SetItem { key: String, value: Value },
    RemoveItem { key: String },
    GetCursor { name: String },
    SetCursor { name: String, value: i64 },
    ClearCursor { name: String },
    GetState { name: String },
    SetState { name: String, state: TaskState },
    GetResult { name: String },
    SetResult { name: String, value: Value },
    Skip { name: String },
    End,
    IsEnded,
    Acquire,
    Release,
}

/// Reply to a [`CtxRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum CtxResponse {
    Unit,
    Value { value: Option<Value> },
    Cursor { value: Option<i64> },
    State { state: Option<TaskState> },
    Flag { value: bool },
    Error { message: String },
}

/// Transport carrying context operations from a worker process back to the
/// owning process.
pub(crate) trait ContextTransport: Send + Sync {
    fn roundtrip(&self, request: CtxRequest) -> Result<CtxResponse, BoxError>;
}

struct UserLock {
    held: Mutex<bool>,
    available: Condvar,
}

impl UserLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = lock(&self.held);
        while *held {
            held = self
                .available
                .wait(held)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        *held = true;
    }

    fn release(&self) {
        *lock(&self.held) = false;
        self.available.notify_one();
    }
}

#[derive(Default)]
struct ContextState {
    items: Kwargs,
    cursors: HashMap<String, i64>,
    root: Option<Node>,
    ended: bool,
}

pub(crate) struct LocalContext {
    state: Mutex<ContextState>,
    user_lock: UserLock,
}

#[derive(Clone)]
enum ContextBackend {
    Local(Arc<LocalContext>),
    Remote(Arc<dyn ContextTransport>),
}

/// Shared execution environment handle. Cloning shares the same state.
#[derive(Clone)]
pub struct Context {
    backend: ContextBackend,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            ContextBackend::Local(_) => "local",
            ContextBackend::Remote(_) => "remote",
        };
        f.debug_struct("Context").field("backend", &backend).finish()
    }
}

impl Context {
    /// Create an in-process context.
    pub fn new() -> Self {
        Self {
            backend: ContextBackend::Local(Arc::new(LocalContext {
                state: Mutex::new(ContextState::default()),
                user_lock: UserLock::new(),
            })),
        }
    }

    /// Create a proxy context speaking through `transport` (worker side).
    pub(crate) fn remote(transport: Arc<dyn ContextTransport>) -> Self {
        Self {
            backend: ContextBackend::Remote(transport),
        }
    }

    fn send(&self, request: CtxRequest) -> Result<CtxResponse, EngineError> {
        match &self.backend {
            ContextBackend::Local(_) => Ok(self.apply(request)),
            ContextBackend::Remote(transport) => transport
                .roundtrip(request)
                .map_err(|e| EngineError::Context(e.to_string())),
        }
    }

    fn expect_unit(&self, request: CtxRequest) -> Result<(), EngineError> {
        match self.send(request)? {
            CtxResponse::Unit => Ok(()),
            CtxResponse::Error { message } => Err(EngineError::Context(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected context response: {other:?}"
            ))),
        }
    }

    /// Install the running node tree, if none is installed yet.
    pub(crate) fn install_root(&self, node: Node) {
        if let ContextBackend::Local(local) = &self.backend {
            let mut state = lock(&local.state);
            if state.root.is_none() {
                state.root = Some(node);
            }
        }
    }

    fn root(&self) -> Option<Node> {
        match &self.backend {
            ContextBackend::Local(local) => lock(&local.state).root.clone(),
            ContextBackend::Remote(_) => None,
        }
    }

    /// Recursive lookup by name through the installed tree.
    ///
    /// Local contexts only: remote workers address tasks by name through the
    /// state/result/skip operations instead of holding node handles.
    pub fn get_task(&self, name: &str) -> Option<Node> {
        self.root().and_then(|root| root.find(name))
    }

    pub fn get_item(&self, key: &str) -> Result<Option<Value>, EngineError> {
        match self.send(CtxRequest::GetItem { key: key.to_string() })? {
            CtxResponse::Value { value } => Ok(value),
            CtxResponse::Error { message } => Err(EngineError::Context(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected context response: {other:?}"
            ))),
        }
    }

    pub fn set_item(&self, key: &str, value: Value) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::SetItem {
            key: key.to_string(),
            value,
        })
    }

    pub fn remove_item(&self, key: &str) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::RemoveItem {
            key: key.to_string(),
        })
    }

    /// Cursor persisted for the named workflow, if any.
    pub fn cursor(&self, name: &str) -> Result<Option<i64>, EngineError> {
        match self.send(CtxRequest::GetCursor {
            name: name.to_string(),
        })? {
            CtxResponse::Cursor { value } => Ok(value),
            CtxResponse::Error { message } => Err(EngineError::Context(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected context response: {other:?}"
            ))),
        }
    }

    /// Rewrite the named workflow's cursor. The workflow resumes at
    /// `value + 1` after the current stage; this indirection is the goto.
    pub fn set_cursor(&self, name: &str, value: i64) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::SetCursor {
            name: name.to_string(),
            value,
        })
    }

    pub(crate) fn clear_cursor(&self, name: &str) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::ClearCursor {
            name: name.to_string(),
        })
    }

    /// State of the named task or workflow.
    pub fn state_of(&self, name: &str) -> Result<TaskState, EngineError> {
        match self.send(CtxRequest::GetState {
            name: name.to_string(),
        })? {
            CtxResponse::State { state: Some(state) } => Ok(state),
            CtxResponse::State { state: None } => {
                Err(EngineError::UnknownTask(name.to_string()))
            }
            CtxResponse::Error { message } => Err(EngineError::Context(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected context response: {other:?}"
            ))),
        }
    }

    pub fn set_state_of(&self, name: &str, state: TaskState) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::SetState {
            name: name.to_string(),
            state,
        })
    }

    /// Cached result of the named task or workflow.
    pub fn result_of(&self, name: &str) -> Result<Option<Value>, EngineError> {
        match self.send(CtxRequest::GetResult {
            name: name.to_string(),
        })? {
            CtxResponse::Value { value } => Ok(value),
            CtxResponse::Error { message } => Err(EngineError::Context(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected context response: {other:?}"
            ))),
        }
    }

    pub fn set_result_of(&self, name: &str, value: Value) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::SetResult {
            name: name.to_string(),
            value,
        })
    }

    /// Mark the named task or workflow to be bypassed at its next encounter,
    /// retaining its previous result.
    pub fn skip(&self, name: &str) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::Skip {
            name: name.to_string(),
        })
    }

    /// Force early termination: every run loop sharing this context exits at
    /// the next stage boundary and completes normally.
    pub fn end(&self) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::End)
    }

    pub fn is_ended(&self) -> Result<bool, EngineError> {
        match self.send(CtxRequest::IsEnded)? {
            CtxResponse::Flag { value } => Ok(value),
            CtxResponse::Error { message } => Err(EngineError::Context(message)),
            other => Err(EngineError::Protocol(format!(
                "unexpected context response: {other:?}"
            ))),
        }
    }

    pub(crate) fn reset_ended(&self) {
        if let ContextBackend::Local(local) = &self.backend {
            lock(&local.state).ended = false;
        }
    }

    /// Acquire the user lock. Blocks until available.
    pub fn acquire(&self) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::Acquire)
    }

    /// Release the user lock.
    pub fn release(&self) -> Result<(), EngineError> {
        self.expect_unit(CtxRequest::Release)
    }

    /// RAII variant of [`Context::acquire`] / [`Context::release`].
    pub fn hold_lock(&self) -> Result<ContextLockGuard<'_>, EngineError> {
        self.acquire()?;
        Ok(ContextLockGuard { context: self })
    }

    /// Service one context operation against local state. This is what the
    /// parent-side worker service threads call for each request a worker
    /// sends; local contexts route their own operations through it too.
    pub(crate) fn apply(&self, request: CtxRequest) -> CtxResponse {
        let ContextBackend::Local(local) = &self.backend else {
            return CtxResponse::Error {
                message: "context operations cannot be served by a remote proxy".to_string(),
            };
        };
        match request {
            CtxRequest::GetItem { key } => CtxResponse::Value {
                value: lock(&local.state).items.get(&key).cloned(),
            },
            CtxRequest::SetItem { key, value } => {
                lock(&local.state).items.insert(key, value);
                CtxResponse::Unit
            }
            CtxRequest::RemoveItem { key } => {
                lock(&local.state).items.shift_remove(&key);
                CtxResponse::Unit
            }
            CtxRequest::GetCursor { name } => CtxResponse::Cursor {
                value: lock(&local.state).cursors.get(&name).copied(),
            },
            CtxRequest::SetCursor { name, value } => {
                lock(&local.state).cursors.insert(name, value);
                CtxResponse::Unit
            }
            CtxRequest::ClearCursor { name } => {
                lock(&local.state).cursors.remove(&name);
                CtxResponse::Unit
            }
            CtxRequest::GetState { name } => CtxResponse::State {
                state: self.get_task(&name).map(|node| node.state()),
            },
            CtxRequest::SetState { name, state } => match self.get_task(&name) {
                Some(node) => {
                    node.set_state(state);
                    CtxResponse::Unit
                }
                None => CtxResponse::Error {
                    message: EngineError::UnknownTask(name).to_string(),
                },
            },
            CtxRequest::GetResult { name } => CtxResponse::Value {
                value: self.get_task(&name).and_then(|node| node.result()),
            },
            CtxRequest::SetResult { name, value } => match self.get_task(&name) {
                Some(node) => {
                    node.set_result(value);
                    CtxResponse::Unit
                }
                None => CtxResponse::Error {
                    message: EngineError::UnknownTask(name).to_string(),
                },
            },
            CtxRequest::Skip { name } => match self.get_task(&name) {
                Some(node) => {
                    node.request_skip();
                    CtxResponse::Unit
                }
                None => CtxResponse::Error {
                    message: EngineError::UnknownTask(name).to_string(),
                },
            },
            CtxRequest::End => {
                lock(&local.state).ended = true;
                CtxResponse::Unit
            }
            CtxRequest::IsEnded => CtxResponse::Flag {
                value: lock(&local.state).ended,
            },
            CtxRequest::Acquire => {
                local.user_lock.acquire();
                CtxResponse::Unit
            }
            CtxRequest::Release => {
                local.user_lock.release();
                CtxResponse::Unit
            }
        }
    }
}

/// Holds the context user lock until dropped.
pub struct ContextLockGuard<'a> {
    context: &'a Context,
}

impl Drop for ContextLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.context.release() {
            tracing::warn!(error = %err, "failed to release context lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::task::Task;

    #[test]
    fn test_item_store_roundtrip() {
        let ctx = Context::new();
        assert_eq!(ctx.get_item("missing").unwrap(), None);

        ctx.set_item("count", json!(3)).unwrap();
        assert_eq!(ctx.get_item("count").unwrap(), Some(json!(3)));

        ctx.remove_item("count").unwrap();
        assert_eq!(ctx.get_item("count").unwrap(), None);
    }

    #[test]
    fn test_cursor_map_is_per_name() {
        let ctx = Context::new();
        ctx.set_cursor("outer", 2).unwrap();
        ctx.set_cursor("inner", -1).unwrap();

        assert_eq!(ctx.cursor("outer").unwrap(), Some(2));
        assert_eq!(ctx.cursor("inner").unwrap(), Some(-1));
        assert_eq!(ctx.cursor("other").unwrap(), None);

        ctx.clear_cursor("outer").unwrap();
        assert_eq!(ctx.cursor("outer").unwrap(), None);
        assert_eq!(ctx.cursor("inner").unwrap(), Some(-1));
    }

    #[test]
    fn test_task_lookup_through_installed_tree() {
        let ctx = Context::new();
        let task = Task::new("leaf", |_: &[Value], _: &Kwargs| Ok(json!(1)));
        ctx.install_root(Node::Task(task.clone()));

        assert!(ctx.get_task("leaf").is_some());
        assert!(ctx.get_task("other").is_none());
        assert_eq!(ctx.state_of("leaf").unwrap(), TaskState::Pending);
        assert!(matches!(
            ctx.state_of("other"),
            Err(EngineError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_skip_marks_state_and_retains_result() {
        let ctx = Context::new();
        let task = Task::new("leaf", |_: &[Value], _: &Kwargs| Ok(json!(1)));
        task.run(&[], &Kwargs::new()).unwrap();
        ctx.install_root(Node::Task(task.clone()));

        ctx.skip("leaf").unwrap();
        assert_eq!(task.state(), TaskState::Skipped);
        assert_eq!(task.result(), Some(json!(1)));
    }

    #[test]
    fn test_end_flag() {
        let ctx = Context::new();
        assert!(!ctx.is_ended().unwrap());
        ctx.end().unwrap();
        assert!(ctx.is_ended().unwrap());
        ctx.reset_ended();
        assert!(!ctx.is_ended().unwrap());
    }

    #[test]
    fn test_user_lock_brackets_cross_thread_updates() {
        let ctx = Context::new();
        ctx.set_item("n", json!(0)).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let _guard = ctx.hold_lock().unwrap();
                        let n = ctx.get_item("n").unwrap().unwrap().as_i64().unwrap();
                        ctx.set_item("n", json!(n + 1)).unwrap();
                    }
                });
            }
        });

        assert_eq!(ctx.get_item("n").unwrap(), Some(json!(200)));
    }

    #[test]
    fn test_protocol_types_roundtrip_as_json_lines() {
        let request = CtxRequest::SetCursor {
            name: "flow".to_string(),
            value: -1,
        };
        let line = serde_json::to_string(&request).unwrap();
        let parsed: CtxRequest = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            parsed,
            CtxRequest::SetCursor { ref name, value: -1 } if name == "flow"
        ));

        let response = CtxResponse::State {
            state: Some(TaskState::Completed),
        };
        let line = serde_json::to_string(&response).unwrap();
        let parsed: CtxResponse = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            parsed,
            CtxResponse::State {
                state: Some(TaskState::Completed)
            }
        ));
    }
}
