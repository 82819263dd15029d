//! Tasks: the atomic unit of work
//!
//! A [`Task`] wraps a callable together with bound arguments, a lifecycle
//! state, and a cached result. Tasks are cheap, shared handles: `Clone`
//! produces another view of the same execution state, which is what lets a
//! running [`Context`](crate::context::Context) look tasks up by name and
//! mutate them. [`Task::clone_with_name`] is the explicit deep copy used by
//! `map`/`starmap` fan-out.
//!
//! Callables come in four shapes (sync, sync with context, async, async
//! with context) plus [`Task::registered`], which defers to the process
//! registry by name so the task can execute inside a worker process.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::BoxError;
use crate::registry;
use crate::util::lock;

/// Keyword arguments, in declaration order.
pub type Kwargs = serde_json::Map<String, Value>;

/// Boxed future returned by async task callables.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;

/// Lifecycle state of a task or workflow.
///
/// `Pending → Running → {Completed | Failure}`. `Skipped` is requested
/// externally through the context, bypasses exactly one encounter, and
/// leaves the previous result untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failure,
    Skipped,
}

/// Synchronous task callable.
pub trait SyncTaskFn: DynClone + Send + Sync {
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, BoxError>;
}

dyn_clone::clone_trait_object!(SyncTaskFn);

impl<F> SyncTaskFn for F
where
    F: Fn(&[Value], &Kwargs) -> Result<Value, BoxError> + Clone + Send + Sync,
{
    fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, BoxError> {
        self(args, kwargs)
    }
}

/// Synchronous task callable that receives the shared execution context.
pub trait SyncCtxTaskFn: DynClone + Send + Sync {
    fn call(&self, ctx: &Context, args: &[Value], kwargs: &Kwargs) -> Result<Value, BoxError>;
}

dyn_clone::clone_trait_object!(SyncCtxTaskFn);

impl<F> SyncCtxTaskFn for F
where
    F: Fn(&Context, &[Value], &Kwargs) -> Result<Value, BoxError> + Clone + Send + Sync,
{
    fn call(&self, ctx: &Context, args: &[Value], kwargs: &Kwargs) -> Result<Value, BoxError> {
        self(ctx, args, kwargs)
    }
}

/// Async task callable.
pub trait AsyncTaskFn: DynClone + Send + Sync {
    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> TaskFuture;
}

dyn_clone::clone_trait_object!(AsyncTaskFn);

impl<F> AsyncTaskFn for F
where
    F: Fn(Vec<Value>, Kwargs) -> TaskFuture + Clone + Send + Sync,
{
    fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> TaskFuture {
        self(args, kwargs)
    }
}

/// Async task callable that receives the shared execution context.
pub trait AsyncCtxTaskFn: DynClone + Send + Sync {
    fn call(&self, ctx: Context, args: Vec<Value>, kwargs: Kwargs) -> TaskFuture;
}

dyn_clone::clone_trait_object!(AsyncCtxTaskFn);

impl<F> AsyncCtxTaskFn for F
where
    F: Fn(Context, Vec<Value>, Kwargs) -> TaskFuture + Clone + Send + Sync,
{
    fn call(&self, ctx: Context, args: Vec<Value>, kwargs: Kwargs) -> TaskFuture {
        self(ctx, args, kwargs)
    }
}

#[derive(Clone)]
pub(crate) enum Callable {
    Sync(Box<dyn SyncTaskFn>),
    SyncCtx(Box<dyn SyncCtxTaskFn>),
    Async(Box<dyn AsyncTaskFn>),
    AsyncCtx(Box<dyn AsyncCtxTaskFn>),
    /// Resolved through the process registry at execution time.
    Registered(String),
}

pub(crate) struct TaskInner {
    pub(crate) name: String,
    pub(crate) callable: Callable,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Kwargs,
    pub(crate) immutable: bool,
    pub(crate) flat_result: bool,
    pub(crate) state: TaskState,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<String>,
    pub(crate) skip_requested: bool,
}

/// Atomic unit of work: a callable plus bound arguments and lifecycle state.
///
/// `Clone` is shallow and shares execution state with the original handle.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Mutex<TaskInner>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Task")
            .field("name", &inner.name)
            .field("state", &inner.state)
            .field("immutable", &inner.immutable)
            .field("flat_result", &inner.flat_result)
            .finish()
    }
}

impl Task {
    fn from_callable(name: impl Into<String>, callable: Callable) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskInner {
                name: name.into(),
                callable,
                args: Vec::new(),
                kwargs: Kwargs::new(),
                immutable: false,
                flat_result: false,
                state: TaskState::Pending,
                result: None,
                error: None,
                skip_requested: false,
            })),
        }
    }

    /// Create a task from a synchronous callable.
    pub fn new(name: impl Into<String>, f: impl SyncTaskFn + 'static) -> Self {
        Self::from_callable(name, Callable::Sync(Box::new(f)))
    }

    /// Create a task whose callable receives the shared [`Context`] ahead of
    /// its arguments. This is how control-flow primitives obtain cursor
    /// access.
    pub fn with_context(name: impl Into<String>, f: impl SyncCtxTaskFn + 'static) -> Self {
        Self::from_callable(name, Callable::SyncCtx(Box::new(f)))
    }

    /// Create a task from an async callable. Only runnable through
    /// `async_run` on the sequential executor.
    pub fn new_async(name: impl Into<String>, f: impl AsyncTaskFn + 'static) -> Self {
        Self::from_callable(name, Callable::Async(Box::new(f)))
    }

    /// Async callable that also receives the shared [`Context`].
    pub fn async_with_context(name: impl Into<String>, f: impl AsyncCtxTaskFn + 'static) -> Self {
        Self::from_callable(name, Callable::AsyncCtx(Box::new(f)))
    }

    /// Create a task resolved through the process registry by `key`.
    ///
    /// Registered tasks run on every executor; they are the only tasks the
    /// process pool can ship to worker processes.
    pub fn registered(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::from_callable(name, Callable::Registered(key.into()))
    }

    /// Bind positional arguments (mutable binding: upstream results are
    /// prepended at execution time).
    pub fn with_args(self, args: Vec<Value>) -> Self {
        lock(&self.inner).args = args;
        self
    }

    /// Bind keyword arguments (runtime kwargs are merged over these).
    pub fn with_kwargs(self, kwargs: Kwargs) -> Self {
        lock(&self.inner).kwargs = kwargs;
        self
    }

    /// Make the binding immutable: the task ignores all upstream and runtime
    /// arguments and always executes with only its own bound arguments.
    pub fn immutable(self) -> Self {
        lock(&self.inner).immutable = true;
        self
    }

    /// When set, a list-valued result is spliced element-by-element into the
    /// next stage's input instead of being passed as one nested value.
    pub fn with_flat_result(self, flat: bool) -> Self {
        lock(&self.inner).flat_result = flat;
        self
    }

    pub fn name(&self) -> String {
        lock(&self.inner).name.clone()
    }

    pub fn state(&self) -> TaskState {
        lock(&self.inner).state
    }

    pub fn result(&self) -> Option<Value> {
        lock(&self.inner).result.clone()
    }

    /// Error text recorded by the most recent failure, if any.
    pub fn error(&self) -> Option<String> {
        lock(&self.inner).error.clone()
    }

    pub fn is_immutable(&self) -> bool {
        lock(&self.inner).immutable
    }

    pub fn flat_result(&self) -> bool {
        lock(&self.inner).flat_result
    }

    /// Clear result, error, and state so the task can be reused.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.state = TaskState::Pending;
        inner.result = None;
        inner.error = None;
        inner.skip_requested = false;
    }

    /// Deep copy with independent bindings and a new name. The callable
    /// itself is cloned; execution state starts fresh.
    pub fn clone_with_name(&self, name: impl Into<String>) -> Self {
        let inner = lock(&self.inner);
        Self {
            inner: Arc::new(Mutex::new(TaskInner {
                name: name.into(),
                callable: inner.callable.clone(),
                args: inner.args.clone(),
                kwargs: inner.kwargs.clone(),
                immutable: inner.immutable,
                flat_result: inner.flat_result,
                state: TaskState::Pending,
                result: None,
                error: None,
                skip_requested: false,
            })),
        }
    }

    /// Append one positional argument to the existing binding (fan-out).
    pub(crate) fn push_arg(&self, value: Value) {
        lock(&self.inner).args.push(value);
    }

    pub(crate) fn extend_args(&self, values: Vec<Value>) {
        lock(&self.inner).args.extend(values);
    }

    pub(crate) fn merge_kwargs(&self, kwargs: Kwargs) {
        let mut inner = lock(&self.inner);
        for (k, v) in kwargs {
            inner.kwargs.insert(k, v);
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        lock(&self.inner).state = state;
    }

    pub(crate) fn complete(&self, result: Value) {
        let mut inner = lock(&self.inner);
        inner.state = TaskState::Completed;
        inner.result = Some(result);
        inner.error = None;
    }

    pub(crate) fn fail(&self, error: String) {
        let mut inner = lock(&self.inner);
        inner.state = TaskState::Failure;
        inner.result = None;
        inner.error = Some(error);
    }

    pub(crate) fn set_result(&self, result: Value) {
        lock(&self.inner).result = Some(result);
    }

    /// Arm a one-shot bypass and surface it in the state.
    pub(crate) fn request_skip(&self) {
        let mut inner = lock(&self.inner);
        inner.skip_requested = true;
        inner.state = TaskState::Skipped;
    }

    /// Consume an armed skip request, if any.
    pub(crate) fn take_skip_request(&self) -> bool {
        let mut inner = lock(&self.inner);
        std::mem::take(&mut inner.skip_requested)
    }

    pub(crate) fn is_async(&self) -> bool {
        matches!(
            lock(&self.inner).callable,
            Callable::Async(_) | Callable::AsyncCtx(_)
        )
    }

    /// Registry key, when this task is registry-backed.
    pub(crate) fn registered_key(&self) -> Option<String> {
        match &lock(&self.inner).callable {
            Callable::Registered(key) => Some(key.clone()),
            _ => None,
        }
    }

    /// Assemble the effective call arguments from upstream/runtime input and
    /// the task's own binding.
    pub(crate) fn effective_call(&self, upstream: &[Value], runtime_kwargs: &Kwargs) -> (Vec<Value>, Kwargs) {
        let inner = lock(&self.inner);
        if inner.immutable {
            return (inner.args.clone(), inner.kwargs.clone());
        }
        let mut args = Vec::with_capacity(upstream.len() + inner.args.len());
        args.extend(upstream.iter().cloned());
        args.extend(inner.args.iter().cloned());
        let mut kwargs = inner.kwargs.clone();
        for (k, v) in runtime_kwargs {
            kwargs.insert(k.clone(), v.clone());
        }
        (args, kwargs)
    }

    /// Execute the callable without touching lifecycle state. The executor
    /// owns the Running/Completed/Failure transitions around this call.
    pub(crate) fn invoke(
        &self,
        ctx: Option<&Context>,
        upstream: &[Value],
        runtime_kwargs: &Kwargs,
    ) -> Result<Value, BoxError> {
        let (args, kwargs) = self.effective_call(upstream, runtime_kwargs);
        let callable = lock(&self.inner).callable.clone();
        match callable {
            Callable::Sync(f) => f.call(&args, &kwargs),
            Callable::SyncCtx(f) => {
                let ctx = ctx.ok_or("task requires a context but none is installed")?;
                f.call(ctx, &args, &kwargs)
            }
            Callable::Registered(key) => match registry::lookup(&key) {
                Some(registry::RegisteredCallable::Sync(f)) => f.call(&args, &kwargs),
                Some(registry::RegisteredCallable::WithContext(f)) => {
                    let ctx = ctx.ok_or("task requires a context but none is installed")?;
                    f.call(ctx, &args, &kwargs)
                }
                None => Err(format!("task `{key}` is not registered").into()),
            },
            Callable::Async(_) | Callable::AsyncCtx(_) => {
                Err("async task invoked on a synchronous path".into())
            }
        }
    }

    /// Async counterpart of [`Task::invoke`]; sync callables run inline.
    pub(crate) fn invoke_async(
        &self,
        ctx: Option<&Context>,
        upstream: Vec<Value>,
        runtime_kwargs: Kwargs,
    ) -> TaskFuture {
        let (args, kwargs) = self.effective_call(&upstream, &runtime_kwargs);
        let callable = lock(&self.inner).callable.clone();
        match callable {
            Callable::Async(f) => f.call(args, kwargs),
            Callable::AsyncCtx(f) => match ctx {
                Some(ctx) => f.call(ctx.clone(), args, kwargs),
                None => Box::pin(async {
                    Err::<Value, BoxError>("task requires a context but none is installed".into())
                }),
            },
            _ => {
                let out = self.invoke(ctx, &upstream, &runtime_kwargs);
                Box::pin(async move { out })
            }
        }
    }

    /// Run the task directly, outside any workflow.
    ///
    /// Executes with the task's binding semantics, records the result (or
    /// the failure) on the task, and returns it. Context-aware tasks cannot
    /// run standalone.
    pub fn run(&self, extra: &[Value], kwargs: &Kwargs) -> Result<Value, BoxError> {
        self.set_state(TaskState::Running);
        match self.invoke(None, extra, kwargs) {
            Ok(value) => {
                self.complete(value.clone());
                Ok(value)
            }
            Err(err) => {
                self.fail(err.to_string());
                Err(err)
            }
        }
    }
}
