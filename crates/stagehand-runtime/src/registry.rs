//! Process-global task registry
//!
//! Worker processes are re-executions of the current binary, so a task that
//! should run on the process pool has to be resolvable by name on both
//! sides. Embedders register their callables once at startup, before
//! `worker::init()`, and reference them with [`Task::registered`]
//! (`crate::task::Task::registered`). Registered tasks run on every
//! executor, not just the process pool.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::task::{SyncCtxTaskFn, SyncTaskFn};

#[derive(Clone)]
pub(crate) enum RegisteredCallable {
    Sync(Arc<dyn SyncTaskFn>),
    WithContext(Arc<dyn SyncCtxTaskFn>),
}

fn registry() -> &'static RwLock<HashMap<String, RegisteredCallable>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, RegisteredCallable>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn insert(name: String, callable: RegisteredCallable) {
    let mut table = registry().write().unwrap_or_else(|e| e.into_inner());
    if table.insert(name.clone(), callable).is_some() {
        tracing::debug!(task = %name, "re-registered task callable");
    }
}

/// Register a synchronous callable under `name`.
pub fn register_task(name: impl Into<String>, f: impl SyncTaskFn + 'static) {
    insert(name.into(), RegisteredCallable::Sync(Arc::new(f)));
}

/// Register a context-aware synchronous callable under `name`.
pub fn register_task_with_context(name: impl Into<String>, f: impl SyncCtxTaskFn + 'static) {
    insert(name.into(), RegisteredCallable::WithContext(Arc::new(f)));
}

pub(crate) fn lookup(name: &str) -> Option<RegisteredCallable> {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::task::{Kwargs, Task, TaskState};

    #[test]
    fn test_registered_task_resolves_at_execution() {
        register_task("registry.double", |args: &[Value], _: &Kwargs| {
            Ok(json!(args[0].as_i64().unwrap_or(0) * 2))
        });

        let task = Task::registered("double", "registry.double").with_args(vec![json!(21)]);
        assert_eq!(task.run(&[], &Kwargs::new()).unwrap(), json!(42));
    }

    #[test]
    fn test_unregistered_key_fails_the_task() {
        let task = Task::registered("nope", "registry.missing");
        assert!(task.run(&[], &Kwargs::new()).is_err());
        assert_eq!(task.state(), TaskState::Failure);
    }
}
