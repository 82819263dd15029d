use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Engine bookkeeping stays consistent across branch panics because every
/// mutation is a single small critical section.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Short unique suffix for generated node names.
pub(crate) fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
