//! Poison-tolerant locking for state shared by the client's stdio pump threads.

use std::sync::{Mutex, MutexGuard};

/// Take `lock` even if a pump thread panicked while holding it.
///
/// The guarded values here are sockets and append-only logs, which stay usable
/// after a panic mid-write.
pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(context, "lock poisoned by a panicked thread; continuing");
        poisoned.into_inner()
    })
}
