//! TTL-bounded correlation handlers for tracked requests.
//!
//! A caller that needs the asynchronous response to a command registers a
//! one-shot handler under the command's tracking id. The feed router calls
//! [`CallbackRegistry::dispatch`] for every domain event; the first event
//! whose correlation id matches consumes the entry. Entries nobody answers
//! are purged by [`CallbackRegistry::sweep`] once their deadline passes, so
//! abandoned requests cannot grow the map without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::trace;

/// One-shot handler for a correlated event.
pub type SpecificCallback = Box<dyn FnOnce(Value) + Send>;

struct PendingCorrelation {
    handler: SpecificCallback,
    deadline: Instant,
}

/// Correlation id → (handler, deadline).
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<String, PendingCorrelation>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `id`, expiring `ttl` from now. Overwrites any
    /// earlier registration for the same id.
    pub fn register(&self, id: impl Into<String>, ttl: Duration, handler: SpecificCallback) {
        self.register_at(id, ttl, handler, Instant::now());
    }

    /// [`register`](Self::register) against an explicit clock.
    pub fn register_at(
        &self,
        id: impl Into<String>,
        ttl: Duration,
        handler: SpecificCallback,
        now: Instant,
    ) {
        let id = id.into();
        trace!("Registering correlation {id} for {ttl:?}");
        self.lock().insert(
            id,
            PendingCorrelation {
                handler,
                deadline: now + ttl,
            },
        );
    }

    /// Deliver `event` to the handler registered for `id`.
    ///
    /// `Ok(())` when a live handler consumed the event. Unknown and expired
    /// ids hand the event back in `Err` so the caller can route it elsewhere.
    pub fn dispatch(&self, id: &str, event: Value) -> Result<(), Value> {
        self.dispatch_at(id, event, Instant::now())
    }

    /// [`dispatch`](Self::dispatch) against an explicit clock.
    pub fn dispatch_at(&self, id: &str, event: Value, now: Instant) -> Result<(), Value> {
        // Remove under the lock, run the handler after releasing it.
        let entry = {
            let mut entries = self.lock();
            match entries.get(id) {
                Some(e) if e.deadline >= now => entries.remove(id),
                Some(_) => {
                    entries.remove(id);
                    None
                }
                None => None,
            }
        };
        match entry {
            Some(pending) => {
                (pending.handler)(event);
                Ok(())
            }
            None => Err(event),
        }
    }

    /// Drop every entry whose deadline is before `now`. Returns how many were
    /// removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.deadline >= now);
        let removed = before - entries.len();
        if removed > 0 {
            trace!("Swept {removed} expired correlation(s)");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCorrelation>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("pending", &self.len())
            .finish()
    }
}
