use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub type Handler<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Identifies one registration. Registering the same closure twice yields two
/// ids, and `off` removes exactly the one it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Fan-out of payloads to handlers keyed by `K`. Handlers run in registration
/// order, outside the internal lock, so they may call `on`/`off` on the same
/// registry. A panicking handler is logged and skipped.
pub struct SubscriberRegistry<K, P> {
    handlers: Mutex<HashMap<K, Vec<(HandlerId, Handler<P>)>>>,
    next_id: AtomicU64,
}

impl<K, P> Default for SubscriberRegistry<K, P>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> SubscriberRegistry<K, P>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on<F>(&self, key: K, handler: F) -> HandlerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.on_shared(key, Arc::new(handler))
    }

    pub fn on_shared(&self, key: K, handler: Handler<P>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(key).or_default().push((id, handler));
        id
    }

    /// Returns `false` when no such registration exists under `key`.
    pub fn off(&self, key: &K, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(key);
        }
        removed
    }

    /// Invokes every handler registered under `key` at the time of the call.
    /// Returns the number of handlers that completed without panicking.
    pub fn emit(&self, key: &K, payload: &P) -> usize {
        let snapshot: Vec<(HandlerId, Handler<P>)> = match self.lock().get(key) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut completed = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    tracing::warn!(key = ?key, handler = id.0, panic = %message, "event handler panicked");
                }
            }
        }
        completed
    }

    pub fn handler_count(&self, key: &K) -> usize {
        self.lock().get(key).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<(HandlerId, Handler<P>)>>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
