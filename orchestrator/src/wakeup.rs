//! Event-or-timeout wait between loop iterations.
//!
//! The registry keeps a set of one-shot callbacks per orchestration id, keyed
//! by token. [`WakeupRegistry::notify`] drains the set and fires each callback
//! exactly once, so concurrent waiters never overwrite each other. A notify
//! that finds no callback is remembered, and the next [`WakeupRegistry::wait`]
//! for that id returns at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};
use std::time::Duration;

use tracing::trace;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakeupToken(u64);

#[derive(Default)]
struct Slot {
    callbacks: HashMap<WakeupToken, Callback>,
    /// A notify arrived while nobody was registered.
    missed: bool,
}

#[derive(Default)]
pub struct WakeupRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

impl WakeupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(
        &self,
        slots: &mut HashMap<String, Slot>,
        orchestration_id: &str,
        callback: Callback,
    ) -> WakeupToken {
        let token = WakeupToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        slots
            .entry(orchestration_id.to_string())
            .or_default()
            .callbacks
            .insert(token, callback);
        token
    }

    pub fn register(
        &self,
        orchestration_id: &str,
        callback: impl FnOnce() + Send + 'static,
    ) -> WakeupToken {
        let mut slots = self.slots();
        self.insert(&mut slots, orchestration_id, Box::new(callback))
    }

    /// Remove a callback that has not fired. Returns whether it was pending.
    pub fn cancel(&self, orchestration_id: &str, token: WakeupToken) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(orchestration_id) else {
            return false;
        };
        let removed = slot.callbacks.remove(&token).is_some();
        if slot.callbacks.is_empty() && !slot.missed {
            slots.remove(orchestration_id);
        }
        removed
    }

    /// Fire every pending callback for the id. Returns how many fired.
    pub fn notify(&self, orchestration_id: &str) -> usize {
        let drained = {
            let mut slots = self.slots();
            let slot = slots.entry(orchestration_id.to_string()).or_default();
            if slot.callbacks.is_empty() {
                slot.missed = true;
                trace!(orchestration_id, "wakeup held for the next waiter");
                return 0;
            }
            let drained = std::mem::take(&mut slot.callbacks);
            slots.remove(orchestration_id);
            drained
        };
        let fired = drained.len();
        // Callbacks run outside the lock so they may register again.
        for (_, callback) in drained {
            callback();
        }
        trace!(orchestration_id, fired, "wakeups delivered");
        fired
    }

    pub fn pending_count(&self, orchestration_id: &str) -> usize {
        self.slots()
            .get(orchestration_id)
            .map_or(0, |slot| slot.callbacks.len())
    }

    /// Block until notified or until `timeout` passes. Returns true when woken.
    ///
    /// A notify held since the last wait wakes the caller immediately.
    pub fn wait(&self, orchestration_id: &str, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let token = {
            let mut slots = self.slots();
            if let Some(slot) = slots.get_mut(orchestration_id)
                && slot.missed
            {
                slot.missed = false;
                if slot.callbacks.is_empty() {
                    slots.remove(orchestration_id);
                }
                return true;
            }
            self.insert(
                &mut slots,
                orchestration_id,
                Box::new(move || {
                    let _ = tx.send(());
                }),
            )
        };
        match rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(_) => {
                self.cancel(orchestration_id, token);
                false
            }
        }
    }
}
