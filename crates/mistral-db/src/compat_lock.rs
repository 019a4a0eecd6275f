//! In-process row locks for backends without `SELECT ... FOR UPDATE`.
//!
//! SQLite serialises writers per database, not per row, so two sessions that
//! both want exclusive access to one aggregate need something else to queue
//! on. This table of binary semaphores is that something. It only works among
//! sessions created from the same [`crate::Database`] handle and is never a
//! cross-host lock.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

#[derive(Default)]
struct SlotState {
    held: bool,
    owner: Option<u64>,
    /// Sessions between "looked the slot up" and "took it". A slot with
    /// waiters must stay in the registry even when free.
    waiters: usize,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    released: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map of lock key -> (owning session, binary semaphore).
///
/// Lock order is always registry first, then slot.
#[derive(Default)]
pub struct CompatLocks {
    registry: Mutex<HashMap<String, Arc<Slot>>>,
}

impl CompatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `session` owns `key`. Returns immediately if it already does.
    pub fn acquire(&self, key: &str, session: u64) {
        let slot = {
            let mut registry = self.registry();
            let slot = Arc::clone(registry.entry(key.to_string()).or_default());
            {
                let mut state = slot.lock();
                if state.held && state.owner == Some(session) {
                    return;
                }
                state.waiters += 1;
            }
            slot
        };

        let mut state = slot.lock();
        while state.held {
            state = slot
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.waiters -= 1;
        state.held = true;
        state.owner = Some(session);
        debug!(key, session, "compat lock acquired");
    }

    /// Release every lock owned by `session`. Returns how many were released.
    pub fn release_all(&self, session: u64) -> usize {
        let mut registry = self.registry();
        let mut released = 0;
        registry.retain(|_, slot| {
            let mut state = slot.lock();
            if state.held && state.owner == Some(session) {
                state.held = false;
                state.owner = None;
                released += 1;
                slot.released.notify_one();
            }
            state.held || state.waiters > 0
        });
        if released > 0 {
            debug!(session, released, "compat locks released");
        }
        released
    }

    /// Number of keys currently owned by `session`.
    pub fn held_by(&self, session: u64) -> usize {
        self.registry()
            .values()
            .filter(|slot| {
                let state = slot.lock();
                state.held && state.owner == Some(session)
            })
            .count()
    }

    /// Forget every tracked lock, waking anyone still waiting. Test and
    /// shutdown use only.
    pub fn cleanup(&self) {
        let mut registry = self.registry();
        for slot in registry.values() {
            let mut state = slot.lock();
            state.held = false;
            state.owner = None;
            slot.released.notify_all();
        }
        registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reacquire_by_owner_does_not_block() {
        let locks = CompatLocks::new();
        locks.acquire("wf:1", 7);
        locks.acquire("wf:1", 7);
        assert_eq!(locks.held_by(7), 1);
        assert_eq!(locks.release_all(7), 1);
        assert_eq!(locks.held_by(7), 0);
    }

    #[test]
    fn second_session_waits_for_release() {
        let locks = Arc::new(CompatLocks::new());
        locks.acquire("wf:1", 1);

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let locks = Arc::clone(&locks);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                locks.acquire("wf:1", 2);
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst), "lock must still be held");

        locks.release_all(1);
        waiter.join().expect("waiter thread");
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(locks.held_by(2), 1);
    }

    #[test]
    fn different_keys_do_not_contend() {
        let locks = CompatLocks::new();
        locks.acquire("wf:1", 1);
        locks.acquire("wf:2", 2);
        assert_eq!(locks.held_by(1), 1);
        assert_eq!(locks.held_by(2), 1);
    }

    #[test]
    fn released_slots_are_forgotten() {
        let locks = CompatLocks::new();
        locks.acquire("wf:1", 1);
        locks.release_all(1);
        assert!(locks.registry().is_empty());
    }

    #[test]
    fn cleanup_wakes_waiters() {
        let locks = Arc::new(CompatLocks::new());
        locks.acquire("wf:1", 1);
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.acquire("wf:1", 2))
        };
        thread::sleep(Duration::from_millis(50));
        locks.cleanup();
        waiter.join().expect("waiter thread");
    }
}
