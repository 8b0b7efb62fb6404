//! Hook/FSM synchronization gate.
//!
//! While a leader hook is submitting commands, the local FSM must not
//! interleave entries arriving from other leaders: the hook's view of
//! the registries would be yanked from under it. Each hook invocation
//! activates the gate with a fresh nonce and tags its submissions with
//! it; the FSM lets matching entries through and blocks everything
//! else until the hook releases the gate.

use std::sync::{Arc, Condvar, Mutex};

struct Gate {
    /// Nonce of the hook currently holding the gate, if any.
    nonce: Option<u64>,
}

pub struct HookSync {
    gate: Mutex<Gate>,
    cond: Condvar,
}

impl Default for HookSync {
    fn default() -> Self {
        Self::new()
    }
}

impl HookSync {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(Gate { nonce: None }),
            cond: Condvar::new(),
        }
    }

    /// Activate the gate for one hook invocation, waiting for any
    /// other hook to finish first. The gate is released when the
    /// returned guard drops.
    pub fn enter(self: &Arc<Self>) -> HookGuard {
        let mut gate = self.gate.lock().unwrap();
        while gate.nonce.is_some() {
            gate = self.cond.wait(gate).unwrap();
        }
        let nonce = fresh_nonce();
        gate.nonce = Some(nonce);
        HookGuard {
            sync: Arc::clone(self),
            nonce,
        }
    }

    /// Block until the entry tagged with `origin` may be applied.
    pub fn wait_allowed(&self, origin: u64) {
        let mut gate = self.gate.lock().unwrap();
        while matches!(gate.nonce, Some(nonce) if nonce != origin) {
            gate = self.cond.wait(gate).unwrap();
        }
    }

    fn release(&self, nonce: u64) {
        let mut gate = self.gate.lock().unwrap();
        debug_assert_eq!(gate.nonce, Some(nonce));
        gate.nonce = None;
        self.cond.notify_all();
    }
}

/// Holds the gate for the duration of one hook invocation.
pub struct HookGuard {
    sync: Arc<HookSync>,
    nonce: u64,
}

impl HookGuard {
    /// The nonce to tag this hook's command submissions with.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        self.sync.release(self.nonce);
    }
}

// Zero is reserved for "no origin".
fn fresh_nonce() -> u64 {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let high = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let low = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    (high ^ low).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_own_nonce_passes_while_gate_held() {
        let sync = Arc::new(HookSync::new());
        let guard = sync.enter();
        // Must not block.
        sync.wait_allowed(guard.nonce());
    }

    #[test]
    fn test_foreign_entry_blocks_until_release() {
        let sync = Arc::new(HookSync::new());
        let guard = sync.enter();

        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.wait_allowed(0))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn test_everything_passes_when_inactive() {
        let sync = Arc::new(HookSync::new());
        sync.wait_allowed(0);
        sync.wait_allowed(12345);
    }

    #[test]
    fn test_nonces_are_nonzero_and_distinct() {
        for _ in 0..100 {
            assert_ne!(fresh_nonce(), 0);
        }
        assert_ne!(fresh_nonce(), fresh_nonce());
    }
}
