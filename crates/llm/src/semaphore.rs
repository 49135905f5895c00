//! Fair counting semaphore with direct slot hand-off.
//!
//! `tokio::sync::Semaphore` would bound concurrency, but the gateway
//! contract also needs observable `active`/`pending` counts and strict
//! FIFO transfer of a released slot to the longest waiter. Both fall out
//! naturally from an explicit waiter queue of oneshot senders.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

struct State {
    capacity: usize,
    active: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

struct Inner {
    state: Mutex<State>,
}

/// FIFO-fair counting semaphore. Cloning shares the same slots.
#[derive(Clone)]
pub struct FairSemaphore {
    inner: Arc<Inner>,
}

/// An acquired slot. Dropping it releases the slot — or hands it directly
/// to the longest waiter, keeping the active count unchanged.
pub struct Permit {
    inner: Arc<Inner>,
}

impl FairSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    capacity: capacity.max(1),
                    active: 0,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Wait for a slot. Callers are granted strictly in call order.
    pub async fn acquire(&self) -> Permit {
        let rx = {
            let mut state = self.inner.state.lock().expect("semaphore state poisoned");
            if state.active < state.capacity {
                state.active += 1;
                return Permit { inner: self.inner.clone() };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };
        // The sender is only dropped when a permit hand-off fails, and
        // that path re-queues the slot, so this resolves for any waiter
        // still alive.
        rx.await.expect("semaphore closed while waiting")
    }

    /// Number of currently held slots.
    pub fn active(&self) -> usize {
        self.inner.state.lock().expect("semaphore state poisoned").active
    }

    /// Number of queued acquirers.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().expect("semaphore state poisoned").waiters.len()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let waiter = {
            let mut state = self.inner.state.lock().expect("semaphore state poisoned");
            match state.waiters.pop_front() {
                Some(tx) => Some(tx),
                None => {
                    state.active -= 1;
                    None
                }
            }
        };
        if let Some(tx) = waiter {
            let transferred = Permit { inner: self.inner.clone() };
            if let Err(orphan) = tx.send(transferred) {
                // The waiter's future was cancelled; dropping the orphan
                // permit retries the hand-off with the next waiter.
                drop(orphan);
            }
        }
    }
}
