//! Ordering of engine operations.
//!
//! Normal operations are queued per key: an operation starts only after the
//! previous operation on the same key has released its guard. Exclusive
//! operations wait for everything submitted before them and hold back
//! everything submitted after them until their guard is dropped.
//!
//! Queue positions are taken synchronously when a [`Ticket`] is issued, so
//! the order of submission is the order of execution regardless of when the
//! tasks holding the tickets get polled.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Completion of the latest queued operation on each key.
    tails: HashMap<String, (u64, oneshot::Receiver<()>)>,
    /// Release signal of the latest exclusive operation.
    exclusive: Option<watch::Receiver<bool>>,
}

#[derive(Clone, Default)]
pub struct OperationCoordinator {
    state: Arc<Mutex<State>>,
}

impl OperationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a normal operation on `key`.
    pub fn normal(&self, key: &str) -> Ticket {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        let (done, finished) = oneshot::channel();
        let previous = state.tails.insert(key.to_owned(), (seq, finished)).map(|(_, rx)| rx);
        Ticket {
            waits: previous.into_iter().collect(),
            gate: state.exclusive.clone(),
            release: Release::Key { state: Arc::clone(&self.state), key: key.to_owned(), seq, done },
        }
    }

    /// Queue an exclusive operation.
    pub fn exclusive(&self) -> Ticket {
        let mut state = self.state.lock();
        let waits = state.tails.drain().map(|(_, (_, rx))| rx).collect();
        let (done, released) = watch::channel(false);
        let gate = state.exclusive.replace(released);
        Ticket { waits, gate, release: Release::Exclusive { done } }
    }

    /// Number of keys with a queued or running normal operation.
    pub fn queued_keys(&self) -> usize {
        self.state.lock().tails.len()
    }
}

enum Release {
    Key { state: Arc<Mutex<State>>, key: String, seq: u64, done: oneshot::Sender<()> },
    Exclusive { done: watch::Sender<bool> },
}

impl Release {
    fn release(self) {
        match self {
            Release::Key { state, key, seq, done } => {
                {
                    let mut state = state.lock();
                    if state.tails.get(&key).is_some_and(|(tail, _)| *tail == seq) {
                        state.tails.remove(&key);
                    }
                }
                let _ = done.send(());
            }
            Release::Exclusive { done } => {
                done.send_replace(true);
            }
        }
    }
}

/// A queue position. Await [`Ticket::ready`] to start the operation.
#[must_use = "a ticket holds its queue position until it is used or dropped"]
pub struct Ticket {
    waits: Vec<oneshot::Receiver<()>>,
    gate: Option<watch::Receiver<bool>>,
    release: Release,
}

impl Ticket {
    /// Wait until every earlier conflicting operation has finished.
    pub async fn ready(self) -> OperationGuard {
        if let Some(mut gate) = self.gate {
            // A dropped sender also means the exclusive operation is over.
            let _ = gate.wait_for(|released| *released).await;
        }
        for finished in self.waits {
            let _ = finished.await;
        }
        OperationGuard { release: Some(self.release) }
    }
}

/// Held while an operation runs; dropping it lets the next one start.
pub struct OperationGuard {
    release: Option<Release>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release.release();
        }
    }
}
