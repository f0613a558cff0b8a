// src/core/state.rs

//! The daemon-wide state machine. Transitions flow one way:
//! `Invalid -> Initialized -> Running -> Exiting -> Shutdown`.

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Nothing is built yet.
    Invalid,
    /// Tables and channels exist; no listener open, no worker running.
    Initialized,
    /// The accept loop is (or is about to be) serving.
    Running,
    /// Shutdown has been requested; loops drain and exit.
    Exiting,
    /// Everything is torn down.
    Shutdown,
}

/// A small cell combining the authoritative state value with a watch
/// channel, so blocking observers (workers, the signal task) wake up on
/// every transition instead of polling.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<DaemonState>,
    tx: watch::Sender<DaemonState>,
}

impl StateCell {
    pub fn new() -> StateCell {
        let (tx, _) = watch::channel(DaemonState::Invalid);
        StateCell {
            state: Mutex::new(DaemonState::Invalid),
            tx,
        }
    }

    pub fn get(&self) -> DaemonState {
        *self.state.lock()
    }

    pub fn set(&self, next: DaemonState) {
        *self.state.lock() = next;
        // send_replace stores the value even with no live observers.
        self.tx.send_replace(next);
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new()
    }
}
