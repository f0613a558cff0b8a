// src/connection/registry.rs

//! Tracks every live front-end connection so shutdown can ask them all to
//! stop and then watch the population drain to zero.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Iscsi,
    Uctl,
}

/// Metadata kept per live connection.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub addr: SocketAddr,
    pub kind: ConnKind,
    /// Tag of the portal the connection arrived through.
    pub tag: u32,
}

/// The registry itself. Connection handlers register on accept and are
/// deregistered by their guard when the handler task ends.
#[derive(Debug)]
pub struct ConnRegistry {
    conns: DashMap<u64, ConnInfo>,
    next_id: AtomicU64,
    stop_tx: broadcast::Sender<()>,
}

impl ConnRegistry {
    pub fn new() -> ConnRegistry {
        let (stop_tx, _) = broadcast::channel(1);
        ConnRegistry {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
            stop_tx,
        }
    }

    /// Registers a new connection and hands back its id plus the stop
    /// receiver its handler must select on.
    pub fn register(
        &self,
        addr: SocketAddr,
        kind: ConnKind,
        tag: u32,
    ) -> (u64, broadcast::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, ConnInfo { addr, kind, tag });
        (id, self.stop_tx.subscribe())
    }

    pub fn deregister(&self, id: u64) {
        if self.conns.remove(&id).is_some() {
            debug!(id, "connection deregistered");
        }
    }

    /// Asks every live connection handler to stop.
    pub fn stop_conns(&self) {
        // No receivers just means there is nothing left to stop.
        let _ = self.stop_tx.send(());
    }

    /// Number of connections still alive. The shutdown drain polls this.
    pub fn active_conns(&self) -> usize {
        self.conns.len()
    }

    /// Live connections of one kind; the session limit only counts iSCSI.
    pub fn active_by_kind(&self, kind: ConnKind) -> usize {
        self.conns.iter().filter(|e| e.value().kind == kind).count()
    }

    /// Final teardown: repeats the stop request and forgets whatever is
    /// left after the drain deadline.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(());
        self.conns.clear();
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        ConnRegistry::new()
    }
}
