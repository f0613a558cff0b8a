// src/connection/guard.rs

//! `ConnGuard`, the RAII guard every connection handler holds: whatever
//! way the handler ends, the registry entry is removed and the portal and
//! group reference counts are released exactly once.

use crate::core::daemon::Daemon;
use crate::core::portal::PortalRef;
use std::sync::Arc;

pub struct ConnGuard {
    daemon: Arc<Daemon>,
    session_id: u64,
    portal: PortalRef,
}

impl ConnGuard {
    /// Takes over an already-acquired portal reference.
    pub fn new(daemon: Arc<Daemon>, session_id: u64, portal: PortalRef) -> ConnGuard {
        ConnGuard {
            daemon,
            session_id,
            portal,
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.daemon.registry.deregister(self.session_id);
        self.portal.release();
    }
}
