// src/connection/iscsi.rs

//! The iSCSI front-end entry point. The accept loop hands an accepted
//! socket and its owning portal here; this module owns the connection's
//! lifetime bookkeeping. The PDU and login state machines sit behind this
//! boundary and are not part of the core.

use crate::connection::guard::ConnGuard;
use crate::connection::registry::ConnKind;
use crate::core::TargetError;
use crate::core::daemon::Daemon;
use crate::core::portal::PortalRef;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Wires up a freshly accepted iSCSI connection: enforces the session
/// limit, registers it, takes a reference on the owning portal and group,
/// and spawns the handler task. On error the caller closes the socket.
pub fn create_iscsi_conn(
    daemon: &Arc<Daemon>,
    portal: PortalRef,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), TargetError> {
    let tunables = daemon.tunables();
    if daemon.registry.active_by_kind(ConnKind::Iscsi) >= tunables.max_sessions as usize {
        return Err(TargetError::Capacity("session"));
    }

    let (session_id, stop_rx) = daemon.registry.register(peer, ConnKind::Iscsi, portal.tag);
    portal.acquire();
    let guard = ConnGuard::new(Arc::clone(daemon), session_id, portal.clone());

    info!(%peer, tag = portal.tag, label = %portal.label, "accepted iSCSI connection");
    let idle = Duration::from_secs(u64::from(tunables.timeout.max(1)));
    tokio::spawn(serve(stream, peer, stop_rx, guard, idle));
    Ok(())
}

/// Runs one connection until the peer hangs up, the idle timeout fires, or
/// the daemon asks every connection to stop.
async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut stop_rx: broadcast::Receiver<()>,
    guard: ConnGuard,
    idle: Duration,
) {
    // Dropping the guard at the end releases the registry slot and the
    // portal references, no matter which branch ends the loop.
    let _guard = guard;
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                debug!(%peer, "connection stopping on daemon request");
                break;
            }
            read = tokio::time::timeout(idle, stream.read(&mut buf)) => {
                match read {
                    Err(_) => {
                        debug!(%peer, "connection idle timeout");
                        break;
                    }
                    Ok(Ok(0)) => {
                        debug!(%peer, "peer closed connection");
                        break;
                    }
                    Ok(Ok(_n)) => {
                        // TODO: feed the login/PDU state machine here once
                        // the session layer moves in-tree.
                    }
                    Ok(Err(e)) => {
                        warn!(%peer, "connection read error: {e}");
                        break;
                    }
                }
            }
        }
    }
}
