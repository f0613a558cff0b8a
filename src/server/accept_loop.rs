// src/server/accept_loop.rs

//! The accept loop: a readiness multiplex over every open portal-group
//! socket, every unit-control socket, and the control channel. It runs on
//! the server's main task for as long as the daemon is `Running`.
//!
//! Reload commands are serviced here because this loop is the only place
//! that may safely swap listener sets: after servicing one command the
//! loop rebuilds its readiness snapshot from scratch, so the initiator's
//! completion implies the live listener set already reflects the edit.

use crate::connection::registry::ConnKind;
use crate::connection::{create_iscsi_conn, create_uctl_conn};
use crate::core::daemon::{ControlCommand, Daemon};
use crate::core::limits::POLLWAIT;
use crate::core::portal::PortalRef;
use crate::core::state::DaemonState;
use crate::core::{TargetError, is_transient_accept_error};
use crate::server::reload::{apply_pg_delete, apply_pg_update};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// One entry of the readiness snapshot: a listener plus the identity the
/// front-end receives with each accepted socket.
struct AcceptSource {
    listener: Arc<TcpListener>,
    portal: PortalRef,
    kind: ConnKind,
}

/// Snapshots every open listener under the daemon mutex. Free portal-group
/// slots are excluded even if a stale socket were still around.
fn snapshot(daemon: &Daemon) -> Vec<AcceptSource> {
    daemon.with_tables(|t| {
        let mut sources = Vec::new();
        for pg in t.pgs.slots() {
            if pg.tag == 0 {
                continue;
            }
            for portal in &pg.portals {
                if let Some(listener) = &portal.sock {
                    sources.push(AcceptSource {
                        listener: Arc::clone(listener),
                        portal: PortalRef::new(portal, pg.idx, Some(Arc::clone(&pg.refs))),
                        kind: ConnKind::Iscsi,
                    });
                }
            }
        }
        for portal in &t.uctl_portals {
            if let Some(listener) = &portal.sock {
                sources.push(AcceptSource {
                    listener: Arc::clone(listener),
                    portal: PortalRef::new(portal, 0, None),
                    kind: ConnKind::Uctl,
                });
            }
        }
        sources
    })
}

/// Resolves as soon as any source has an accepted connection, returning
/// the source index with the accept result.
async fn accept_any(sources: &[AcceptSource]) -> (usize, io::Result<(TcpStream, SocketAddr)>) {
    futures::future::poll_fn(|cx| {
        for (idx, source) in sources.iter().enumerate() {
            if let Poll::Ready(result) = source.listener.poll_accept(cx) {
                return Poll::Ready((idx, result));
            }
        }
        Poll::Pending
    })
    .await
}

fn handle_accept(
    daemon: &Arc<Daemon>,
    source: &AcceptSource,
    result: io::Result<(TcpStream, SocketAddr)>,
) {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(e) if is_transient_accept_error(&e) => {
            debug!("transient accept error: {e}");
            return;
        }
        Err(e) => {
            // The listener is kept; one bad accept is not worth a portal.
            error!(
                host = %source.portal.host,
                port = %source.portal.port,
                "accept error: {e}"
            );
            return;
        }
    };

    let created = match source.kind {
        ConnKind::Iscsi => create_iscsi_conn(daemon, source.portal.clone(), stream, peer),
        ConnKind::Uctl => create_uctl_conn(daemon, source.portal.clone(), stream, peer),
    };
    // On failure `stream` has already been dropped, closing the socket.
    if let Err(e) = created {
        error!(%peer, "connection setup failed: {e}");
    }
}

fn ack(done: oneshot::Sender<Result<(), TargetError>>, result: Result<(), TargetError>) {
    if done.send(result).is_err() {
        error!("reload initiator went away before completion");
    }
}

/// Runs the multiplex until an exit request or a control-channel failure.
/// Moves the daemon `Initialized -> Running` on entry and
/// `-> Exiting` (with the LU broadcast) on the way out.
pub async fn run(
    daemon: &Arc<Daemon>,
    mut control_rx: mpsc::Receiver<ControlCommand>,
) -> Result<(), TargetError> {
    if daemon.state.get() != DaemonState::Initialized {
        return Err(TargetError::IoFailed("accept loop started before init".into()));
    }
    daemon.state.set(DaemonState::Running);

    let mut failure = None;
    'reload: loop {
        let mut sources = snapshot(daemon);
        debug!(listeners = sources.len(), "accept loop start");

        loop {
            if daemon.state.get() != DaemonState::Running {
                break 'reload;
            }
            tokio::select! {
                biased;

                cmd = control_rx.recv() => {
                    match cmd {
                        None => {
                            error!("control channel closed");
                            failure = Some(TargetError::IoFailed("control channel closed".into()));
                            break 'reload;
                        }
                        Some(ControlCommand::Exit) => {
                            debug!("exit request (accept loop)");
                            break 'reload;
                        }
                        Some(ControlCommand::Delete { done }) => {
                            // Drop the snapshot first so the descriptors of
                            // retired portals are fully closed before the
                            // initiator resumes.
                            sources.clear();
                            let result = apply_pg_delete(daemon);
                            if let Err(e) = &result {
                                error!("pg delete failed: {e}");
                            }
                            ack(done, result);
                            debug!("reload accept loop");
                            continue 'reload;
                        }
                        Some(ControlCommand::Update { done }) => {
                            sources.clear();
                            let result = apply_pg_update(daemon);
                            if let Err(e) = &result {
                                error!("pg update failed: {e}");
                            }
                            ack(done, result);
                            debug!("reload accept loop");
                            continue 'reload;
                        }
                    }
                }

                (idx, result) = accept_any(&sources), if !sources.is_empty() => {
                    handle_accept(daemon, &sources[idx], result);
                }

                // Idle tick: nothing to do but re-check the daemon state.
                _ = tokio::time::sleep(POLLWAIT) => {}
            }
        }
    }

    debug!("accept loop ended");
    daemon.state.set(DaemonState::Exiting);
    daemon.lu_set_all_state(DaemonState::Exiting);

    match failure {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
