// src/connection/uctl.rs

//! The unit-control front-end: a plain line-oriented management channel on
//! the UCTL portals. One command per line, one `OK`/`ERR` terminated
//! response per command.

use crate::connection::guard::ConnGuard;
use crate::connection::registry::ConnKind;
use crate::core::TargetError;
use crate::core::daemon::Daemon;
use crate::core::portal::PortalRef;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// Longest request line the channel accepts.
const MAX_LINE: usize = 1024;

/// Wires up an accepted management connection. On error the caller closes
/// the socket.
pub fn create_uctl_conn(
    daemon: &Arc<Daemon>,
    portal: PortalRef,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), TargetError> {
    let (session_id, stop_rx) = daemon.registry.register(peer, ConnKind::Uctl, portal.tag);
    portal.acquire();
    let guard = ConnGuard::new(Arc::clone(daemon), session_id, portal.clone());

    info!(%peer, label = %portal.label, "accepted UCTL connection");
    tokio::spawn(serve(Arc::clone(daemon), stream, peer, stop_rx, guard));
    Ok(())
}

async fn serve(
    daemon: Arc<Daemon>,
    stream: TcpStream,
    peer: SocketAddr,
    mut stop_rx: broadcast::Receiver<()>,
    guard: ConnGuard,
) {
    let _guard = guard;
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));

    let banner = format!("rustgt version {} UCTL ready", env!("CARGO_PKG_VERSION"));
    if let Err(e) = framed.send(banner).await {
        warn!(%peer, "UCTL banner write failed: {e}");
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.recv() => {
                debug!(%peer, "UCTL connection stopping on daemon request");
                break;
            }
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Err(e)) => {
                        warn!(%peer, "UCTL read error: {e}");
                        break;
                    }
                    Some(Ok(line)) => line,
                };
                match dispatch(&daemon, &line).await {
                    Reply::Lines(lines) => {
                        for out in lines {
                            if framed.send(out).await.is_err() {
                                return;
                            }
                        }
                    }
                    Reply::Quit(out) => {
                        let _ = framed.send(out).await;
                        break;
                    }
                }
            }
        }
    }
}

enum Reply {
    Lines(Vec<String>),
    Quit(String),
}

async fn dispatch(daemon: &Arc<Daemon>, line: &str) -> Reply {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Reply::Lines(vec!["ERR empty command".into()]);
    };
    debug!(%cmd, "UCTL command");

    if cmd.eq_ignore_ascii_case("VERSION") {
        return Reply::Lines(vec![format!("OK rustgt version {}", env!("CARGO_PKG_VERSION"))]);
    }
    if cmd.eq_ignore_ascii_case("NOOP") {
        return Reply::Lines(vec!["OK".into()]);
    }
    if cmd.eq_ignore_ascii_case("LIST") {
        let mut lines = daemon.with_tables(|t| {
            let mut lines = Vec::new();
            for pg in t.pgs.slots() {
                if pg.tag == 0 {
                    continue;
                }
                for portal in &pg.portals {
                    lines.push(format!(
                        "PG{} {} {}:{}",
                        pg.tag, portal.label, portal.host, portal.port
                    ));
                }
            }
            for lu in t.lus.units() {
                lines.push(format!(
                    "LU{} {}",
                    lu.num,
                    lu.name.as_deref().unwrap_or("-")
                ));
            }
            lines
        });
        lines.push("OK".into());
        return Reply::Lines(lines);
    }
    if cmd.eq_ignore_ascii_case("RELOAD") {
        return match crate::server::reload::reload(daemon).await {
            Ok(()) => Reply::Lines(vec![format!("OK generation {}", daemon.generation())]),
            Err(e) => Reply::Lines(vec![format!("ERR reload failed: {e}")]),
        };
    }
    if cmd.eq_ignore_ascii_case("QUIT") {
        return Reply::Quit("OK bye".into());
    }
    Reply::Lines(vec![format!("ERR unknown command '{cmd}'")])
}
