// src/core/portal.rs

//! A portal is one listening endpoint: a textual `(host, port)` pair plus
//! the listener socket once it has been opened. The textual form is kept
//! verbatim (brackets included for IPv6) so reload comparisons are exact
//! string comparisons, the same way the rest of the tables work.

use crate::core::TargetError;
use crate::core::limits::DEFAULT_PORT;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::net::TcpListener;
use tracing::debug;

/// Decodes a portal endpoint into `(host, port)`, both textual.
///
/// A leading `[` starts a bracketed IPv6 host; the brackets stay part of
/// the stored host. The port defaults to 3260 when absent. No name
/// resolution and no numeric validation happens here; that is deferred to
/// open time.
pub fn parse_portal(portal: &str) -> Result<(String, String), TargetError> {
    if portal.is_empty() {
        return Err(TargetError::BadPortal(portal.to_string()));
    }

    let (host, rest) = if let Some(inner) = portal.strip_prefix('[') {
        let end = inner
            .find(']')
            .ok_or_else(|| TargetError::BadPortal(portal.to_string()))?;
        let host = &portal[..end + 2];
        (host, &portal[end + 2..])
    } else {
        match portal.find(':') {
            Some(colon) => (&portal[..colon], &portal[colon..]),
            None => (portal, ""),
        }
    };

    let port = if rest.is_empty() {
        DEFAULT_PORT.to_string()
    } else {
        let port_text = rest
            .strip_prefix(':')
            .ok_or_else(|| TargetError::BadPortal(portal.to_string()))?;
        port_text.to_string()
    };

    Ok((host.to_string(), port))
}

/// One listening endpoint owned by a portal group or the unit-control set.
#[derive(Debug)]
pub struct Portal {
    pub label: String,
    pub host: String,
    pub port: String,
    /// Tag of the owning group; `UC_TAG` for management portals.
    pub tag: u32,
    /// Position inside the owning group.
    pub idx: usize,
    /// The listener, or `None` while closed. The `Option` is what makes
    /// open/close idempotent: the descriptor is owned here and nowhere else.
    pub sock: Option<Arc<TcpListener>>,
    /// Number of front-end connections accepted through this portal.
    pub refs: Arc<AtomicU32>,
}

impl Portal {
    pub fn new(label: &str, host: String, port: String, tag: u32, idx: usize) -> Portal {
        Portal {
            label: label.to_string(),
            host,
            port,
            tag,
            idx,
            sock: None,
            refs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    /// Binds and listens. A second open on an already-open portal is a
    /// no-op.
    pub fn open(&mut self) -> Result<(), TargetError> {
        if self.sock.is_some() {
            return Ok(());
        }
        debug!(host = %self.host, port = %self.port, tag = self.tag, "open portal");
        let listener = listen(&self.host, &self.port).map_err(|source| TargetError::ListenFailed {
            host: self.host.clone(),
            port: self.port.clone(),
            source,
        })?;
        self.sock = Some(Arc::new(listener));
        Ok(())
    }

    /// Drops the listener. A second close is a no-op. The descriptor is
    /// fully released once the accept loop has rebuilt its readiness set.
    pub fn close(&mut self) {
        if self.sock.is_some() {
            debug!(host = %self.host, port = %self.port, tag = self.tag, "close portal");
            self.sock = None;
        }
    }

    /// The local address actually bound, once open. Useful when the
    /// configured port is `0`.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.sock.as_ref().and_then(|l| l.local_addr().ok())
    }
}

/// Resolves the textual endpoint and opens a nonblocking listener
/// registered with the runtime. `*` listens on every IPv4 interface;
/// a bracketed host is IPv6.
fn listen(host: &str, port: &str) -> io::Result<TcpListener> {
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad port '{port}'")))?;
    let host = match host {
        "*" => "0.0.0.0",
        h => h.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(h),
    };
    let listener = std::net::TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// What a front-end receives with an accepted socket: enough identity to
/// log and authorize, plus the shared counters that keep the owning portal
/// and group alive across a reload. Never ownership of the portal itself.
#[derive(Debug, Clone)]
pub struct PortalRef {
    pub label: String,
    pub host: String,
    pub port: String,
    pub tag: u32,
    pub group_idx: usize,
    pub portal_idx: usize,
    portal_refs: Arc<AtomicU32>,
    group_refs: Option<Arc<AtomicU32>>,
}

impl PortalRef {
    pub fn new(
        portal: &Portal,
        group_idx: usize,
        group_refs: Option<Arc<AtomicU32>>,
    ) -> PortalRef {
        PortalRef {
            label: portal.label.clone(),
            host: portal.host.clone(),
            port: portal.port.clone(),
            tag: portal.tag,
            group_idx,
            portal_idx: portal.idx,
            portal_refs: Arc::clone(&portal.refs),
            group_refs,
        }
    }

    /// Marks one more active connection on this portal (and its group).
    pub fn acquire(&self) {
        self.portal_refs.fetch_add(1, Ordering::Relaxed);
        if let Some(group) = &self.group_refs {
            group.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases a connection. Pairs with `acquire`; the release ordering
    /// makes the drop visible to a reload that consults the counter under
    /// the daemon mutex.
    pub fn release(&self) {
        self.portal_refs.fetch_sub(1, Ordering::AcqRel);
        if let Some(group) = &self.group_refs {
            group.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
