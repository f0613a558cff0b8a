// src/server/initialization.rs

//! Builds the daemon out of an already-validated configuration: tables,
//! channels, and the state machine. No listener is opened and no worker
//! exists when this returns; that happens in `server::run`.

use super::context::ServerContext;
use crate::config::{ConfigFile, Tunables};
use crate::core::daemon::{Daemon, SwMode};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Everything `main` hands over after CLI parsing and config validation.
pub struct Bootstrap {
    pub config: Arc<ConfigFile>,
    pub tunables: Arc<Tunables>,
    /// `-p` beats the `PidFile` key.
    pub pidfile_override: Option<PathBuf>,
    pub swmode: SwMode,
}

/// Initializes the daemon container and populates its tables.
pub fn setup(boot: Bootstrap) -> Result<ServerContext> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %boot.swmode,
        node_base = %boot.tunables.node_base,
        "rustgt starting"
    );

    let pidfile = boot
        .pidfile_override
        .unwrap_or_else(|| boot.tunables.pidfile.clone());

    let (daemon, control_rx) = Daemon::new(boot.config, boot.tunables, boot.swmode, pidfile);
    daemon
        .build_tables()
        .context("building configuration tables")?;

    daemon.with_tables(|t| {
        info!(
            portal_groups = t.pgs.len(),
            initiator_groups = t.igs.len(),
            uctl_portals = t.uctl_portals.len(),
            logical_units = t.lus.len(),
            "configuration loaded"
        );
    });

    Ok(ServerContext { daemon, control_rx })
}
