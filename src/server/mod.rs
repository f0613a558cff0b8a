// src/server/mod.rs

//! Server orchestration: initialization, the accept loop, the signal
//! task, the reload protocol, and the shutdown sequence, stitched
//! together in lifecycle order.

use crate::core::daemon::Daemon;
use crate::core::limits::DRAIN_RETRIES;
use crate::core::lu;
use crate::core::state::DaemonState;
use crate::core::uctl;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub mod accept_loop;
pub mod context;
pub mod initialization;
pub mod pidfile;
pub mod reload;
pub mod signals;

pub use initialization::Bootstrap;
pub use signals::TraceControl;

/// The main server function: runs from init to shutdown.
pub async fn run(boot: Bootstrap, trace: TraceControl) -> Result<()> {
    // 1. Build the daemon and its tables (state: Invalid -> Initialized).
    let ctx = initialization::setup(boot)?;
    let daemon = Arc::clone(&ctx.daemon);

    // 2. LU workers come up first and are told to run.
    lu::create_workers(&daemon);
    daemon.lu_set_all_state(DaemonState::Running);

    // 3. The signal task owns every signal from here on.
    let signal_task = tokio::spawn(signals::run(Arc::clone(&daemon), trace));

    // 4. Open the management portals, then every portal group. Any listen
    //    failure here is fatal; close whatever was opened and bail.
    let opened: Result<(), crate::core::TargetError> = daemon.with_tables_mut(|t| {
        uctl::open_all(&mut t.uctl_portals)?;
        t.pgs.open_all()
    });
    if let Err(e) = opened {
        error!("opening portals failed: {e}");
        daemon.with_tables_mut(|t| {
            t.pgs.close_all();
            uctl::close_all(&mut t.uctl_portals);
        });
        daemon.state.set(DaemonState::Exiting);
        daemon.lu_set_all_state(DaemonState::Exiting);
        let _ = signal_task.await;
        return Err(e).context("opening portals");
    }

    // 5. Running is externally observable; the pidfile marks it.
    pidfile::write(&daemon.pidfile).context("writing pidfile")?;

    // 6. The accept loop serves until exit (state: Initialized -> Running
    //    on entry, -> Exiting on the way out).
    let served = accept_loop::run(&daemon, ctx.control_rx).await;

    // 7. Drain: ask every connection to stop and give them a bounded
    //    window to go away.
    daemon.registry.stop_conns();
    for _ in 0..DRAIN_RETRIES {
        if daemon.registry.active_conns() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    debug!(active = daemon.registry.active_conns(), "connection drain finished");
    info!("rustgt version {} exiting", env!("CARGO_PKG_VERSION"));

    // 8. The signal task sees Exiting and returns.
    let _ = signal_task.await;

    // 9. Cleanup, in reverse order of bring-up.
    shutdown(&daemon).await;

    served.context("accept loop")
}

/// Tears the daemon down: listeners, front-end state, workers, tables,
/// pidfile. Ends in `Shutdown`.
async fn shutdown(daemon: &Arc<Daemon>) {
    daemon.with_tables_mut(|t| {
        t.pgs.close_all();
        uctl::close_all(&mut t.uctl_portals);
    });
    daemon.registry.shutdown();
    lu::shutdown(daemon).await;
    daemon.with_tables_mut(|t| {
        t.pgs.destroy();
        t.igs.destroy();
        t.lus.destroy();
        t.uctl_portals.clear();
    });
    pidfile::remove(&daemon.pidfile);
    daemon.state.set(DaemonState::Shutdown);
    debug!("shutdown complete");
}
