// Shared scaffolding for the daemon-level tests: build a daemon from a
// config file on disk, open its portals, and run the accept loop in the
// background the way `server::run` does.
#![allow(dead_code)]

use rustgt::config::{ConfigFile, Tunables};
use rustgt::core::TargetError;
use rustgt::core::daemon::{ControlCommand, Daemon, SwMode};
use rustgt::core::state::DaemonState;
use rustgt::core::uctl;
use rustgt::server::accept_loop;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A minimal but complete configuration: management portal, two portal
/// groups, one ACL, one logical unit. Every listener binds an ephemeral
/// port so tests can run in parallel.
pub const BASE_CONF: &str = "\
[Global]
NodeBase iqn.2016-04.org.rustgt.test

[UnitControl]
Portal UC1 127.0.0.1:0

[PortalGroup1]
Portal A1 127.0.0.1:0

[PortalGroup2]
Portal B1 127.0.0.1:0

[InitiatorGroup1]
InitiatorName ALL
Netmask ALL

[LogicalUnit1]
TargetName disk1
";

pub fn write_conf(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

/// Loads, validates, and builds a daemon from the config at `path`.
pub fn build_daemon(path: &Path) -> (Arc<Daemon>, mpsc::Receiver<ControlCommand>) {
    let config = Arc::new(ConfigFile::load(path).unwrap());
    let tunables = Arc::new(Tunables::from_config(&config).unwrap());
    let pidfile = path.with_extension("pid");
    let (daemon, control_rx) = Daemon::new(config, tunables, SwMode::default(), pidfile);
    daemon.build_tables().unwrap();
    (daemon, control_rx)
}

pub fn open_portals(daemon: &Daemon) {
    daemon
        .with_tables_mut(|t| -> Result<(), TargetError> {
            uctl::open_all(&mut t.uctl_portals)?;
            t.pgs.open_all()
        })
        .unwrap();
}

/// Spawns the accept loop and waits until the daemon reports `Running`.
pub async fn spawn_accept_loop(
    daemon: &Arc<Daemon>,
    control_rx: mpsc::Receiver<ControlCommand>,
) -> JoinHandle<Result<(), TargetError>> {
    let loop_daemon = Arc::clone(daemon);
    let handle = tokio::spawn(async move { accept_loop::run(&loop_daemon, control_rx).await });

    let mut state_rx = daemon.state.subscribe();
    while *state_rx.borrow_and_update() != DaemonState::Running {
        state_rx.changed().await.unwrap();
    }
    handle
}

pub fn pg_portal_addr(daemon: &Daemon, tag: u32, idx: usize) -> SocketAddr {
    daemon.with_tables(|t| {
        t.pgs.find_by_tag(tag).unwrap().portals[idx]
            .local_addr()
            .unwrap()
    })
}

pub fn uctl_addr(daemon: &Daemon) -> SocketAddr {
    daemon.with_tables(|t| t.uctl_portals[0].local_addr().unwrap())
}

/// Polls `cond` for up to two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}
