mod common;

use common::*;
use rustgt::core::lu;
use rustgt::core::state::DaemonState;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_lu_workers_follow_state_broadcast() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, _control_rx) = build_daemon(&conf);
    lu::create_workers(&daemon);
    daemon.lu_set_all_state(DaemonState::Running);

    // Exiting must terminate every worker; shutdown only reaps.
    daemon.lu_set_all_state(DaemonState::Exiting);
    tokio::time::timeout(Duration::from_secs(5), lu::shutdown(&daemon))
        .await
        .expect("LU workers did not exit on state broadcast");
}

#[tokio::test]
async fn test_lu_shutdown_with_no_workers_is_immediate() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    // A config with no logical units spawns no workers.
    write_conf(&conf, &BASE_CONF.replace("[LogicalUnit1]\nTargetName disk1\n", ""));

    let (daemon, _control_rx) = build_daemon(&conf);
    lu::create_workers(&daemon);
    tokio::time::timeout(Duration::from_secs(1), lu::shutdown(&daemon))
        .await
        .expect("empty worker set must reap immediately");
}
