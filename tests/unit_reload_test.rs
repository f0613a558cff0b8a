mod common;

use common::*;
use rustgt::core::TargetError;
use rustgt::core::state::DaemonState;
use rustgt::server::reload;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::tempdir;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_reload_identical_config_is_a_noop() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    let sock_before = daemon.with_tables(|t| {
        Arc::clone(t.pgs.find_by_tag(1).unwrap().portals[0].sock.as_ref().unwrap())
    });
    assert_eq!(daemon.generation(), 0);

    reload::reload(&daemon).await.unwrap();

    // One generation, same sockets: nothing was closed or reopened.
    assert_eq!(daemon.generation(), 1);
    let sock_after = daemon.with_tables(|t| {
        Arc::clone(t.pgs.find_by_tag(1).unwrap().portals[0].sock.as_ref().unwrap())
    });
    assert!(Arc::ptr_eq(&sock_before, &sock_after));
    daemon.with_tables(|t| {
        assert!(t.pgs.find_by_tag(1).is_some());
        assert!(t.pgs.find_by_tag(2).is_some());
        assert!(t.igs.find_by_tag(1).is_some());
        assert_eq!(t.lus.len(), 1);
    });

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reload_removes_retired_group() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    let pg1_sock = daemon.with_tables(|t| {
        Arc::clone(t.pgs.find_by_tag(1).unwrap().portals[0].sock.as_ref().unwrap())
    });
    let pg2_addr = pg_portal_addr(&daemon, 2, 0);

    // Same config minus PortalGroup2.
    let trimmed = BASE_CONF.replace("[PortalGroup2]\nPortal B1 127.0.0.1:0\n\n", "");
    assert!(!trimmed.contains("PortalGroup2"));
    write_conf(&conf, &trimmed);

    reload::reload(&daemon).await.unwrap();
    assert_eq!(daemon.generation(), 1);

    daemon.with_tables(|t| {
        assert!(t.pgs.find_by_tag(2).is_none());
        // The slot is free, not compacted, and its listener is closed.
        assert_eq!(t.pgs.len(), 2);
        assert_eq!(t.pgs.slots()[1].tag, 0);
        assert!(!t.pgs.slots()[1].portals[0].is_open());
        // PG1 is untouched.
        let pg1 = t.pgs.find_by_tag(1).unwrap();
        assert!(Arc::ptr_eq(pg1.portals[0].sock.as_ref().unwrap(), &pg1_sock));
    });

    // New connections to the retired portal are refused.
    assert!(TcpStream::connect(pg2_addr).await.is_err());

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reload_adds_new_group() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    let grown = format!("{BASE_CONF}\n[PortalGroup3]\nPortal C1 127.0.0.1:0\n");
    write_conf(&conf, &grown);
    reload::reload(&daemon).await.unwrap();

    let pg3_addr = pg_portal_addr(&daemon, 3, 0);
    daemon.with_tables(|t| {
        assert!(t.pgs.find_by_tag(3).unwrap().portals[0].is_open());
    });

    // The new listener is already multiplexed: a connection lands in the
    // registry.
    let client = TcpStream::connect(pg3_addr).await.unwrap();
    wait_until(|| daemon.registry.active_conns() == 1).await;
    daemon.with_tables(|t| {
        assert_eq!(t.pgs.find_by_tag(3).unwrap().ref_count(), 1);
    });

    drop(client);
    wait_until(|| daemon.registry.active_conns() == 0).await;
    daemon.with_tables(|t| {
        assert_eq!(t.pgs.find_by_tag(3).unwrap().ref_count(), 0);
    });

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reload_applies_changed_group() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    let changed = BASE_CONF.replace("Portal B1 127.0.0.1:0", "Portal B2 127.0.0.1:0");
    write_conf(&conf, &changed);
    reload::reload(&daemon).await.unwrap();

    daemon.with_tables(|t| {
        let pg2 = t.pgs.find_by_tag(2).unwrap();
        assert_eq!(pg2.portals[0].label, "B2");
        // The portal was closed and reopened around the rewrite.
        assert!(pg2.portals[0].is_open());
    });

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reload_refuses_update_of_referenced_group() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    // A session holds PG2.
    daemon.with_tables(|t| {
        t.pgs.find_by_tag(2).unwrap().refs.fetch_add(1, Ordering::Relaxed);
    });

    let changed = BASE_CONF.replace("Portal B1 127.0.0.1:0", "Portal B2 127.0.0.1:0");
    write_conf(&conf, &changed);
    // The reload itself succeeds; the referenced group keeps its old
    // definition.
    reload::reload(&daemon).await.unwrap();

    daemon.with_tables(|t| {
        let pg2 = t.pgs.find_by_tag(2).unwrap();
        assert_eq!(pg2.portals[0].label, "B1");
        assert_eq!(pg2.ref_count(), 1);
    });

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_failed_reload_keeps_prior_config() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    reload::reload(&daemon).await.unwrap();
    assert_eq!(daemon.generation(), 1);

    // Out-of-range tunable: validation fails before anything is swapped.
    let broken = BASE_CONF.replace(
        "NodeBase iqn.2016-04.org.rustgt.test",
        "MaxBurstLength 256",
    );
    write_conf(&conf, &broken);
    let err = reload::reload(&daemon).await.unwrap_err();
    assert!(matches!(err, TargetError::ConfigInvalid(_)));

    // Generation untouched, old tables still live.
    assert_eq!(daemon.generation(), 1);
    daemon.with_tables(|t| {
        assert!(t.pgs.find_by_tag(1).is_some());
        assert!(t.pgs.find_by_tag(2).is_some());
    });

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reload_updates_initiator_groups_and_lus() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    let changed = BASE_CONF
        .replace("InitiatorName ALL", "InitiatorName iqn.example:only")
        .replace("TargetName disk1", "TargetName disk1-renamed")
        + "\n[InitiatorGroup2]\nInitiatorName ALL\nNetmask 192.168.0.0/16\n[LogicalUnit2]\nTargetName disk2\n";
    write_conf(&conf, &changed);
    reload::reload(&daemon).await.unwrap();

    daemon.with_tables(|t| {
        assert_eq!(t.igs.find_by_tag(1).unwrap().initiators, vec!["iqn.example:only"]);
        assert!(t.igs.find_by_tag(2).is_some());
        assert_eq!(
            t.lus.find_by_num(1).unwrap().name.as_deref(),
            Some("disk1-renamed")
        );
        assert!(t.lus.find_by_num(2).is_some());
    });

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_generation_counts_each_successful_reload() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    reload::reload(&daemon).await.unwrap();
    reload::reload(&daemon).await.unwrap();
    assert_eq!(daemon.generation(), 2);

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exit_command_ends_loop_and_marks_exiting() {
    let dir = tempdir().unwrap();
    let conf = dir.path().join("rustgt.conf");
    write_conf(&conf, BASE_CONF);

    let (daemon, control_rx) = build_daemon(&conf);
    open_portals(&daemon);
    let handle = spawn_accept_loop(&daemon, control_rx).await;

    daemon.stop_loop().await;
    handle.await.unwrap().unwrap();
    assert_eq!(daemon.state.get(), DaemonState::Exiting);

    // LU workers were told as well.
    assert_eq!(*daemon.lu_state_rx().borrow(), DaemonState::Exiting);
}
