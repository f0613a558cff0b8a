use rustgt::server::pidfile;
use tempfile::tempdir;

#[test]
fn test_write_contains_pid_and_newline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rustgt.pid");

    pidfile::write(&path).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, format!("{}\n", std::process::id()));
}

#[test]
fn test_write_replaces_stale_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rustgt.pid");
    std::fs::write(&path, "99999\n").unwrap();

    pidfile::write(&path).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, format!("{}\n", std::process::id()));
}

#[test]
fn test_remove_is_quiet_on_missing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rustgt.pid");
    // Nothing to remove; must not panic.
    pidfile::remove(&path);

    pidfile::write(&path).unwrap();
    pidfile::remove(&path);
    assert!(!path.exists());
}
