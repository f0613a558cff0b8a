// src/server/pidfile.rs

//! Pidfile handling: written when the daemon enters `Running`, removed at
//! shutdown. Contents are the decimal PID followed by a newline.

use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, error};

pub fn write(path: &Path) -> io::Result<()> {
    debug!(path = %path.display(), "write pidfile");
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Removal failures at shutdown are logged and otherwise ignored.
pub fn remove(path: &Path) {
    debug!(path = %path.display(), "remove pidfile");
    if let Err(e) = fs::remove_file(path) {
        error!(path = %path.display(), "pidfile remove error: {e}");
    }
}
