// src/server/signals.rs

//! The signal task: the one place in the process that consumes signals.
//! INT/TERM drive shutdown through the control channel, HUP drives the
//! reload, USR1/USR2 (and INFO where the platform has it) drive the
//! runtime trace filter.

use crate::core::daemon::Daemon;
use crate::core::state::DaemonState;
use crate::server::reload;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{debug, error, info};
use tracing_subscriber::{Registry, filter::EnvFilter, reload as filter_reload};

/// Runtime control over the tracing filter, driven by signals. Wraps the
/// reload handle installed at logging bootstrap.
pub struct TraceControl {
    handle: Arc<filter_reload::Handle<EnvFilter, Registry>>,
    /// The directives selected at startup (`-t`/`-q`); USR1 returns here.
    baseline: String,
    iscsi_trace: AtomicBool,
}

impl TraceControl {
    pub fn new(
        handle: Arc<filter_reload::Handle<EnvFilter, Registry>>,
        baseline: String,
    ) -> TraceControl {
        TraceControl {
            handle,
            baseline,
            iscsi_trace: AtomicBool::new(false),
        }
    }

    fn apply(&self, directives: &str) {
        match self.handle.reload(EnvFilter::new(directives)) {
            Ok(()) => info!(%directives, "trace filter changed"),
            Err(e) => error!("trace filter reload failed: {e}"),
        }
    }

    /// USR1: back to the startup filter.
    pub fn clear(&self) {
        self.iscsi_trace.store(false, Ordering::Relaxed);
        self.apply(&self.baseline);
    }

    /// USR2: everything this crate logs, at debug.
    pub fn all(&self) {
        self.apply("rustgt=debug,info");
    }

    /// INFO: flip connection-level tracing on or off.
    pub fn toggle_iscsi(&self) {
        if self.iscsi_trace.fetch_xor(true, Ordering::Relaxed) {
            self.apply(&self.baseline);
        } else {
            self.apply(&format!("rustgt::connection=debug,{}", self.baseline));
        }
    }
}

/// INT and TERM do the same thing: stop the accept loop, mark the daemon
/// exiting, and tell every LU worker.
async fn request_exit(daemon: &Arc<Daemon>) {
    daemon.stop_loop().await;
    daemon.state.set(DaemonState::Exiting);
    daemon.lu_set_all_state(DaemonState::Exiting);
}

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn info_signal() -> Option<Signal> {
    signal(SignalKind::info()).ok()
}

#[cfg(not(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn info_signal() -> Option<Signal> {
    None
}

/// Waits on a signal stream the platform may not have.
async fn recv_optional(sig: &mut Option<Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs until the daemon leaves `Running`/`Initialized`.
pub async fn run(daemon: Arc<Daemon>, trace: TraceControl) {
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM stream");
    let mut sigquit = signal(SignalKind::quit()).expect("SIGQUIT stream");
    let mut sighup = signal(SignalKind::hangup()).expect("SIGHUP stream");
    let mut sigusr1 = signal(SignalKind::user_defined1()).expect("SIGUSR1 stream");
    let mut sigusr2 = signal(SignalKind::user_defined2()).expect("SIGUSR2 stream");
    let mut siginfo = info_signal();
    let mut state_rx = daemon.state.subscribe();

    debug!("signal task start");
    loop {
        if matches!(
            daemon.state.get(),
            DaemonState::Exiting | DaemonState::Shutdown
        ) {
            break;
        }
        tokio::select! {
            _ = sigint.recv() => {
                info!("SIGINT received");
                request_exit(&daemon).await;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received");
                request_exit(&daemon).await;
            }
            _ = sigquit.recv() => {
                info!("SIGQUIT received, exiting immediately");
                std::process::exit(0);
            }
            _ = sighup.recv() => {
                info!("SIGHUP received");
                if let Err(e) = reload::reload(&daemon).await {
                    error!("reload failed: {e}");
                }
            }
            _ = sigusr1.recv() => {
                info!("SIGUSR1 received");
                trace.clear();
            }
            _ = sigusr2.recv() => {
                info!("SIGUSR2 received");
                trace.all();
            }
            _ = recv_optional(&mut siginfo) => {
                info!("SIGINFO received");
                trace.toggle_iscsi();
            }
            // State transitions wake the loop so it can exit promptly.
            _ = state_rx.changed() => {}
        }
    }
    debug!("signal task exit");
}
