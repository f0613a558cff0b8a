// src/main.rs

//! The main entry point for the rustgt daemon.

use anyhow::Result;
use clap::Parser;
use rustgt::config::{self, ConfigFile, Tunables};
use rustgt::core::daemon::SwMode;
use rustgt::server::{self, Bootstrap, TraceControl};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

/// Which subsystem gets debug tracing at startup (`-t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum TraceSelect {
    All,
    Net,
    Iscsi,
    Scsi,
    Lu,
    None,
}

#[derive(Parser, Debug)]
#[command(
    name = "rustgt",
    version,
    about = "iSCSI target daemon",
    disable_help_flag = true
)]
struct Cli {
    /// config file
    #[arg(short = 'c', value_name = "config", default_value = config::DEFAULT_CONFIG)]
    config: PathBuf,

    /// use specific pid file
    #[arg(short = 'p', value_name = "pidfile")]
    pidfile: Option<PathBuf>,

    /// use specific syslog facility
    #[arg(short = 'l', value_name = "facility")]
    log_facility: Option<String>,

    /// operational mode (0=traditional, 1=normal, 2=experimental)
    #[arg(short = 'm', value_name = "mode", value_parser = clap::value_parser!(u8).range(0..=2))]
    mode: Option<u8>,

    /// trace flag
    #[arg(short = 't', value_name = "flag", value_enum, ignore_case = true)]
    trace: Option<TraceSelect>,

    /// quiet warnings
    #[arg(short = 'q')]
    quiet: bool,

    /// don't detach from tty
    #[arg(short = 'D')]
    foreground: bool,

    /// show this usage
    #[arg(short = 'H', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

/// Maps `-t`/`-q` onto the initial filter directives.
fn trace_directives(trace: Option<TraceSelect>, quiet: bool) -> String {
    let floor = if quiet { "warn" } else { "info" };
    match trace {
        None | Some(TraceSelect::None) => floor.to_string(),
        Some(TraceSelect::All) => format!("rustgt=debug,{floor}"),
        Some(TraceSelect::Net) => format!(
            "rustgt::server=debug,rustgt::core::portal=debug,rustgt::core::portal_group=debug,{floor}"
        ),
        Some(TraceSelect::Iscsi) => format!("rustgt::connection=debug,{floor}"),
        Some(TraceSelect::Scsi) | Some(TraceSelect::Lu) => {
            format!("rustgt::core::lu=debug,{floor}")
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load and validate the configuration before anything else; the
    // daemon cannot run without it.
    let config_file = match ConfigFile::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };
    if config_file.is_empty() {
        eprintln!("empty config {}", cli.config.display());
        std::process::exit(1);
    }
    let tunables = match Tunables::from_config(&config_file) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    let facility = cli
        .log_facility
        .clone()
        .unwrap_or_else(|| tunables.log_facility.clone());
    if !config::valid_log_facility(&facility) {
        eprintln!("log facility error: unknown facility '{facility}'");
        std::process::exit(1);
    }

    let swmode = match cli.mode {
        None => SwMode::default(),
        Some(flag) => match SwMode::from_flag(flag) {
            Some(mode) => mode,
            None => {
                eprintln!("unknown mode {flag}");
                std::process::exit(1);
            }
        },
    };

    // Detach before the runtime exists; forking a live runtime is unsound.
    if !cli.foreground {
        let rc = unsafe { libc::daemon(0, 0) };
        if rc < 0 {
            eprintln!("daemon() failed: {}", std::io::Error::last_os_error());
            std::process::exit(1);
        }
    }

    // Logging with a reloadable filter: the signal task rewrites the
    // filter at runtime (SIGUSR1/SIGUSR2/SIGINFO).
    let directives = trace_directives(cli.trace, cli.quiet);
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(&directives));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true),
        )
        .init();
    let trace = TraceControl::new(Arc::new(reload_handle), directives);

    let boot = Bootstrap {
        config: Arc::new(config_file),
        tunables: Arc::new(tunables),
        pidfile_override: cli.pidfile,
        swmode,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        if let Err(e) = server::run(boot, trace).await {
            error!("server runtime error: {e:#}");
            return Err(e);
        }
        Ok(())
    })
}
