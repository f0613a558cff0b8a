// src/core/daemon.rs

//! The process-wide container: configuration, the three tables, the state
//! machine, the reload generation counter, and the control channel into
//! the accept loop. One `Daemon` exists per process, shared behind an
//! `Arc` by the accept loop, the signal task, every connection handler,
//! and every LU worker.

use crate::config::{ConfigFile, Tunables};
use crate::connection::registry::ConnRegistry;
use crate::core::TargetError;
use crate::core::initiator_group::IgTable;
use crate::core::lu::LuTable;
use crate::core::portal::Portal;
use crate::core::portal_group::PgTable;
use crate::core::state::{DaemonState, StateCell};
use crate::core::uctl;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

/// Capacity of the control channel. Commands are rare (shutdown, the two
/// reload phases) and each sender awaits its completion, so the bound is
/// never a throughput concern.
const CONTROL_CHANNEL_CAPACITY: usize = 8;

/// Operational mode selected with `-m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwMode {
    Traditional,
    #[default]
    Normal,
    Experimental,
}

impl SwMode {
    pub fn from_flag(flag: u8) -> Option<SwMode> {
        match flag {
            0 => Some(SwMode::Traditional),
            1 => Some(SwMode::Normal),
            2 => Some(SwMode::Experimental),
            _ => None,
        }
    }
}

impl fmt::Display for SwMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwMode::Traditional => write!(f, "traditional"),
            SwMode::Normal => write!(f, "normal"),
            SwMode::Experimental => write!(f, "experimental"),
        }
    }
}

/// A command posted into the accept loop. `Delete` and `Update` carry the
/// completion the initiator blocks on; the loop answers only after the
/// live listener set reflects the edit and its readiness set has been
/// rebuilt.
#[derive(Debug)]
pub enum ControlCommand {
    /// Break out of the accept loop.
    Exit,
    /// Retire portal groups absent from the current config.
    Delete {
        done: oneshot::Sender<Result<(), TargetError>>,
    },
    /// Add new portal groups and apply changed definitions.
    Update {
        done: oneshot::Sender<Result<(), TargetError>>,
    },
}

/// Everything guarded by the daemon mutex: the three tables. Held for
/// short critical sections only, never across an await point.
#[derive(Debug, Default)]
pub struct Tables {
    pub pgs: PgTable,
    pub igs: IgTable,
    pub uctl_portals: Vec<Portal>,
    pub lus: LuTable,
}

/// The configuration handle: the live file plus, for the duration of a
/// reload, the one it replaced.
#[derive(Debug)]
pub struct ConfigSlot {
    pub current: Arc<ConfigFile>,
    pub previous: Option<Arc<ConfigFile>>,
}

pub struct Daemon {
    tables: Mutex<Tables>,
    config: Mutex<ConfigSlot>,
    tunables: Mutex<Arc<Tunables>>,
    pub state: StateCell,
    lu_state: watch::Sender<DaemonState>,
    pub lu_workers: Mutex<JoinSet<()>>,
    /// Bumped once per successful reload.
    generation: AtomicU32,
    control_tx: mpsc::Sender<ControlCommand>,
    /// Serializes reloads end to end: at most one in flight.
    pub reload_lock: tokio::sync::Mutex<()>,
    pub registry: ConnRegistry,
    pub swmode: SwMode,
    pub pidfile: PathBuf,
}

impl Daemon {
    /// Builds the container around an already-validated configuration.
    /// Returns the receiving end of the control channel for the accept
    /// loop. No table is populated and no socket is opened here.
    pub fn new(
        config: Arc<ConfigFile>,
        tunables: Arc<Tunables>,
        swmode: SwMode,
        pidfile: PathBuf,
    ) -> (Arc<Daemon>, mpsc::Receiver<ControlCommand>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (lu_state, _) = watch::channel(DaemonState::Invalid);
        let daemon = Arc::new(Daemon {
            tables: Mutex::new(Tables::default()),
            config: Mutex::new(ConfigSlot {
                current: config,
                previous: None,
            }),
            tunables: Mutex::new(tunables),
            state: StateCell::new(),
            lu_state,
            lu_workers: Mutex::new(JoinSet::new()),
            generation: AtomicU32::new(0),
            control_tx,
            reload_lock: tokio::sync::Mutex::new(()),
            registry: ConnRegistry::new(),
            swmode,
            pidfile,
        });
        (daemon, control_rx)
    }

    /// Populates the UCTL list and the PG, IG and LU tables from the
    /// current configuration, then moves to `Initialized`. Init only; any
    /// failure here is fatal to startup.
    pub fn build_tables(&self) -> Result<(), TargetError> {
        let config = self.current_config();
        let mut tables = self.tables.lock();
        tables.uctl_portals = uctl::build(&config)?;
        tables.pgs.build(&config)?;
        tables.igs.build(&config)?;
        tables.lus.build(&config)?;
        drop(tables);
        self.state.set(DaemonState::Initialized);
        Ok(())
    }

    /// Runs `f` with the tables locked. The closure must not block.
    pub fn with_tables<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.lock())
    }

    /// Mutable variant of [`Daemon::with_tables`].
    pub fn with_tables_mut<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut self.tables.lock())
    }

    pub fn current_config(&self) -> Arc<ConfigFile> {
        Arc::clone(&self.config.lock().current)
    }

    /// Swaps in a freshly parsed config, remembering the old one for the
    /// duration of the reload.
    pub fn begin_config_swap(&self, next: Arc<ConfigFile>) {
        let mut slot = self.config.lock();
        slot.previous = Some(Arc::clone(&slot.current));
        slot.current = next;
    }

    /// Drops the remembered previous config once a reload has finished.
    pub fn finish_config_swap(&self) {
        self.config.lock().previous = None;
    }

    pub fn tunables(&self) -> Arc<Tunables> {
        Arc::clone(&self.tunables.lock())
    }

    pub fn set_tunables(&self, next: Arc<Tunables>) {
        *self.tunables.lock() = next;
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Broadcasts a state to every LU worker. `send_replace` stores the
    /// value even when no worker is subscribed yet.
    pub fn lu_set_all_state(&self, state: DaemonState) {
        self.lu_state.send_replace(state);
    }

    pub fn lu_state_rx(&self) -> watch::Receiver<DaemonState> {
        self.lu_state.subscribe()
    }

    /// Posts a command into the accept loop.
    pub async fn post_control(&self, cmd: ControlCommand) -> Result<(), TargetError> {
        self.control_tx
            .send(cmd)
            .await
            .map_err(|_| TargetError::IoFailed("accept loop is gone".into()))
    }

    /// Asks the accept loop to exit. Failures are ignored: if the loop is
    /// already gone, the goal is reached.
    pub async fn stop_loop(&self) {
        let _ = self.control_tx.send(ControlCommand::Exit).await;
    }
}
