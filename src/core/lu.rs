// src/core/lu.rs

//! The logical-unit side of the daemon, reduced to what the control plane
//! needs: the table of configured units, one worker task per unit, and the
//! reload hooks. Command queues and backing-store I/O live behind this
//! boundary and are not part of the core.

use crate::config::{ConfigFile, Section, SectionKind};
use crate::core::TargetError;
use crate::core::daemon::Daemon;
use crate::core::limits::MAX_LOGICAL_UNIT;
use crate::core::portal_group::UpdateOutcome;
use crate::core::state::DaemonState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// One configured logical unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalUnit {
    pub num: u32,
    /// The `TargetName` the unit is exported under, if set.
    pub name: Option<String>,
}

impl LogicalUnit {
    fn from_section(sp: &Section) -> LogicalUnit {
        LogicalUnit {
            num: sp.num,
            name: sp.val("TargetName").map(str::to_string),
        }
    }
}

/// The bounded table of logical units. Serialized by the daemon mutex.
#[derive(Debug, Default)]
pub struct LuTable {
    units: Vec<LogicalUnit>,
}

impl LuTable {
    pub fn new() -> LuTable {
        LuTable { units: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn units(&self) -> &[LogicalUnit] {
        &self.units
    }

    pub fn find_by_num(&self, num: u32) -> Option<&LogicalUnit> {
        self.units.iter().find(|lu| lu.num == num)
    }

    pub fn add(&mut self, sp: &Section) -> Result<(), TargetError> {
        if self.units.len() >= MAX_LOGICAL_UNIT {
            return Err(TargetError::Capacity("logical unit"));
        }
        debug!(num = sp.num, "add logical unit");
        self.units.push(LogicalUnit::from_section(sp));
        Ok(())
    }

    pub fn update(&mut self, sp: &Section) -> Result<UpdateOutcome, TargetError> {
        let next = LogicalUnit::from_section(sp);
        let lu = self
            .units
            .iter_mut()
            .find(|lu| lu.num == sp.num)
            .ok_or(TargetError::NotFound { kind: "LU", tag: sp.num })?;
        if *lu == next {
            return Ok(UpdateOutcome::Unchanged);
        }
        debug!(num = sp.num, "update logical unit");
        *lu = next;
        Ok(UpdateOutcome::Updated)
    }

    pub fn delete_retired(&mut self, config: &ConfigFile) {
        self.units.retain(|lu| {
            if config.has_numbered(SectionKind::LogicalUnit, lu.num) {
                return true;
            }
            info!(num = lu.num, "delete LU");
            false
        });
    }

    pub fn build(&mut self, config: &ConfigFile) -> Result<(), TargetError> {
        for sp in config.sections_of(SectionKind::LogicalUnit) {
            if sp.num == 0 {
                return Err(TargetError::ConfigInvalid("LogicalUnit0 is invalid".into()));
            }
            self.add(sp)?;
        }
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.units.clear();
    }
}

/// The per-unit worker body: follows the LU state broadcast, exits once it
/// reaches `Exiting`. Command queues would hang off this task.
async fn worker(lu: LogicalUnit, mut state_rx: watch::Receiver<DaemonState>) {
    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            DaemonState::Running => {
                debug!(num = lu.num, name = ?lu.name, "LU worker running");
            }
            DaemonState::Exiting | DaemonState::Shutdown => break,
            _ => {}
        }
        if state_rx.changed().await.is_err() {
            break;
        }
    }
    debug!(num = lu.num, "LU worker exit");
}

/// Spawns one worker task per configured unit.
pub fn create_workers(daemon: &Arc<Daemon>) {
    let units: Vec<LogicalUnit> = daemon.with_tables(|t| t.lus.units().to_vec());
    let mut workers = daemon.lu_workers.lock();
    for lu in units {
        workers.spawn(worker(lu, daemon.lu_state_rx()));
    }
}

/// Reload phase: drop units no longer configured. Runs in place under the
/// daemon mutex; LU workers are driven by the state broadcast, not by the
/// table, so no handshake with the accept loop is needed.
pub fn reload_delete(daemon: &Daemon) {
    let config = daemon.current_config();
    daemon.with_tables_mut(|t| t.lus.delete_retired(&config));
}

/// Reload phase: add units new to the configuration and apply content
/// changes to the rest.
pub fn reload_update(daemon: &Arc<Daemon>) {
    let config = daemon.current_config();
    for sp in config.sections_of(SectionKind::LogicalUnit) {
        if sp.num == 0 {
            tracing::error!("LogicalUnit0 is invalid");
            continue;
        }
        let known = daemon.with_tables(|t| t.lus.find_by_num(sp.num).is_some());
        let result = daemon.with_tables_mut(|t| {
            if known {
                t.lus.update(sp).map(|outcome| outcome == UpdateOutcome::Updated)
            } else {
                t.lus.add(sp).map(|_| true)
            }
        });
        match result {
            Ok(true) if known => info!(num = sp.num, "update LU"),
            Ok(true) => {
                info!(num = sp.num, "add LU");
                // A unit added at runtime needs its worker too.
                daemon
                    .lu_workers
                    .lock()
                    .spawn(worker(LogicalUnit::from_section(sp), daemon.lu_state_rx()));
            }
            Ok(false) => {}
            Err(e) => tracing::error!(num = sp.num, "LU reload failed: {e}"),
        }
    }
}

/// Awaits every LU worker. Called once the state broadcast has reached
/// `Exiting`, so this only reaps.
pub async fn shutdown(daemon: &Daemon) {
    let mut workers = std::mem::take(&mut *daemon.lu_workers.lock());
    while workers.join_next().await.is_some() {}
}
