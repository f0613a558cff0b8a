// src/server/reload.rs

//! The reload protocol. A reload always starts outside the accept loop
//! (the signal task on SIGHUP, or a UCTL `RELOAD` command) and finishes
//! inside it: the portal-group phases are a synchronous exchange through
//! the control channel, because only the accept loop may swap the listener
//! set it is multiplexing. Initiator and logical-unit phases have no
//! sockets and mutate the tables in place under the daemon mutex.

use crate::config::{ConfigFile, SectionKind, Tunables};
use crate::core::TargetError;
use crate::core::daemon::{ControlCommand, Daemon};
use crate::core::lu;
use crate::core::portal_group::{PgTable, UpdateOutcome};
use crate::core::state::DaemonState;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Re-reads the configuration file and walks the daemon over to it.
///
/// Serialized end to end: a second initiator blocks until the first
/// exchange has fully completed. A parse or validation failure returns
/// before anything is swapped, leaving the daemon on the prior
/// configuration. `generation` is bumped exactly once, at the end of a
/// fully executed reload.
pub async fn reload(daemon: &Arc<Daemon>) -> Result<(), TargetError> {
    let _serial = daemon.reload_lock.lock().await;
    debug!("reload");

    let path = daemon.current_config().path().to_path_buf();
    let next = ConfigFile::load(&path)?;
    if next.is_empty() {
        return Err(TargetError::ConfigFile(format!(
            "{}: empty config",
            path.display()
        )));
    }
    let tunables = Tunables::from_config(&next)?;

    daemon.begin_config_swap(Arc::new(next));
    daemon.set_tunables(Arc::new(tunables));
    info!(generation = daemon.generation() + 1, "reloading configuration");

    lu::reload_delete(daemon);
    ig_reload_delete(daemon);
    pg_exchange(daemon, Phase::Delete).await?;
    pg_exchange(daemon, Phase::Update).await?;
    ig_reload_update(daemon);
    lu::reload_update(daemon);

    daemon.finish_config_swap();
    let generation = daemon.bump_generation();
    info!(generation, "configuration reloaded");
    Ok(())
}

#[derive(Clone, Copy)]
enum Phase {
    Delete,
    Update,
}

/// One two-phase exchange with the accept loop: post the command, block
/// until the loop has applied it and rebuilt its readiness set. A failure
/// reported by the loop is fatal only once the daemon has left `Running`;
/// before that the loop has already logged the details and keeps serving.
async fn pg_exchange(daemon: &Daemon, phase: Phase) -> Result<(), TargetError> {
    let (done, completion) = oneshot::channel();
    let cmd = match phase {
        Phase::Delete => ControlCommand::Delete { done },
        Phase::Update => ControlCommand::Update { done },
    };
    daemon.post_control(cmd).await?;

    match completion.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            if daemon.state.get() != DaemonState::Running {
                warn!("pg reload aborted");
                Err(e)
            } else {
                Ok(())
            }
        }
        Err(_) => Err(TargetError::IoFailed(
            "accept loop dropped reload completion".into(),
        )),
    }
}

/// Accept-loop side of the `Delete` command: retire groups whose tags are
/// gone from the current config and close their listeners.
pub(crate) fn apply_pg_delete(daemon: &Daemon) -> Result<(), TargetError> {
    let config = daemon.current_config();
    daemon.with_tables_mut(|t| t.pgs.delete_retired(&config));
    Ok(())
}

enum Applied {
    Added,
    Updated,
    Skipped,
}

/// Accept-loop side of the `Update` command: add groups with new tags
/// (opening their listeners) and rewrite changed, unreferenced groups.
/// A group with live sessions keeps its old definition; rejecting the
/// change beats stalling those sessions.
pub(crate) fn apply_pg_update(daemon: &Daemon) -> Result<(), TargetError> {
    let config = daemon.current_config();
    let mut failed = false;

    for sp in config.sections_of(SectionKind::PortalGroup) {
        if sp.num == 0 {
            error!("PortalGroup0 is invalid");
            failed = true;
            continue;
        }
        debug!(tag = sp.num, "PG reload");

        let result: Result<Applied, TargetError> = daemon.with_tables_mut(|t| {
            let Some(idx) = t.pgs.slots().iter().position(|pg| pg.tag == sp.num) else {
                // New tag: place it and bring its listeners up. A listen
                // failure is logged but does not fail the reload; the
                // group stays in the table for the next attempt.
                let idx = t.pgs.add(sp)?;
                if let Err(e) = t.pgs.slots_mut()[idx].open() {
                    error!(tag = sp.num, "listen failed on reload: {e}");
                }
                return Ok(Applied::Added);
            };

            {
                let pg = &t.pgs.slots()[idx];
                if PgTable::matches(pg, sp) {
                    debug!(tag = sp.num, "skip unchanged PG");
                    return Ok(Applied::Skipped);
                }
                if pg.ref_count() != 0 {
                    error!(tag = pg.tag, "update request for referenced PG");
                    return Ok(Applied::Skipped);
                }
            }

            // Changed and unreferenced: drop the old listeners before the
            // table rewrite, then open the new set.
            let mut pgp_idx = idx;
            t.pgs.slots_mut()[idx].close();
            match t.pgs.update(sp, &mut pgp_idx)? {
                UpdateOutcome::Unchanged => Ok(Applied::Skipped),
                UpdateOutcome::Updated => {
                    if let Err(e) = t.pgs.slots_mut()[pgp_idx].open() {
                        error!(tag = sp.num, "listen failed on reload: {e}");
                    }
                    Ok(Applied::Updated)
                }
            }
        });

        match result {
            Ok(Applied::Added) => info!(tag = sp.num, "add PG"),
            Ok(Applied::Updated) => info!(tag = sp.num, "update PG"),
            Ok(Applied::Skipped) => {}
            Err(e) => {
                error!(tag = sp.num, "PG reload failed: {e}");
                failed = true;
            }
        }
    }

    if failed {
        Err(TargetError::ConfigInvalid("portal group reload had errors".into()))
    } else {
        Ok(())
    }
}

/// Reload phase: drop initiator groups no longer configured. In place, no
/// accept-loop handshake: nothing multiplexes on an initiator group.
fn ig_reload_delete(daemon: &Daemon) {
    let config = daemon.current_config();
    daemon.with_tables_mut(|t| t.igs.delete_retired(&config));
}

/// Reload phase: add new initiator groups and rewrite changed ones.
fn ig_reload_update(daemon: &Daemon) {
    let config = daemon.current_config();
    for sp in config.sections_of(SectionKind::InitiatorGroup) {
        if sp.num == 0 {
            error!("InitiatorGroup0 is invalid");
            continue;
        }
        debug!(tag = sp.num, "IG reload");

        let known = daemon.with_tables(|t| t.igs.find_by_tag(sp.num).is_some());
        if known {
            match daemon.with_tables_mut(|t| t.igs.update(sp)) {
                Ok(UpdateOutcome::Updated) => info!(tag = sp.num, "update IG"),
                Ok(UpdateOutcome::Unchanged) => {}
                Err(e) => error!(tag = sp.num, "IG update failed: {e}"),
            }
        } else {
            match daemon.with_tables_mut(|t| t.igs.add(sp)) {
                Ok(_) => info!(tag = sp.num, "add IG"),
                Err(e) => error!(tag = sp.num, "IG add failed: {e}"),
            }
        }
    }
}
