// src/core/portal_group.rs

//! The portal group table: a bounded slot store indexed by position, keyed
//! by tag. Slot indices are stable handles: sessions and the accept loop
//! hold them across reloads, so retirement never compacts. A slot with
//! `tag == 0` is free and may be reused by a later add with the same
//! portal count, which keeps the published slot count from growing.

use crate::config::{ConfigFile, Section, SectionKind};
use crate::core::TargetError;
use crate::core::limits::{MAX_PG_TAG, MAX_PORTAL, MAX_PORTAL_GROUP};
use crate::core::portal::{Portal, parse_portal};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info};

/// What a portal-group update did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The section matches the live slot; nothing was touched.
    Unchanged,
    /// The slot content was rewritten (in place or into a new slot).
    Updated,
}

/// An ordered set of portals sharing one tag.
#[derive(Debug)]
pub struct PortalGroup {
    /// 16-bit positive tag while assigned; 0 marks the slot free.
    pub tag: u32,
    /// Position in the table. Never changes once the slot exists.
    pub idx: usize,
    pub portals: Vec<Portal>,
    /// Sessions currently bound to this group. A non-zero count blocks
    /// retirement and content updates.
    pub refs: Arc<AtomicU32>,
}

impl PortalGroup {
    pub fn nportals(&self) -> usize {
        self.portals.len()
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Opens every portal in the group. The first failure aborts; portals
    /// opened earlier in this call stay open and it is the caller's call
    /// whether to close them or tear the whole process down.
    pub fn open(&mut self) -> Result<(), TargetError> {
        for portal in &mut self.portals {
            portal.open()?;
        }
        Ok(())
    }

    /// Closes every portal in the group. Idempotent.
    pub fn close(&mut self) {
        for portal in &mut self.portals {
            portal.close();
        }
    }
}

/// The `(label, host, port)` triples of a `[PortalGroup<N>]` section, with
/// every endpoint syntax-checked. The list ends at the first `Portal` item
/// with a missing column.
fn collect_portals(sp: &Section) -> Result<Vec<(String, String, String)>, TargetError> {
    let mut portals = Vec::new();
    for i in 0.. {
        let (Some(label), Some(endpoint)) = (sp.nmval("Portal", i, 0), sp.nmval("Portal", i, 1))
        else {
            break;
        };
        let (host, port) = parse_portal(endpoint)?;
        portals.push((label.to_string(), host, port));
    }
    if portals.len() > MAX_PORTAL {
        return Err(TargetError::Capacity("portal"));
    }
    Ok(portals)
}

/// The table itself. Callers serialize access through the daemon mutex.
#[derive(Debug, Default)]
pub struct PgTable {
    slots: Vec<PortalGroup>,
}

impl PgTable {
    pub fn new() -> PgTable {
        PgTable { slots: Vec::new() }
    }

    /// Number of slots ever published, free ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[PortalGroup] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [PortalGroup] {
        &mut self.slots
    }

    /// Looks a live group up by tag. Tag 0 never matches.
    pub fn find_by_tag(&self, tag: u32) -> Option<&PortalGroup> {
        if tag == 0 {
            return None;
        }
        self.slots.iter().find(|pg| pg.tag == tag)
    }

    fn find_idx_by_tag(&self, tag: u32) -> Option<usize> {
        if tag == 0 {
            return None;
        }
        self.slots.iter().position(|pg| pg.tag == tag)
    }

    /// True when the live slot and the section describe the same portals,
    /// in the same order, and the section has no extras.
    pub fn matches(pg: &PortalGroup, sp: &Section) -> bool {
        let Ok(portals) = collect_portals(sp) else {
            return false;
        };
        if portals.len() != pg.portals.len() {
            return false;
        }
        pg.portals
            .iter()
            .zip(&portals)
            .all(|(p, (label, host, port))| {
                p.label == *label && p.host == *host && p.port == *port
            })
    }

    /// Adds the group described by `sp`, preferring the first free slot
    /// whose portal count matches over a fresh index. Returns the slot
    /// index. Listeners are not opened here.
    pub fn add(&mut self, sp: &Section) -> Result<usize, TargetError> {
        debug!(tag = sp.num, "add portal group");
        let idx = self.place(sp, Arc::new(AtomicU32::new(0)))?;
        Ok(idx)
    }

    /// Applies a changed section to the live slot carrying its tag.
    ///
    /// The caller is expected to have closed the group's listeners first;
    /// the slot-reallocating branch frees the old slot without touching
    /// sockets. `pgp_idx` is written only when the table actually changed.
    pub fn update(&mut self, sp: &Section, pgp_idx: &mut usize) -> Result<UpdateOutcome, TargetError> {
        debug!(tag = sp.num, "update portal group");
        let portals = collect_portals(sp)?;
        let idx = self
            .find_idx_by_tag(sp.num)
            .ok_or(TargetError::NotFound { kind: "PG", tag: sp.num })?;
        if Self::matches(&self.slots[idx], sp) {
            debug!(tag = sp.num, "portal group unchanged");
            return Ok(UpdateOutcome::Unchanged);
        }

        if self.slots[idx].portals.len() == portals.len() {
            // Same shape: rewrite the strings in place, keeping sockets,
            // refs and per-portal identity as they are.
            let slot = &mut self.slots[idx];
            for (portal, (label, host, port)) in slot.portals.iter_mut().zip(portals) {
                portal.label = label;
                portal.host = host;
                portal.port = port;
            }
            *pgp_idx = idx;
            return Ok(UpdateOutcome::Updated);
        }

        // The portal count changed: retire the old slot (its listeners are
        // already closed) and place the new definition, carrying the live
        // session count over to the new slot.
        self.slots[idx].tag = 0;
        let carried_refs = Arc::clone(&self.slots[idx].refs);
        let new_idx = self.place(sp, carried_refs)?;
        debug!(tag = sp.num, old_idx = idx, new_idx, "portal group reallocated");
        *pgp_idx = new_idx;
        Ok(UpdateOutcome::Updated)
    }

    /// Slot placement shared by add and the reallocating update: first
    /// free slot with a matching portal count wins, else the next fresh
    /// index.
    fn place(&mut self, sp: &Section, refs: Arc<AtomicU32>) -> Result<usize, TargetError> {
        if sp.num > MAX_PG_TAG {
            return Err(TargetError::ConfigInvalid(format!(
                "PortalGroup{} tag out of range",
                sp.num
            )));
        }
        let portals = collect_portals(sp)?;
        let count = portals.len();

        let reuse_idx = self
            .slots
            .iter()
            .position(|slot| slot.tag == 0 && slot.portals.len() == count);
        let idx = reuse_idx.unwrap_or(self.slots.len());
        if idx >= MAX_PORTAL_GROUP {
            return Err(TargetError::Capacity("portal group"));
        }
        debug!(idx, tag = sp.num, portals = count, "place portal group");

        let new_portals: Vec<Portal> = portals
            .into_iter()
            .enumerate()
            .map(|(i, (label, host, port))| Portal::new(&label, host, port, sp.num, i))
            .collect();

        if reuse_idx.is_some() {
            let slot = &mut self.slots[idx];
            slot.tag = sp.num;
            slot.portals = new_portals;
            slot.refs = refs;
        } else {
            self.slots.push(PortalGroup {
                tag: sp.num,
                idx,
                portals: new_portals,
                refs,
            });
        }
        Ok(idx)
    }

    /// Frees every live slot whose tag is no longer present in `config`,
    /// closing its listeners. A referenced group is left alone and the
    /// request logged; retiring it under active sessions would leave them
    /// pointing at a recycled slot.
    pub fn delete_retired(&mut self, config: &ConfigFile) {
        for slot in &mut self.slots {
            if slot.tag == 0 {
                continue;
            }
            if config.has_numbered(SectionKind::PortalGroup, slot.tag) {
                continue;
            }
            if slot.ref_count() != 0 {
                error!(tag = slot.tag, "delete request for referenced PG");
            } else {
                info!(tag = slot.tag, "delete PG");
                slot.tag = 0;
                slot.close();
            }
        }
    }

    /// Populates the table from every `[PortalGroup<N>]` section. Used at
    /// init, where any error is fatal.
    pub fn build(&mut self, config: &ConfigFile) -> Result<(), TargetError> {
        for sp in config.sections_of(SectionKind::PortalGroup) {
            if sp.num == 0 {
                return Err(TargetError::ConfigInvalid("PortalGroup0 is invalid".into()));
            }
            self.add(sp)?;
        }
        Ok(())
    }

    /// Opens every portal of every live group. Free slots keep their
    /// sockets closed.
    pub fn open_all(&mut self) -> Result<(), TargetError> {
        for slot in &mut self.slots {
            if slot.tag == 0 {
                continue;
            }
            slot.open()?;
        }
        Ok(())
    }

    /// Closes every portal of every group, live or free.
    pub fn close_all(&mut self) {
        for slot in &mut self.slots {
            slot.close();
        }
    }

    /// Drops every slot. Shutdown only.
    pub fn destroy(&mut self) {
        self.close_all();
        self.slots.clear();
    }
}
