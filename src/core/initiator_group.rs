// src/core/initiator_group.rs

//! The initiator group table: the access-control side of the house. An
//! initiator group is an ordered list of initiator-name patterns plus an
//! ordered list of netmask patterns; matching against a login is the
//! front-end's job, this table only owns the text.
//!
//! Unlike portal groups there are no sockets here, so updates always
//! rebuild the entry, and retirement compacts the table: nothing outside
//! holds an initiator group by index, only by tag.

use crate::config::{ConfigFile, Section, SectionKind};
use crate::core::TargetError;
use crate::core::limits::{MAX_INITIATOR, MAX_INITIATOR_GROUP, MAX_NETMASK};
use crate::core::portal_group::UpdateOutcome;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info};

/// One ACL entry: who may log in (names) from where (netmasks).
#[derive(Debug)]
pub struct InitiatorGroup {
    pub tag: u32,
    pub idx: usize,
    pub initiators: Vec<String>,
    pub netmasks: Vec<String>,
    /// Sessions currently authorized through this group.
    pub refs: Arc<AtomicU32>,
}

impl InitiatorGroup {
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Every `InitiatorName` and `Netmask` value of a section, bounds-checked.
fn collect_patterns(sp: &Section) -> Result<(Vec<String>, Vec<String>), TargetError> {
    let mut names = Vec::new();
    for i in 0.. {
        let Some(name) = sp.nval("InitiatorName", i) else {
            break;
        };
        names.push(name.to_string());
    }
    if names.len() > MAX_INITIATOR {
        return Err(TargetError::Capacity("initiator name"));
    }

    let mut masks = Vec::new();
    for i in 0.. {
        let Some(mask) = sp.nval("Netmask", i) else {
            break;
        };
        masks.push(mask.to_string());
    }
    if masks.len() > MAX_NETMASK {
        return Err(TargetError::Capacity("netmask"));
    }

    Ok((names, masks))
}

/// The table. Access is serialized through the daemon mutex.
#[derive(Debug, Default)]
pub struct IgTable {
    groups: Vec<InitiatorGroup>,
}

impl IgTable {
    pub fn new() -> IgTable {
        IgTable { groups: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[InitiatorGroup] {
        &self.groups
    }

    pub fn find_by_tag(&self, tag: u32) -> Option<&InitiatorGroup> {
        if tag == 0 {
            return None;
        }
        self.groups.iter().find(|ig| ig.tag == tag)
    }

    /// True when the live entry and the section carry the same patterns in
    /// the same order, with no extras on either side.
    pub fn matches(ig: &InitiatorGroup, sp: &Section) -> bool {
        let Ok((names, masks)) = collect_patterns(sp) else {
            return false;
        };
        ig.initiators == names && ig.netmasks == masks
    }

    /// Appends the group described by `sp`.
    pub fn add(&mut self, sp: &Section) -> Result<usize, TargetError> {
        let (names, masks) = collect_patterns(sp)?;
        let idx = self.groups.len();
        if idx >= MAX_INITIATOR_GROUP {
            return Err(TargetError::Capacity("initiator group"));
        }
        debug!(
            idx,
            tag = sp.num,
            names = names.len(),
            masks = masks.len(),
            "add initiator group"
        );
        self.groups.push(InitiatorGroup {
            tag: sp.num,
            idx,
            initiators: names,
            netmasks: masks,
            refs: Arc::new(AtomicU32::new(0)),
        });
        Ok(idx)
    }

    /// Rewrites the entry carrying this section's tag. The pattern lists
    /// are rebuilt wholesale, but only after the match check has ruled out
    /// a no-op, so an unchanged group is never churned.
    pub fn update(&mut self, sp: &Section) -> Result<UpdateOutcome, TargetError> {
        let (names, masks) = collect_patterns(sp)?;
        let ig = self
            .groups
            .iter_mut()
            .find(|ig| ig.tag == sp.num)
            .ok_or(TargetError::NotFound { kind: "IG", tag: sp.num })?;
        if ig.initiators == names && ig.netmasks == masks {
            debug!(tag = sp.num, "initiator group unchanged");
            return Ok(UpdateOutcome::Unchanged);
        }
        debug!(
            idx = ig.idx,
            tag = sp.num,
            names = names.len(),
            masks = masks.len(),
            "update initiator group"
        );
        ig.initiators = names;
        ig.netmasks = masks;
        Ok(UpdateOutcome::Updated)
    }

    /// Removes every group whose tag is gone from `config`, shifting the
    /// survivors down and renumbering their indices. Referenced groups are
    /// kept and the request logged.
    pub fn delete_retired(&mut self, config: &ConfigFile) {
        self.groups.retain(|ig| {
            if config.has_numbered(SectionKind::InitiatorGroup, ig.tag) {
                return true;
            }
            if ig.ref_count() != 0 {
                error!(tag = ig.tag, "delete request for referenced IG");
                return true;
            }
            info!(tag = ig.tag, "delete IG");
            false
        });
        for (idx, ig) in self.groups.iter_mut().enumerate() {
            ig.idx = idx;
        }
    }

    /// Populates the table from every `[InitiatorGroup<N>]` section. Init
    /// only; errors are fatal there.
    pub fn build(&mut self, config: &ConfigFile) -> Result<(), TargetError> {
        for sp in config.sections_of(SectionKind::InitiatorGroup) {
            if sp.num == 0 {
                return Err(TargetError::ConfigInvalid(
                    "InitiatorGroup0 is invalid".into(),
                ));
            }
            self.add(sp)?;
        }
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.groups.clear();
    }
}
