// src/core/uctl.rs

//! The unit-control portal set: the fixed list of management listeners
//! read from `[UnitControl]` at init. Unlike portal groups this set is
//! never reconfigured at runtime; it is opened at startup and closed at
//! shutdown.

use crate::config::ConfigFile;
use crate::core::TargetError;
use crate::core::limits::{MAX_UCPORTAL, UC_TAG};
use crate::core::portal::{Portal, parse_portal};
use tracing::debug;

/// Builds the management portal list from the `[UnitControl]` section.
/// A missing section is fatal: a daemon without a control channel cannot
/// be administered.
pub fn build(config: &ConfigFile) -> Result<Vec<Portal>, TargetError> {
    let sp = config
        .find("UnitControl")
        .ok_or_else(|| TargetError::ConfigInvalid("no [UnitControl] section".into()))?;

    let mut portals = Vec::new();
    for i in 0.. {
        let (Some(label), Some(endpoint)) = (sp.nmval("Portal", i, 0), sp.nmval("Portal", i, 1))
        else {
            break;
        };
        let (host, port) = parse_portal(endpoint)?;
        let idx = portals.len();
        if idx >= MAX_UCPORTAL {
            return Err(TargetError::Capacity("unit control portal"));
        }
        debug!(idx, %host, %port, tag = UC_TAG, "build uctl portal");
        portals.push(Portal::new(label, host, port, UC_TAG, idx));
    }
    Ok(portals)
}

/// Opens every management portal. Idempotent per portal.
pub fn open_all(portals: &mut [Portal]) -> Result<(), TargetError> {
    for portal in portals {
        portal.open()?;
    }
    Ok(())
}

/// Closes every management portal. Idempotent.
pub fn close_all(portals: &mut [Portal]) {
    for portal in portals {
        portal.close();
    }
}
