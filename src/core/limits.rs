// src/core/limits.rs

//! Compile-time bounds and wire constants shared across the core tables.

/// Default iSCSI listening port (RFC 3720, 13.2).
pub const DEFAULT_PORT: u16 = 3260;

/// Maximum number of portals inside one portal group.
pub const MAX_PORTAL: usize = 1024;

/// Maximum number of portal group slots.
pub const MAX_PORTAL_GROUP: usize = 4096;

/// Maximum number of initiator-name patterns per initiator group.
pub const MAX_INITIATOR: usize = 256;

/// Maximum number of netmask patterns per initiator group.
pub const MAX_NETMASK: usize = 256;

/// Maximum number of initiator group slots.
pub const MAX_INITIATOR_GROUP: usize = 4096;

/// Maximum number of management (unit control) portals.
pub const MAX_UCPORTAL: usize = 16;

/// Maximum number of logical units.
pub const MAX_LOGICAL_UNIT: usize = 64;

/// Upper bound for the MaxR2T tunable.
pub const MAX_R2T: u32 = 256;

/// Portal group tags are 16-bit positive integers (RFC 3720, 12.3);
/// the management portals live above that space.
pub const MAX_PG_TAG: u32 = 0xffff;

/// Sentinel tag carried by every unit-control portal.
pub const UC_TAG: u32 = MAX_PG_TAG + 1;

/// How long the accept loop sleeps between idle state re-checks.
pub const POLLWAIT: std::time::Duration = std::time::Duration::from_secs(5);

/// How many one-second rounds shutdown waits for connections to drain.
pub const DRAIN_RETRIES: u32 = 10;
