// src/core/errors.rs

//! Defines the primary error type for the daemon core.

use std::io;
use thiserror::Error;

/// The main error enum, covering every failure the core can report.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum TargetError {
    /// A textual endpoint could not be decoded into host and port.
    #[error("bad portal '{0}'")]
    BadPortal(String),

    /// A bounded table (portal groups, initiator groups, portals, ...) is full.
    #[error("{0} limit exceeded")]
    Capacity(&'static str),

    /// A group lookup by tag came up empty.
    #[error("{kind}{tag} not found")]
    NotFound { kind: &'static str, tag: u32 },

    /// bind/listen failed while opening a portal.
    #[error("listen error {host}:{port}")]
    ListenFailed {
        host: String,
        port: String,
        #[source]
        source: io::Error,
    },

    /// A tunable is out of range or carries an unsupported value.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The control channel broke mid-exchange.
    #[error("control channel error: {0}")]
    IoFailed(String),

    /// The configuration file could not be read or tokenized.
    #[error("config file error: {0}")]
    ConfigFile(String),
}

/// Classifies accept(2) errors that are expected under normal operation:
/// the peer gave up between the TCP handshake and our accept.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
