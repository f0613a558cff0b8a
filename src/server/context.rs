// src/server/context.rs

use crate::core::daemon::{ControlCommand, Daemon};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Holds the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub daemon: Arc<Daemon>,
    /// Receiving end of the control channel, consumed by the accept loop.
    pub control_rx: mpsc::Receiver<ControlCommand>,
}
