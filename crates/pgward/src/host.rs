//! Host application control seam.
//!
//! The application embedding the supervisor cannot function without its
//! database, so an unreachable engine is escalated to a full host shutdown
//! through this trait rather than handled locally.

use nix::sys::signal::{Signal, raise};
use tracing::{info, warn};

const HOST_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::host");

/// Collaborator used to bring the host application down.
pub trait HostControl: Send + Sync {
    /// Requests an orderly shutdown of the host process.
    fn request_shutdown(&self);
}

/// Production control that raises SIGTERM in the host process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostControl;

impl SystemHostControl {
    /// Builds a new control.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HostControl for SystemHostControl {
    fn request_shutdown(&self) {
        info!(target: HOST_TARGET, "requesting host shutdown");
        if let Err(errno) = raise(Signal::SIGTERM) {
            warn!(
                target: HOST_TARGET,
                errno = %errno,
                "failed to raise shutdown signal"
            );
        }
    }
}
