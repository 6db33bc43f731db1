//! Dependent subservices started once the database is ready.
//!
//! Hosts register factories; the supervisor builds each unit after a
//! successful bootstrap, handing it a [`ConnectionSource`] so it can obtain
//! its own connections on demand. Units are started in registration order
//! and stopped in reverse before the engine's stop command is issued.

use thiserror::Error;

use crate::connect::ConnectionSource;

/// Failure reported by a subservice's start or stop handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SubserviceError(String);

impl SubserviceError {
    /// Builds an error carrying a diagnostic message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A startable and stoppable unit depending on the database.
pub trait Subservice: Send {
    /// Diagnostic name of the unit.
    fn name(&self) -> &str;

    /// Starts the unit. The database is guaranteed to be bootstrapped.
    fn start(&mut self) -> Result<(), SubserviceError>;

    /// Stops the unit. Called before the engine is shut down.
    fn stop(&mut self) -> Result<(), SubserviceError>;
}

/// Builds subservice units for the supervisor.
pub trait SubserviceFactory: Send + Sync {
    /// Builds a unit wired to the given connection producer.
    fn build(&self, connections: ConnectionSource) -> Box<dyn Subservice>;
}
