//! Lifecycle supervision for an embedded relational engine.
//!
//! The supervisor runs the engine as a child process on behalf of a host
//! application: it decides whether the on-disk cluster needs first-time
//! initialisation, launches the engine with composed runtime options, waits
//! for the readiness sentinel in the engine's log stream, bootstraps the
//! application database exactly once, and then hands a connection source to
//! the host's dependent subservices. Shutdown is interlocked against
//! in-flight startup so a stop request never races initialisation.
//!
//! The process-facing collaborators sit behind traits so hosts and tests can
//! substitute them: [`engine::EngineControl`] wraps the engine binaries,
//! [`connect::Connector`] wraps the database driver, and
//! [`host::HostControl`] lets the supervisor ask its host to shut down when
//! the engine turns out to be unreachable.

pub mod bootstrap;
pub mod connect;
pub mod engine;
mod errors;
pub mod host;
mod interlock;
pub mod monitor;
pub mod subservice;
mod supervisor;
pub mod telemetry;

pub use bootstrap::{BootstrapError, BootstrapOutcome, SchemaBootstrapper};
pub use connect::{
    ADMIN_DATABASE, Connection, ConnectionDescriptor, ConnectionSource, Connector, DriverError,
    DriverErrorKind, resolve_role,
};
pub use engine::{
    ConfigurationError, EngineContext, EngineControl, EngineError, StatusReport,
    SystemEngineControl, parse_status_pid,
};
pub use errors::StartupError;
pub use host::{HostControl, SystemHostControl};
pub use interlock::ShutdownInterlock;
pub use monitor::{MonitorCompletion, READY_SENTINEL, ReadyMonitor};
pub use subservice::{Subservice, SubserviceError, SubserviceFactory};
pub use supervisor::{LifecycleState, LifecycleSupervisor};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
