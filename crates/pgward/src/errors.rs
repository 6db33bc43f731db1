//! Unified error surface of the startup sequence.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::connect::DriverError;
use crate::engine::EngineError;
use crate::subservice::SubserviceError;

/// Errors that abort the startup sequence.
///
/// `EngineUnreachable` additionally triggers a host shutdown: the
/// application cannot function without its database. Every variant leaves
/// the supervisor with no dependent subservice running and the
/// shutdown-critical flag cleared, so the host can still stop cleanly.
#[derive(Debug, Error)]
pub enum StartupError {
    /// A required directory could not be prepared.
    #[error("failed to prepare directory '{path}': {source}")]
    Directory {
        /// Directory that could not be prepared.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Cluster initialisation printed a fatal marker.
    #[error("cluster initialisation reported a fatal error: {output}")]
    ClusterInit {
        /// Combined output of the init binary.
        output: String,
    },
    /// An engine binary could not be spawned or waited on.
    #[error("engine command failed: {source}")]
    Engine {
        /// Underlying engine error.
        #[from]
        source: EngineError,
    },
    /// Neither the start command nor the status probe found a usable engine.
    #[error("engine unreachable: {detail}")]
    EngineUnreachable {
        /// Description of the failed start and probe.
        detail: String,
    },
    /// The administrative connection collaborator failed.
    #[error("administrative connection failed: {source}")]
    Driver {
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },
    /// Schema bootstrap failed for a non-driver reason.
    #[error("schema bootstrap failed: {source}")]
    Bootstrap {
        /// Underlying bootstrap error.
        #[source]
        source: BootstrapError,
    },
    /// A dependent subservice refused to start.
    #[error("subservice '{name}' failed to start: {source}")]
    Subservice {
        /// Name of the failed unit.
        name: String,
        /// Underlying subservice error.
        #[source]
        source: SubserviceError,
    },
}

impl From<DriverError> for StartupError {
    fn from(source: DriverError) -> Self {
        Self::Driver { source }
    }
}

impl From<BootstrapError> for StartupError {
    fn from(source: BootstrapError) -> Self {
        match source {
            BootstrapError::Driver { source } => Self::Driver { source },
            other => Self::Bootstrap { source: other },
        }
    }
}
