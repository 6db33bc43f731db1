//! One-time creation of the application database and its schema.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use pgward_config::ServiceConfig;

use crate::connect::{Connection, ConnectionSource, DriverError};

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");

/// Result of a bootstrap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The database already existed; no schema work was performed.
    AlreadyExisted,
    /// The database was created and its schema (or import payload) executed.
    Initialized,
}

/// Errors surfaced while bootstrapping the application database.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The driver reported a failure that is not "database already exists".
    #[error("database bootstrap failed: {source}")]
    Driver {
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },
    /// The configured import payload could not be read.
    #[error("failed to read import file '{path}': {source}")]
    ImportRead {
        /// Import file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl From<DriverError> for BootstrapError {
    fn from(source: DriverError) -> Self {
        Self::Driver { source }
    }
}

/// Creates the application database exactly once and loads its schema.
#[derive(Debug)]
pub struct SchemaBootstrapper<'a> {
    config: &'a ServiceConfig,
    connections: &'a ConnectionSource,
}

impl<'a> SchemaBootstrapper<'a> {
    /// Builds a bootstrapper over the supervisor's configuration and
    /// connection source.
    #[must_use]
    pub fn new(config: &'a ServiceConfig, connections: &'a ConnectionSource) -> Self {
        Self {
            config,
            connections,
        }
    }

    /// Runs the bootstrap algorithm against an open administrative
    /// connection, consuming and closing it.
    ///
    /// Only a duplicate-database error from `create database` maps to
    /// [`BootstrapOutcome::AlreadyExisted`]; every other creation failure
    /// propagates so permission problems and the like are not silently
    /// folded into "already exists".
    pub fn bootstrap(
        &self,
        mut admin: Box<dyn Connection>,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let database = self.config.database_name();

        if self.config.reset_schema() {
            // A missing database is not an error on the reset path.
            if let Err(error) = admin.execute(&format!("drop database {database}")) {
                debug!(
                    target: BOOTSTRAP_TARGET,
                    database,
                    error = %error,
                    "reset drop failed; continuing"
                );
            }
        }

        let creation = admin.execute(&format!(
            "create database {database} with encoding 'UTF8'"
        ));
        match creation {
            Ok(()) => {}
            Err(error) if error.is_duplicate_database() => {
                info!(
                    target: BOOTSTRAP_TARGET,
                    database,
                    "database already exists; skipping schema"
                );
                close_quietly(admin.as_mut());
                return Ok(BootstrapOutcome::AlreadyExisted);
            }
            Err(error) => {
                close_quietly(admin.as_mut());
                return Err(error.into());
            }
        }
        close_quietly(admin.as_mut());

        let payload = self.payload()?;
        let mut connection = self.connections.produce("schema bootstrap", None)?;
        connection.execute(&payload)?;
        connection.commit()?;
        close_quietly(connection.as_mut());
        info!(target: BOOTSTRAP_TARGET, database, "database initialised");
        Ok(BootstrapOutcome::Initialized)
    }

    /// Selects the initialisation payload: the import file's full contents
    /// when configured and present, otherwise the default schema text.
    fn payload(&self) -> Result<String, BootstrapError> {
        if let Some(path) = self.config.import_file() {
            if path.exists() {
                info!(
                    target: BOOTSTRAP_TARGET,
                    file = %path.display(),
                    "executing import payload"
                );
                return fs::read_to_string(path).map_err(|source| BootstrapError::ImportRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
            debug!(
                target: BOOTSTRAP_TARGET,
                file = %path.display(),
                "import file absent; using default schema"
            );
        }
        Ok(self.config.schema().to_owned())
    }
}

fn close_quietly(connection: &mut dyn Connection) {
    if let Err(error) = connection.close() {
        warn!(target: BOOTSTRAP_TARGET, error = %error, "failed to close connection");
    }
}
