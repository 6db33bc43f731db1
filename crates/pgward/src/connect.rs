//! Connection descriptors and the administrative driver seam.
//!
//! The supervisor never speaks the wire protocol itself. It composes
//! [`ConnectionDescriptor`] values from the service configuration and hands
//! them to a [`Connector`] supplied by the host; the connector wraps
//! whatever driver the host uses. Dependent subservices receive a cloneable
//! [`ConnectionSource`] so they can obtain their own connections on demand.

use std::fmt;
use std::sync::Arc;

use nix::unistd::{Uid, User};
use thiserror::Error;
use tracing::debug;

use pgward_config::ServiceConfig;

const CONNECT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::connect");

/// Maintenance database used for administrative work such as `create database`.
pub const ADMIN_DATABASE: &str = "postgres";

/// Where and how to connect: host or socket directory, optional port,
/// database, and role. Pure value type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    host: String,
    port: Option<u16>,
    database: String,
    role: Option<String>,
}

impl ConnectionDescriptor {
    /// Host name, or the socket directory path for Unix-socket connections.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port, when the engine listens on one.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Target database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Role to connect as, when one could be resolved.
    #[must_use]
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:dbname={}", self.host, self.database)?;
        if let Some(role) = &self.role {
            write!(formatter, ":{role}")?;
        }
        if let Some(port) = self.port {
            write!(formatter, " port={port}")?;
        }
        Ok(())
    }
}

/// Category of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The target of a `create database` already exists.
    DuplicateDatabase,
    /// The connection could not be established.
    ConnectionFailed,
    /// Any other failure reported by the driver.
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DuplicateDatabase => "duplicate database",
            Self::ConnectionFailed => "connection failed",
            Self::Other => "database error",
        };
        formatter.write_str(label)
    }
}

/// Failure surfaced by the administrative connection collaborator.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    kind: DriverErrorKind,
    message: String,
}

impl DriverError {
    /// Builds a driver error of the given category.
    #[must_use]
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Error category.
    #[must_use]
    pub fn kind(&self) -> DriverErrorKind {
        self.kind
    }

    /// Whether this is the non-fatal "database already exists" condition.
    #[must_use]
    pub fn is_duplicate_database(&self) -> bool {
        self.kind == DriverErrorKind::DuplicateDatabase
    }
}

/// An open administrative connection with cursor-style operations.
pub trait Connection: Send {
    /// Executes a statement.
    fn execute(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Commits the current transaction.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Closes the connection. Idempotent.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Driver collaborator that opens connections from descriptors.
pub trait Connector: Send + Sync {
    /// Opens a connection described by `descriptor`. The label is carried
    /// for diagnostics only.
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        label: &str,
    ) -> Result<Box<dyn Connection>, DriverError>;
}

/// Cloneable connection producer handed to dependent subservices.
#[derive(Clone)]
pub struct ConnectionSource {
    config: Arc<ServiceConfig>,
    connector: Arc<dyn Connector>,
}

impl ConnectionSource {
    /// Builds a source over the supervisor's configuration and driver.
    #[must_use]
    pub fn new(config: Arc<ServiceConfig>, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }

    /// Composes a descriptor, defaulting to the configured database.
    #[must_use]
    pub fn describe(&self, database: Option<&str>) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: self.config.host(),
            port: self.config.port(),
            database: database.unwrap_or_else(|| self.config.database_name()).to_owned(),
            role: resolve_role(&self.config),
        }
    }

    /// Opens a connection to the given database (default when `None`).
    pub fn produce(
        &self,
        label: &str,
        database: Option<&str>,
    ) -> Result<Box<dyn Connection>, DriverError> {
        let descriptor = self.describe(database);
        debug!(
            target: CONNECT_TARGET,
            descriptor = %descriptor,
            label,
            "producing connection"
        );
        self.connector.connect(&descriptor, label)
    }
}

impl fmt::Debug for ConnectionSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConnectionSource")
            .field("database", &self.config.database_name())
            .finish_non_exhaustive()
    }
}

/// Resolves the role to connect as: the configured role name, else the
/// owning OS user of the configured uid, else none. Lookup failures degrade
/// to no role rather than erroring.
#[must_use]
pub fn resolve_role(config: &ServiceConfig) -> Option<String> {
    if let Some(role) = config.database_role() {
        return Some(role.to_owned());
    }
    let uid = config.uid()?;
    User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}
