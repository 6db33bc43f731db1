//! Immutable supervisor configuration.

use std::path::{self, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::{
    DEFAULT_CLUSTER_NAME, DEFAULT_CONTROL_COMMAND, DEFAULT_DATABASE_NAME, DEFAULT_INIT_COMMAND,
    DEFAULT_LOG_FILE, DEFAULT_MAX_CONNECTIONS, DEFAULT_ROLE, DEFAULT_SHARED_BUFFERS,
    TEST_MODE_MAX_CONNECTIONS, TEST_MODE_SHARED_BUFFERS,
};
use crate::socket::derived_socket_directory;

/// Errors raised while parsing listen addresses.
#[derive(Debug, Error)]
pub enum ListenAddressError {
    /// The port component of the first listen address was not numeric.
    #[error("invalid port in listen address '{address}'")]
    InvalidPort {
        /// Address that failed to parse.
        address: String,
    },
}

/// Configuration for a supervised engine instance.
///
/// Supplied by the host at construction and never mutated afterwards. The
/// builder methods consume and return `Self` so hosts can chain overrides
/// onto [`ServiceConfig::new`].
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceConfig {
    data_directory: PathBuf,
    cluster_name: String,
    database_name: String,
    schema: String,
    reset_schema: bool,
    log_file: PathBuf,
    log_directory: Option<PathBuf>,
    socket_directory: Option<PathBuf>,
    listen_hosts: Vec<String>,
    port: Option<u16>,
    shared_buffers: u32,
    max_connections: u32,
    extra_options: Vec<String>,
    database_role: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    import_file: Option<PathBuf>,
    control_command: String,
    init_command: String,
    test_mode: bool,
}

impl ServiceConfig {
    /// Builds a configuration with defaults for everything except the data
    /// directory and the schema DDL text.
    #[must_use]
    pub fn new(data_directory: impl Into<PathBuf>, schema: impl Into<String>) -> Self {
        Self {
            data_directory: data_directory.into(),
            cluster_name: DEFAULT_CLUSTER_NAME.to_owned(),
            database_name: DEFAULT_DATABASE_NAME.to_owned(),
            schema: schema.into(),
            reset_schema: false,
            log_file: absolutised(Path::new(DEFAULT_LOG_FILE)),
            log_directory: None,
            socket_directory: None,
            listen_hosts: Vec::new(),
            port: None,
            shared_buffers: DEFAULT_SHARED_BUFFERS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            extra_options: Vec::new(),
            database_role: Some(DEFAULT_ROLE.to_owned()),
            uid: None,
            gid: None,
            import_file: None,
            control_command: DEFAULT_CONTROL_COMMAND.to_owned(),
            init_command: DEFAULT_INIT_COMMAND.to_owned(),
            test_mode: false,
        }
    }

    /// Overrides the cluster directory name.
    #[must_use]
    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    /// Overrides the application database name.
    #[must_use]
    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    /// Requests that the application database is dropped and recreated.
    #[must_use]
    pub fn with_reset_schema(mut self, reset: bool) -> Self {
        self.reset_schema = reset;
        self
    }

    /// Overrides the engine log file. Relative paths are absolutised so the
    /// engine's own working directory does not affect where logs land.
    #[must_use]
    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = absolutised(&log_file.into());
        self
    }

    /// Enables log rotation into the given directory.
    #[must_use]
    pub fn with_log_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.log_directory = Some(absolutised(&directory.into()));
        self
    }

    /// Overrides the derived socket directory.
    #[must_use]
    pub fn with_socket_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.socket_directory = Some(directory.into());
        self
    }

    /// Sets TCP listen addresses. The first entry may carry a `host:port`
    /// suffix; the port applies to the whole instance.
    pub fn with_listen_addresses(
        mut self,
        addresses: &[String],
    ) -> Result<Self, ListenAddressError> {
        if let Some(first) = addresses.first()
            && let Some((_, port)) = first.split_once(':')
        {
            self.port = Some(port.parse().map_err(|_| ListenAddressError::InvalidPort {
                address: first.clone(),
            })?);
        }
        self.listen_hosts = addresses
            .iter()
            .map(|address| {
                address
                    .split_once(':')
                    .map_or_else(|| address.clone(), |(host, _)| host.to_owned())
            })
            .collect();
        Ok(self)
    }

    /// Overrides the `shared_buffers` tuning value.
    #[must_use]
    pub fn with_shared_buffers(mut self, megabytes: u32) -> Self {
        self.shared_buffers = megabytes;
        self
    }

    /// Overrides the `max_connections` tuning value.
    #[must_use]
    pub fn with_max_connections(mut self, connections: u32) -> Self {
        self.max_connections = connections;
        self
    }

    /// Appends extra engine options passed verbatim after the composed ones.
    #[must_use]
    pub fn with_extra_options(mut self, options: impl IntoIterator<Item = String>) -> Self {
        self.extra_options.extend(options);
        self
    }

    /// Overrides the administrative role name. `None` defers to the owning
    /// OS user of the configured uid.
    #[must_use]
    pub fn with_database_role(mut self, role: Option<String>) -> Self {
        self.database_role = role;
        self
    }

    /// Sets the uid/gid the spawned binaries and prepared directories use.
    #[must_use]
    pub fn with_ownership(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Configures an import payload executed instead of the default schema
    /// when the database is first created.
    #[must_use]
    pub fn with_import_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.import_file = Some(path.into());
        self
    }

    /// Overrides the engine control binary name or path.
    #[must_use]
    pub fn with_control_command(mut self, command: impl Into<String>) -> Self {
        self.control_command = command.into();
        self
    }

    /// Overrides the cluster initialisation binary name or path.
    #[must_use]
    pub fn with_init_command(mut self, command: impl Into<String>) -> Self {
        self.init_command = command.into();
        self
    }

    /// Enables test mode: tighter tuning values and statement logging.
    #[must_use]
    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    /// Root of the on-disk data store.
    #[must_use]
    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Directory holding the engine cluster.
    #[must_use]
    pub fn cluster_directory(&self) -> PathBuf {
        self.data_directory.join(&self.cluster_name)
    }

    /// Working directory for the spawned binaries.
    #[must_use]
    pub fn working_directory(&self) -> PathBuf {
        self.data_directory.join("working")
    }

    /// Name of the application database.
    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Default schema DDL text.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Whether the application database is dropped before bootstrap.
    #[must_use]
    pub fn reset_schema(&self) -> bool {
        self.reset_schema
    }

    /// Absolute path of the engine log file.
    #[must_use]
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Directory the engine rotates logs into, when configured.
    #[must_use]
    pub fn log_directory(&self) -> Option<&Path> {
        self.log_directory.as_deref()
    }

    /// Socket directory, derived from the data directory when not supplied.
    #[must_use]
    pub fn socket_directory(&self) -> PathBuf {
        self.socket_directory
            .clone()
            .unwrap_or_else(|| derived_socket_directory(&self.data_directory))
    }

    /// TCP listen hosts, without port suffixes.
    #[must_use]
    pub fn listen_hosts(&self) -> &[String] {
        &self.listen_hosts
    }

    /// TCP port parsed from the first listen address.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Host connections are made against: the first listen host, or the
    /// socket directory when the engine listens on a Unix socket only.
    #[must_use]
    pub fn host(&self) -> String {
        self.listen_hosts.first().map_or_else(
            || self.socket_directory().to_string_lossy().into_owned(),
            Clone::clone,
        )
    }

    /// Effective `shared_buffers` value, clamped in test mode.
    #[must_use]
    pub fn shared_buffers(&self) -> u32 {
        if self.test_mode {
            TEST_MODE_SHARED_BUFFERS
        } else {
            self.shared_buffers
        }
    }

    /// Effective `max_connections` value, clamped in test mode.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        if self.test_mode {
            TEST_MODE_MAX_CONNECTIONS
        } else {
            self.max_connections
        }
    }

    /// Extra engine options appended after the composed ones.
    #[must_use]
    pub fn extra_options(&self) -> &[String] {
        &self.extra_options
    }

    /// Explicitly configured administrative role, if any.
    #[must_use]
    pub fn database_role(&self) -> Option<&str> {
        self.database_role.as_deref()
    }

    /// Uid the spawned binaries run as, when configured.
    #[must_use]
    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// Gid the spawned binaries run as, when configured.
    #[must_use]
    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    /// Path to the optional import payload.
    #[must_use]
    pub fn import_file(&self) -> Option<&Path> {
        self.import_file.as_deref()
    }

    /// Engine control binary name or path.
    #[must_use]
    pub fn control_command(&self) -> &str {
        &self.control_command
    }

    /// Cluster initialisation binary name or path.
    #[must_use]
    pub fn init_command(&self) -> &str {
        &self.init_command
    }

    /// Whether test mode is active.
    #[must_use]
    pub fn test_mode(&self) -> bool {
        self.test_mode
    }
}

fn absolutised(path: &Path) -> PathBuf {
    path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
