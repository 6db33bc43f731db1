//! Default values shared by the supervisor configuration.

/// Default name of the on-disk cluster directory inside the data directory.
pub const DEFAULT_CLUSTER_NAME: &str = "cluster";

/// Default name of the application database.
pub const DEFAULT_DATABASE_NAME: &str = "pgward";

/// Default administrative role the engine is initialised with.
pub const DEFAULT_ROLE: &str = "pgward";

/// Default engine log file, relative to the host's working directory.
pub const DEFAULT_LOG_FILE: &str = "postgres.log";

/// Default `shared_buffers` tuning value, in megabytes.
pub const DEFAULT_SHARED_BUFFERS: u32 = 30;

/// Default `max_connections` tuning value.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// `shared_buffers` applied when the supervisor runs in test mode.
pub const TEST_MODE_SHARED_BUFFERS: u32 = 16;

/// `max_connections` applied when the supervisor runs in test mode.
pub const TEST_MODE_MAX_CONNECTIONS: u32 = 8;

/// Default name of the engine control binary.
pub const DEFAULT_CONTROL_COMMAND: &str = "pg_ctl";

/// Default name of the cluster initialisation binary.
pub const DEFAULT_INIT_COMMAND: &str = "initdb";
