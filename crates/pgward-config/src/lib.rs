//! Configuration types for the pgward supervisor.
//!
//! The supervisor is constructed by a host application, so configuration is
//! assembled programmatically through [`ServiceConfig`] rather than loaded
//! from the environment. The crate also houses the socket-directory
//! derivation shared by the supervisor and the connection factory, and the
//! logging settings consumed by `pgward::telemetry`.

mod defaults;
mod logging;
mod service;
mod socket;

pub use defaults::{
    DEFAULT_CLUSTER_NAME, DEFAULT_CONTROL_COMMAND, DEFAULT_DATABASE_NAME, DEFAULT_INIT_COMMAND,
    DEFAULT_LOG_FILE, DEFAULT_MAX_CONNECTIONS, DEFAULT_ROLE, DEFAULT_SHARED_BUFFERS,
    TEST_MODE_MAX_CONNECTIONS, TEST_MODE_SHARED_BUFFERS,
};
pub use logging::{LogFormat, LogFormatParseError, TelemetrySettings};
pub use service::{ListenAddressError, ServiceConfig};
pub use socket::derived_socket_directory;
