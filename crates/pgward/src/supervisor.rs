//! The lifecycle state machine driving the supervised engine.
//!
//! One supervisor instance owns one engine: it decides whether the cluster
//! needs first-time initialisation, launches the engine with composed
//! runtime options, waits for readiness, bootstraps the application
//! database exactly once, and starts the dependent subservices. Stop
//! requests are interlocked against in-flight initialisation so a stop
//! never races a start. Every instance owns its own state; nothing is
//! shared at module level.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Gid, Pid, Uid, chown};
use tracing::{debug, error, info, warn};

use pgward_config::ServiceConfig;

use crate::bootstrap::SchemaBootstrapper;
use crate::connect::{ADMIN_DATABASE, Connection, ConnectionSource, Connector, resolve_role};
use crate::engine::{
    ConfigurationError, EngineContext, EngineControl, StatusReport, SystemEngineControl,
};
use crate::errors::StartupError;
use crate::host::{HostControl, SystemHostControl};
use crate::interlock::ShutdownInterlock;
use crate::monitor::ReadyMonitor;
use crate::subservice::{Subservice, SubserviceFactory};

const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Marker the init binary prints when the cluster cannot be initialised.
const FATAL_MARKER: &str = "FATAL:";

/// Phase of the supervised engine's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet started.
    Idle,
    /// Deciding on, or running, first-time cluster initialisation.
    PreparingCluster,
    /// Composing options and spawning the start command.
    Launching,
    /// Waiting for the start command to confirm readiness.
    AwaitingReadiness,
    /// Probing the engine's status for its process id.
    ProbingStatus,
    /// Creating the application database and loading its schema.
    Bootstrapping,
    /// Engine ready, database bootstrapped, subservices running.
    Running,
    /// A stop request is being carried out.
    ShuttingDown,
    /// Terminal: stopped, whether or not the stop command succeeded.
    Stopped,
    /// Terminal: startup could not complete.
    Failed,
}

impl LifecycleState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PreparingCluster => "preparing_cluster",
            Self::Launching => "launching",
            Self::AwaitingReadiness => "awaiting_readiness",
            Self::ProbingStatus => "probing_status",
            Self::Bootstrapping => "bootstrapping",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

struct SupervisorInner {
    state: LifecycleState,
    engine_owner: bool,
    engine_pid: Option<u32>,
    monitor: Option<Arc<ReadyMonitor>>,
    subservices: Vec<Box<dyn Subservice>>,
}

/// Supervises one engine instance through its whole lifecycle.
pub struct LifecycleSupervisor {
    config: Arc<ServiceConfig>,
    engine: Box<dyn EngineControl>,
    host: Box<dyn HostControl>,
    factories: Vec<Box<dyn SubserviceFactory>>,
    connections: ConnectionSource,
    interlock: ShutdownInterlock,
    inner: Mutex<SupervisorInner>,
}

impl LifecycleSupervisor {
    /// Builds a supervisor over the production engine binaries.
    ///
    /// Locates the control and init binaries immediately; a missing binary
    /// is a configuration fault the host should learn about before any
    /// process is spawned.
    pub fn new(
        config: ServiceConfig,
        connector: Arc<dyn Connector>,
        factories: Vec<Box<dyn SubserviceFactory>>,
    ) -> Result<Self, ConfigurationError> {
        let engine = SystemEngineControl::locate(&config)?;
        Ok(Self::with_collaborators(
            config,
            Box::new(engine),
            connector,
            Box::new(SystemHostControl::new()),
            factories,
        ))
    }

    /// Builds a supervisor with injected collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: ServiceConfig,
        engine: Box<dyn EngineControl>,
        connector: Arc<dyn Connector>,
        host: Box<dyn HostControl>,
        factories: Vec<Box<dyn SubserviceFactory>>,
    ) -> Self {
        let config = Arc::new(config);
        let connections = ConnectionSource::new(Arc::clone(&config), connector);
        Self {
            config,
            engine,
            host,
            factories,
            connections,
            interlock: ShutdownInterlock::new(),
            inner: Mutex::new(SupervisorInner {
                state: LifecycleState::Idle,
                engine_owner: false,
                engine_pid: None,
                monitor: None,
                subservices: Vec::new(),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock_inner().state
    }

    /// Recorded engine process id, when the status probe found one.
    #[must_use]
    pub fn engine_pid(&self) -> Option<u32> {
        self.lock_inner().engine_pid
    }

    /// Whether this supervisor started the engine and is responsible for
    /// stopping it.
    #[must_use]
    pub fn owns_engine(&self) -> bool {
        self.lock_inner().engine_owner
    }

    /// Whether a stop has been requested, including one still deferred
    /// behind an in-flight start.
    #[must_use]
    pub fn stop_pending(&self) -> bool {
        self.interlock.stop_pending()
    }

    /// Whether the current start attempt has seen the readiness sentinel.
    #[must_use]
    pub fn ready_seen(&self) -> bool {
        self.lock_inner()
            .monitor
            .as_ref()
            .is_some_and(|monitor| monitor.saw_ready())
    }

    /// Connection producer handed to dependent subservices.
    #[must_use]
    pub fn connections(&self) -> ConnectionSource {
        self.connections.clone()
    }

    /// Drives the engine from idle to running: cluster preparation, launch,
    /// readiness, bootstrap, and subservice start, in that order.
    ///
    /// The whole sequence is a shutdown-critical section: a concurrent
    /// [`stop`](Self::stop) blocks until this returns. On failure the
    /// supervisor transitions to [`LifecycleState::Failed`], no subservice
    /// is left running, and the critical flag is cleared so the host can
    /// still shut down cleanly. An unreachable engine additionally asks the
    /// host to shut down.
    pub fn start(&self) -> Result<(), StartupError> {
        self.interlock.enter_critical();
        let outcome = self.run_startup();
        if let Err(startup_error) = &outcome {
            error!(
                target: SUPERVISOR_TARGET,
                error = %startup_error,
                "startup failed"
            );
            self.set_state(LifecycleState::Failed);
        }
        self.interlock.exit_critical();
        if matches!(outcome, Err(StartupError::EngineUnreachable { .. })) {
            self.host.request_shutdown();
        }
        outcome
    }

    /// Stops dependent subservices in reverse start order, then issues the
    /// graceful engine stop command when this supervisor started the
    /// engine. Deferred while startup's critical section is in flight;
    /// concurrent stop requests fold into one teardown.
    pub fn stop(&self) {
        self.interlock.request_stop();

        let (subservices, engine_owner) = {
            let mut inner = self.lock_inner();
            if matches!(
                inner.state,
                LifecycleState::ShuttingDown | LifecycleState::Stopped
            ) {
                return;
            }
            debug!(
                target: SUPERVISOR_TARGET,
                from = %inner.state,
                to = %LifecycleState::ShuttingDown,
                "state transition"
            );
            inner.state = LifecycleState::ShuttingDown;
            (std::mem::take(&mut inner.subservices), inner.engine_owner)
        };

        for mut unit in subservices.into_iter().rev() {
            info!(target: SUPERVISOR_TARGET, name = unit.name(), "stopping subservice");
            if let Err(stop_error) = unit.stop() {
                warn!(
                    target: SUPERVISOR_TARGET,
                    name = unit.name(),
                    error = %stop_error,
                    "subservice stop failed"
                );
            }
        }

        if engine_owner {
            let context = self.engine_context();
            match self.engine.stop(&context, self.config.log_file()) {
                Ok(()) => {
                    let mut inner = self.lock_inner();
                    inner.engine_pid = None;
                    info!(target: SUPERVISOR_TARGET, "engine stopped");
                }
                Err(stop_error) => {
                    warn!(
                        target: SUPERVISOR_TARGET,
                        error = %stop_error,
                        "engine stop command failed"
                    );
                }
            }
        } else {
            info!(
                target: SUPERVISOR_TARGET,
                "engine was not started by this supervisor; skipping stop command"
            );
        }

        self.set_state(LifecycleState::Stopped);
    }

    /// Emergency path: sends SIGQUIT to the recorded engine process id,
    /// independent of the state machine. Best-effort; an already-gone
    /// process is not an error.
    pub fn hard_stop(&self) {
        let Some(pid) = self.lock_inner().engine_pid else {
            return;
        };
        info!(target: SUPERVISOR_TARGET, pid, "sending SIGQUIT to engine");
        match kill(Pid::from_raw(pid as i32), Signal::SIGQUIT) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    pid,
                    errno = %errno,
                    "failed to signal engine"
                );
            }
        }
    }

    fn run_startup(&self) -> Result<(), StartupError> {
        self.set_state(LifecycleState::PreparingCluster);
        self.prepare_directories()?;
        let context = self.engine_context();

        let cluster_directory = self.config.cluster_directory();
        if cluster_directory.is_dir() {
            info!(
                target: SUPERVISOR_TARGET,
                directory = %cluster_directory.display(),
                "cluster already exists"
            );
        } else {
            info!(
                target: SUPERVISOR_TARGET,
                directory = %cluster_directory.display(),
                "initialising cluster"
            );
            let output = self.engine.init_cluster(&context)?;
            if output.contains(FATAL_MARKER) {
                error!(target: SUPERVISOR_TARGET, output, "cluster initialisation failed");
                return Err(StartupError::ClusterInit { output });
            }
        }

        self.launch_engine(&context)?;

        self.set_state(LifecycleState::Bootstrapping);
        let admin = self.open_admin_connection()?;
        let outcome =
            SchemaBootstrapper::new(&self.config, &self.connections).bootstrap(admin)?;
        info!(target: SUPERVISOR_TARGET, ?outcome, "bootstrap complete");

        if self.interlock.stop_pending() {
            info!(
                target: SUPERVISOR_TARGET,
                "stop requested during startup; subservices will not be started"
            );
        } else {
            self.start_subservices()?;
        }
        self.set_state(LifecycleState::Running);
        Ok(())
    }

    fn launch_engine(&self, context: &EngineContext) -> Result<(), StartupError> {
        self.set_state(LifecycleState::Launching);
        let options = compose_engine_options(&self.config).join(" ");
        let monitor = Arc::new(ReadyMonitor::new());
        self.lock_inner().monitor = Some(Arc::clone(&monitor));

        self.set_state(LifecycleState::AwaitingReadiness);
        match self
            .engine
            .start(context, self.config.log_file(), &options, &monitor)
        {
            Ok(()) => {
                self.lock_inner().engine_owner = true;
                self.set_state(LifecycleState::ProbingStatus);
                match self.engine.status(context) {
                    Ok(report) => self.record_pid(&report),
                    Err(probe_error) => {
                        warn!(
                            target: SUPERVISOR_TARGET,
                            error = %probe_error,
                            "status probe failed after successful start"
                        );
                    }
                }
                Ok(())
            }
            Err(start_error) => {
                warn!(
                    target: SUPERVISOR_TARGET,
                    error = %start_error,
                    "engine start failed; probing for an existing instance"
                );
                self.set_state(LifecycleState::ProbingStatus);
                match self.engine.status(context) {
                    Ok(report) if report.success() => {
                        {
                            let mut inner = self.lock_inner();
                            inner.engine_owner = false;
                            inner.engine_pid = report.pid();
                        }
                        info!(
                            target: SUPERVISOR_TARGET,
                            "attached to an already-running engine; it will not be \
                             stopped by this supervisor"
                        );
                        Ok(())
                    }
                    Ok(report) => Err(StartupError::EngineUnreachable {
                        detail: format!(
                            "start failed ({start_error}); status probe reported: {}",
                            report.output().trim()
                        ),
                    }),
                    Err(probe_error) => Err(StartupError::EngineUnreachable {
                        detail: format!(
                            "start failed ({start_error}); status probe failed: {probe_error}"
                        ),
                    }),
                }
            }
        }
    }

    fn open_admin_connection(&self) -> Result<Box<dyn Connection>, StartupError> {
        let attempt = self
            .connections
            .produce("schema creation", Some(ADMIN_DATABASE))
            .and_then(|mut admin| {
                // Leave the driver's implicit transaction block; the engine
                // refuses to create databases inside one.
                admin.execute("commit")?;
                Ok(admin)
            });
        attempt.map_err(|driver_error| {
            if self.owns_engine() {
                StartupError::Driver {
                    source: driver_error,
                }
            } else {
                // The probe said an instance was running, yet it refuses
                // connections: same terminal condition as no engine at all.
                StartupError::EngineUnreachable {
                    detail: format!(
                        "attached instance refused the administrative connection: \
                         {driver_error}"
                    ),
                }
            }
        })
    }

    fn start_subservices(&self) -> Result<(), StartupError> {
        let mut started: Vec<Box<dyn Subservice>> = Vec::new();
        for factory in &self.factories {
            let mut unit = factory.build(self.connections.clone());
            info!(target: SUPERVISOR_TARGET, name = unit.name(), "starting subservice");
            if let Err(start_error) = unit.start() {
                let name = unit.name().to_owned();
                error!(
                    target: SUPERVISOR_TARGET,
                    name,
                    error = %start_error,
                    "subservice failed to start; unwinding"
                );
                for mut other in started.into_iter().rev() {
                    if let Err(unwind_error) = other.stop() {
                        warn!(
                            target: SUPERVISOR_TARGET,
                            name = other.name(),
                            error = %unwind_error,
                            "subservice stop failed during unwind"
                        );
                    }
                }
                return Err(StartupError::Subservice {
                    name,
                    source: start_error,
                });
            }
            started.push(unit);
        }
        self.lock_inner().subservices = started;
        Ok(())
    }

    fn prepare_directories(&self) -> Result<(), StartupError> {
        let socket_directory = self.config.socket_directory();
        ensure_directory(&socket_directory)?;
        self.apply_ownership(&socket_directory)?;
        set_mode(&socket_directory, 0o770)?;

        ensure_directory(self.config.data_directory())?;
        self.apply_ownership(self.config.data_directory())?;
        let working_directory = self.config.working_directory();
        ensure_directory(&working_directory)?;
        self.apply_ownership(&working_directory)?;
        Ok(())
    }

    fn apply_ownership(&self, path: &Path) -> Result<(), StartupError> {
        let (Some(uid), Some(gid)) = (self.config.uid(), self.config.gid()) else {
            return Ok(());
        };
        chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|errno| {
            StartupError::Directory {
                path: path.to_path_buf(),
                source: io::Error::from_raw_os_error(errno as i32),
            }
        })
    }

    fn engine_context(&self) -> EngineContext {
        let role = resolve_role(&self.config);
        let mut env = vec![
            (
                "PGDATA".to_owned(),
                self.config
                    .cluster_directory()
                    .to_string_lossy()
                    .into_owned(),
            ),
            ("PGHOST".to_owned(), self.config.host()),
        ];
        if let Some(role_name) = &role {
            env.push(("PGUSER".to_owned(), role_name.clone()));
        }
        EngineContext::new(
            self.config.working_directory(),
            env,
            role,
            self.config.uid(),
            self.config.gid(),
        )
    }

    fn record_pid(&self, report: &StatusReport) {
        match report.pid() {
            Some(pid) => {
                info!(target: SUPERVISOR_TARGET, pid, "recorded engine process id");
                self.lock_inner().engine_pid = Some(pid);
            }
            None => {
                debug!(
                    target: SUPERVISOR_TARGET,
                    "status output carried no process id"
                );
            }
        }
    }

    fn set_state(&self, next: LifecycleState) {
        let mut inner = self.lock_inner();
        if inner.state != next {
            debug!(
                target: SUPERVISOR_TARGET,
                from = %inner.state,
                to = %next,
                "state transition"
            );
            inner.state = next;
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SupervisorInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl fmt::Debug for LifecycleSupervisor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LifecycleSupervisor")
            .field("state", &self.state())
            .field("database", &self.config.database_name())
            .finish_non_exhaustive()
    }
}

/// Composes the options string passed to the start command, in the same
/// order the engine documentation groups them: addressing, tuning, fixed
/// safety settings, host extras, log rotation, and test-mode statement
/// logging.
pub(crate) fn compose_engine_options(config: &ServiceConfig) -> Vec<String> {
    let mut options = Vec::new();
    options.push(format!(
        "-c listen_addresses={}",
        shell_quote(&config.listen_hosts().join(","))
    ));
    options.push(format!(
        "-k {}",
        shell_quote(&config.socket_directory().to_string_lossy())
    ));
    if let Some(port) = config.port() {
        options.push(format!("-c port={port}"));
    }
    options.push(format!("-c shared_buffers={}", config.shared_buffers()));
    options.push(format!("-c max_connections={}", config.max_connections()));
    options.push("-c standard_conforming_strings=on".to_owned());
    options.push("-c unix_socket_permissions=0770".to_owned());
    options.extend(config.extra_options().iter().cloned());
    if let Some(directory) = config.log_directory() {
        options.push(format!(
            "-c log_directory={}",
            shell_quote(&directory.to_string_lossy())
        ));
        options.push("-c log_truncate_on_rotation=on".to_owned());
        options.push("-c log_filename=postgresql_%w.log".to_owned());
        options.push("-c log_rotation_age=1440".to_owned());
        options.push("-c logging_collector=on".to_owned());
    }
    options.push("-c log_line_prefix=%t".to_owned());
    if config.test_mode() {
        options.push("-c log_statement=all".to_owned());
    }
    options
}

/// Minimal POSIX single-quoting for values embedded in the options string.
fn shell_quote(value: &str) -> String {
    let safe = |character: char| {
        character.is_ascii_alphanumeric() || "_-./=:,".contains(character)
    };
    if !value.is_empty() && value.chars().all(safe) {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

fn ensure_directory(path: &Path) -> Result<(), StartupError> {
    if path.is_dir() {
        return Ok(());
    }
    info!(target: SUPERVISOR_TARGET, directory = %path.display(), "creating directory");
    fs::create_dir_all(path).map_err(|source| StartupError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

fn set_mode(path: &Path, mode: u32) -> Result<(), StartupError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| {
            StartupError::Directory {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn options_follow_the_documented_order() {
        let config = ServiceConfig::new("/var/db/store", "")
            .with_socket_directory("/tmp/pgward_sockets")
            .with_listen_addresses(&["127.0.0.1:6543".to_owned()])
            .unwrap();
        let options = compose_engine_options(&config);
        assert_eq!(
            options,
            vec![
                "-c listen_addresses=127.0.0.1".to_owned(),
                "-k /tmp/pgward_sockets".to_owned(),
                "-c port=6543".to_owned(),
                "-c shared_buffers=30".to_owned(),
                "-c max_connections=20".to_owned(),
                "-c standard_conforming_strings=on".to_owned(),
                "-c unix_socket_permissions=0770".to_owned(),
                "-c log_line_prefix=%t".to_owned(),
            ]
        );
    }

    #[rstest]
    fn socket_only_configuration_quotes_the_empty_address_list() {
        let config = ServiceConfig::new("/var/db/store", "")
            .with_socket_directory("/tmp/pgward_sockets");
        let options = compose_engine_options(&config);
        assert_eq!(
            options.first().map(String::as_str),
            Some("-c listen_addresses=''")
        );
        assert!(!options.iter().any(|option| option.starts_with("-c port=")));
    }

    #[rstest]
    fn test_mode_appends_statement_logging() {
        let config = ServiceConfig::new("/var/db/store", "").with_test_mode(true);
        let options = compose_engine_options(&config);
        assert_eq!(
            options.last().map(String::as_str),
            Some("-c log_statement=all")
        );
        assert!(options.contains(&"-c shared_buffers=16".to_owned()));
        assert!(options.contains(&"-c max_connections=8".to_owned()));
    }

    #[rstest]
    fn log_directory_enables_rotation() {
        let config = ServiceConfig::new("/var/db/store", "")
            .with_log_directory("/var/log/pgward");
        let options = compose_engine_options(&config);
        assert!(options.contains(&"-c log_directory=/var/log/pgward".to_owned()));
        assert!(options.contains(&"-c logging_collector=on".to_owned()));
        // Rotation settings precede the line prefix, as the original
        // grouping has it.
        let rotation = options
            .iter()
            .position(|option| option == "-c logging_collector=on")
            .unwrap();
        let prefix = options
            .iter()
            .position(|option| option == "-c log_line_prefix=%t")
            .unwrap();
        assert!(rotation < prefix);
    }

    #[rstest]
    fn extra_options_are_passed_through_verbatim() {
        let config = ServiceConfig::new("/var/db/store", "")
            .with_extra_options(["-c fsync=off".to_owned()]);
        let options = compose_engine_options(&config);
        assert!(options.contains(&"-c fsync=off".to_owned()));
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("/tmp/pg socket", "'/tmp/pg socket'")]
    #[case("it's", "'it'\\''s'")]
    #[case("", "''")]
    fn shell_quoting(#[case] raw: &str, #[case] quoted: &str) {
        assert_eq!(shell_quote(raw), quoted);
    }
}
