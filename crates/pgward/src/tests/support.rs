//! Recording collaborators for the supervisor behaviour suite.
//!
//! Every fake appends to one shared journal so tests can assert ordering
//! across collaborators: engine commands, driver activity, subservice
//! starts and stops, and host shutdown requests all land in a single
//! sequence.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier, Mutex};

use tempfile::TempDir;

use pgward_config::ServiceConfig;

use crate::connect::{
    Connection, ConnectionDescriptor, ConnectionSource, Connector, DriverError, DriverErrorKind,
};
use crate::engine::{EngineContext, EngineControl, EngineError, StatusReport};
use crate::host::HostControl;
use crate::monitor::{READY_SENTINEL, ReadyMonitor};
use crate::subservice::{Subservice, SubserviceError, SubserviceFactory};
use crate::supervisor::LifecycleSupervisor;

/// Shared, append-only record of collaborator activity.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().unwrap().iter().any(|line| line == entry)
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|line| line == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|line| *line == entry)
            .count()
    }
}

/// What the fake start command does after being invoked.
pub enum StartPlan {
    /// Feed the readiness sentinel to the monitor and exit cleanly.
    Ready,
    /// Exit with the given nonzero code without ever becoming ready.
    Fail(i32),
}

/// Scripted engine control recording every command into the journal.
pub struct FakeEngineControl {
    journal: Journal,
    start_plan: StartPlan,
    init_output: String,
    status_plan: Mutex<VecDeque<Result<StatusReport, EngineError>>>,
    stop_fails: bool,
    env_seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeEngineControl {
    /// A healthy engine: start feeds the sentinel, status reports PID 4242.
    pub fn healthy(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            start_plan: StartPlan::Ready,
            init_output: "ok, you can now start the database server\n".to_owned(),
            status_plan: Mutex::new(VecDeque::new()),
            stop_fails: false,
            env_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_start_plan(mut self, plan: StartPlan) -> Self {
        self.start_plan = plan;
        self
    }

    pub fn with_init_output(mut self, output: impl Into<String>) -> Self {
        self.init_output = output.into();
        self
    }

    /// Queues a status probe result; consumed in order, one per probe.
    pub fn with_status(self, result: Result<StatusReport, EngineError>) -> Self {
        self.status_plan.lock().unwrap().push_back(result);
        self
    }

    pub fn with_failing_stop(mut self) -> Self {
        self.stop_fails = true;
        self
    }

    fn env_handle(&self) -> Arc<Mutex<Vec<(String, String)>>> {
        Arc::clone(&self.env_seen)
    }
}

impl EngineControl for FakeEngineControl {
    fn init_cluster(&self, _context: &EngineContext) -> Result<String, EngineError> {
        self.journal.push("engine init");
        Ok(self.init_output.clone())
    }

    fn start(
        &self,
        context: &EngineContext,
        _log_file: &Path,
        _options: &str,
        monitor: &ReadyMonitor,
    ) -> Result<(), EngineError> {
        self.journal.push("engine start");
        *self.env_seen.lock().unwrap() = context.env().to_vec();
        match self.start_plan {
            StartPlan::Ready => {
                monitor.observe(format!("LOG:  {READY_SENTINEL}\n").as_bytes());
                monitor.note_exit(Some(0));
                Ok(())
            }
            StartPlan::Fail(code) => {
                monitor.note_exit(Some(code));
                Err(EngineError::Failed {
                    command: "pg_ctl start".to_owned(),
                    code: Some(code),
                })
            }
        }
    }

    fn status(&self, _context: &EngineContext) -> Result<StatusReport, EngineError> {
        self.journal.push("engine status");
        self.status_plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(StatusReport::new(
                    "pg_ctl: server is running (PID: 4242)\n",
                    true,
                ))
            })
    }

    fn stop(&self, _context: &EngineContext, _log_file: &Path) -> Result<(), EngineError> {
        self.journal.push("engine stop");
        if self.stop_fails {
            Err(EngineError::Failed {
                command: "pg_ctl stop".to_owned(),
                code: Some(1),
            })
        } else {
            Ok(())
        }
    }
}

/// Scripted driver recording connections and SQL into the journal.
#[derive(Clone)]
pub struct FakeConnector {
    journal: Journal,
    create_error: Arc<Mutex<Option<DriverErrorKind>>>,
    connect_error: Arc<Mutex<Option<DriverErrorKind>>>,
    gate: Arc<Mutex<Option<(Arc<Barrier>, Arc<Barrier>)>>>,
}

impl FakeConnector {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            create_error: Arc::new(Mutex::new(None)),
            connect_error: Arc::new(Mutex::new(None)),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Makes `create database` fail with the given kind.
    pub fn refuse_create(self, kind: DriverErrorKind) -> Self {
        *self.create_error.lock().unwrap() = Some(kind);
        self
    }

    /// Makes every connection attempt fail with the given kind.
    pub fn refuse_connections(self, kind: DriverErrorKind) -> Self {
        *self.connect_error.lock().unwrap() = Some(kind);
        self
    }

    /// Holds the administrative connection at a rendezvous: the returned
    /// barriers are (reached, release), each shared with one waiter.
    pub fn hold_admin_connection(&self) -> (Arc<Barrier>, Arc<Barrier>) {
        let reached = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        *self.gate.lock().unwrap() = Some((Arc::clone(&reached), Arc::clone(&release)));
        (reached, release)
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        label: &str,
    ) -> Result<Box<dyn Connection>, DriverError> {
        if label == "schema creation" {
            let gate = self.gate.lock().unwrap().clone();
            if let Some((reached, release)) = gate {
                reached.wait();
                release.wait();
            }
        }
        self.journal.push(format!("connect {label}"));
        if let Some(kind) = *self.connect_error.lock().unwrap() {
            return Err(DriverError::new(kind, "connection refused"));
        }
        Ok(Box::new(FakeConnection {
            connector: self.clone(),
        }))
    }
}

struct FakeConnection {
    connector: FakeConnector,
}

impl Connection for FakeConnection {
    fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.connector.journal.push(format!("sql {sql}"));
        if sql.starts_with("create database") {
            if let Some(kind) = *self.connector.create_error.lock().unwrap() {
                return Err(DriverError::new(kind, "create refused"));
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.connector.journal.push("sql <commit>");
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

struct RecordingSubservice {
    name: &'static str,
    journal: Journal,
    fail_start: bool,
}

impl Subservice for RecordingSubservice {
    fn name(&self) -> &str {
        self.name
    }

    fn start(&mut self) -> Result<(), SubserviceError> {
        self.journal.push(format!("subservice start {}", self.name));
        if self.fail_start {
            Err(SubserviceError::new("intentional start failure"))
        } else {
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<(), SubserviceError> {
        self.journal.push(format!("subservice stop {}", self.name));
        Ok(())
    }
}

/// Factory producing one named recording subservice per build.
pub struct RecordingFactory {
    name: &'static str,
    journal: Journal,
    fail_start: bool,
}

impl RecordingFactory {
    pub fn new(name: &'static str, journal: &Journal) -> Self {
        Self {
            name,
            journal: journal.clone(),
            fail_start: false,
        }
    }

    pub fn failing(name: &'static str, journal: &Journal) -> Self {
        Self {
            name,
            journal: journal.clone(),
            fail_start: true,
        }
    }
}

impl SubserviceFactory for RecordingFactory {
    fn build(&self, _connections: ConnectionSource) -> Box<dyn Subservice> {
        Box::new(RecordingSubservice {
            name: self.name,
            journal: self.journal.clone(),
            fail_start: self.fail_start,
        })
    }
}

/// Host control that records shutdown requests instead of signalling.
#[derive(Clone, Default)]
pub struct RecordingHostControl {
    journal: Journal,
}

impl RecordingHostControl {
    pub fn new(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
        }
    }
}

impl HostControl for RecordingHostControl {
    fn request_shutdown(&self) {
        self.journal.push("host shutdown");
    }
}

/// Scenario world: temporary data directory, shared journal, and a
/// supervisor wired to recording collaborators.
pub struct TestWorld {
    data_dir: TempDir,
    pub journal: Journal,
    pub connector: FakeConnector,
    pub supervisor: Arc<LifecycleSupervisor>,
    engine_env: Arc<Mutex<Vec<(String, String)>>>,
}

impl TestWorld {
    pub fn data_path(&self) -> PathBuf {
        self.data_dir.path().to_path_buf()
    }

    /// Environment passed to the most recent engine start.
    pub fn captured_env(&self) -> Vec<(String, String)> {
        self.engine_env.lock().unwrap().clone()
    }
}

/// Builds a world around the given engine fake and subservice factories,
/// letting the caller adjust the configuration and connector first.
pub struct WorldBuilder {
    journal: Journal,
    factories: Vec<Box<dyn SubserviceFactory>>,
    existing_cluster: bool,
    configure: Box<dyn FnOnce(ServiceConfig) -> ServiceConfig>,
    shape_engine: Box<dyn FnOnce(FakeEngineControl) -> FakeEngineControl>,
    shape_connector: Box<dyn FnOnce(FakeConnector) -> FakeConnector>,
}

impl WorldBuilder {
    pub fn new() -> Self {
        Self {
            journal: Journal::default(),
            factories: Vec::new(),
            existing_cluster: false,
            configure: Box::new(|config| config),
            shape_engine: Box::new(|engine| engine),
            shape_connector: Box::new(|connector| connector),
        }
    }

    pub fn subservice(mut self, name: &'static str) -> Self {
        self.factories
            .push(Box::new(RecordingFactory::new(name, &self.journal)));
        self
    }

    pub fn failing_subservice(mut self, name: &'static str) -> Self {
        self.factories
            .push(Box::new(RecordingFactory::failing(name, &self.journal)));
        self
    }

    /// Pre-creates the cluster directory so initialisation is skipped.
    pub fn existing_cluster(mut self) -> Self {
        self.existing_cluster = true;
        self
    }

    pub fn configure(
        mut self,
        tweak: impl FnOnce(ServiceConfig) -> ServiceConfig + 'static,
    ) -> Self {
        self.configure = Box::new(tweak);
        self
    }

    pub fn engine(
        mut self,
        shape: impl FnOnce(FakeEngineControl) -> FakeEngineControl + 'static,
    ) -> Self {
        self.shape_engine = Box::new(shape);
        self
    }

    pub fn connector(
        mut self,
        shape: impl FnOnce(FakeConnector) -> FakeConnector + 'static,
    ) -> Self {
        self.shape_connector = Box::new(shape);
        self
    }

    pub fn build(self) -> TestWorld {
        let data_dir = TempDir::new().expect("temporary data directory");
        let config = ServiceConfig::new(data_dir.path(), "create table example (id integer);")
            .with_socket_directory(data_dir.path().join("sockets"));
        let config = (self.configure)(config);
        if self.existing_cluster {
            std::fs::create_dir_all(config.cluster_directory())
                .expect("pre-created cluster directory");
        }
        let engine = (self.shape_engine)(FakeEngineControl::healthy(&self.journal));
        let engine_env = engine.env_handle();
        let connector = (self.shape_connector)(FakeConnector::new(&self.journal));
        let supervisor = LifecycleSupervisor::with_collaborators(
            config,
            Box::new(engine),
            Arc::new(connector.clone()),
            Box::new(RecordingHostControl::new(&self.journal)),
            self.factories,
        );
        TestWorld {
            data_dir,
            journal: self.journal,
            connector,
            supervisor: Arc::new(supervisor),
            engine_env,
        }
    }
}

impl Default for WorldBuilder {
    fn default() -> Self {
        Self::new()
    }
}
