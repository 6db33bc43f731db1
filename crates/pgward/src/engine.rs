//! Spawns and controls the engine binaries.
//!
//! Three external commands are wrapped behind the [`EngineControl`] seam:
//! the cluster initialisation binary (run once per fresh data directory),
//! and the control binary's `start`, `status`, and `stop` subcommands. The
//! production implementation locates the binaries on PATH at construction,
//! which is where a missing binary surfaces as a fatal
//! [`ConfigurationError`].

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use pgward_config::ServiceConfig;

use crate::monitor::ReadyMonitor;

const ENGINE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::engine");

/// Timeout, in seconds, granted to the start command. Generous so a long
/// cluster upgrade on startup is not cut short.
const START_TIMEOUT_SECS: &str = "86400";

/// A required engine binary could not be located. Fatal at construction.
#[derive(Debug, Error)]
#[error("unable to locate {name} command '{command}': {source}")]
pub struct ConfigurationError {
    name: &'static str,
    command: String,
    #[source]
    source: which::Error,
}

/// Errors surfaced while spawning or waiting on the engine binaries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The command could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// Command that failed to spawn.
        command: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Reading the command's output or waiting for it failed.
    #[error("failed to collect output of {command}: {source}")]
    Output {
        /// Command whose output could not be collected.
        command: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The command ran but exited abnormally.
    #[error("{command} exited with code {code:?}")]
    Failed {
        /// Command that failed.
        command: String,
        /// Exit code, when not killed by a signal.
        code: Option<i32>,
    },
}

/// Spawn context shared by every engine invocation: working directory, the
/// environment channel to the binaries, the administrative role, and the
/// identity the children run as.
#[derive(Debug, Clone)]
pub struct EngineContext {
    working_directory: PathBuf,
    env: Vec<(String, String)>,
    role: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
}

impl EngineContext {
    /// Builds a context.
    #[must_use]
    pub fn new(
        working_directory: PathBuf,
        env: Vec<(String, String)>,
        role: Option<String>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Self {
        Self {
            working_directory,
            env,
            role,
            uid,
            gid,
        }
    }

    /// Environment variables passed to the spawned binaries.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

/// Captured result of a status probe.
#[derive(Debug, Clone)]
pub struct StatusReport {
    output: String,
    success: bool,
}

impl StatusReport {
    /// Builds a report from captured output and the probe's exit success.
    #[must_use]
    pub fn new(output: impl Into<String>, success: bool) -> Self {
        Self {
            output: output.into(),
            success,
        }
    }

    /// Combined stdout and stderr of the probe.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Whether the probe confirmed a running instance.
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// Engine process id parsed from the status text, when present.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        parse_status_pid(&self.output)
    }
}

/// Extracts the engine PID from status output.
#[must_use]
pub fn parse_status_pid(status: &str) -> Option<u32> {
    static PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"PID:\s*(\d+)").expect("literal pattern compiles"));
    PATTERN
        .captures(status)?
        .get(1)
        .and_then(|digits| digits.as_str().parse().ok())
}

/// Collaborator contract for the supervised engine binaries.
pub trait EngineControl: Send + Sync {
    /// Runs the cluster initialisation binary and returns its combined
    /// output. The caller inspects the output for fatal markers; a non-zero
    /// exit alone is not an error here.
    fn init_cluster(&self, context: &EngineContext) -> Result<String, EngineError>;

    /// Runs the control binary's `start` subcommand, feeding its stderr to
    /// the monitor. Blocks until the command exits; `Ok` means exit code
    /// zero, i.e. the engine reported itself ready.
    fn start(
        &self,
        context: &EngineContext,
        log_file: &Path,
        options: &str,
        monitor: &ReadyMonitor,
    ) -> Result<(), EngineError>;

    /// Runs the `status` subcommand, short-lived, capturing its output.
    fn status(&self, context: &EngineContext) -> Result<StatusReport, EngineError>;

    /// Runs the `stop` subcommand and waits for it to complete.
    fn stop(&self, context: &EngineContext, log_file: &Path) -> Result<(), EngineError>;
}

/// Production control backed by the real binaries.
#[derive(Debug)]
pub struct SystemEngineControl {
    control_path: PathBuf,
    init_path: PathBuf,
}

impl SystemEngineControl {
    /// Locates the control and init binaries configured in `config`.
    pub fn locate(config: &ServiceConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            control_path: locate_command("control", config.control_command())?,
            init_path: locate_command("cluster-init", config.init_command())?,
        })
    }

    fn command(&self, binary: &Path, context: &EngineContext) -> Command {
        let mut command = Command::new(binary);
        command.current_dir(&context.working_directory);
        for (key, value) in &context.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            if let Some(uid) = context.uid {
                command.uid(uid);
            }
            if let Some(gid) = context.gid {
                command.gid(gid);
            }
        }
        command
    }

    fn capture(&self, mut command: Command, label: &str) -> Result<Output, EngineError> {
        command
            .stdin(Stdio::null())
            .output()
            .map_err(|source| EngineError::Spawn {
                command: label.to_owned(),
                source,
            })
    }
}

impl EngineControl for SystemEngineControl {
    fn init_cluster(&self, context: &EngineContext) -> Result<String, EngineError> {
        let mut command = self.command(&self.init_path, context);
        command.args(["-E", "UTF8"]);
        if let Some(role) = &context.role {
            command.args(["-U", role]);
        }
        info!(
            target: ENGINE_TARGET,
            command = %self.init_path.display(),
            "running cluster initialisation"
        );
        let output = self.capture(command, "cluster-init")?;
        debug!(
            target: ENGINE_TARGET,
            code = ?output.status.code(),
            "cluster initialisation finished"
        );
        Ok(combined_output(&output))
    }

    fn start(
        &self,
        context: &EngineContext,
        log_file: &Path,
        options: &str,
        monitor: &ReadyMonitor,
    ) -> Result<(), EngineError> {
        let mut command = self.command(&self.control_path, context);
        command
            .arg("start")
            .arg("-l")
            .arg(log_file)
            .args(["-t", START_TIMEOUT_SECS, "-w", "-o"])
            .arg(options)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        info!(
            target: ENGINE_TARGET,
            command = %self.control_path.display(),
            options,
            "requesting engine start"
        );

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            command: "start".to_owned(),
            source,
        })?;

        // pg_ctl chats on stdout while the interesting lines arrive on
        // stderr; drain stdout on its own thread so neither pipe stalls.
        let stdout_pump = child.stdout.take().map(|stdout| {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(text) => {
                            debug!(target: ENGINE_TARGET, line = %text, "engine stdout");
                        }
                        Err(_) => break,
                    }
                }
            })
        });

        if let Some(mut stderr) = child.stderr.take() {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(length) => monitor.observe(chunk.get(..length).unwrap_or_default()),
                    Err(source) => {
                        return Err(EngineError::Output {
                            command: "start".to_owned(),
                            source,
                        });
                    }
                }
            }
        }

        let status = child.wait().map_err(|source| EngineError::Output {
            command: "start".to_owned(),
            source,
        })?;
        if let Some(pump) = stdout_pump {
            let _ = pump.join();
        }
        monitor.note_exit(status.code());
        info!(
            target: ENGINE_TARGET,
            code = ?status.code(),
            "start command exited"
        );

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed {
                command: "start".to_owned(),
                code: status.code(),
            })
        }
    }

    fn status(&self, context: &EngineContext) -> Result<StatusReport, EngineError> {
        let mut command = self.command(&self.control_path, context);
        command.arg("status");
        let output = self.capture(command, "status")?;
        Ok(StatusReport::new(
            combined_output(&output),
            output.status.success(),
        ))
    }

    fn stop(&self, context: &EngineContext, log_file: &Path) -> Result<(), EngineError> {
        let mut command = self.command(&self.control_path, context);
        command.arg("-l").arg(log_file).arg("stop");
        info!(
            target: ENGINE_TARGET,
            command = %self.control_path.display(),
            "requesting graceful engine stop"
        );
        let output = self.capture(command, "stop")?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed {
                command: "stop".to_owned(),
                code: output.status.code(),
            })
        }
    }
}

fn combined_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}

fn locate_command(name: &'static str, command: &str) -> Result<PathBuf, ConfigurationError> {
    which::which(command).map_err(|source| ConfigurationError {
        name,
        command: command.to_owned(),
        source,
    })
}
