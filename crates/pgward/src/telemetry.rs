//! Tracing subscriber installation for embedding hosts.
//!
//! The supervisor is a library and never installs a subscriber on its own;
//! a host opts in by calling [`initialise`] during startup. Installation is
//! guarded so a host wiring telemetry from several entry points does not
//! trip over the global default already being set.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use pgward_config::{LogFormat, TelemetrySettings};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Proof that telemetry has been set up for this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryHandle;

/// Errors raised while setting up telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter expression did not parse.
    #[error("invalid log filter '{0}'")]
    Filter(String),
    /// A global subscriber was already installed outside this module.
    #[error("could not install telemetry subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Installs the process-wide tracing subscriber, once.
///
/// The first call performs the installation; every later call leaves the
/// existing registration alone and hands back a fresh [`TelemetryHandle`].
pub fn initialise(settings: &TelemetrySettings) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED.get_or_try_init(|| install(settings))?;
    Ok(TelemetryHandle)
}

fn install(settings: &TelemetrySettings) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(settings.filter())
        .map_err(|_| TelemetryError::Filter(settings.filter().to_owned()))?;
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        // Colour only when stderr is an interactive terminal.
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339());
    match settings.format() {
        LogFormat::Json => {
            let subscriber = builder.json().flatten_event(true).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Compact => {
            let subscriber = builder.compact().finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}
