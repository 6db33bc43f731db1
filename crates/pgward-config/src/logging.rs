//! Logging settings consumed by the supervisor's telemetry module.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Output format of the subscriber a host installs.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Newline-delimited JSON events for machine consumption.
    #[default]
    Json,
    /// Terse single-line text for reading in a terminal.
    Compact,
}

/// Errors encountered while parsing a [`LogFormat`] from text.
pub type LogFormatParseError = strum::ParseError;

/// Settings for the host-installed tracing subscriber.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TelemetrySettings {
    filter: String,
    format: LogFormat,
}

impl TelemetrySettings {
    /// Builds settings from a filter expression and output format.
    #[must_use]
    pub fn new(filter: impl Into<String>, format: LogFormat) -> Self {
        Self {
            filter: filter.into(),
            format,
        }
    }

    /// Log filter expression in `tracing_subscriber::EnvFilter` syntax.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Output format for the subscriber.
    #[must_use]
    pub fn format(&self) -> LogFormat {
        self.format
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self::new("info", LogFormat::default())
    }
}
