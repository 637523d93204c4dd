//! Tracing setup for the ingest tools
//!
//! One call to [`init_logging`] installs the global subscriber. Lines go to
//! stdout, to a daily rotated file, or both, as text or JSON. Every field of
//! [`LogConfig`] can be overridden from a `LOGINGEST_LOG_*` variable.
//!
//! Stages log per-file chatter at `trace`, transitions at `info`, per-file
//! failures they recover from at `warn` and anything that aborts a stage at
//! `error`.
//!
//! ```no_run
//! use agi_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> agi_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("ingest starting");
//!     Ok(())
//! }
//! ```

use crate::error::{AgiError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::FmtSpan, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Prefix of every logging variable, e.g. `LOGINGEST_LOG_LEVEL`
pub const ENV_PREFIX: &str = "LOGINGEST_LOG_";

pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_FILE_PREFIX: &str = "agi-ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-file detail (`detail` is accepted as an alias)
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = AgiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "detail" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(invalid("level", s)),
        }
    }
}

/// Where lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != Self::File
    }

    fn file(self) -> bool {
        self != Self::Console
    }
}

impl FromStr for LogOutput {
    type Err = AgiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "console" | "stdout" => Ok(Self::Console),
            "file" => Ok(Self::File),
            "both" | "all" => Ok(Self::Both),
            _ => Err(invalid("output", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = AgiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(invalid("format", s)),
        }
    }
}

fn invalid(field: &str, value: &str) -> AgiError {
    AgiError::Logging(format!("invalid log {}: {}", field, value))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Rotated files land here when the output includes a file
    pub dir: PathBuf,
    /// `agi-ingest` gives `agi-ingest.2024-01-18`
    pub file_prefix: String,
    /// Extra directives such as `aws_smithy_runtime=warn,ssh2=info`
    pub filter: Option<String>,
    pub with_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            filter: None,
            with_location: false,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Apply `LOGINGEST_LOG_{LEVEL,OUTPUT,FORMAT,DIR,FILE_PREFIX,FILTER,LOCATION}`
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(v) = var("LEVEL") {
            self.level = v.parse()?;
        }
        if let Some(v) = var("OUTPUT") {
            self.output = v.parse()?;
        }
        if let Some(v) = var("FORMAT") {
            self.format = v.parse()?;
        }
        if let Some(v) = var("DIR") {
            self.dir = PathBuf::from(v);
        }
        if let Some(v) = var("FILE_PREFIX") {
            self.file_prefix = v;
        }
        if let Some(v) = var("FILTER") {
            self.filter = Some(v);
        }
        if let Some(v) = var("LOCATION") {
            self.with_location = v
                .parse()
                .map_err(|_| invalid("location flag", &v))?;
        }
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(Level::from(self.level).into());
        for directive in self.filter.iter().flat_map(|f| f.split(',')) {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| AgiError::Logging(format!("bad filter directive {}: {}", directive, e)))?,
            );
        }
        Ok(filter)
    }
}

fn var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix)).ok()
}

#[derive(Debug, Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber
///
/// With file output the returned guard must outlive the program's logging,
/// dropping it flushes and stops the writer thread.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.output.console() {
        layers.push(layer(config, std::io::stdout, true));
    }
    if config.output.file() {
        std::fs::create_dir_all(&config.dir)?;
        let appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| AgiError::Logging(e.to_string()))?;
    Ok(guard)
}

fn layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(config.with_location)
        .with_line_number(config.with_location)
        .with_span_events(FmtSpan::CLOSE);
    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_level_aliases() {
        assert_eq!("DETAIL".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert!(matches!("loud".parse::<LogLevel>(), Err(AgiError::Logging(_))));
    }

    #[test]
    fn test_output_targets() {
        let both: LogOutput = "all".parse().unwrap();
        assert!(both.console() && both.file());
        assert!(!LogOutput::Console.file());
        assert!(!LogOutput::File.console());
    }

    #[test]
    fn test_filter_directives_are_validated() {
        let mut config = LogConfig::default();
        config.filter = Some("ssh2=info, aws_smithy_runtime=warn,".into());
        assert!(config.env_filter().is_ok());
        config.filter = Some("ssh2=loudest".into());
        assert!(config.env_filter().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_builder() {
        std::env::set_var("LOGINGEST_LOG_LEVEL", "debug");
        std::env::set_var("LOGINGEST_LOG_FORMAT", "json");
        let config = LogConfig::builder()
            .level(LogLevel::Error)
            .log_file_prefix("ingest-test")
            .build()
            .merge_env();
        std::env::remove_var("LOGINGEST_LOG_LEVEL");
        std::env::remove_var("LOGINGEST_LOG_FORMAT");

        let config = config.unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_prefix, "ingest-test");
    }

    #[test]
    #[serial]
    fn test_bad_env_value_is_rejected() {
        std::env::set_var("LOGINGEST_LOG_OUTPUT", "pager");
        let result = LogConfig::from_env();
        std::env::remove_var("LOGINGEST_LOG_OUTPUT");
        assert!(result.is_err());
    }
}
