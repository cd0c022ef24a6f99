//! Console and JSONL logging for Ephemera
//!
//! This crate wires the `tracing` output of the story engine into either
//! human-readable console output or structured JSON lines, optionally mirrored
//! to rotating log files.
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines format for log aggregation (default)
//! - **Owner Context**: Tag spans with the account whose engine emitted them
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use ephemera_logging::{EphemeraSubscriberBuilder, LogConfig};
//!
//! // JSONL to console
//! let _guard = EphemeraSubscriberBuilder::new().init();
//!
//! // Human-readable output during development
//! let _guard = EphemeraSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init();
//! ```
//!
//! # Owner Context
//!
//! ```ignore
//! use ephemera_core::OwnerId;
//! use ephemera_logging::OwnerContextGuard;
//!
//! let guard = OwnerContextGuard::new(OwnerId(1));
//! let _span = OwnerContextGuard::current_span().entered();
//! tracing::info!("sending story"); // carries owner_id = 1
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{OwnerContextData, OwnerContextGuard};
pub use layers::{OwnerContextExtension, OwnerContextLayer, jsonl_layer};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

/// Errors raised while setting up logging
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid filter directive: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("log file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("rolling appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("a global subscriber is already set: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

type Base = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Base> + Send + Sync>;

/// Builder for configuring and initializing the logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable output.
pub struct EphemeraSubscriberBuilder {
    config: LogConfig,
}

impl EphemeraSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// The configuration the subscriber will be built from
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Initialize the subscriber globally
    ///
    /// Setup failures are reported on stderr and leave logging disabled. Keep
    /// the returned guard alive for as long as file output should be flushed.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {e}");
                None
            }
        }
    }

    /// Try to initialize the subscriber globally
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let filter = self.env_filter()?;

        let mut layers: Vec<BoxedLayer> = vec![OwnerContextLayer::new().boxed()];
        let mut guard = None;

        if self.config.console.enabled {
            layers.push(self.console_layer()?);
        }

        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            guard = Some(file_guard);
            layers.push(jsonl_layer(&self.config.jsonl, writer));
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(layers)
            .try_init()?;

        Ok(guard)
    }

    /// RUST_LOG wins over the configured directives
    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        Ok(EnvFilter::try_new(self.config.directives().join(","))?)
    }

    fn console_layer(&self) -> Result<BoxedLayer, LoggingError> {
        let console = &self.config.console;
        let layer = if console.pretty {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
                .boxed()
        } else {
            jsonl_layer(&self.config.jsonl, std::io::stdout)
        };

        Ok(match &console.level {
            Some(level) => layer.with_filter(EnvFilter::try_new(level)?).boxed(),
            None => layer,
        })
    }
}

impl Default for EphemeraSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the file writer; truncates for `Never` rotation, appends otherwise
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;

    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.log", config.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.as_str())
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    Ok(tracing_appender::non_blocking(
        builder.build(&config.directory)?,
    ))
}

/// Initialize logging with default settings (JSONL to console)
pub fn init_default() -> Option<WorkerGuard> {
    EphemeraSubscriberBuilder::new().init()
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> Option<WorkerGuard> {
    EphemeraSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Initialize logging for tests; a subscriber set earlier is left in place
pub fn init_testing() {
    let _ = EphemeraSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = EphemeraSubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
        assert!(!builder.config().console.pretty);
    }

    #[test]
    fn test_builder_with_config() {
        let builder = EphemeraSubscriberBuilder::new().with_config(LogConfig::development());
        assert_eq!(builder.config().default_level, "debug");
        assert!(builder.config().console.pretty);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = EphemeraSubscriberBuilder::new()
            .with_level("trace")
            .with_console(false)
            .with_file_output(FileConfig::default());
        assert_eq!(builder.config().default_level, "trace");
        assert!(!builder.config().console.enabled);
        assert!(builder.config().file.is_some());
    }

    #[test]
    fn test_never_rotation_writes_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig {
            directory: dir.path().join("nested"),
            prefix: "run".to_string(),
            rotation: RotationStrategy::Never,
            max_files: None,
        };
        let (_writer, _guard) = file_writer(&config).unwrap();
        assert!(dir.path().join("nested").join("run.log").exists());
    }

    #[test]
    fn test_rolling_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig {
            directory: dir.path().join("rolling"),
            rotation: RotationStrategy::Hourly,
            ..FileConfig::default()
        };
        let (_writer, _guard) = file_writer(&config).unwrap();
        assert!(dir.path().join("rolling").is_dir());
    }

    #[test]
    fn test_bad_level_is_rejected() {
        let builder = EphemeraSubscriberBuilder::new().with_level("ephemera=notalevel");
        // RUST_LOG may be set in the environment running the tests
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(builder.env_filter(), Err(LoggingError::Filter(_))));
        }
    }
}
