//! Subscriber settings
//!
//! Everything here is plain data with serde support, so a deployment can keep
//! its logging setup in a JSON file next to the engine's data directory.
//! Fields left out of that file fall back to [`LogConfig::default`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::LoggingError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base filter directive; `RUST_LOG` replaces it when set
    pub default_level: String,
    pub console: ConsoleConfig,
    /// Rolling JSONL files, off unless set
    pub file: Option<FileConfig>,
    /// Shape of JSONL records, shared by console and file output
    pub jsonl: JsonlConfig,
    /// Per-target level overrides, e.g. `ephemera_storage = "warn"`
    pub targets: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".into(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
            targets: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// Human-readable debug output on the terminal
    pub fn development() -> Self {
        Self {
            default_level: "debug".into(),
            console: ConsoleConfig::readable("debug"),
            ..Self::default()
        }
    }

    /// Daily JSONL files under `log_dir` and a quiet storage layer
    ///
    /// The terminal stays silent; a month of files is retained.
    pub fn production(log_dir: PathBuf) -> Self {
        let mut config = Self {
            console: ConsoleConfig::off(),
            file: Some(FileConfig {
                directory: log_dir,
                max_files: Some(30),
                ..FileConfig::default()
            }),
            ..Self::default()
        };
        config.set_target_level("ephemera_storage", "warn");
        config
    }

    /// Warnings and errors only, uncolored so test output stays greppable
    pub fn testing() -> Self {
        Self {
            default_level: "warn".into(),
            console: ConsoleConfig {
                level: Some("warn".into()),
                ..ConsoleConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn set_target_level(&mut self, target: impl Into<String>, level: impl Into<String>) {
        self.targets.insert(target.into(), level.into());
    }

    pub fn from_json(json: &str) -> Result<Self, LoggingError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, LoggingError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// `default_level` first, then one `target=level` per override
    pub fn directives(&self) -> Vec<String> {
        let overrides = self
            .targets
            .iter()
            .map(|(target, level)| format!("{target}={level}"));
        std::iter::once(self.default_level.clone())
            .chain(overrides)
            .collect()
    }
}

/// Terminal output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Multi-line human format instead of JSONL
    pub pretty: bool,
    pub ansi: bool,
    /// Stricter level for the terminal than for the files
    pub level: Option<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: false,
            ansi: false,
            level: None,
        }
    }
}

impl ConsoleConfig {
    pub fn off() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Pretty, colored output at `level`
    pub fn readable(level: &str) -> Self {
        Self {
            enabled: true,
            pretty: true,
            ansi: true,
            level: Some(level.to_string()),
        }
    }
}

/// Rolling log files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File names start with this, followed by the rotation date
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Oldest files beyond this count are deleted on rotation
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "ephemera".into(),
            rotation: RotationStrategy::default(),
            max_files: Some(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One `<prefix>.log` file, truncated on start
    Never,
}

/// Which parts of an event end up in a JSONL record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Event fields at the top level instead of under `fields`
    pub flatten_events: bool,
    /// Full span stack under `spans`
    pub include_spans: bool,
    /// Innermost span under `span`
    pub include_current_span: bool,
    pub include_thread_info: bool,
    /// Source file and line
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_current_span: true,
            include_thread_info: false,
            include_location: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_writes_jsonl_to_console_only() {
        let config = LogConfig::default();
        assert_eq!(config.default_level, "info");
        assert!(config.console.enabled);
        assert!(!config.console.pretty);
        assert!(config.file.is_none());
        assert_eq!(config.directives(), vec!["info"]);
    }

    #[test]
    fn test_development_is_readable() {
        let config = LogConfig::development();
        assert_eq!(config.default_level, "debug");
        assert_eq!(config.console, ConsoleConfig::readable("debug"));
    }

    #[test]
    fn test_production_logs_to_files() {
        let config = LogConfig::production(PathBuf::from("/var/log/ephemera"));
        assert!(!config.console.enabled);
        let file = config.file.as_ref().unwrap();
        assert_eq!(file.directory, PathBuf::from("/var/log/ephemera"));
        assert_eq!(file.rotation, RotationStrategy::Daily);
        assert_eq!(file.max_files, Some(30));
        assert_eq!(config.directives(), vec!["info", "ephemera_storage=warn"]);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = LogConfig::from_json(
            r#"{ "default_level": "trace", "file": { "rotation": "never" } }"#,
        )
        .unwrap();
        assert_eq!(config.default_level, "trace");
        assert!(config.console.enabled);
        let file = config.file.unwrap();
        assert_eq!(file.rotation, RotationStrategy::Never);
        assert_eq!(file.prefix, "ephemera");
    }

    #[test]
    fn test_json_survives_a_trip() {
        let mut config = LogConfig::production(PathBuf::from("logs"));
        config.set_target_level("ephemera_stories::manager", "trace");
        let json = config.to_json().unwrap();
        assert_eq!(LogConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(matches!(
            LogConfig::from_json("{ not json"),
            Err(LoggingError::Json(_))
        ));
    }
}
