//! Structured logging for the flood risk forecasting service
//!
//! Provides context-rich logging with component tags, optional subject
//! identifiers (artifact family, hour, stage), timestamps and severity
//! levels. Supports both console output and file-based logging for
//! long training runs.

use chrono::Utc;
use serde::Deserialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use crate::model::ForecastError;

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Training,
    Features,
    Simulation,
    Model,
    Artifacts,
    Risk,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Training => write!(f, "TRAIN"),
            Component::Features => write!(f, "FEAT"),
            Component::Simulation => write!(f, "SIM"),
            Component::Model => write!(f, "MODEL"),
            Component::Artifacts => write!(f, "STORE"),
            Component::Risk => write!(f, "RISK"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - e.g. no artifacts yet on a fresh install
    Expected,
    /// Unexpected failure - indicates bad data, bad config or a bug
    Unexpected,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logger Configuration
// ---------------------------------------------------------------------------

/// Global logger instance
static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

pub struct Logger {
    /// Minimum log level to display
    min_level: LogLevel,
    /// Optional file path for logging
    log_file: Option<String>,
    /// Whether to include timestamps in console output
    console_timestamps: bool,
}

impl Logger {
    /// Initialize the global logger
    pub fn init(min_level: LogLevel, log_file: Option<String>, console_timestamps: bool) {
        let logger = Logger {
            min_level,
            log_file,
            console_timestamps,
        };

        // A poisoned lock only means another thread panicked mid-log.
        let mut slot = LOGGER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(logger);
    }

    fn log(&self, level: LogLevel, component: Component, subject: Option<&str>, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let subject_part = subject.map(|s| format!(" [{}]", s)).unwrap_or_default();
        let log_entry = format!(
            "{} {} {}{}: {}",
            timestamp, level, component, subject_part, message
        );

        if self.console_timestamps {
            match level {
                LogLevel::Error => eprintln!("{}", log_entry),
                LogLevel::Warning => eprintln!("   {}", log_entry),
                LogLevel::Info | LogLevel::Debug => println!("   {}", log_entry),
            }
        } else {
            match level {
                LogLevel::Error => eprintln!("   ✗ {}{}: {}", component, subject_part, message),
                LogLevel::Warning => eprintln!("   ⚠ {}{}: {}", component, subject_part, message),
                LogLevel::Info => println!("   {}", message),
                LogLevel::Debug => println!("   [DEBUG] {}{}: {}", component, subject_part, message),
            }
        }

        if let Some(ref path) = self.log_file {
            if let Err(e) = Self::append_to_file(path, &log_entry) {
                eprintln!("Failed to write to log file {}: {}", path, e);
            }
        }
    }

    fn append_to_file(path: &str, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }
}

fn dispatch(level: LogLevel, component: Component, subject: Option<&str>, message: &str) {
    let guard = LOGGER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(logger) = guard.as_ref() {
        logger.log(level, component, subject, message);
    }
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Initialize the global logger
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    Logger::init(min_level, log_file.map(String::from), console_timestamps);
}

/// Log a general informational message
pub fn info(component: Component, subject: Option<&str>, message: &str) {
    dispatch(LogLevel::Info, component, subject, message);
}

/// Log a warning message
pub fn warn(component: Component, subject: Option<&str>, message: &str) {
    dispatch(LogLevel::Warning, component, subject, message);
}

/// Log an error message
pub fn error(component: Component, subject: Option<&str>, message: &str) {
    dispatch(LogLevel::Error, component, subject, message);
}

/// Log a debug message
pub fn debug(component: Component, subject: Option<&str>, message: &str) {
    dispatch(LogLevel::Debug, component, subject, message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify an artifact load failure.
///
/// A missing artifact directory or file is the normal state before the
/// first training run; anything else (corrupt JSON, schema drift) means the
/// store was damaged or written by an incompatible build.
pub fn classify_load_failure(err: &ForecastError) -> FailureType {
    match err {
        ForecastError::ArtifactLoad { reason, .. } if reason.starts_with("not found") => {
            FailureType::Expected
        }
        _ => FailureType::Unexpected,
    }
}

// ---------------------------------------------------------------------------
// Structured Failure Logging
// ---------------------------------------------------------------------------

/// Log an artifact load failure that is about to be recovered by retraining.
pub fn log_load_failure(family: &str, err: &ForecastError) {
    let failure_type = classify_load_failure(err);
    let message = format!("artifact load failed [{}]: {}; retraining", failure_type, err);

    match failure_type {
        FailureType::Expected => info(Component::Artifacts, Some(family), &message),
        FailureType::Unexpected => warn(Component::Artifacts, Some(family), &message),
    }
}

/// Log an orchestrator failure. The error already carries its stage tag.
pub fn log_stage_failure(err: &ForecastError) {
    let subject = match err {
        ForecastError::Stage { stage, .. } => Some(stage.to_string()),
        _ => None,
    };
    error(Component::Training, subject.as_deref(), &err.to_string());
}

// ---------------------------------------------------------------------------
// Summary Logging
// ---------------------------------------------------------------------------

/// Log how many raw rows survived feature engineering and the split sizes.
pub fn log_training_summary(raw_rows: usize, engineered_rows: usize, train: usize, test: usize) {
    let dropped = raw_rows.saturating_sub(engineered_rows);
    let message = format!(
        "Engineered {}/{} rows ({} dropped for trailing history), split {} train / {} test",
        engineered_rows, raw_rows, dropped, train, test
    );

    if engineered_rows == 0 || train == 0 || test == 0 {
        warn(Component::Training, None, &message);
    } else {
        info(Component::Training, None, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
    }

    #[test]
    fn test_missing_artifacts_are_expected_failures() {
        let missing = ForecastError::ArtifactLoad {
            path: "models/hybrid/tabular_model.json".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(classify_load_failure(&missing), FailureType::Expected);

        let corrupt = ForecastError::ArtifactLoad {
            path: "models/hybrid/tabular_model.json".to_string(),
            reason: "invalid JSON at line 1".to_string(),
        };
        assert_eq!(classify_load_failure(&corrupt), FailureType::Unexpected);
    }

    #[test]
    fn test_log_level_parses_from_config_strings() {
        #[derive(Deserialize)]
        struct Wrapper {
            level: LogLevel,
        }
        let parsed: Wrapper = toml::from_str("level = \"warn\"").expect("alias should parse");
        assert_eq!(parsed.level, LogLevel::Warning);
        let parsed: Wrapper = toml::from_str("level = \"debug\"").expect("lowercase should parse");
        assert_eq!(parsed.level, LogLevel::Debug);
    }
}
