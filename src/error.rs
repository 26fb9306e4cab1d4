//! Error handling module for the backup engine
//!
//! Fatal errors (configuration, directory, rotation) abort a run before the
//! report is written. `TransferError` is the only recoverable kind: the
//! orchestrator turns it into a report entry and moves on.

use std::path::PathBuf;
use thiserror::Error;

/// Why a configuration file was rejected.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read at all
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML or has the wrong shape
    #[error("cannot parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// A required field is absent
    #[error("missing required field '{field}'")]
    MissingField { field: String },

    /// A required field is present but blank
    #[error("field '{field}' must not be empty")]
    EmptyField { field: String },

    /// A field holds a value outside its enumeration
    #[error("invalid value '{value}' for '{field}' (expected one of: {expected})")]
    InvalidEnum {
        field: String,
        value: String,
        expected: &'static str,
    },

    /// A field value is well-typed but unusable
    #[error("invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: &'static str,
    },

    /// Module names become directory names and must be a single path segment
    #[error("invalid module name '{name}': {reason}")]
    InvalidModuleName { name: String, reason: &'static str },
}

/// Failure while archiving modules into the previous generation.
#[derive(Error, Debug)]
pub enum RotationError {
    /// Could not create the previous generation directory
    #[error("cannot create previous generation {path}: {source}")]
    CreateGeneration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stale archived copy of the module could not be removed
    #[error("cannot remove stale archive of module '{module}' at {path}: {source}")]
    RemoveStale {
        module: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The module directory could not be moved between generations
    #[error("cannot move module '{module}' from {from} to {to}: {message}")]
    Move {
        module: String,
        from: PathBuf,
        to: PathBuf,
        message: String,
    },

    /// A config copy or report artifact could not be archived
    #[error("cannot archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of an rsync invocation that did not exit cleanly.
///
/// `exit_code` is `-1` when the process could not be launched or was killed
/// by a signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (exit code {exit_code}){}", tail_suffix(.captured_output))]
pub struct TransferError {
    pub message: String,
    pub exit_code: i32,
    pub captured_output: String,
}

/// Exit code used when rsync never ran or has no exit status.
pub const LAUNCH_FAILED_EXIT_CODE: i32 = -1;

/// Number of stderr lines kept in logs and report details.
const TAIL_LINES: usize = 5;

fn tail_suffix(output: &str) -> String {
    let tail = stderr_tail(output, TAIL_LINES);
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

/// Last `lines` non-blank lines of `output`, joined with ` | `.
pub fn stderr_tail(output: &str, lines: usize) -> String {
    let kept: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join(" | ")
}

impl TransferError {
    /// The process could not be started (missing binary, permission denied).
    pub fn launch_failed(output: impl Into<String>) -> Self {
        Self {
            message: "launch failed".to_string(),
            exit_code: LAUNCH_FAILED_EXIT_CODE,
            captured_output: output.into(),
        }
    }

    /// The process ran and reported failure.
    pub fn exited(exit_code: Option<i32>, captured_output: impl Into<String>) -> Self {
        let message = match exit_code {
            Some(_) => "rsync exited with an error",
            None => "rsync terminated by signal",
        };
        Self {
            message: message.to_string(),
            exit_code: exit_code.unwrap_or(LAUNCH_FAILED_EXIT_CODE),
            captured_output: captured_output.into(),
        }
    }

    /// The transfer was never started because the run was cancelled.
    pub fn cancelled() -> Self {
        Self {
            message: "cancelled before start".to_string(),
            exit_code: LAUNCH_FAILED_EXIT_CODE,
            captured_output: String::new(),
        }
    }

    /// One-line summary for report entries.
    pub fn summary(&self) -> String {
        let tail = stderr_tail(&self.captured_output, 1);
        if tail.is_empty() {
            format!("{} (exit code {})", self.message, self.exit_code)
        } else {
            format!("{} (exit code {}): {}", self.message, self.exit_code, tail)
        }
    }
}

/// Main error type for a backup run
#[derive(Error, Debug)]
pub enum BackupError {
    /// Malformed or missing settings
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A required directory could not be created
    #[error("Directory error at {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generation rotation failed; the run must not continue
    #[error("Rotation error: {0}")]
    Rotation(#[from] RotationError),

    /// Run stage machine misuse
    #[error("Stage transition error: {0}")]
    StageTransition(#[from] crate::run_state::StageTransitionError),

    /// IO errors (config copy, report writing)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON report serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    /// Create a directory error
    pub fn directory(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Directory {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BackupError::from(ConfigError::MissingField {
            field: "settings.backup_directory".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: missing required field 'settings.backup_directory'"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BackupError = io_err.into();
        assert!(matches!(err, BackupError::Io(_)));
    }

    #[test]
    fn test_launch_failed_sentinel() {
        let err = TransferError::launch_failed("No such file or directory");
        assert_eq!(err.exit_code, -1);
        assert_eq!(err.message, "launch failed");
    }

    #[test]
    fn test_transfer_error_display_includes_tail() {
        let err = TransferError::exited(
            Some(23),
            "line one\n\nrsync: link_stat \"/nope\" failed: No such file or directory (2)\n",
        );
        let text = err.to_string();
        assert!(text.starts_with("rsync exited with an error (exit code 23)"));
        assert!(text.contains("link_stat"));
    }

    #[test]
    fn test_signal_termination_uses_sentinel() {
        let err = TransferError::exited(None, "");
        assert_eq!(err.exit_code, LAUNCH_FAILED_EXIT_CODE);
        assert_eq!(err.to_string(), "rsync terminated by signal (exit code -1)");
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let output = "a\nb\n  \nc\nd\n";
        assert_eq!(stderr_tail(output, 2), "c | d");
        assert_eq!(stderr_tail(output, 10), "a | b | c | d");
        assert_eq!(stderr_tail("", 3), "");
    }

    #[test]
    fn test_summary_is_single_line() {
        let err = TransferError::exited(Some(12), "first\nprotocol data stream error\n");
        assert_eq!(
            err.summary(),
            "rsync exited with an error (exit code 12): protocol data stream error"
        );
    }
}
