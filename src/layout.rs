//! On-disk layout of a backup root.
//!
//! ```text
//! {root}/
//!   current/    live generation: one dir per module, one `{user}-{host}` dir per host,
//!               config copy, backup_report.log, backup_report.json
//!   previous/   modules dropped from the configuration, plus the archived
//!               config copy and report of the run that last held them
//!   logs/       rsync-output-*.txt, one per transfer
//! ```

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BackupError;
use crate::module_set::HostDescriptor;

/// Human-readable report file name inside a generation.
pub const REPORT_FILE: &str = "backup_report.log";
/// Machine-readable report file name inside a generation.
pub const REPORT_JSON_FILE: &str = "backup_report.json";

/// Resolved paths for one backup root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLayout {
    root: PathBuf,
    current: PathBuf,
    previous: PathBuf,
    logs: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            current: root.join("current"),
            previous: root.join("previous"),
            logs: root.join("logs"),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current_dir(&self) -> &Path {
        &self.current
    }

    pub fn previous_dir(&self) -> &Path {
        &self.previous
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs
    }

    /// Destination of a module inside the current generation.
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.current.join(module)
    }

    /// Per-host configuration directory in the current generation.
    pub fn host_dir(&self, host: &HostDescriptor) -> PathBuf {
        self.current.join(Self::host_dir_name(host))
    }

    /// `{user}-{host}`
    pub fn host_dir_name(host: &HostDescriptor) -> String {
        format!("{}-{}", host.user, host.host)
    }

    pub fn module_log(&self, module: &str) -> PathBuf {
        self.logs.join(format!("rsync-output-{module}.txt"))
    }

    pub fn host_etc_log(&self, host: &HostDescriptor) -> PathBuf {
        self.logs
            .join(format!("rsync-output-conf-hosts-{}.txt", host.user))
    }

    pub fn host_dotfiles_log(&self, host: &HostDescriptor) -> PathBuf {
        self.logs.join(format!("rsync-output-conf-{}.txt", host.user))
    }

    /// Persisted config copy in the current generation; the next run reads
    /// its previous module set from here.
    pub fn config_copy(&self, file_name: &OsStr) -> PathBuf {
        self.current.join(file_name)
    }

    pub fn report_path(&self) -> PathBuf {
        self.current.join(REPORT_FILE)
    }

    pub fn report_json_path(&self) -> PathBuf {
        self.current.join(REPORT_JSON_FILE)
    }

    /// Create the backup root and the logs directory.
    pub fn ensure_base(&self) -> Result<(), BackupError> {
        ensure_dir(&self.root)?;
        ensure_dir(&self.logs)
    }

    /// Create the current generation directory.
    pub fn ensure_current(&self) -> Result<(), BackupError> {
        ensure_dir(&self.current)
    }
}

/// Create `path` and any missing parents.
pub fn ensure_dir(path: &Path) -> Result<(), BackupError> {
    fs::create_dir_all(path).map_err(|source| BackupError::directory(path, source))
}
