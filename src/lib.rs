//! rsync-generations library
//!
//! Backup generation engine: loads a YAML module list, rotates modules that
//! left the configuration into `previous/`, pulls every module with rsync
//! into `current/`, and writes a per-run report.

pub mod cli;
pub mod command;
pub mod config_file;
pub mod error;
pub mod host_config;
pub mod layout;
pub mod module_set;
pub mod orchestrator;
pub mod process_guard;
pub mod report;
pub mod rotation;
pub mod run_state;
pub mod runner;
pub mod types;

// Re-export main types for convenience
pub use command::{Invocation, SyncOptions};
pub use config_file::{BackupConfig, Settings};
pub use error::{BackupError, ConfigError, RotationError, TransferError};
pub use layout::BackupLayout;
pub use module_set::{HostDescriptor, HostKey, ModuleSet};
pub use orchestrator::{BackupOrchestrator, RunOptions, RunPlan, RunSummary};
pub use process_guard::{CancelToken, ChildRegistry, CommandProcessGroup};
pub use report::{ReportEntry, RunReport};
pub use run_state::{RunContext, RunStage, StageTransitionError};
pub use runner::{RsyncRunner, SyncRunner};
pub use types::{HostOs, LogLevel};
