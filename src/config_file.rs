//! Backup configuration loading.
//!
//! Loading is parse-then-validate: the YAML is first decoded into raw structs
//! whose fields are all optional, then `validate` turns them into the typed
//! `BackupConfig`, failing with a named `ConfigError` reason.
//!
//! ```yaml
//! settings:
//!   backup_directory: /srv/backup
//!   log_level: DEBUG
//!   verify_backup: false
//! modules:
//!   photos: { user: alice, host: nas, os: linux, src_path: /data/photos }
//! ```

use serde::Deserialize;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::layout::{BackupLayout, REPORT_FILE, REPORT_JSON_FILE};
use crate::module_set::{HostDescriptor, ModuleSet};
use crate::types::{HostOs, LogLevel};

/// Program invoked when `settings.rsync_binary` is not set.
pub const DEFAULT_RSYNC_BINARY: &str = "rsync";

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    settings: Option<RawSettings>,
    modules: Option<serde_yaml::Mapping>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    backup_directory: Option<String>,
    log_level: Option<String>,
    verify_backup: Option<bool>,
    rsync_binary: Option<String>,
    backup_host_config: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawModule {
    user: Option<String>,
    host: Option<String>,
    os: Option<String>,
    src_path: Option<String>,
}

/// Validated `settings` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub backup_directory: PathBuf,
    pub log_level: LogLevel,
    /// Compare file checksums instead of size+mtime (slow)
    pub verify_backup: bool,
    pub rsync_binary: String,
    /// Back up `/etc` files and dot-files once per distinct host
    pub backup_host_config: bool,
}

/// A fully validated configuration file.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Where the configuration was loaded from; copied into each generation
    pub path: PathBuf,
    pub settings: Settings,
    pub modules: ModuleSet,
}

impl BackupConfig {
    /// Load and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Validate configuration text that was read from `path`.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let raw = parse_raw(path, content)?;
        let settings = validate_settings(raw.settings.unwrap_or_default())?;
        let modules = validate_modules(raw.modules.unwrap_or_default())?;
        check_reserved_names(&modules, path.file_name())?;
        Ok(Self {
            path: path.to_path_buf(),
            settings,
            modules,
        })
    }

    /// File name of the configuration, used for the persisted copies.
    pub fn file_name(&self) -> &std::ffi::OsStr {
        self.path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("backup.yml"))
    }
}

/// Load the module set persisted by a previous run.
///
/// Returns `Ok(None)` when no copy exists (first run). Only the `modules`
/// block is validated; an invalid copy is still an error.
pub fn load_previous_modules(path: &Path) -> Result<Option<ModuleSet>, ConfigError> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = parse_raw(path, &content)?;
    validate_modules(raw.modules.unwrap_or_default()).map(Some)
}

fn parse_raw(path: &Path, content: &str) -> Result<RawConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    let value = value.ok_or_else(|| ConfigError::MissingField {
        field: field.to_string(),
    })?;
    if value.trim().is_empty() {
        return Err(ConfigError::EmptyField {
            field: field.to_string(),
        });
    }
    Ok(value)
}

fn validate_settings(raw: RawSettings) -> Result<Settings, ConfigError> {
    let backup_directory = required(raw.backup_directory, "settings.backup_directory")?;

    let log_level = match raw.log_level {
        None => LogLevel::default(),
        Some(value) => {
            LogLevel::from_str(value.trim()).map_err(|_| ConfigError::InvalidEnum {
                field: "settings.log_level".to_string(),
                value,
                expected: "INFO, DEBUG, TRACE",
            })?
        }
    };

    let rsync_binary = match raw.rsync_binary {
        None => DEFAULT_RSYNC_BINARY.to_string(),
        Some(value) if value.trim().is_empty() => {
            return Err(ConfigError::EmptyField {
                field: "settings.rsync_binary".to_string(),
            });
        }
        Some(value) => value,
    };

    Ok(Settings {
        backup_directory: PathBuf::from(backup_directory),
        log_level,
        verify_backup: raw.verify_backup.unwrap_or(false),
        rsync_binary,
        backup_host_config: raw.backup_host_config.unwrap_or(true),
    })
}

fn validate_modules(raw: serde_yaml::Mapping) -> Result<ModuleSet, ConfigError> {
    let mut entries = Vec::with_capacity(raw.len());
    for (key, value) in raw {
        let name = match key {
            serde_yaml::Value::String(name) => name,
            other => {
                return Err(ConfigError::InvalidModuleName {
                    name: format!("{other:?}"),
                    reason: "module names must be strings",
                });
            }
        };
        validate_module_name(&name)?;

        let module: RawModule =
            serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
                path: PathBuf::from(format!("modules.{name}")),
                message: e.to_string(),
            })?;
        let field = |f: &str| format!("modules.{name}.{f}");
        let descriptor = HostDescriptor {
            user: endpoint_part(module.user, &field("user"))?,
            host: endpoint_part(module.host, &field("host"))?,
            os: HostOs::from_config(&required(module.os, &field("os"))?),
            source_path: required(module.src_path, &field("src_path"))?,
        };
        entries.push((name, descriptor));
    }
    Ok(ModuleSet::from_entries(entries))
}

/// `user` and `host` end up in `user@host:` locators handed to rsync and ssh.
fn endpoint_part(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    let value = required(value, field)?;
    let reason = if value.starts_with('-') {
        Some("must not start with '-'")
    } else if value.chars().any(char::is_whitespace) {
        Some("must not contain whitespace")
    } else if value.contains('@') {
        Some("must not contain '@'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            reason,
        }),
        None => Ok(value),
    }
}

/// Module names are used verbatim as directory and log file names.
fn validate_module_name(name: &str) -> Result<(), ConfigError> {
    let reason = if name.trim().is_empty() {
        Some("name is empty")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if name.contains('/') || name.contains('\\') {
        Some("name contains a path separator")
    } else if name.contains('\0') {
        Some("name contains a NUL byte")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidModuleName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Module directories share `current/` with the report, the config copy and
/// the host configuration directories; a module named like one of them would
/// be mirrored over it with `--delete`.
fn check_reserved_names(
    modules: &ModuleSet,
    config_name: Option<&OsStr>,
) -> Result<(), ConfigError> {
    let host_dirs: BTreeSet<String> = modules
        .iter()
        .map(|(_, host)| BackupLayout::host_dir_name(host))
        .collect();

    for name in modules.names() {
        let reason = if name == REPORT_FILE || name == REPORT_JSON_FILE {
            Some("name is reserved for the run report")
        } else if config_name.is_some_and(|config| config == OsStr::new(name)) {
            Some("name is reserved for the configuration copy")
        } else if host_dirs.contains(name) {
            Some("name is reserved for a host configuration directory")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigError::InvalidModuleName {
                name: name.to_string(),
                reason,
            });
        }
    }
    Ok(())
}
