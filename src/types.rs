//! Type-safe configuration enums
//!
//! Stringly-typed config values (`os`, `log_level`) are parsed into these enums
//! once, at validation time, so the rest of the engine matches exhaustively.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Operating system family of a backed-up host.
///
/// Only the home directory convention depends on it: `/home/<user>` on Linux,
/// `/Users/<user>` everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HostOs {
    #[default]
    Linux,
    Other,
}

impl HostOs {
    /// Map a free-form `os` config value onto a host family.
    ///
    /// Anything that is not `linux` is treated as `other`.
    pub fn from_config(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }

    /// Top-level directory holding user homes on this host family.
    pub const fn home_root(self) -> &'static str {
        match self {
            Self::Linux => "home",
            Self::Other => "Users",
        }
    }
}

/// Log verbosity accepted in `settings.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[derive(Serialize, Deserialize, Display, EnumString, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    #[default]
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "TRACE")]
    Trace,
}

impl LogLevel {
    /// Level selected by repeating `-v` on the command line.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Self::Info,
            1 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Whether rsync should print transfer statistics at this level.
    pub const fn wants_stats(self) -> bool {
        !matches!(self, Self::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_host_os_home_root() {
        assert_eq!(HostOs::Linux.home_root(), "home");
        assert_eq!(HostOs::Other.home_root(), "Users");
    }

    #[test]
    fn test_host_os_from_config() {
        assert_eq!(HostOs::from_config("linux"), HostOs::Linux);
        assert_eq!(HostOs::from_config(" Linux "), HostOs::Linux);
        assert_eq!(HostOs::from_config("macos"), HostOs::Other);
        assert_eq!(HostOs::from_config("darwin"), HostOs::Other);
        assert_eq!(HostOs::from_config(""), HostOs::Other);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::from_str("INFO").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("DEBUG").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("TRACE").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("WARNING").is_err());
    }

    #[test]
    fn test_log_level_display_roundtrip() {
        for level in LogLevel::iter() {
            assert_eq!(LogLevel::from_str(&level.to_string()).unwrap(), level);
        }
    }

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbosity(9), LogLevel::Trace);
    }

    #[test]
    fn test_stats_only_above_info() {
        assert!(!LogLevel::Info.wants_stats());
        assert!(LogLevel::Debug.wants_stats());
        assert!(LogLevel::Trace.wants_stats());
    }
}
