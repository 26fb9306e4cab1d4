//! rsync invocation building.
//!
//! `build` is pure: it maps a source locator, destination, log path and
//! options onto an argument list and touches nothing on disk. Callers create
//! the destination and log parent directories beforehand.
//!
//! # Flag Mapping
//!
//! | Input                     | rsync flag                      |
//! |---------------------------|---------------------------------|
//! | (always)                  | `--archive --compress`          |
//! | `log_path`                | `--log-file=<log_path>`         |
//! | (always)                  | `--info=progress2 --delete`     |
//! | `verbose_stats`           | `--stats`                       |
//! | `verify_checksum`         | `--checksum`                    |
//! | `extra_args`              | appended verbatim               |
//! | `source`, `destination`   | positional, after `--`          |

use std::fmt;
use std::path::{Path, PathBuf};

/// Per-run rsync switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOptions {
    /// Print transfer statistics at the end of each run
    pub verbose_stats: bool,
    /// Compare checksums instead of size and mtime; much slower
    pub verify_checksum: bool,
}

/// Fully described rsync call. Pure data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub source: String,
    pub destination: PathBuf,
    pub log_path: PathBuf,
    pub extra_args: Vec<String>,
}

/// Flags passed on every invocation regardless of options.
pub const BASELINE_FLAGS: [&str; 2] = ["--archive", "--compress"];

/// Build the invocation for one transfer.
pub fn build(
    program: &str,
    source: impl Into<String>,
    destination: impl Into<PathBuf>,
    log_path: impl Into<PathBuf>,
    options: SyncOptions,
) -> Invocation {
    let mut extra_args = Vec::new();
    if options.verbose_stats {
        extra_args.push("--stats".to_string());
    }
    if options.verify_checksum {
        extra_args.push("--checksum".to_string());
    }
    Invocation {
        program: program.to_string(),
        source: source.into(),
        destination: destination.into(),
        log_path: log_path.into(),
        extra_args,
    }
}

impl Invocation {
    /// Append extra arguments after the option-derived ones.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Arguments exactly as handed to the process, program excluded.
    ///
    /// Source and destination follow `--` so a value starting with `-` can
    /// never be read as an option.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args: Vec<String> = BASELINE_FLAGS.iter().map(|f| f.to_string()).collect();
        args.push(format!("--log-file={}", self.log_path.display()));
        args.push("--info=progress2".to_string());
        args.push("--delete".to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push("--".to_string());
        args.push(self.source.clone());
        args.push(path_arg(&self.destination));
        args
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn needs_quoting(arg: &str) -> bool {
    arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || "'\"$`\\*?[".contains(c))
}

/// Shell-like rendering for logs only; never executed.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in self.to_cli_args() {
            if needs_quoting(&arg) {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_invocation(options: SyncOptions) -> Invocation {
        build(
            "rsync",
            "alice@nas:/data/photos",
            "/b/current/photos",
            "/b/logs/rsync-output-photos.txt",
            options,
        )
    }

    #[test]
    fn test_baseline_args() {
        let args = module_invocation(SyncOptions::default()).to_cli_args();
        assert_eq!(
            args,
            vec![
                "--archive",
                "--compress",
                "--log-file=/b/logs/rsync-output-photos.txt",
                "--info=progress2",
                "--delete",
                "--",
                "alice@nas:/data/photos",
                "/b/current/photos",
            ]
        );
    }

    #[test]
    fn test_stats_flag() {
        let inv = module_invocation(SyncOptions {
            verbose_stats: true,
            verify_checksum: false,
        });
        assert_eq!(inv.extra_args, vec!["--stats"]);
        assert!(inv.to_cli_args().contains(&"--stats".to_string()));
    }

    #[test]
    fn test_checksum_flag() {
        let inv = module_invocation(SyncOptions {
            verbose_stats: false,
            verify_checksum: true,
        });
        assert_eq!(inv.extra_args, vec!["--checksum"]);
    }

    #[test]
    fn test_extra_args_precede_positionals() {
        let inv = module_invocation(SyncOptions {
            verbose_stats: true,
            verify_checksum: true,
        })
        .with_args(["--exclude=.cache"]);
        let args = inv.to_cli_args();
        let sep = args.iter().position(|a| a == "--").unwrap();
        let exclude = args.iter().position(|a| a == "--exclude=.cache").unwrap();
        let stats = args.iter().position(|a| a == "--stats").unwrap();
        assert!(stats < exclude && exclude < sep);
        assert_eq!(args.len(), sep + 3);
    }

    #[test]
    fn test_build_is_deterministic() {
        let options = SyncOptions {
            verbose_stats: true,
            verify_checksum: true,
        };
        assert_eq!(module_invocation(options), module_invocation(options));
    }

    #[test]
    fn test_metacharacters_stay_single_argument() {
        let inv = build(
            "rsync",
            "alice@nas:/data/my photos; rm -rf ~",
            "/b/current/p",
            "/b/logs/p.txt",
            SyncOptions::default(),
        );
        let args = inv.to_cli_args();
        assert!(args.contains(&"alice@nas:/data/my photos; rm -rf ~".to_string()));
    }

    #[test]
    fn test_display_quotes_unsafe_args() {
        let inv = build("rsync", "u@h:/a b", "/d", "/l", SyncOptions::default());
        let shown = inv.to_string();
        assert!(shown.starts_with("rsync --archive"));
        assert!(shown.contains("'u@h:/a b'"));
    }
}
