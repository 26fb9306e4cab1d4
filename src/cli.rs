use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::RunOptions;
use crate::types::LogLevel;

/// rsync-generations - pull a fleet of hosts into a two-generation backup tree
#[derive(Parser, Debug)]
#[command(name = "rsync-generations")]
#[command(about = "Rotating rsync backups of remote hosts driven by a YAML module list")]
#[command(version)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, short_alias = 'j', value_name = "FILE")]
    pub config: PathBuf,

    /// Increase log verbosity (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Skip the /etc and dotfile backup of each host
    #[arg(long, global = true)]
    pub no_host_config: bool,

    /// Compare file checksums (slow), regardless of settings.verify_backup
    #[arg(long, global = true)]
    pub verify: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the backup (default)
    Run,
    /// Validate the configuration file and list its modules
    Validate,
    /// Show the rotation and every rsync command without running anything
    Plan,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    pub fn command(&self) -> Commands {
        self.command.unwrap_or(Commands::Run)
    }

    /// Effective log level: `-v` flags win over the configured level.
    pub fn log_level(&self, configured: LogLevel) -> LogLevel {
        if self.verbose == 0 {
            configured
        } else {
            LogLevel::from_verbosity(self.verbose)
        }
    }

    /// Apply the command-line switches on top of the configured options.
    pub fn apply(&self, mut options: RunOptions, level: LogLevel) -> RunOptions {
        options.sync.verbose_stats = level.wants_stats();
        if self.verify {
            options.sync.verify_checksum = true;
        }
        if self.no_host_config {
            options.backup_host_config = false;
        }
        options
    }
}
