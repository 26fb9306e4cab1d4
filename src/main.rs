//! rsync-generations - main entry point

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rsync_generations::cli::{Cli, Commands};
use rsync_generations::orchestrator::{self, BackupOrchestrator, RunOptions};
use rsync_generations::process_guard::{self, CancelToken};
use rsync_generations::runner::RsyncRunner;
use rsync_generations::types::LogLevel;
use rsync_generations::BackupConfig;

/// Initialize tracing; `RUST_LOG` overrides `level` when set.
fn init_logger(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    // The config decides the log level, so a load failure is reported at INFO
    let loaded = BackupConfig::load_from_file(&cli.config);
    let configured = loaded
        .as_ref()
        .map(|config| config.settings.log_level)
        .unwrap_or_default();
    let level = cli.log_level(configured);
    init_logger(level);

    let config = loaded
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    debug!("Configuration loaded from {}", config.path.display());
    let options = cli.apply(RunOptions::from_config(&config), level);

    match cli.command() {
        Commands::Validate => {
            info!("Configuration {} is valid", config.path.display());
            println!("✓ Configuration file is valid: {}", config.path.display());
            println!("  backup directory: {}", config.settings.backup_directory.display());
            for (name, host) in config.modules.iter() {
                println!("  {name}: {}", host.remote(&host.source_path));
            }
        }
        Commands::Plan => {
            let plan = orchestrator::plan(&config, options).context("Failed to build plan")?;
            print!("{plan}");
        }
        Commands::Run => {
            let token = CancelToken::global();
            if let Err(e) = process_guard::init_signal_handlers(token.clone()) {
                warn!("Failed to initialize signal handlers: {}", e);
            }

            let summary = BackupOrchestrator::new(config, RsyncRunner::new())
                .with_options(options)
                .with_cancel_token(token)
                .run()
                .context("Backup run failed")?;

            if summary.cancelled {
                warn!("Run was cancelled, remaining modules are listed as failed");
            }
            println!(
                "Backup finished: {} succeeded, {} failed, {} unreachable host(s)",
                summary.report.successful.len(),
                summary.report.failed.len(),
                summary.report.unreachable_hosts.len()
            );
        }
    }

    Ok(())
}
