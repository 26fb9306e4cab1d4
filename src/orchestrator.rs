//! Backup run coordination.
//!
//! `BackupOrchestrator::run` drives one pass through the `RunStage` machine:
//! rotate generations, pull every module, pull host configuration, persist the
//! configuration copy, write the report. Only setup and rotation failures
//! abort the run; a failed transfer becomes a report entry.

use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::command::{build, Invocation, SyncOptions};
use crate::config_file::{load_previous_modules, BackupConfig};
use crate::error::{Result, TransferError};
use crate::host_config::{backup_host, distinct_hosts, host_invocations};
use crate::layout::BackupLayout;
use crate::module_set::{HostDescriptor, ModuleSet};
use crate::process_guard::CancelToken;
use crate::report::RunReport;
use crate::rotation::{plan_rotation, reconcile, RotationOutcome, RotationPlan};
use crate::run_state::{RunContext, RunStage};
use crate::runner::SyncRunner;

/// Switches for one run, derived from the settings block and CLI overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub sync: SyncOptions,
    pub backup_host_config: bool,
}

impl RunOptions {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            sync: SyncOptions {
                verbose_stats: config.settings.log_level.wants_stats(),
                verify_checksum: config.settings.verify_backup,
            },
            backup_host_config: config.settings.backup_host_config,
        }
    }
}

/// Result of a run that reached `ReportWritten`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: RunReport,
    pub rotation: RotationOutcome,
    /// A cancellation request arrived before every transfer was started
    pub cancelled: bool,
    /// Time spent in each stage up to `Done`
    pub stage_timings: Vec<(RunStage, chrono::Duration)>,
}

pub struct BackupOrchestrator<R: SyncRunner> {
    config: BackupConfig,
    layout: BackupLayout,
    runner: R,
    options: RunOptions,
    cancel: CancelToken,
    context: RunContext,
}

impl<R: SyncRunner> BackupOrchestrator<R> {
    pub fn new(config: BackupConfig, runner: R) -> Self {
        let options = RunOptions::from_config(&config);
        Self {
            layout: BackupLayout::new(&config.settings.backup_directory),
            config,
            runner,
            options,
            cancel: CancelToken::new(),
            context: RunContext::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `token` to stop the run from starting further transfers.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute the run. On error the context is left in `Failed` and no
    /// report is written, unless the error came from persisting the config
    /// copy, which is reported after the report.
    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_stages();
        if let Err(e) = &result {
            error!("Backup run aborted during {}: {}", self.context.current_stage(), e);
            let _ = self.context.fail();
        }
        result
    }

    fn run_stages(&mut self) -> Result<RunSummary> {
        info!(
            "Starting backup of {} module(s) into {}",
            self.config.modules.len(),
            self.layout.root().display()
        );
        if self.options.sync.verify_checksum {
            warn!("Checksum verification is enabled, transfers will take considerably longer");
        }

        self.layout.ensure_base()?;
        let previous = load_previous_modules(&self.layout.config_copy(self.config.file_name()))?;
        if previous.is_none() {
            info!("No previous configuration copy found, first run for this backup root");
        }

        self.context.transition_to(RunStage::Rotating)?;
        let rotation = reconcile(
            previous.as_ref(),
            &self.config.modules,
            &self.layout,
            &self.config.path,
        )?;
        self.layout.ensure_current()?;

        self.context.transition_to(RunStage::TransferringModules)?;
        let mut report = RunReport::new();
        let attempted = self.transfer_modules(&mut report);

        if self.options.backup_host_config {
            self.context.transition_to(RunStage::BackingUpHostConfigs)?;
            self.backup_host_configs(&attempted, &mut report);
        }

        self.context.transition_to(RunStage::PersistingConfig)?;
        let persisted = self.persist_config();
        if let Err(e) = &persisted {
            error!("Could not persist the configuration copy: {}", e);
        }

        self.context.transition_to(RunStage::ReportWritten)?;
        report.write(&self.layout)?;
        persisted?;

        self.context.transition_to(RunStage::Done)?;
        let stage_timings = self.context.stage_timings();
        for (stage, took) in &stage_timings {
            debug!("{}: {} ms", stage.description(), took.num_milliseconds());
        }
        let elapsed = self.context.elapsed().num_seconds();
        if report.is_clean() {
            info!(
                "Backup finished in {}s, all {} module(s) succeeded",
                elapsed,
                report.successful.len()
            );
        } else {
            warn!(
                "Backup finished in {}s with {} failed module(s) and {} unreachable host(s)",
                elapsed,
                report.failed.len(),
                report.unreachable_hosts.len()
            );
        }

        Ok(RunSummary {
            report,
            rotation,
            cancelled: self.cancel.is_cancelled(),
            stage_timings,
        })
    }

    /// Pull every module, returning the hosts of those actually attempted.
    fn transfer_modules(&self, report: &mut RunReport) -> Vec<HostDescriptor> {
        let mut attempted = Vec::new();
        for (name, host) in self.config.modules.iter() {
            if self.cancel.is_cancelled() {
                let err = TransferError::cancelled();
                warn!("Module {}: {}", name, err.message);
                report.record_failure(name, format!("{}: {}", host.source_path, err.message));
                continue;
            }

            let invocation = module_invocation(
                &self.layout,
                &self.config.settings.rsync_binary,
                name,
                host,
                self.options.sync,
            );
            info!("Backing up module {} from {}", name, host.remote(&host.source_path));
            attempted.push(host.clone());

            match self.runner.execute(&invocation) {
                Ok(()) => {
                    info!("Module {} backed up", name);
                    report.record_success(name, host.source_path.as_str());
                }
                Err(e) => {
                    error!("Module {} failed: {} [{}]", name, e, invocation);
                    report.record_failure(name, format!("{}: {}", host.source_path, e.summary()));
                }
            }
        }
        attempted
    }

    fn backup_host_configs(&self, attempted: &[HostDescriptor], report: &mut RunReport) {
        for (key, host) in distinct_hosts(attempted) {
            if self.cancel.is_cancelled() {
                warn!("Skipping host configuration of {}: run cancelled", key);
                continue;
            }
            if let Err(e) = backup_host(
                &self.runner,
                &host,
                &self.layout,
                &self.config.settings.rsync_binary,
                self.options.sync,
            ) {
                error!("Host {} unreachable: {}", key, e);
                report.record_unreachable(key.to_string(), e.summary());
            }
        }
    }

    /// Copy the configuration into the current generation for the next run.
    fn persist_config(&self) -> Result<()> {
        let target = self.layout.config_copy(self.config.file_name());
        if same_file(&self.config.path, &target) {
            return Ok(());
        }
        fs::copy(&self.config.path, &target)?;
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Invocation pulling module `name` into the current generation.
pub fn module_invocation(
    layout: &BackupLayout,
    program: &str,
    name: &str,
    host: &HostDescriptor,
    options: SyncOptions,
) -> Invocation {
    build(
        program,
        host.remote(&host.source_path),
        layout.module_dir(name),
        layout.module_log(name),
        options,
    )
}

/// What a run would do, computed without touching the backup root.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub root: std::path::PathBuf,
    pub first_run: bool,
    pub rotation: RotationPlan,
    pub modules: Vec<(String, Invocation)>,
    pub hosts: Vec<(String, Invocation)>,
}

/// Build the plan for `config` under `options`.
pub fn plan(config: &BackupConfig, options: RunOptions) -> Result<RunPlan> {
    let layout = BackupLayout::new(&config.settings.backup_directory);
    let previous: Option<ModuleSet> =
        load_previous_modules(&layout.config_copy(config.file_name()))?;
    let program = config.settings.rsync_binary.as_str();

    let modules = config
        .modules
        .iter()
        .map(|(name, host)| {
            (
                name.to_string(),
                module_invocation(&layout, program, name, host, options.sync),
            )
        })
        .collect();

    let hosts = if options.backup_host_config {
        distinct_hosts(config.modules.iter().map(|(_, host)| host))
            .into_iter()
            .flat_map(|(key, host)| {
                host_invocations(&host, &layout, program, options.sync)
                    .into_iter()
                    .map(move |invocation| (key.to_string(), invocation))
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(RunPlan {
        root: layout.root().to_path_buf(),
        first_run: previous.is_none(),
        rotation: plan_rotation(previous.as_ref(), &config.modules),
        modules,
        hosts,
    })
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backup root: {}", self.root.display())?;
        if self.first_run {
            writeln!(f, "Rotation: none (first run)")?;
        } else if !self.rotation.rotate {
            writeln!(f, "Rotation: none (module set unchanged)")?;
        } else if self.rotation.missing.is_empty() {
            writeln!(f, "Rotation: module set changed, nothing to archive")?;
        } else {
            writeln!(f, "Rotation: archive into previous/")?;
            for module in &self.rotation.missing {
                writeln!(f, "  - {module}")?;
            }
        }

        writeln!(f, "\nModules:")?;
        for (name, invocation) in &self.modules {
            writeln!(f, "  {name}: {invocation}")?;
        }

        if !self.hosts.is_empty() {
            writeln!(f, "\nHost configuration:")?;
            for (host, invocation) in &self.hosts {
                writeln!(f, "  {host}: {invocation}")?;
            }
        }
        Ok(())
    }
}
