//! Generation rotation.
//!
//! Before any transfer starts, modules that disappeared from the configuration
//! are moved from `current/` into `previous/`. A module directory lives in
//! exactly one generation at rest: the stale archived copy is deleted just
//! before a move, and an already-moved module is skipped without touching its
//! archive.
//!
//! Every failure here is fatal to the run. A half-finished rotation would leave
//! module data that neither generation's config copy describes.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::RotationError;
use crate::layout::{BackupLayout, REPORT_FILE, REPORT_JSON_FILE};
use crate::module_set::ModuleSet;

/// What a reconciliation would do, computed without touching the disk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationPlan {
    /// False on a first run or when both module sets are identical
    pub rotate: bool,
    /// Modules named in the previous set but not in the current one
    pub missing: BTreeSet<String>,
}

/// What a reconciliation actually did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RotationOutcome {
    pub rotated: bool,
    /// Modules moved into the previous generation
    pub moved: Vec<String>,
    /// Missing modules with no directory left in the current generation
    pub skipped: Vec<String>,
}

/// Decide whether rotation is needed and which modules it archives.
pub fn plan_rotation(previous: Option<&ModuleSet>, current: &ModuleSet) -> RotationPlan {
    match previous {
        None => RotationPlan::default(),
        Some(previous) if previous == current => RotationPlan::default(),
        Some(previous) => RotationPlan {
            rotate: true,
            missing: previous.missing_from(current),
        },
    }
}

/// Reconcile the generations of `layout` against the two module sets.
///
/// `config_file` is the current run's configuration; it is archived into
/// `previous/` together with the last run's report artifacts.
pub fn reconcile(
    previous: Option<&ModuleSet>,
    current: &ModuleSet,
    layout: &BackupLayout,
    config_file: &Path,
) -> Result<RotationOutcome, RotationError> {
    let plan = plan_rotation(previous, current);
    if !plan.rotate {
        debug!("Module set unchanged, no rotation needed");
        return Ok(RotationOutcome::default());
    }

    let previous_dir = layout.previous_dir();
    fs::create_dir_all(previous_dir).map_err(|source| RotationError::CreateGeneration {
        path: previous_dir.to_path_buf(),
        source,
    })?;

    let mut outcome = RotationOutcome {
        rotated: true,
        ..RotationOutcome::default()
    };

    for module in &plan.missing {
        if archive_module(module, layout)? {
            outcome.moved.push(module.clone());
        } else {
            outcome.skipped.push(module.clone());
        }
    }

    archive_file(config_file, previous_dir)?;
    for name in [REPORT_FILE, REPORT_JSON_FILE] {
        let report = layout.current_dir().join(name);
        if report.is_file() {
            archive_file(&report, previous_dir)?;
        } else {
            warn!("No prior report at {}, nothing to archive", report.display());
        }
    }

    info!(
        "Rotation complete: {} module(s) archived, {} already absent",
        outcome.moved.len(),
        outcome.skipped.len()
    );
    Ok(outcome)
}

/// Move one module into the previous generation.
///
/// Returns `Ok(false)` when there is nothing left to move.
fn archive_module(module: &str, layout: &BackupLayout) -> Result<bool, RotationError> {
    let source = layout.current_dir().join(module);
    let target = layout.previous_dir().join(module);

    // An earlier interrupted run may already have moved it; the archive is
    // then the only copy and stays put
    if fs::symlink_metadata(&source).is_err() {
        info!("Module {} has no data in the current generation, skipping", module);
        return Ok(false);
    }

    if fs::symlink_metadata(&target).is_ok() {
        debug!("Removing stale archive {}", target.display());
        remove_path(&target).map_err(|source| RotationError::RemoveStale {
            module: module.to_string(),
            path: target.clone(),
            source,
        })?;
    }

    warn!("Moving missing module {} to the previous generation", module);
    move_dir(&source, &target, layout.previous_dir()).map_err(|message| RotationError::Move {
        module: module.to_string(),
        from: source.clone(),
        to: target.clone(),
        message,
    })?;
    Ok(true)
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
fn move_dir(source: &Path, target: &Path, target_parent: &Path) -> Result<(), String> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            debug!(
                "{} and {} are on different filesystems, copying",
                source.display(),
                target.display()
            );
            let mut options = fs_extra::dir::CopyOptions::new();
            options.overwrite = true;
            fs_extra::dir::move_dir(source, target_parent, &options)
                .map(|_| ())
                .map_err(|err| err.to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn archive_file(file: &Path, previous_dir: &Path) -> Result<(), RotationError> {
    let archive_error = |source| RotationError::Archive {
        path: file.to_path_buf(),
        source,
    };
    let name = file.file_name().ok_or_else(|| {
        archive_error(io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))
    })?;
    fs::copy(file, previous_dir.join(name)).map_err(archive_error)?;
    Ok(())
}
