//! Run report.
//!
//! Outcomes are collected into three buckets while the run progresses and
//! written once at the end, as `backup_report.log` for people and
//! `backup_report.json` for tooling. Rendering sorts every bucket, so the
//! artifacts do not depend on the order modules were processed in.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use tracing::info;

use crate::error::Result;
use crate::layout::BackupLayout;

/// Timestamp format of the trailing `# Date:` line.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const HEADER: &str = "Backup Report\n====================\n\n\n# Modules\n";

/// One line of a report bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportEntry {
    /// Module name or `user@host`
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub successful: Vec<ReportEntry>,
    pub failed: Vec<ReportEntry>,
    pub unreachable_hosts: Vec<ReportEntry>,
    pub timestamp: String,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    /// Empty report stamped with the local time.
    pub fn new() -> Self {
        Self::with_timestamp(Local::now().format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn with_timestamp(timestamp: impl Into<String>) -> Self {
        Self {
            successful: Vec::new(),
            failed: Vec::new(),
            unreachable_hosts: Vec::new(),
            timestamp: timestamp.into(),
        }
    }

    pub fn record_success(&mut self, module: impl Into<String>, detail: impl Into<String>) {
        self.successful.push(entry(module, detail));
    }

    pub fn record_failure(&mut self, module: impl Into<String>, detail: impl Into<String>) {
        self.failed.push(entry(module, detail));
    }

    pub fn record_unreachable(&mut self, host: impl Into<String>, detail: impl Into<String>) {
        self.unreachable_hosts.push(entry(host, detail));
    }

    /// True when nothing was recorded as failed or unreachable.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unreachable_hosts.is_empty()
    }

    /// Copy with every bucket sorted.
    pub fn sorted(&self) -> Self {
        let mut report = self.clone();
        report.successful.sort();
        report.failed.sort();
        report.unreachable_hosts.sort();
        report
    }

    /// Plain-text rendering written to `backup_report.log`.
    pub fn render(&self) -> String {
        let report = self.sorted();
        let mut out = String::from(HEADER);
        for (title, entries) in [
            ("Successful", &report.successful),
            ("Failed", &report.failed),
            ("Unreachable Hosts", &report.unreachable_hosts),
        ] {
            let _ = writeln!(out, "\n{title}:");
            if entries.is_empty() {
                out.push('\n');
            }
            for entry in entries {
                if entry.detail.is_empty() {
                    let _ = writeln!(out, "  - {}", entry.name);
                } else {
                    let _ = writeln!(out, "  - {}: {}", entry.name, entry.detail);
                }
            }
        }
        let _ = writeln!(out, "\n# Date: {}", report.timestamp);
        out
    }

    /// Replace both report artifacts in the current generation.
    pub fn write(&self, layout: &BackupLayout) -> Result<()> {
        fs::write(layout.report_path(), self.render())?;
        let json = serde_json::to_string_pretty(&self.sorted())?;
        fs::write(layout.report_json_path(), json)?;
        info!(
            "Report written to {} ({} ok, {} failed, {} unreachable)",
            layout.report_path().display(),
            self.successful.len(),
            self.failed.len(),
            self.unreachable_hosts.len()
        );
        Ok(())
    }
}

fn entry(name: impl Into<String>, detail: impl Into<String>) -> ReportEntry {
    ReportEntry {
        name: name.into(),
        detail: detail.into(),
    }
}
