//! Backup run state machine
//!
//! `RunContext` is the single owner of a run's progress. Transitions are
//! forward-only, one stage at a time, and a finished or failed run cannot be
//! resumed.
//!
//! # Stage Flow
//!
//! ```text
//! Initializing
//!     ↓
//! Rotating
//!     ↓
//! TransferringModules
//!     ↓
//! BackingUpHostConfigs   (optional, may be skipped)
//!     ↓
//! PersistingConfig
//!     ↓
//! ReportWritten
//!     ↓
//! Done
//!
//! (Any stage can transition to Failed)
//! ```

use chrono::{DateTime, Duration, Local};
use std::fmt;
use thiserror::Error;

/// Stages of one backup run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RunStage {
    /// Layout resolved, directories created, module sets loaded
    Initializing = 0,

    /// Archiving modules that left the configuration
    Rotating = 1,

    /// One rsync per configured module
    TransferringModules = 2,

    /// `/etc` and dotfiles per distinct host
    BackingUpHostConfigs = 3,

    /// Copying the configuration into the current generation
    PersistingConfig = 4,

    /// Report artifacts written
    ReportWritten = 5,

    /// Run finished (terminal state)
    Done = 6,

    /// Run aborted by a fatal error (terminal state)
    Failed = 255,
}

impl RunStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true for `Done` and `Failed`
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Stages a run may pass over without entering
    #[inline]
    pub const fn is_optional(self) -> bool {
        matches!(self, Self::BackingUpHostConfigs)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Initializing => Some(Self::Rotating),
            Self::Rotating => Some(Self::TransferringModules),
            Self::TransferringModules => Some(Self::BackingUpHostConfigs),
            Self::BackingUpHostConfigs => Some(Self::PersistingConfig),
            Self::PersistingConfig => Some(Self::ReportWritten),
            Self::ReportWritten => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Rotating => "Rotating generations",
            Self::TransferringModules => "Transferring modules",
            Self::BackingUpHostConfigs => "Backing up host configuration",
            Self::PersistingConfig => "Persisting configuration",
            Self::ReportWritten => "Report written",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }

    /// All stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Initializing,
            Self::Rotating,
            Self::TransferringModules,
            Self::BackingUpHostConfigs,
            Self::PersistingConfig,
            Self::ReportWritten,
            Self::Done,
        ]
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTransitionError {
    /// Attempted to skip a mandatory stage
    #[error("Cannot skip from {from} to {to}")]
    SkippedStage { from: RunStage, to: RunStage },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition { from: RunStage, to: RunStage },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: RunStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: RunStage },
}

/// Progress of one backup run.
#[derive(Debug, Clone)]
pub struct RunContext {
    current: RunStage,
    failed_at: Option<RunStage>,
    /// Every stage entered, starting with `Initializing`, and when
    stage_history: Vec<(RunStage, DateTime<Local>)>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            current: RunStage::Initializing,
            failed_at: None,
            stage_history: vec![(RunStage::Initializing, Local::now())],
        }
    }

    #[inline]
    pub fn current_stage(&self) -> RunStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<RunStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.current == RunStage::Done
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == RunStage::Failed
    }

    pub fn stage_history(&self) -> &[(RunStage, DateTime<Local>)] {
        &self.stage_history
    }

    /// Time spent in each stage that has been left, in the order entered.
    ///
    /// The current stage is not included.
    pub fn stage_timings(&self) -> Vec<(RunStage, Duration)> {
        self.stage_history
            .windows(2)
            .map(|pair| (pair[0].0, pair[1].1 - pair[0].1))
            .collect()
    }

    /// Wall-clock time since the run was created.
    pub fn elapsed(&self) -> Duration {
        Local::now() - self.stage_history[0].1
    }

    /// Move to `target`, which must be the next stage or the one after an
    /// optional next stage.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if current is `Done` or `Failed`
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if a mandatory stage would be skipped, or target is `Failed`
    pub fn transition_to(&mut self, target: RunStage) -> Result<RunStage, StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }

        if target == self.current {
            return Err(StageTransitionError::AlreadyAtStage { stage: target });
        }

        // Failed is entered through fail()
        if target == RunStage::Failed {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        if target.order() < self.current.order() {
            return Err(StageTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        let reachable = match self.current.next() {
            Some(next) if next == target => true,
            Some(next) if next.is_optional() => next.next() == Some(target),
            _ => false,
        };
        if !reachable {
            return Err(StageTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        self.enter(target);
        Ok(target)
    }

    /// Mark the run as failed at its current stage.
    pub fn fail(&mut self) -> Result<(), StageTransitionError> {
        if self.current.is_terminal() {
            return Err(StageTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.enter(RunStage::Failed);
        Ok(())
    }

    fn enter(&mut self, stage: RunStage) {
        tracing::debug!("Run stage: {} -> {}", self.current, stage);
        self.stage_history.push((stage, Local::now()));
        self.current = stage;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // RunStage Tests
    // =========================================================================

    #[test]
    fn test_stage_order_is_sequential() {
        for (i, stage) in RunStage::all_stages().iter().enumerate() {
            assert_eq!(stage.order() as usize, i, "Stage {:?} should have order {}", stage, i);
        }
    }

    #[test]
    fn test_stage_next_forms_chain() {
        let mut current = RunStage::Initializing;
        let mut count = 0;
        while let Some(next) = current.next() {
            current = next;
            count += 1;
            assert!(count < 20, "Infinite loop detected in stage chain");
        }
        assert_eq!(current, RunStage::Done);
        assert_eq!(count, 6);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStage::Done.is_terminal());
        assert!(RunStage::Failed.is_terminal());
        assert!(!RunStage::ReportWritten.is_terminal());
    }

    #[test]
    fn test_only_host_configs_optional() {
        for stage in RunStage::all_stages() {
            assert_eq!(stage.is_optional(), *stage == RunStage::BackingUpHostConfigs);
        }
    }

    // =========================================================================
    // RunContext Tests
    // =========================================================================

    /// Walk the full sequence including the optional stage
    fn run_to_done(ctx: &mut RunContext) {
        for stage in &RunStage::all_stages()[1..] {
            ctx.transition_to(*stage).unwrap();
        }
    }

    #[test]
    fn test_transition_through_all_stages() {
        let mut ctx = RunContext::new();
        run_to_done(&mut ctx);
        assert!(ctx.is_done());
        assert_eq!(ctx.stage_history().len(), 7);
        assert_eq!(ctx.stage_history()[0].0, RunStage::Initializing);
    }

    #[test]
    fn test_stage_timings_cover_left_stages() {
        let mut ctx = RunContext::new();
        ctx.transition_to(RunStage::Rotating).unwrap();
        ctx.transition_to(RunStage::TransferringModules).unwrap();
        ctx.transition_to(RunStage::PersistingConfig).unwrap();

        let timings = ctx.stage_timings();
        let stages: Vec<RunStage> = timings.iter().map(|(stage, _)| *stage).collect();
        assert_eq!(
            stages,
            vec![
                RunStage::Initializing,
                RunStage::Rotating,
                RunStage::TransferringModules
            ]
        );
        assert!(timings.iter().all(|(_, took)| *took >= Duration::zero()));
        assert!(ctx.elapsed() >= Duration::zero());
    }

    #[test]
    fn test_cannot_skip_mandatory_stage() {
        let mut ctx = RunContext::new();
        let err = ctx.transition_to(RunStage::TransferringModules).unwrap_err();
        assert!(matches!(err, StageTransitionError::SkippedStage { .. }));
    }

    #[test]
    fn test_can_skip_host_configs() {
        let mut ctx = RunContext::new();
        ctx.transition_to(RunStage::Rotating).unwrap();
        ctx.transition_to(RunStage::TransferringModules).unwrap();
        ctx.transition_to(RunStage::PersistingConfig).unwrap();
        assert_eq!(ctx.current_stage(), RunStage::PersistingConfig);
    }

    #[test]
    fn test_cannot_go_backwards() {
        let mut ctx = RunContext::new();
        ctx.transition_to(RunStage::Rotating).unwrap();
        ctx.transition_to(RunStage::TransferringModules).unwrap();
        let err = ctx.transition_to(RunStage::Rotating).unwrap_err();
        assert!(matches!(err, StageTransitionError::BackwardTransition { .. }));
    }

    #[test]
    fn test_cannot_transition_to_same_stage() {
        let mut ctx = RunContext::new();
        let err = ctx.transition_to(RunStage::Initializing).unwrap_err();
        assert!(matches!(err, StageTransitionError::AlreadyAtStage { .. }));
    }

    #[test]
    fn test_failed_only_via_fail() {
        let mut ctx = RunContext::new();
        let err = ctx.transition_to(RunStage::Failed).unwrap_err();
        assert!(matches!(err, StageTransitionError::SkippedStage { .. }));
    }

    #[test]
    fn test_fail_records_stage() {
        let mut ctx = RunContext::new();
        ctx.transition_to(RunStage::Rotating).unwrap();
        ctx.fail().unwrap();
        assert!(ctx.is_failed());
        assert_eq!(ctx.failed_at(), Some(RunStage::Rotating));
        assert!(matches!(
            ctx.transition_to(RunStage::TransferringModules).unwrap_err(),
            StageTransitionError::FromTerminalState { .. }
        ));
    }

    #[test]
    fn test_cannot_fail_after_done() {
        let mut ctx = RunContext::new();
        run_to_done(&mut ctx);
        assert!(matches!(
            ctx.fail().unwrap_err(),
            StageTransitionError::FromTerminalState { .. }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = StageTransitionError::SkippedStage {
            from: RunStage::Initializing,
            to: RunStage::ReportWritten,
        };
        assert_eq!(err.to_string(), "Cannot skip from Initializing to Report written");
    }
}
