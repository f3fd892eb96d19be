//! Phase state machine
//!
//! One [`PhaseRun`] records one refresh attempt of one source. Each of its
//! three phases moves `pending -> running -> {completed | failed |
//! up-to-date | not-applicable}`; transitions that would move backwards or
//! skip an unfinished predecessor are refused unless forced.

use crate::error::{Result, UpdateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Extract,
    Transform,
    Load,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Extract, Phase::Transform, Phase::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Load => "load",
        }
    }

    pub fn predecessor(self) -> Option<Phase> {
        match self {
            Phase::Extract => None,
            Phase::Transform => Some(Phase::Extract),
            Phase::Load => Some(Phase::Transform),
        }
    }

    /// Phases strictly after this one
    pub fn later(self) -> impl Iterator<Item = Phase> {
        Phase::ALL.into_iter().filter(move |p| *p > self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    UpToDate,
    NotApplicable,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::UpToDate => "up-to-date",
            PhaseStatus::NotApplicable => "not-applicable",
        }
    }

    /// Output a successor phase may build on
    pub fn is_usable(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::UpToDate)
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, PhaseStatus::Pending | PhaseStatus::Running)
    }
}

impl From<String> for PhaseStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => PhaseStatus::Running,
            "completed" => PhaseStatus::Completed,
            "failed" => PhaseStatus::Failed,
            "up-to-date" => PhaseStatus::UpToDate,
            "not-applicable" => PhaseStatus::NotApplicable,
            _ => PhaseStatus::Pending,
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of a refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Pending,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hash: Option<String>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            started_at: None,
            ended_at: None,
            hash: None,
        }
    }
}

impl PhaseState {
    fn finish(&mut self, status: PhaseStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    fn reset(&mut self) {
        *self = PhaseState::default();
    }
}

/// Result of comparing a fresh extract hash with the last completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRun {
    /// Row id once persisted
    pub id: Option<i64>,
    pub source_id: i64,
    pub batch_id: Uuid,
    pub status: RunStatus,
    pub extract: PhaseState,
    pub transform: PhaseState,
    pub load: PhaseState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PhaseRun {
    pub fn new(source_id: i64, batch_id: Uuid) -> Self {
        Self {
            id: None,
            source_id,
            batch_id,
            status: RunStatus::Pending,
            extract: PhaseState::default(),
            transform: PhaseState::default(),
            load: PhaseState::default(),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn phase(&self, phase: Phase) -> &PhaseState {
        match phase {
            Phase::Extract => &self.extract,
            Phase::Transform => &self.transform,
            Phase::Load => &self.load,
        }
    }

    fn phase_mut(&mut self, phase: Phase) -> &mut PhaseState {
        match phase {
            Phase::Extract => &mut self.extract,
            Phase::Transform => &mut self.transform,
            Phase::Load => &mut self.load,
        }
    }

    pub fn status_of(&self, phase: Phase) -> PhaseStatus {
        self.phase(phase).status
    }

    /// The phase currently running, if any
    pub fn running_phase(&self) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|p| self.status_of(*p) == PhaseStatus::Running)
    }

    /// Move `phase` to running.
    ///
    /// Requires the predecessor to be completed or up-to-date and the phase
    /// itself to be pending; `force` lifts both checks.
    pub fn begin(&mut self, phase: Phase, force: bool) -> Result<()> {
        let current = self.status_of(phase);
        if !force {
            if let Some(prev) = phase.predecessor() {
                let prev_status = self.status_of(prev);
                if !prev_status.is_usable() {
                    return Err(UpdateError::InvalidTransition {
                        phase,
                        from: current,
                        to: PhaseStatus::Running,
                    });
                }
            }
            if current != PhaseStatus::Pending {
                return Err(UpdateError::InvalidTransition {
                    phase,
                    from: current,
                    to: PhaseStatus::Running,
                });
            }
        }

        let state = self.phase_mut(phase);
        state.status = PhaseStatus::Running;
        state.started_at = Some(Utc::now());
        state.ended_at = None;
        self.status = RunStatus::Running;
        Ok(())
    }

    fn require_running(&self, phase: Phase, to: PhaseStatus) -> Result<()> {
        let current = self.status_of(phase);
        if current != PhaseStatus::Running {
            return Err(UpdateError::InvalidTransition {
                phase,
                from: current,
                to,
            });
        }
        Ok(())
    }

    /// Finish the extract phase with its content hash.
    ///
    /// When `previous_hash` (the last completed run's extract hash) matches
    /// and the run is not forced, every phase becomes up-to-date and the run
    /// completes. Otherwise extract completes and transform/load go back to
    /// pending.
    pub fn complete_extract(
        &mut self,
        hash: String,
        previous_hash: Option<&str>,
        force: bool,
    ) -> Result<ExtractOutcome> {
        self.require_running(Phase::Extract, PhaseStatus::Completed)?;

        let unchanged = !force && previous_hash == Some(hash.as_str());
        self.extract.hash = Some(hash);

        if unchanged {
            self.extract.finish(PhaseStatus::UpToDate);
            for phase in Phase::Extract.later() {
                let state = self.phase_mut(phase);
                state.reset();
                state.finish(PhaseStatus::UpToDate);
            }
            self.status = RunStatus::Completed;
            Ok(ExtractOutcome::Unchanged)
        } else {
            self.extract.finish(PhaseStatus::Completed);
            for phase in Phase::Extract.later() {
                self.phase_mut(phase).reset();
            }
            Ok(ExtractOutcome::Changed)
        }
    }

    /// Finish a running transform or load phase
    pub fn complete(&mut self, phase: Phase, hash: Option<String>) -> Result<()> {
        self.require_running(phase, PhaseStatus::Completed)?;
        let state = self.phase_mut(phase);
        state.hash = hash;
        state.finish(PhaseStatus::Completed);
        if phase == Phase::Load {
            self.status = RunStatus::Completed;
        }
        Ok(())
    }

    /// Mark everything after `phase` not-applicable: the pipeline stops here
    /// without an error (e.g. download-only runs). The run stays pending so
    /// it never serves as a completed reference.
    pub fn stop_after(&mut self, phase: Phase) {
        for later in phase.later() {
            self.phase_mut(later).finish(PhaseStatus::NotApplicable);
        }
        if self.status == RunStatus::Running {
            self.status = RunStatus::Pending;
        }
    }

    /// Fail `phase` and the run. Later phases have nothing to build on and
    /// become not-applicable.
    pub fn fail(&mut self, phase: Phase, message: impl Into<String>) {
        self.phase_mut(phase).finish(PhaseStatus::Failed);
        for later in phase.later() {
            if !self.status_of(later).is_finished() {
                self.phase_mut(later).finish(PhaseStatus::NotApplicable);
            }
        }
        self.status = RunStatus::Failed;
        self.error = Some(message.into());
    }

    /// Fail whichever phase was in flight, or the first unfinished one
    pub fn fail_current(&mut self, message: impl Into<String>) -> Phase {
        let phase = self
            .running_phase()
            .or_else(|| {
                Phase::ALL
                    .into_iter()
                    .find(|p| !self.status_of(*p).is_finished())
            })
            .unwrap_or(Phase::Load);
        self.fail(phase, message);
        phase
    }

    /// Re-mark a run whose writes were discarded by an aborted refresh
    pub fn abort(&mut self, message: impl Into<String>) {
        self.id = None;
        for phase in Phase::ALL {
            if self.status_of(phase) == PhaseStatus::Running {
                self.phase_mut(phase).finish(PhaseStatus::Failed);
            }
        }
        self.status = RunStatus::Failed;
        self.error = Some(message.into());
    }

    pub fn is_up_to_date(&self) -> bool {
        self.extract.status == PhaseStatus::UpToDate
    }
}
