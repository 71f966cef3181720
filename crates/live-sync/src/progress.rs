//! Study-level progress derived from the per-session view models.

use serde::{Deserialize, Serialize};

use crate::protocol::{SessionStatus, StudyStatus};
use crate::store::SessionView;

/// Visual ceiling of the running phase; the rest is reserved for analysis.
pub const RUNNING_CEILING: f64 = 80.0;
/// Fixed percent shown while the backend analyzes finished sessions.
pub const ANALYZING_PERCENT: u8 = 90;
/// Fixed percent shown while insights are synthesized.
pub const SYNTHESIZING_PERCENT: u8 = 95;
/// An in-flight session never contributes more than this.
pub const IN_FLIGHT_CAP: f64 = 0.95;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyPhase {
    #[default]
    None,
    Running,
    Analyzing,
    Synthesizing,
    Complete,
    Failed,
}

impl StudyPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StudyPhase::Complete | StudyPhase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            StudyPhase::None => 0,
            StudyPhase::Running => 1,
            StudyPhase::Analyzing => 2,
            StudyPhase::Synthesizing => 3,
            StudyPhase::Complete | StudyPhase::Failed => 4,
        }
    }

    /// Transition table of the phase machine.
    ///
    /// Forward moves only. `Failed` is reachable from every non-terminal
    /// phase, including `None` (a study that fails before any session ran)
    /// and `Synthesizing`.
    pub fn can_advance_to(self, next: StudyPhase) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            StudyPhase::Failed => matches!(
                self,
                StudyPhase::None
                    | StudyPhase::Running
                    | StudyPhase::Analyzing
                    | StudyPhase::Synthesizing
            ),
            _ => next.rank() > self.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StudyPhase::None => "none",
            StudyPhase::Running => "running",
            StudyPhase::Analyzing => "analyzing",
            StudyPhase::Synthesizing => "synthesizing",
            StudyPhase::Complete => "complete",
            StudyPhase::Failed => "failed",
        }
    }
}

impl From<StudyStatus> for StudyPhase {
    fn from(status: StudyStatus) -> Self {
        match status {
            StudyStatus::Pending => StudyPhase::None,
            StudyStatus::Running => StudyPhase::Running,
            StudyStatus::Analyzing => StudyPhase::Analyzing,
            StudyStatus::Synthesizing => StudyPhase::Synthesizing,
            StudyStatus::Complete => StudyPhase::Complete,
            StudyStatus::Failed => StudyPhase::Failed,
        }
    }
}

/// Contribution of one session to the running-phase percent, in `0.0..=1.0`.
pub fn session_contribution(session: &SessionView, max_steps: u32) -> f64 {
    if session.completed || session.status.is_terminal() {
        return 1.0;
    }
    if max_steps == 0 {
        return 0.0;
    }
    (f64::from(session.step_number) / f64::from(max_steps)).min(IN_FLIGHT_CAP)
}

/// Running-phase percent: `round(80 * Σcontribution / N)`.
pub fn running_percent<'a>(
    sessions: impl IntoIterator<Item = &'a SessionView>,
    max_steps: u32,
) -> u8 {
    let (count, sum) = sessions
        .into_iter()
        .fold((0usize, 0.0f64), |(count, sum), session| {
            (count + 1, sum + session_contribution(session, max_steps))
        });
    if count == 0 {
        return 0;
    }
    (RUNNING_CEILING * sum / count as f64).round().clamp(0.0, 100.0) as u8
}

/// Overall percent for a phase, before the monotonic floor is applied.
pub fn overall_percent<'a>(
    phase: StudyPhase,
    sessions: impl IntoIterator<Item = &'a SessionView>,
    max_steps: u32,
) -> u8 {
    match phase {
        StudyPhase::Complete => 100,
        StudyPhase::Failed => 0,
        StudyPhase::Synthesizing => SYNTHESIZING_PERCENT,
        StudyPhase::Analyzing => ANALYZING_PERCENT,
        StudyPhase::None | StudyPhase::Running => running_percent(sessions, max_steps),
    }
}

/// Tracks the last shown percent so it never moves backwards while the study
/// is still running. Terminal phases bypass the floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PercentFloor {
    floor: u8,
}

impl PercentFloor {
    pub fn apply(&mut self, phase: StudyPhase, computed: u8) -> u8 {
        if phase.is_terminal() {
            return computed;
        }
        self.floor = self.floor.max(computed);
        self.floor
    }

    pub fn value(&self) -> u8 {
        self.floor
    }
}

/// Session status after a step or progress update, given the current one.
pub(crate) fn running_status(current: SessionStatus) -> SessionStatus {
    if current.is_terminal() {
        current
    } else {
        SessionStatus::Running
    }
}
