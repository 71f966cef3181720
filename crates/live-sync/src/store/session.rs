use std::collections::HashMap;

use serde::Serialize;

use super::history::StepHistory;
use crate::progress::running_status;
use crate::protocol::{Action, SessionPatch, SessionStatus};

/// View model of one persona session, as rendered by the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub persona_name: Option<String>,
    pub status: SessionStatus,
    pub step_number: u32,
    pub total_steps: Option<u32>,
    /// Task completion estimate, `0.0..=100.0`.
    pub task_progress: f64,
    pub emotional_state: Option<String>,
    pub action: Option<Action>,
    pub think_aloud: Option<String>,
    pub screenshot_url: Option<String>,
    pub live_view_url: Option<String>,
    pub browser_active: bool,
    pub screencast_available: bool,
    pub completed: bool,
}

impl SessionView {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            persona_name: None,
            status: SessionStatus::Pending,
            step_number: 0,
            total_steps: None,
            task_progress: 0.0,
            emotional_state: None,
            action: None,
            think_aloud: None,
            screenshot_url: None,
            live_view_url: None,
            browser_active: false,
            screencast_available: false,
            completed: false,
        }
    }

    /// Whether a screencast pipeline should be running for this session.
    pub fn wants_screencast(&self) -> bool {
        self.browser_active && self.screencast_available && !self.completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    PersonaName,
    Status,
    StepNumber,
    TotalSteps,
    TaskProgress,
    EmotionalState,
    Action,
    ThinkAloud,
    ScreenshotUrl,
    LiveViewUrl,
    BrowserActive,
    ScreencastAvailable,
    Completed,
}

/// Result of merging a snapshot patch into one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub written: usize,
    /// Fields skipped because a push update already owns them.
    pub stale: usize,
}

impl PatchStats {
    pub fn changed(&self) -> bool {
        self.written > 0
    }
}

/// Session state plus the provenance bookkeeping that enforces "push wins".
///
/// Every field written by the push channel is stamped with the store's
/// sequence number. Snapshot data may only fill fields without a stamp.
#[derive(Debug, Clone)]
pub(crate) struct SessionSlot {
    pub(crate) view: SessionView,
    pub(crate) history: StepHistory,
    stamps: HashMap<SessionField, u64>,
}

impl SessionSlot {
    pub(crate) fn new(session_id: &str) -> Self {
        Self {
            view: SessionView::new(session_id),
            history: StepHistory::default(),
            stamps: HashMap::new(),
        }
    }

    pub(crate) fn push_stamp(&self, field: SessionField) -> Option<u64> {
        self.stamps.get(&field).copied()
    }

    /// Push write: unconditional, stamped.
    pub(crate) fn push<T: PartialEq>(
        &mut self,
        field: SessionField,
        seq: u64,
        value: T,
        target: impl FnOnce(&mut SessionView) -> &mut T,
    ) -> bool {
        self.stamps.insert(field, seq);
        assign(target(&mut self.view), value)
    }

    /// Push write of a status that follows a step/progress report.
    pub(crate) fn push_running(&mut self, seq: u64) -> bool {
        let status = running_status(self.view.status);
        self.push(SessionField::Status, seq, status, |v| &mut v.status)
    }

    pub(crate) fn apply_snapshot(&mut self, patch: &SessionPatch) -> PatchStats {
        let mut stats = PatchStats::default();

        self.fill(&mut stats, SessionField::PersonaName, patch.persona_name.clone().map(Some), |v| {
            &mut v.persona_name
        });
        if !self.view.completed {
            self.fill(&mut stats, SessionField::Status, patch.status, |v| &mut v.status);
        }
        if let Some(step) = patch.step_number {
            // a snapshot never rewinds the step counter, stamped or not
            let step = step.max(self.view.step_number);
            self.fill(&mut stats, SessionField::StepNumber, Some(step), |v| &mut v.step_number);
        }
        if !self.view.completed {
            self.fill(&mut stats, SessionField::TotalSteps, patch.total_steps.map(Some), |v| {
                &mut v.total_steps
            });
        }
        self.fill(
            &mut stats,
            SessionField::TaskProgress,
            patch.task_progress.map(clamp_progress),
            |v| &mut v.task_progress,
        );
        self.fill(&mut stats, SessionField::EmotionalState, patch.emotional_state.clone().map(Some), |v| {
            &mut v.emotional_state
        });
        self.fill(&mut stats, SessionField::Action, patch.action.clone().map(Some), |v| &mut v.action);
        self.fill(&mut stats, SessionField::ThinkAloud, patch.think_aloud.clone().map(Some), |v| {
            &mut v.think_aloud
        });
        self.fill(&mut stats, SessionField::ScreenshotUrl, patch.screenshot_url.clone().map(Some), |v| {
            &mut v.screenshot_url
        });
        self.fill(&mut stats, SessionField::LiveViewUrl, patch.live_view_url.clone().map(Some), |v| {
            &mut v.live_view_url
        });
        self.fill(&mut stats, SessionField::BrowserActive, patch.browser_active, |v| {
            &mut v.browser_active
        });
        self.fill(
            &mut stats,
            SessionField::ScreencastAvailable,
            patch.screencast_available,
            |v| &mut v.screencast_available,
        );

        let finished = patch.completed == Some(true)
            || patch.status.is_some_and(SessionStatus::is_terminal);
        if finished && !self.view.completed {
            self.view.completed = true;
            stats.written += 1;
            // completion outranks a pushed running status
            let status = patch
                .status
                .filter(|status| status.is_terminal())
                .unwrap_or(SessionStatus::Complete);
            if assign(&mut self.view.status, status) {
                stats.written += 1;
            }
        }
        stats
    }

    fn fill<T: PartialEq>(
        &mut self,
        stats: &mut PatchStats,
        field: SessionField,
        value: Option<T>,
        target: impl FnOnce(&mut SessionView) -> &mut T,
    ) {
        let Some(value) = value else {
            return;
        };
        if self.stamps.contains_key(&field) {
            let unchanged = *target(&mut self.view) == value;
            if !unchanged {
                stats.stale += 1;
            }
            return;
        }
        if assign(target(&mut self.view), value) {
            stats.written += 1;
        }
    }
}

pub(crate) fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_fills_unstamped_fields_only() {
        let mut slot = SessionSlot::new("s-1");
        slot.push(SessionField::EmotionalState, 1, Some("frustrated".to_string()), |v| {
            &mut v.emotional_state
        });

        let stats = slot.apply_snapshot(&SessionPatch {
            emotional_state: Some("delighted".into()),
            think_aloud: Some("Looking for checkout".into()),
            ..SessionPatch::default()
        });

        assert_eq!(slot.view.emotional_state.as_deref(), Some("frustrated"));
        assert_eq!(slot.view.think_aloud.as_deref(), Some("Looking for checkout"));
        assert_eq!(stats, PatchStats { written: 1, stale: 1 });
    }

    #[test]
    fn snapshot_never_rewinds_step_number() {
        let mut slot = SessionSlot::new("s-1");
        slot.apply_snapshot(&SessionPatch {
            step_number: Some(12),
            ..SessionPatch::default()
        });
        let stats = slot.apply_snapshot(&SessionPatch {
            step_number: Some(8),
            ..SessionPatch::default()
        });
        assert_eq!(slot.view.step_number, 12);
        assert!(!stats.changed());
    }

    #[test]
    fn terminal_snapshot_marks_session_completed_once() {
        let mut slot = SessionSlot::new("s-1");
        let stats = slot.apply_snapshot(&SessionPatch {
            status: Some(SessionStatus::Complete),
            ..SessionPatch::default()
        });
        assert!(slot.view.completed);
        assert_eq!(stats.written, 2);

        slot.apply_snapshot(&SessionPatch {
            status: Some(SessionStatus::Running),
            completed: Some(false),
            ..SessionPatch::default()
        });
        assert!(slot.view.completed);
        assert_eq!(slot.view.status, SessionStatus::Complete);
    }

    #[test]
    fn snapshot_completion_overrides_pushed_running_status() {
        let mut slot = SessionSlot::new("s-1");
        slot.push(SessionField::StepNumber, 1, 3, |v| &mut v.step_number);
        slot.push_running(1);
        assert_eq!(slot.view.status, SessionStatus::Running);

        let stats = slot.apply_snapshot(&SessionPatch {
            status: Some(SessionStatus::Complete),
            ..SessionPatch::default()
        });
        assert!(slot.view.completed);
        assert_eq!(slot.view.status, SessionStatus::Complete);
        assert_eq!(stats, PatchStats { written: 2, stale: 1 });

        let mut failed = SessionSlot::new("s-2");
        failed.push_running(1);
        failed.apply_snapshot(&SessionPatch {
            completed: Some(true),
            ..SessionPatch::default()
        });
        assert_eq!(failed.view.status, SessionStatus::Complete);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(clamp_progress(140.0), 100.0);
        assert_eq!(clamp_progress(-3.0), 0.0);
        assert_eq!(clamp_progress(f64::NAN), 0.0);
    }
}
