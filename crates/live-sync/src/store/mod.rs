//! Live state reconciler.
//!
//! Push events and poll snapshots for one study are merged here into one view
//! model per session. Push data always wins: every field written by a push
//! event is stamped with a sequence number and snapshot data can only fill
//! fields that carry no stamp. All mutation goes through this type; observers
//! get read-only [`StudyView`]s and [`StoreChange`] notifications.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::TerminalStudyError;
use crate::progress::{PercentFloor, StudyPhase, overall_percent};
use crate::protocol::{
    LiveViewUpdate, ProgressUpdate, PushEvent, SessionCompletion, SessionPatch, SessionRecord,
    SessionStatus, StepUpdate, StudyRecord,
};
use crate::timeline;

mod history;
mod session;

pub use history::{StepHistory, StepHistoryEntry};
pub use session::{PatchStats, SessionField, SessionView};

use session::{SessionSlot, clamp_progress};

/// Why an input left the store untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No study has been initialized.
    NoStudy,
    /// The input belongs to a different study than the current one.
    OtherStudy,
    /// The study already completed or failed.
    StudyTerminal,
    /// The session already completed; step and progress reports are rejected.
    SessionCompleted,
    /// A step with this number was already accepted for the session.
    DuplicateStep,
    /// The input carried nothing new.
    Unchanged,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IgnoreReason::NoStudy => "no_study",
            IgnoreReason::OtherStudy => "other_study",
            IgnoreReason::StudyTerminal => "study_terminal",
            IgnoreReason::SessionCompleted => "session_completed",
            IgnoreReason::DuplicateStep => "duplicate_step",
            IgnoreReason::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Ignored(IgnoreReason),
}

impl EventOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, EventOutcome::Applied)
    }
}

/// Summary of one snapshot merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Sessions that had no local state before this snapshot.
    pub hydrated: usize,
    pub fields_written: usize,
    /// Snapshot values dropped because push data already owns the field.
    pub stale_fields: usize,
}

/// Notification delivered to listeners after a mutation, outside the lock.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    StudyInitialized { study_id: String },
    SessionUpdated { session_id: String },
    StepAppended { session_id: String, step_number: u32 },
    StudyUpdated { phase: StudyPhase, percent: u8 },
    Reset,
}

/// Read-only derived view of the current study.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudyView {
    pub study_id: Option<String>,
    pub phase: StudyPhase,
    pub percent: u8,
    pub score: Option<f64>,
    pub error: Option<TerminalStudyError>,
    pub max_steps: u32,
    /// Sorted by session id.
    pub sessions: Vec<SessionView>,
}

impl StudyView {
    pub fn session(&self, session_id: &str) -> Option<&SessionView> {
        self.sessions.iter().find(|s| s.session_id == session_id)
    }
}

type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

struct StoreInner {
    state: RwLock<StoreState>,
    listeners: Mutex<Listeners>,
}

struct StoreState {
    study_id: Option<String>,
    default_max_steps: u32,
    max_steps: u32,
    phase: StudyPhase,
    floor: PercentFloor,
    percent: u8,
    score: Option<f64>,
    error: Option<TerminalStudyError>,
    sessions: HashMap<String, SessionSlot>,
    seq: u64,
}

impl StoreState {
    fn new(max_steps: u32) -> Self {
        Self {
            study_id: None,
            default_max_steps: max_steps,
            max_steps,
            phase: StudyPhase::None,
            floor: PercentFloor::default(),
            percent: 0,
            score: None,
            error: None,
            sessions: HashMap::new(),
            seq: 0,
        }
    }

    fn check_epoch(&self, study_id: &str) -> Result<(), IgnoreReason> {
        match self.study_id.as_deref() {
            None => Err(IgnoreReason::NoStudy),
            Some(current) if current != study_id => Err(IgnoreReason::OtherStudy),
            Some(_) => Ok(()),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn slot(&mut self, session_id: &str) -> &mut SessionSlot {
        self.sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| SessionSlot::new(session_id))
    }

    fn advance_phase(&mut self, next: StudyPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            return false;
        }
        debug!(
            target = "store",
            from = self.phase.as_str(),
            to = next.as_str(),
            "study phase advanced"
        );
        self.phase = next;
        true
    }

    /// Recomputes the visible percent. Returns a change notification when
    /// either the phase or the percent moved.
    fn refresh(&mut self, phase_before: StudyPhase) -> Option<StoreChange> {
        let percent_before = self.percent;
        let computed = overall_percent(
            self.phase,
            self.sessions.values().map(|slot| &slot.view),
            self.max_steps,
        );
        if !phase_before.is_terminal() {
            self.percent = self.floor.apply(self.phase, computed);
        }
        if self.phase != phase_before || self.percent != percent_before {
            Some(StoreChange::StudyUpdated {
                phase: self.phase,
                percent: self.percent,
            })
        } else {
            None
        }
    }

    fn view(&self) -> StudyView {
        let mut sessions: Vec<SessionView> =
            self.sessions.values().map(|slot| slot.view.clone()).collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        StudyView {
            study_id: self.study_id.clone(),
            phase: self.phase,
            percent: self.percent,
            score: self.score,
            error: self.error.clone(),
            max_steps: self.max_steps,
            sessions,
        }
    }

    fn merge_patches<'a>(
        &mut self,
        patches: impl IntoIterator<Item = (&'a str, &'a SessionPatch)>,
        changes: &mut Vec<StoreChange>,
    ) -> SnapshotOutcome {
        let mut outcome = SnapshotOutcome::default();
        for (session_id, patch) in patches {
            let hydrating = !self.sessions.contains_key(session_id);
            if hydrating {
                outcome.hydrated += 1;
            }
            let slot = self.slot(session_id);
            let stats = slot.apply_snapshot(patch);
            outcome.fields_written += stats.written;
            outcome.stale_fields += stats.stale;
            if stats.stale > 0 {
                trace!(
                    target = "store",
                    session_id = %session_id,
                    stale = stats.stale,
                    "snapshot fields already owned by push data"
                );
            }
            if hydrating || stats.changed() {
                changes.push(StoreChange::SessionUpdated {
                    session_id: session_id.to_owned(),
                });
            }
        }
        outcome
    }
}

/// Handle to the reconciled state of one study. Cloning shares the state.
#[derive(Clone)]
pub struct LiveStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for LiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("LiveStore")
            .field("study_id", &state.study_id)
            .field("phase", &state.phase)
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

impl LiveStore {
    /// `max_steps` is the configured step budget used until a study object
    /// reports its own.
    pub fn new(max_steps: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState::new(max_steps)),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    /// Starts a new study epoch with an empty, non-terminal session map.
    pub fn init_study(&self, study_id: impl Into<String>) {
        let study_id = study_id.into();
        {
            let mut state = self.inner.state.write();
            let max_steps = state.default_max_steps;
            *state = StoreState::new(max_steps);
            state.study_id = Some(study_id.clone());
        }
        debug!(target = "store", study_id = %study_id, "study initialized");
        self.notify(vec![StoreChange::StudyInitialized { study_id }]);
    }

    /// Drops every session and the study itself.
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.write();
            let max_steps = state.default_max_steps;
            *state = StoreState::new(max_steps);
        }
        self.notify(vec![StoreChange::Reset]);
    }

    /// Applies one push event.
    pub fn handle_event(&self, event: PushEvent) -> EventOutcome {
        let kind = event.kind();
        let mut changes = Vec::new();
        let outcome = {
            let mut state = self.inner.state.write();
            let phase_before = state.phase;
            match apply_event(&mut state, event, &mut changes) {
                Ok(()) => {
                    // study-level events only move the phase; refresh reports it
                    changes.extend(state.refresh(phase_before));
                    if changes.is_empty() {
                        EventOutcome::Ignored(IgnoreReason::Unchanged)
                    } else {
                        EventOutcome::Applied
                    }
                }
                Err(reason) => EventOutcome::Ignored(reason),
            }
        };
        match outcome {
            EventOutcome::Applied => trace!(target = "store", event = kind, "event applied"),
            EventOutcome::Ignored(reason) => debug!(
                target = "store",
                event = kind,
                reason = reason.as_str(),
                "event ignored"
            ),
        }
        self.notify(changes);
        outcome
    }

    /// Merges a `live-state` poll snapshot with hydration semantics.
    pub fn apply_snapshot(
        &self,
        study_id: &str,
        sessions: &HashMap<String, SessionPatch>,
    ) -> Result<SnapshotOutcome, IgnoreReason> {
        self.merge(study_id, sessions.iter().map(|(id, patch)| (id.as_str(), patch)))
    }

    /// Merges the `sessions` poll list with hydration semantics.
    pub fn apply_session_list(
        &self,
        study_id: &str,
        records: &[SessionRecord],
    ) -> Result<SnapshotOutcome, IgnoreReason> {
        self.merge(
            study_id,
            records.iter().map(|record| (record.id.as_str(), &record.fields)),
        )
    }

    /// Applies the polled study object: step budget, phase, score and error.
    pub fn apply_study(&self, record: &StudyRecord) -> Result<bool, IgnoreReason> {
        let mut changes = Vec::new();
        {
            let mut state = self.inner.state.write();
            state.check_epoch(&record.id)?;
            if state.phase.is_terminal() {
                return Err(IgnoreReason::StudyTerminal);
            }
            let phase_before = state.phase;
            if let Some(max_steps) = record.max_steps.filter(|steps| *steps > 0) {
                state.max_steps = max_steps;
            }
            let next = StudyPhase::from(record.status);
            if state.advance_phase(next) {
                finish_study(&mut state, record.score, record.error.clone());
            }
            changes.extend(state.refresh(phase_before));
        }
        let changed = !changes.is_empty();
        self.notify(changes);
        Ok(changed)
    }

    pub fn view(&self) -> StudyView {
        self.inner.state.read().view()
    }

    pub fn study_id(&self) -> Option<String> {
        self.inner.state.read().study_id.clone()
    }

    pub fn phase(&self) -> StudyPhase {
        self.inner.state.read().phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionView> {
        self.inner
            .state
            .read()
            .sessions
            .get(session_id)
            .map(|slot| slot.view.clone())
    }

    /// Step history of a session, sorted ascending by step number.
    pub fn timeline(&self, session_id: &str) -> Option<Vec<StepHistoryEntry>> {
        self.inner
            .state
            .read()
            .sessions
            .get(session_id)
            .map(|slot| timeline::materialize(&slot.history))
    }

    /// Sequence stamp of the last push write to a session field.
    pub fn push_stamp(&self, session_id: &str, field: SessionField) -> Option<u64> {
        self.inner
            .state
            .read()
            .sessions
            .get(session_id)
            .and_then(|slot| slot.push_stamp(field))
    }

    /// Registers a change listener. Dropping the guard unsubscribes it.
    pub fn subscribe<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(listener)));
        ListenerGuard {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    fn merge<'a>(
        &self,
        study_id: &str,
        patches: impl IntoIterator<Item = (&'a str, &'a SessionPatch)>,
    ) -> Result<SnapshotOutcome, IgnoreReason> {
        let mut changes = Vec::new();
        let outcome = {
            let mut state = self.inner.state.write();
            state.check_epoch(study_id)?;
            let phase_before = state.phase;
            let outcome = state.merge_patches(patches, &mut changes);
            changes.extend(state.refresh(phase_before));
            outcome
        };
        debug!(
            target = "store",
            study_id = %study_id,
            hydrated = outcome.hydrated,
            written = outcome.fields_written,
            stale = outcome.stale_fields,
            "snapshot merged"
        );
        self.notify(changes);
        Ok(outcome)
    }

    fn notify(&self, changes: Vec<StoreChange>) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for change in &changes {
            for listener in &listeners {
                listener(change);
            }
        }
    }
}

/// Keeps a store listener registered for as long as it lives.
#[must_use = "dropping the guard unsubscribes the listener"]
pub struct ListenerGuard {
    id: u64,
    store: Weak<StoreInner>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.listeners.lock().entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn apply_event(
    state: &mut StoreState,
    event: PushEvent,
    changes: &mut Vec<StoreChange>,
) -> Result<(), IgnoreReason> {
    state.check_epoch(event.study_id())?;

    if let PushEvent::SessionSnapshot(snapshot) = &event {
        // snapshots hydrate even after the study finished
        state.merge_patches(
            snapshot.sessions.iter().map(|(id, patch)| (id.as_str(), patch)),
            changes,
        );
        return Ok(());
    }
    if state.phase.is_terminal() {
        return Err(IgnoreReason::StudyTerminal);
    }

    match event {
        PushEvent::StudyProgress(update) => apply_progress(state, update, changes),
        PushEvent::SessionStep(step) => apply_step(state, step, changes),
        PushEvent::SessionComplete(done) => apply_completion(state, done, changes),
        PushEvent::SessionLiveView(view) => apply_live_view(state, view, changes),
        PushEvent::BrowserClosed(session) => {
            let seq = state.next_seq();
            let slot = state.slot(&session.session_id);
            let mut changed = slot.push(SessionField::BrowserActive, seq, false, |v| {
                &mut v.browser_active
            });
            changed |= slot.push(SessionField::ScreencastAvailable, seq, false, |v| {
                &mut v.screencast_available
            });
            if changed {
                changes.push(StoreChange::SessionUpdated {
                    session_id: session.session_id,
                });
            }
            Ok(())
        }
        PushEvent::StudyAnalyzing(_) => {
            state.advance_phase(StudyPhase::Analyzing);
            Ok(())
        }
        PushEvent::StudyComplete(done) => {
            if state.advance_phase(StudyPhase::Complete) {
                finish_study(state, done.score, None);
            }
            Ok(())
        }
        PushEvent::StudyError(failure) => {
            if state.advance_phase(StudyPhase::Failed) {
                finish_study(state, None, Some(failure.error));
            }
            Ok(())
        }
        PushEvent::SessionSnapshot(_) => Ok(()),
    }
}

fn finish_study(state: &mut StoreState, score: Option<f64>, error: Option<String>) {
    match state.phase {
        StudyPhase::Complete => state.score = score.or(state.score),
        StudyPhase::Failed => {
            let study_id = state.study_id.clone().unwrap_or_default();
            state.error = Some(TerminalStudyError {
                study_id,
                message: error.unwrap_or_else(|| "study failed".to_string()),
            });
        }
        _ => {}
    }
}

fn apply_progress(
    state: &mut StoreState,
    update: ProgressUpdate,
    changes: &mut Vec<StoreChange>,
) -> Result<(), IgnoreReason> {
    if state.sessions.get(&update.session_id).is_some_and(|s| s.view.completed) {
        return Err(IgnoreReason::SessionCompleted);
    }
    let seq = state.next_seq();
    let slot = state.slot(&update.session_id);
    let mut changed = false;

    if let Some(step) = update.step_number {
        let step = step.max(slot.view.step_number);
        changed |= slot.push(SessionField::StepNumber, seq, step, |v| &mut v.step_number);
    }
    if let Some(total) = update.total_steps {
        changed |= slot.push(SessionField::TotalSteps, seq, Some(total), |v| &mut v.total_steps);
    }
    if let Some(progress) = update.task_progress {
        changed |= slot.push(
            SessionField::TaskProgress,
            seq,
            clamp_progress(progress),
            |v| &mut v.task_progress,
        );
    }
    if let Some(emotion) = update.emotional_state {
        changed |= slot.push(SessionField::EmotionalState, seq, Some(emotion), |v| {
            &mut v.emotional_state
        });
    }
    match update.status {
        Some(status) => {
            changed |= slot.push(SessionField::Status, seq, status, |v| &mut v.status);
            if status.is_terminal() {
                changed |= slot.push(SessionField::Completed, seq, true, |v| &mut v.completed);
            }
        }
        None => changed |= slot.push_running(seq),
    }

    if changed {
        changes.push(StoreChange::SessionUpdated {
            session_id: update.session_id,
        });
    }
    state.advance_phase(StudyPhase::Running);
    Ok(())
}

fn apply_step(
    state: &mut StoreState,
    step: StepUpdate,
    changes: &mut Vec<StoreChange>,
) -> Result<(), IgnoreReason> {
    if let Some(slot) = state.sessions.get(&step.session_id) {
        if slot.view.completed {
            return Err(IgnoreReason::SessionCompleted);
        }
        if slot.history.contains(step.step_number) {
            return Err(IgnoreReason::DuplicateStep);
        }
    }
    let seq = state.next_seq();
    let slot = state.slot(&step.session_id);
    slot.history.insert(StepHistoryEntry::from_update(&step));
    changes.push(StoreChange::StepAppended {
        session_id: step.session_id.clone(),
        step_number: step.step_number,
    });

    // a late, reordered step only lands in the history
    if step.step_number >= slot.view.step_number {
        slot.push(SessionField::StepNumber, seq, step.step_number, |v| {
            &mut v.step_number
        });
        if let Some(thought) = step.think_aloud {
            slot.push(SessionField::ThinkAloud, seq, Some(thought), |v| &mut v.think_aloud);
        }
        if let Some(url) = step.screenshot_url {
            slot.push(SessionField::ScreenshotUrl, seq, Some(url), |v| &mut v.screenshot_url);
        }
        if let Some(emotion) = step.emotional_state {
            slot.push(SessionField::EmotionalState, seq, Some(emotion), |v| {
                &mut v.emotional_state
            });
        }
        if let Some(action) = step.action {
            slot.push(SessionField::Action, seq, Some(action), |v| &mut v.action);
        }
        if let Some(progress) = step.task_progress {
            slot.push(
                SessionField::TaskProgress,
                seq,
                clamp_progress(progress),
                |v| &mut v.task_progress,
            );
        }
        if let Some(total) = step.total_steps {
            slot.push(SessionField::TotalSteps, seq, Some(total), |v| &mut v.total_steps);
        }
        slot.push_running(seq);
        changes.push(StoreChange::SessionUpdated {
            session_id: step.session_id,
        });
    }
    state.advance_phase(StudyPhase::Running);
    Ok(())
}

fn apply_completion(
    state: &mut StoreState,
    done: SessionCompletion,
    changes: &mut Vec<StoreChange>,
) -> Result<(), IgnoreReason> {
    if state.sessions.get(&done.session_id).is_some_and(|s| s.view.completed) {
        return Err(IgnoreReason::SessionCompleted);
    }
    let seq = state.next_seq();
    let slot = state.slot(&done.session_id);
    let status = if done.success {
        SessionStatus::Complete
    } else {
        SessionStatus::Failed
    };
    let total = done.total_steps.unwrap_or(slot.view.step_number);
    slot.push(SessionField::Completed, seq, true, |v| &mut v.completed);
    slot.push(SessionField::Status, seq, status, |v| &mut v.status);
    slot.push(SessionField::TotalSteps, seq, Some(total), |v| &mut v.total_steps);
    changes.push(StoreChange::SessionUpdated {
        session_id: done.session_id,
    });
    state.advance_phase(StudyPhase::Running);
    Ok(())
}

fn apply_live_view(
    state: &mut StoreState,
    view: LiveViewUpdate,
    changes: &mut Vec<StoreChange>,
) -> Result<(), IgnoreReason> {
    if state.sessions.get(&view.session_id).is_some_and(|s| s.view.completed) {
        return Err(IgnoreReason::SessionCompleted);
    }
    let seq = state.next_seq();
    let slot = state.slot(&view.session_id);
    let mut changed = slot.push(SessionField::BrowserActive, seq, true, |v| {
        &mut v.browser_active
    });
    changed |= slot.push(SessionField::ScreencastAvailable, seq, view.screencast, |v| {
        &mut v.screencast_available
    });
    if let Some(url) = view.live_view_url {
        changed |= slot.push(SessionField::LiveViewUrl, seq, Some(url), |v| &mut v.live_view_url);
    }
    if changed {
        changes.push(StoreChange::SessionUpdated {
            session_id: view.session_id,
        });
    }
    Ok(())
}
