use std::collections::HashMap;
use std::time::SystemTime;

use serde::Serialize;

use crate::protocol::{Action, StepUpdate};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepHistoryEntry {
    pub step_number: u32,
    /// Timestamp as reported by the backend, if any.
    pub timestamp: Option<String>,
    pub received_at: SystemTime,
    pub think_aloud: Option<String>,
    pub screenshot_url: Option<String>,
    pub emotional_state: Option<String>,
    pub action: Option<Action>,
    pub task_progress: Option<f64>,
}

impl StepHistoryEntry {
    pub fn from_update(step: &StepUpdate) -> Self {
        Self {
            step_number: step.step_number,
            timestamp: step.timestamp.clone(),
            received_at: SystemTime::now(),
            think_aloud: step.think_aloud.clone(),
            screenshot_url: step.screenshot_url.clone(),
            emotional_state: step.emotional_state.clone(),
            action: step.action.clone(),
            task_progress: step.task_progress,
        }
    }
}

/// Append-only step log of one session, keyed by step number.
///
/// Storage is unordered; ordering is a presentation concern handled by
/// [`crate::timeline`].
#[derive(Debug, Clone, Default)]
pub struct StepHistory {
    entries: HashMap<u32, StepHistoryEntry>,
}

impl StepHistory {
    /// Accepts the entry unless its step number is already present.
    pub fn insert(&mut self, entry: StepHistoryEntry) -> bool {
        if self.entries.contains_key(&entry.step_number) {
            return false;
        }
        self.entries.insert(entry.step_number, entry);
        true
    }

    pub fn contains(&self, step_number: u32) -> bool {
        self.entries.contains_key(&step_number)
    }

    pub fn get(&self, step_number: u32) -> Option<&StepHistoryEntry> {
        self.entries.get(&step_number)
    }

    pub fn latest_step(&self) -> Option<u32> {
        self.entries.keys().copied().max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepHistoryEntry> {
        self.entries.values()
    }
}
