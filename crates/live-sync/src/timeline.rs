//! Timeline materialization and follow-tail expansion.

use tracing::trace;

use crate::store::{StepHistory, StepHistoryEntry};

/// Distance from the newest entry, in pixels, still treated as "at the edge".
pub const NEAR_EDGE_PX: f64 = 64.0;

/// Step history sorted ascending by step number, one entry per step.
pub fn materialize(history: &StepHistory) -> Vec<StepHistoryEntry> {
    let mut entries: Vec<StepHistoryEntry> = history.iter().cloned().collect();
    entries.sort_by_key(|entry| entry.step_number);
    entries
}

/// Scroll geometry reported by the viewer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    pub offset: f64,
    pub viewport: f64,
    pub content: f64,
}

impl ScrollPosition {
    pub fn distance_from_edge(&self) -> f64 {
        (self.content - (self.offset + self.viewport)).max(0.0)
    }

    pub fn is_near_edge(&self) -> bool {
        self.distance_from_edge() <= NEAR_EDGE_PX
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineRow {
    pub entry: StepHistoryEntry,
    pub expanded: bool,
}

/// Tracks which single entry is expanded and whether it follows new steps.
#[derive(Debug, Clone)]
pub struct TimelineCursor {
    expanded: Option<u32>,
    follow_tail: bool,
    /// Newest step the cursor has auto-focused.
    focused_tail: Option<u32>,
}

impl Default for TimelineCursor {
    fn default() -> Self {
        Self {
            expanded: None,
            follow_tail: true,
            focused_tail: None,
        }
    }
}

impl TimelineCursor {
    /// Sorts the history and marks exactly one row expanded. Focus moves to
    /// the newest step only when one arrived since the last auto-focus.
    pub fn render(&mut self, history: &StepHistory) -> Vec<TimelineRow> {
        let entries = materialize(history);
        let latest = entries.last().map(|entry| entry.step_number);
        let newer = latest > self.focused_tail;
        if (self.follow_tail && newer) || self.expanded.is_none() {
            self.expanded = latest;
            self.focused_tail = latest;
        } else if let Some(step) = self.expanded {
            if !history.contains(step) {
                self.expanded = latest;
            }
        }
        let expanded = self.expanded;
        entries
            .into_iter()
            .map(|entry| TimelineRow {
                expanded: Some(entry.step_number) == expanded,
                entry,
            })
            .collect()
    }

    pub fn on_scroll(&mut self, position: ScrollPosition) {
        let follow = position.is_near_edge();
        if follow != self.follow_tail {
            trace!(
                target = "timeline",
                distance = position.distance_from_edge(),
                follow_tail = follow,
                "follow mode changed"
            );
        }
        self.follow_tail = follow;
    }

    /// Manual expansion by the viewer.
    pub fn expand(&mut self, step_number: u32) {
        self.expanded = Some(step_number);
    }

    pub fn expanded(&self) -> Option<u32> {
        self.expanded
    }

    pub fn is_following_tail(&self) -> bool {
        self.follow_tail
    }
}
