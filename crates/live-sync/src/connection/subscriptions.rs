use std::collections::BTreeSet;

/// Study ids the client wants to hear about.
///
/// `active` ids have been sent to the server on the current socket;
/// `pending` ids are waiting for the socket to open. An id is in at most one
/// of the two sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    active: BTreeSet<String>,
    pending: BTreeSet<String>,
}

impl SubscriptionSet {
    /// Records interest in `study_id`. Returns true when a subscribe message
    /// must be sent right now.
    pub fn insert(&mut self, study_id: &str, open: bool) -> bool {
        if self.contains(study_id) {
            return false;
        }
        if open {
            self.active.insert(study_id.to_owned());
            true
        } else {
            self.pending.insert(study_id.to_owned());
            false
        }
    }

    /// Forgets `study_id`. Returns true when the server had been told about
    /// it and should be notified.
    pub fn remove(&mut self, study_id: &str) -> bool {
        self.pending.remove(study_id);
        self.active.remove(study_id)
    }

    pub fn contains(&self, study_id: &str) -> bool {
        self.active.contains(study_id) || self.pending.contains(study_id)
    }

    /// The socket went away: everything active must be replayed on reopen.
    pub fn suspend(&mut self) {
        let active = std::mem::take(&mut self.active);
        self.pending.extend(active);
    }

    /// Moves every pending id to active, returning the ids to send.
    pub fn flush(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        let ids: Vec<String> = pending.into_iter().collect();
        self.active.extend(ids.iter().cloned());
        ids
    }

    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }
}
