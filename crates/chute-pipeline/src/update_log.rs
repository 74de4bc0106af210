//! Read-only view of every update the manager has accepted.
//!
//! The worker writes; HTTP handlers and other read consumers take
//! snapshots without coordinating with it.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::update::{UpdateClass, UpdateOutcome, UpdateState, UpdateType};

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub id: u64,
    pub tok: u64,
    pub class: UpdateClass,
    #[serde(rename = "type")]
    pub kind: UpdateType,
    pub name: Option<String>,
    pub state: UpdateState,
    pub progress: Vec<String>,
    pub success: Option<bool>,
    pub message: Option<String>,
}

#[derive(Clone, Default)]
pub struct UpdateLog {
    entries: Arc<DashMap<u64, UpdateSummary>>,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, summary: UpdateSummary) {
        self.entries.insert(summary.id, summary);
    }

    pub fn get(&self, id: u64) -> Option<UpdateSummary> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// All summaries, oldest first.
    pub fn list(&self) -> Vec<UpdateSummary> {
        let mut all: Vec<UpdateSummary> = self.entries.iter().map(|e| e.clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn append_progress(&self, id: u64, message: &str) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.progress.push(message.to_string());
        }
    }

    pub(crate) fn set_state(&self, id: u64, state: UpdateState) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.state = state;
        }
    }

    pub(crate) fn finish(&self, id: u64, outcome: &UpdateOutcome) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.state = outcome.state;
            entry.success = Some(outcome.success);
            entry.message = Some(outcome.message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: u64) -> UpdateSummary {
        UpdateSummary {
            id,
            tok: id,
            class: UpdateClass::Chute,
            kind: UpdateType::Start,
            name: Some("x".into()),
            state: UpdateState::Queued,
            progress: Vec::new(),
            success: None,
            message: None,
        }
    }

    #[test]
    fn tracks_lifecycle() {
        let log = UpdateLog::new();
        log.insert(summary(2));
        log.insert(summary(1));
        log.append_progress(1, "planning");
        log.set_state(1, UpdateState::Executing);
        log.finish(
            1,
            &UpdateOutcome {
                id: 1,
                tok: 1,
                state: UpdateState::Succeeded,
                success: true,
                message: "done".into(),
                progress: Vec::new(),
            },
        );

        let all = log.list();
        assert_eq!(all.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(all[0].progress, vec!["planning"]);
        assert_eq!(all[0].state, UpdateState::Succeeded);
        assert_eq!(all[0].success, Some(true));
        assert!(log.get(3).is_none());
    }
}
