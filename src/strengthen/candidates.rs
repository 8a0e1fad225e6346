//! Password rows and their improved candidates
//!
//! The store is observable: every change publishes a fresh snapshot on a
//! `tokio::sync::watch` channel so front ends can render without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

/// Progress of a row's improvement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "at", rename_all = "lowercase")]
pub enum RowState {
    Idle,
    /// Queued behind other rows
    Waiting,
    Generating,
    Success(DateTime<Utc>),
}

/// One generated replacement for a password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    pub value: String,
    pub score: u8,
    pub is_selected: bool,
}

/// A password being strengthened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRow {
    pub id: Uuid,
    pub original: String,
    /// `None` until scoring finishes
    pub score: Option<u8>,
    /// Value of the selected candidate
    pub current_improved: Option<String>,
    pub state: RowState,
    pub candidates: Vec<Candidate>,
}

impl PasswordRow {
    fn new(original: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            original,
            score: None,
            current_improved: None,
            state: RowState::Idle,
            candidates: Vec::new(),
        }
    }

    pub fn selected(&self) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.is_selected)
    }
}

/// Observable list of password rows
#[derive(Debug)]
pub struct CandidateStore {
    rows: watch::Sender<Vec<PasswordRow>>,
}

impl Default for CandidateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateStore {
    pub fn new() -> Self {
        let (rows, _) = watch::channel(Vec::new());
        Self { rows }
    }

    /// Replaces all rows with fresh, unscored rows for `originals`
    pub fn set_initial<I, S>(&self, originals: I) -> Vec<Uuid>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rows: Vec<PasswordRow> = originals.into_iter().map(|o| PasswordRow::new(o.into())).collect();
        let ids = rows.iter().map(|r| r.id).collect();
        self.rows.send_replace(rows);
        ids
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PasswordRow>> {
        self.rows.subscribe()
    }

    pub fn rows(&self) -> Vec<PasswordRow> {
        self.rows.borrow().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<PasswordRow> {
        self.rows.borrow().iter().find(|r| r.id == id).cloned()
    }

    fn update_row(&self, id: Uuid, f: impl FnOnce(&mut PasswordRow)) -> bool {
        self.rows.send_if_modified(|rows| match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                f(row);
                true
            }
            None => false,
        })
    }

    pub fn set_score(&self, id: Uuid, score: u8) -> bool {
        self.update_row(id, |row| row.score = Some(score))
    }

    pub fn set_state(&self, id: Uuid, state: RowState) -> bool {
        self.update_row(id, |row| row.state = state)
    }

    /// Appends a candidate and makes it the only selected one
    pub fn add_candidate_and_select(&self, id: Uuid, value: impl Into<String>, score: u8) -> Option<Uuid> {
        let candidate = Candidate {
            id: Uuid::new_v4(),
            value: value.into(),
            score,
            is_selected: true,
        };
        let candidate_id = candidate.id;
        let updated = self.update_row(id, |row| {
            for c in &mut row.candidates {
                c.is_selected = false;
            }
            row.current_improved = Some(candidate.value.clone());
            row.candidates.push(candidate);
        });
        updated.then_some(candidate_id)
    }

    /// Selects one candidate of a row. Unknown candidate ids leave the row unchanged.
    pub fn select_candidate(&self, id: Uuid, candidate_id: Uuid) -> bool {
        self.update_row(id, |row| {
            if !row.candidates.iter().any(|c| c.id == candidate_id) {
                return;
            }
            for c in &mut row.candidates {
                c.is_selected = c.id == candidate_id;
            }
            row.current_improved = row.selected().map(|c| c.value.clone());
        })
    }
}
