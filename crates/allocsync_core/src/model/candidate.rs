//! Candidate row with six ranked preference slots.

use super::{require_id, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Number of ranked preference slots per candidate (`pref_1..pref_6`).
pub const PREFERENCE_SLOTS: usize = 6;

/// Canonical candidate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub student_id: String,
    /// Geography used for region sharding. `None` keeps the row master-only.
    pub state: Option<String>,
    /// Reservation category (`GEN|OBC|SC|ST`), not enforced.
    pub reservation: Option<String>,
    /// Ranked internship references; index 0 is `pref_1`.
    pub preferences: [Option<String>; PREFERENCE_SLOTS],
    pub revision: i64,
}

impl Candidate {
    pub fn new(student_id: impl Into<String>, state: Option<&str>) -> Self {
        Self {
            student_id: student_id.into(),
            state: state.map(str::to_string),
            reservation: None,
            preferences: Default::default(),
            revision: 0,
        }
    }

    /// Replaces the ranked preference list; extra entries beyond six are dropped.
    pub fn with_preferences<I, S>(mut self, prefs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferences = Default::default();
        for (slot, pref) in self.preferences.iter_mut().zip(prefs) {
            *slot = Some(pref.into());
        }
        self
    }

    /// Distinct non-blank internship ids referenced by this candidate.
    ///
    /// Duplicates across slots collapse to one entry.
    pub fn preference_ids(&self) -> BTreeSet<&str> {
        self.preferences
            .iter()
            .flatten()
            .map(|pref| pref.trim())
            .filter(|pref| !pref.is_empty())
            .collect()
    }

    /// Blank preference slots are stored as NULL.
    pub fn normalize(&mut self) {
        for slot in self.preferences.iter_mut() {
            let normalized = slot
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            *slot = normalized;
        }
        if matches!(&self.state, Some(state) if state.trim().is_empty()) {
            self.state = None;
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_id("student_id", &self.student_id)
    }
}
