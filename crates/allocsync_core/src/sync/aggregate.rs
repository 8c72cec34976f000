//! Exact maintenance of `internships.preference_count`.
//!
//! # Responsibility
//! - Derive the internships touched by one candidate change.
//! - Recount each from master truth and persist the result.
//!
//! # Invariants
//! - Counts are recomputed, never adjusted by deltas, so repeated or
//!   concurrent recomputes converge to the exact value.
//! - Recomputes for one internship id are serialized through [`KeyedLocks`]
//!   and run inside an IMMEDIATE transaction.
//! - A failed recompute does not undo the candidate write; it is reported and
//!   later surfaced by the audit's stale-aggregate check.

use crate::model::candidate::Candidate;
use crate::repo::master_repo::{count_preferring, write_preference_count, CountWrite};
use crate::repo::RepoResult;
use crate::sync::locks::KeyedLocks;
use log::{error, info};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateUpdate {
    pub internship_id: String,
    pub preference_count: u32,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecomputeFailure {
    pub internship_id: String,
    pub error: String,
}

/// Per-id results of one recompute batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateReport {
    pub updated: Vec<AggregateUpdate>,
    pub unchanged: Vec<String>,
    /// Referenced ids with no master internship row.
    pub missing: Vec<String>,
    pub failures: Vec<RecomputeFailure>,
}

impl AggregateReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Union of internship ids referenced by the old and new preference sets.
pub fn affected_internships(
    previous: Option<&Candidate>,
    current: Option<&Candidate>,
) -> BTreeSet<String> {
    previous
        .into_iter()
        .chain(current)
        .flat_map(|candidate| candidate.preference_ids())
        .map(str::to_string)
        .collect()
}

pub struct AggregateMaintainer<'conn> {
    conn: &'conn Connection,
    locks: Arc<KeyedLocks>,
}

impl<'conn> AggregateMaintainer<'conn> {
    /// `locks` must be shared by every maintainer writing the same store.
    pub fn new(conn: &'conn Connection, locks: Arc<KeyedLocks>) -> Self {
        Self { conn, locks }
    }

    /// Recounts every internship referenced before or after a candidate change.
    ///
    /// Called after the candidate write committed.
    pub fn on_candidate_change(
        &self,
        previous: Option<&Candidate>,
        current: Option<&Candidate>,
    ) -> AggregateReport {
        let affected = affected_internships(previous, current);
        self.recompute(affected.iter().map(String::as_str))
    }

    /// Recounts the given internships in ascending id order.
    pub fn recompute<'a>(&self, internship_ids: impl IntoIterator<Item = &'a str>) -> AggregateReport {
        let ordered: BTreeSet<&str> = internship_ids.into_iter().collect();
        let mut report = AggregateReport::default();
        for internship_id in ordered {
            match self.recompute_one(internship_id) {
                Ok((count, CountWrite::Updated(revision))) => {
                    report.updated.push(AggregateUpdate {
                        internship_id: internship_id.to_string(),
                        preference_count: count,
                        revision,
                    });
                }
                Ok((_, CountWrite::Unchanged)) => report.unchanged.push(internship_id.to_string()),
                Ok((_, CountWrite::Missing)) => report.missing.push(internship_id.to_string()),
                Err(err) => {
                    error!(
                        "event=aggregate_recompute module=sync status=error internship_id={internship_id} error={err}"
                    );
                    report.failures.push(RecomputeFailure {
                        internship_id: internship_id.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Recounts every master internship.
    pub fn recompute_all(&self) -> RepoResult<AggregateReport> {
        let mut stmt = self
            .conn
            .prepare("SELECT internship_id FROM internships ORDER BY internship_id ASC;")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let report = self.recompute(ids.iter().map(String::as_str));
        info!(
            "event=aggregate_recompute_all module=sync status={} scanned={} updated={} failed={}",
            if report.is_clean() { "ok" } else { "partial" },
            ids.len(),
            report.updated.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn recompute_one(&self, internship_id: &str) -> RepoResult<(u32, CountWrite)> {
        self.locks.with_key(internship_id, || -> RepoResult<(u32, CountWrite)> {
            let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
            let count = count_preferring(&tx, internship_id)?;
            let written = write_preference_count(&tx, internship_id, count)?;
            tx.commit()?;
            Ok((count, written))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{affected_internships, AggregateMaintainer};
    use crate::db::open_db_in_memory;
    use crate::model::candidate::Candidate;
    use crate::model::internship::Internship;
    use crate::repo::master_repo::{MasterRepository, SqliteMasterRepository};
    use crate::sync::locks::KeyedLocks;
    use std::sync::Arc;

    fn candidate(id: &str, prefs: &[&str]) -> Candidate {
        Candidate::new(id, Some("Goa")).with_preferences(prefs.iter().copied())
    }

    #[test]
    fn affected_set_is_union_of_old_and_new() {
        let old = candidate("S1", &["A", "B"]);
        let new = candidate("S1", &["B", "C", "C"]);
        let affected = affected_internships(Some(&old), Some(&new));
        assert_eq!(
            affected.into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string(), "C".to_string()]
        );
    }

    #[test]
    fn recount_is_exact_and_idempotent() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteMasterRepository::new(&conn);
        for id in ["A", "B"] {
            repo.upsert_internship(&Internship::new(id, "IT", "Tier1", 5, "Goa"))
                .unwrap();
        }
        let maintainer = AggregateMaintainer::new(&conn, Arc::new(KeyedLocks::new()));

        let first = repo.upsert_candidate(&candidate("S1", &["A", "B"])).unwrap();
        maintainer.on_candidate_change(first.previous.as_ref(), first.current.as_ref());
        let second = repo.upsert_candidate(&candidate("S2", &["A", "B"])).unwrap();
        let report =
            maintainer.on_candidate_change(second.previous.as_ref(), second.current.as_ref());

        assert_eq!(report.updated.len(), 2);
        assert_eq!(repo.get_internship("A").unwrap().unwrap().preference_count, 2);
        assert_eq!(repo.get_internship("B").unwrap().unwrap().preference_count, 2);

        let replay = maintainer.recompute(["A", "B"]);
        assert!(replay.updated.is_empty());
        assert_eq!(replay.unchanged, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn dropped_preference_is_decremented() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteMasterRepository::new(&conn);
        for id in ["A", "B"] {
            repo.upsert_internship(&Internship::new(id, "IT", "Tier1", 5, "Goa"))
                .unwrap();
        }
        let maintainer = AggregateMaintainer::new(&conn, Arc::new(KeyedLocks::new()));

        let write = repo.upsert_candidate(&candidate("S1", &["A", "B"])).unwrap();
        maintainer.on_candidate_change(write.previous.as_ref(), write.current.as_ref());
        let write = repo.upsert_candidate(&candidate("S1", &["B"])).unwrap();
        maintainer.on_candidate_change(write.previous.as_ref(), write.current.as_ref());

        assert_eq!(repo.get_internship("A").unwrap().unwrap().preference_count, 0);
        assert_eq!(repo.get_internship("B").unwrap().unwrap().preference_count, 1);
    }

    #[test]
    fn unknown_preference_is_reported_missing() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteMasterRepository::new(&conn);
        let maintainer = AggregateMaintainer::new(&conn, Arc::new(KeyedLocks::new()));

        let write = repo.upsert_candidate(&candidate("S1", &["GHOST"])).unwrap();
        let report = maintainer.on_candidate_change(write.previous.as_ref(), write.current.as_ref());
        assert_eq!(report.missing, vec!["GHOST".to_string()]);
        assert!(report.is_clean());
    }
}
