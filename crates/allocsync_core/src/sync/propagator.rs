//! Master-to-replica change propagation.
//!
//! # Responsibility
//! - Route one committed master row to its replica and apply it with bounded
//!   retries.
//! - Drain the durable outbox in commit order.
//! - Rebuild every replica from master state.
//!
//! # Invariants
//! - The propagator never writes the master tables; it only acknowledges or
//!   annotates outbox entries.
//! - Within one drain, an entity whose delivery failed is not advanced past
//!   the failed entry.
//! - Retries sleep on the shutdown signal and never hold a master lock.

use crate::config::RetryPolicy;
use crate::db::now_epoch_ms;
use crate::model::candidate::Candidate;
use crate::model::internship::Internship;
use crate::repo::master_repo::{
    load_all_candidates, load_all_internships, load_candidate, load_internship,
};
use crate::repo::outbox_repo::{self, EntityKind};
use crate::repo::{RepoError, RepoResult};
use crate::shard::router::{route_candidate, route_internship, RegionShard, TierShard};
use crate::shard::sink::{ShardSink, SinkResult};
use crate::sync::shutdown::ShutdownSignal;
use log::{error, info, warn};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Replica a row landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShardRef {
    Tier(TierShard),
    Region(RegionShard),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PropagationOutcome {
    /// The replica row was written at this revision.
    Applied { shard: ShardRef, revision: i64 },
    /// The replica already held this revision or a newer one.
    AlreadyCurrent { shard: ShardRef, revision: i64 },
    /// Routing field had no shard; older replica copies were dropped.
    Unrouted { value: String, removed: usize },
    /// Master row is gone; replica copies were dropped.
    Removed { removed: usize },
}

/// Reportable event for a propagation that gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationFailure {
    pub kind: EntityKind,
    pub entity_id: String,
    pub revision: i64,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug)]
pub enum PropagationError {
    /// Every attempt failed; the master write stands.
    Exhausted(PropagationFailure),
    /// Shutdown was requested while waiting to retry.
    Aborted {
        kind: EntityKind,
        entity_id: String,
        attempts: u32,
    },
    Repo(RepoError),
}

impl Display for PropagationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted(failure) => write!(
                f,
                "propagation of {} {} gave up after {} attempts: {}",
                failure.kind.as_str(),
                failure.entity_id,
                failure.attempts,
                failure.error
            ),
            Self::Aborted {
                kind,
                entity_id,
                attempts,
            } => write!(
                f,
                "propagation of {} {entity_id} aborted by shutdown after {attempts} attempts",
                kind.as_str()
            ),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for PropagationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Exhausted(_) | Self::Aborted { .. } => None,
        }
    }
}

impl From<RepoError> for PropagationError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Summary of one outbox drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub already_current: usize,
    pub unrouted: usize,
    pub removed: usize,
    /// Entries skipped because an earlier entry for the same entity failed.
    pub deferred: usize,
    pub failures: Vec<PropagationFailure>,
    pub aborted: bool,
}

impl DrainReport {
    fn record(&mut self, outcome: &PropagationOutcome) {
        match outcome {
            PropagationOutcome::Applied { .. } => self.applied += 1,
            PropagationOutcome::AlreadyCurrent { .. } => self.already_current += 1,
            PropagationOutcome::Unrouted { .. } => self.unrouted += 1,
            PropagationOutcome::Removed { .. } => self.removed += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub internships: usize,
    pub candidates: usize,
    pub unrouted_internships: usize,
    pub unrouted_candidates: usize,
}

/// Delivers master changes to a [`ShardSink`].
///
/// `conn` is the master store; it is read for current row state and for the
/// outbox, never for replica writes.
pub struct Propagator<'conn, S: ShardSink> {
    conn: &'conn Connection,
    sink: S,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl<'conn, S: ShardSink> Propagator<'conn, S> {
    pub fn new(
        conn: &'conn Connection,
        sink: S,
        retry: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            conn,
            sink,
            retry,
            shutdown,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Ships one internship row (as committed in the master store).
    pub fn propagate_internship(
        &self,
        row: &Internship,
    ) -> Result<PropagationOutcome, PropagationError> {
        let id = row.internship_id.as_str();
        let Some(shard) = route_internship(&row.tier) else {
            warn!(
                "event=routing_anomaly module=sync kind=internship id={id} tier={:?}",
                row.tier
            );
            let removed = self.with_retry(EntityKind::Internship, id, row.revision, || {
                self.sink.remove_internship(id, row.revision)
            })?;
            return Ok(PropagationOutcome::Unrouted {
                value: row.tier.clone(),
                removed,
            });
        };

        let synced_at = now_epoch_ms();
        let changed = self.with_retry(EntityKind::Internship, id, row.revision, || {
            self.sink.place_internship(shard, row, synced_at)
        })?;
        Ok(placed(ShardRef::Tier(shard), row.revision, changed))
    }

    /// Ships one candidate row (as committed in the master store).
    pub fn propagate_candidate(
        &self,
        row: &Candidate,
    ) -> Result<PropagationOutcome, PropagationError> {
        let id = row.student_id.as_str();
        let state = row.state.as_deref().unwrap_or_default();
        let Some(shard) = route_candidate(state) else {
            // Candidates without a state are expected; only unknown states are anomalies.
            if !state.trim().is_empty() {
                warn!("event=routing_anomaly module=sync kind=candidate id={id} state={state:?}");
            }
            let removed = self.with_retry(EntityKind::Candidate, id, row.revision, || {
                self.sink.remove_candidate(id, row.revision)
            })?;
            return Ok(PropagationOutcome::Unrouted {
                value: state.to_string(),
                removed,
            });
        };

        let synced_at = now_epoch_ms();
        let changed = self.with_retry(EntityKind::Candidate, id, row.revision, || {
            self.sink.place_candidate(shard, row, synced_at)
        })?;
        Ok(placed(ShardRef::Region(shard), row.revision, changed))
    }

    /// Ships the current master state of one entity and acknowledges its
    /// outbox entries up to `seq`.
    ///
    /// A missing master row means the entity was deleted at or after `seq`;
    /// its replica copies up to that revision are removed.
    pub fn sync_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
        seq: i64,
    ) -> Result<PropagationOutcome, PropagationError> {
        let (outcome, acknowledged) = match kind {
            EntityKind::Internship => match load_internship(self.conn, entity_id)? {
                Some(row) => {
                    let outcome = self.propagate_internship(&row)?;
                    (outcome, row.revision.max(seq))
                }
                None => {
                    let removed = self.with_retry(kind, entity_id, seq, || {
                        self.sink.remove_internship(entity_id, seq)
                    })?;
                    (PropagationOutcome::Removed { removed }, seq)
                }
            },
            EntityKind::Candidate => match load_candidate(self.conn, entity_id)? {
                Some(row) => {
                    let outcome = self.propagate_candidate(&row)?;
                    (outcome, row.revision.max(seq))
                }
                None => {
                    let removed = self.with_retry(kind, entity_id, seq, || {
                        self.sink.remove_candidate(entity_id, seq)
                    })?;
                    (PropagationOutcome::Removed { removed }, seq)
                }
            },
        };
        outbox_repo::complete_through(self.conn, kind, entity_id, acknowledged)?;
        Ok(outcome)
    }

    /// Delivers up to `limit` pending outbox entries in commit order.
    ///
    /// Exhausted deliveries are recorded on their entry and reported; they do
    /// not stop the pass. Shutdown stops the pass and leaves the rest pending.
    pub fn drain_pending(&self, limit: u32) -> RepoResult<DrainReport> {
        let entries = outbox_repo::pending(self.conn, limit)?;
        let mut report = DrainReport::default();
        let mut blocked: BTreeSet<(EntityKind, String)> = BTreeSet::new();
        let mut acknowledged: HashMap<(EntityKind, String), i64> = HashMap::new();

        for entry in entries {
            let key = (entry.kind, entry.entity_id.clone());
            if blocked.contains(&key) {
                report.deferred += 1;
                continue;
            }
            if acknowledged
                .get(&key)
                .is_some_and(|through| entry.seq <= *through)
            {
                continue;
            }

            match self.sync_entity(entry.kind, &entry.entity_id, entry.seq) {
                Ok(outcome) => {
                    report.record(&outcome);
                    let through = match outcome {
                        PropagationOutcome::Applied { revision, .. }
                        | PropagationOutcome::AlreadyCurrent { revision, .. } => {
                            revision.max(entry.seq)
                        }
                        _ => entry.seq,
                    };
                    acknowledged.insert(key, through);
                }
                Err(PropagationError::Exhausted(failure)) => {
                    outbox_repo::record_failure(
                        self.conn,
                        entry.seq,
                        failure.attempts,
                        &failure.error,
                    )?;
                    blocked.insert(key);
                    report.failures.push(failure);
                }
                Err(PropagationError::Aborted { .. }) => {
                    report.aborted = true;
                    break;
                }
                Err(PropagationError::Repo(err)) => return Err(err),
            }
        }

        info!(
            "event=outbox_drain module=sync status={} applied={} already_current={} unrouted={} removed={} deferred={} failed={}",
            if report.failures.is_empty() && !report.aborted { "ok" } else { "partial" },
            report.applied,
            report.already_current,
            report.unrouted,
            report.removed,
            report.deferred,
            report.failures.len()
        );
        Ok(report)
    }

    /// Drains until the outbox is empty, a pass makes no progress, or
    /// shutdown is requested.
    pub fn drain_all(&self, batch: u32) -> RepoResult<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let before = outbox_repo::pending_count(self.conn)?;
            if before == 0 {
                return Ok(total);
            }
            let pass = self.drain_pending(batch)?;
            let after = outbox_repo::pending_count(self.conn)?;
            total.applied += pass.applied;
            total.already_current += pass.already_current;
            total.unrouted += pass.unrouted;
            total.removed += pass.removed;
            total.deferred += pass.deferred;
            total.failures.extend(pass.failures);
            if pass.aborted {
                total.aborted = true;
                return Ok(total);
            }
            if after >= before {
                return Ok(total);
            }
        }
    }

    /// Replaces every replica with the routed master state.
    ///
    /// Outbox entries stay pending; replaying them afterwards is a no-op.
    pub fn rebuild_shards(&self) -> Result<RebuildReport, PropagationError> {
        let internships = load_all_internships(self.conn)?;
        let candidates = load_all_candidates(self.conn)?;
        let mut report = RebuildReport::default();

        let mut tier_rows: Vec<(TierShard, &Internship)> = Vec::with_capacity(internships.len());
        for row in &internships {
            match route_internship(&row.tier) {
                Some(shard) => tier_rows.push((shard, row)),
                None => report.unrouted_internships += 1,
            }
        }
        let mut region_rows: Vec<(RegionShard, &Candidate)> = Vec::with_capacity(candidates.len());
        for row in &candidates {
            match row.state.as_deref().and_then(route_candidate) {
                Some(shard) => region_rows.push((shard, row)),
                None => report.unrouted_candidates += 1,
            }
        }
        report.internships = tier_rows.len();
        report.candidates = region_rows.len();

        let synced_at = now_epoch_ms();
        self.with_retry(EntityKind::Internship, "*", 0, || {
            self.sink.replace_all(&tier_rows, &region_rows, synced_at)
        })?;

        info!(
            "event=shard_rebuild module=sync status=ok internships={} candidates={} unrouted_internships={} unrouted_candidates={}",
            report.internships,
            report.candidates,
            report.unrouted_internships,
            report.unrouted_candidates
        );
        Ok(report)
    }

    fn with_retry<T>(
        &self,
        kind: EntityKind,
        entity_id: &str,
        revision: i64,
        mut op: impl FnMut() -> SinkResult<T>,
    ) -> Result<T, PropagationError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                error!(
                    "event=propagation_failed module=sync kind={} id={entity_id} revision={revision} attempts={attempt} error={err}",
                    kind.as_str()
                );
                return Err(PropagationError::Exhausted(PropagationFailure {
                    kind,
                    entity_id: entity_id.to_string(),
                    revision,
                    attempts: attempt,
                    error: err.to_string(),
                }));
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                "event=propagation_retry module=sync kind={} id={entity_id} attempt={attempt} delay_ms={} error={err}",
                kind.as_str(),
                delay.as_millis()
            );
            if self.shutdown.wait_timeout(delay) {
                warn!(
                    "event=propagation_aborted module=sync kind={} id={entity_id} attempts={attempt}",
                    kind.as_str()
                );
                return Err(PropagationError::Aborted {
                    kind,
                    entity_id: entity_id.to_string(),
                    attempts: attempt,
                });
            }
            attempt += 1;
        }
    }
}

fn placed(shard: ShardRef, revision: i64, changed: bool) -> PropagationOutcome {
    if changed {
        PropagationOutcome::Applied { shard, revision }
    } else {
        PropagationOutcome::AlreadyCurrent { shard, revision }
    }
}
