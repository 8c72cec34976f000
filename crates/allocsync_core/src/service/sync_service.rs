//! Write-side use cases.
//!
//! # Responsibility
//! - Commit master writes, then fan out to the aggregate maintainer and the
//!   propagator, then invalidate cached reads.
//!
//! # Invariants
//! - Only master-write failures (validation, constraint, missing row) are
//!   returned as `Err`. Propagation and recompute problems are reported in
//!   the [`MutationOutcome`] while the master write stands.
//! - Cache invalidation finishes before a mutation returns.

use crate::cache::keys::{CANDIDATES_PREFIX, INTERNSHIPS_PREFIX, STATS_PREFIX};
use crate::cache::CacheLayer;
use crate::config::SyncConfig;
use crate::model::candidate::Candidate;
use crate::model::internship::{Allocation, Company, Internship};
use crate::repo::master_repo::{CandidateWrite, MasterRepository, SqliteMasterRepository};
use crate::repo::outbox_repo::{self, EntityKind};
use crate::repo::RepoResult;
use crate::shard::sink::ShardSink;
use crate::sync::aggregate::{AggregateMaintainer, AggregateReport};
use crate::sync::locks::KeyedLocks;
use crate::sync::propagator::{
    DrainReport, PropagationError, PropagationFailure, PropagationOutcome, Propagator,
    RebuildReport,
};
use crate::sync::shutdown::ShutdownSignal;
use log::{info, warn};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;

/// Delivery result for one entity touched by a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PropagationStatus {
    Delivered {
        kind: EntityKind,
        entity_id: String,
        outcome: PropagationOutcome,
    },
    /// Retries exhausted; the outbox entry stays pending.
    Failed(PropagationFailure),
    /// Not attempted to completion (shutdown or store error); stays pending.
    Deferred {
        kind: EntityKind,
        entity_id: String,
        reason: String,
    },
}

impl PropagationStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// What a committed mutation did beyond the master write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    pub kind: EntityKind,
    pub entity_id: String,
    pub revision: i64,
    pub propagation: Vec<PropagationStatus>,
    pub aggregates: AggregateReport,
}

impl MutationOutcome {
    /// Every touched entity reached its replica and every recount succeeded.
    pub fn fully_synced(&self) -> bool {
        self.aggregates.is_clean() && self.propagation.iter().all(PropagationStatus::is_delivered)
    }
}

/// Mutation entry point over one master connection.
pub struct SyncService<'conn, S: ShardSink> {
    conn: &'conn Connection,
    repo: SqliteMasterRepository<'conn>,
    propagator: Propagator<'conn, S>,
    maintainer: AggregateMaintainer<'conn>,
    cache: CacheLayer,
    drain_batch_size: u32,
}

impl<'conn, S: ShardSink> SyncService<'conn, S> {
    /// `locks` must be shared by every service writing the same store.
    pub fn new(
        conn: &'conn Connection,
        sink: S,
        cache: CacheLayer,
        locks: Arc<KeyedLocks>,
        shutdown: ShutdownSignal,
        config: &SyncConfig,
    ) -> Self {
        Self {
            conn,
            repo: SqliteMasterRepository::new(conn),
            propagator: Propagator::new(conn, sink, config.retry, shutdown),
            maintainer: AggregateMaintainer::new(conn, locks),
            cache,
            drain_batch_size: config.drain_batch_size,
        }
    }

    pub fn propagator(&self) -> &Propagator<'conn, S> {
        &self.propagator
    }

    pub fn upsert_company(&self, company: &Company) -> RepoResult<()> {
        self.repo.upsert_company(company)?;
        self.cache.delete_by_prefix(INTERNSHIPS_PREFIX);
        Ok(())
    }

    /// Writes an internship and picks up candidates that already prefer it.
    pub fn upsert_internship(&self, row: &Internship) -> RepoResult<MutationOutcome> {
        let receipt = self.repo.upsert_internship(row)?;
        let aggregates = self.maintainer.recompute([receipt.entity_id.as_str()]);

        let shipped_through = aggregates
            .updated
            .iter()
            .map(|update| update.revision)
            .max()
            .unwrap_or(receipt.revision);
        let propagation = vec![self.ship(EntityKind::Internship, &receipt.entity_id, shipped_through)];

        self.invalidate(&[INTERNSHIPS_PREFIX, STATS_PREFIX]);
        Ok(MutationOutcome {
            kind: receipt.kind,
            entity_id: receipt.entity_id,
            revision: receipt.revision,
            propagation,
            aggregates,
        })
    }

    /// Deletes an internship; its allocations cascade, preferences dangle.
    pub fn delete_internship(&self, internship_id: &str) -> RepoResult<MutationOutcome> {
        let receipt = self.repo.delete_internship(internship_id)?;
        let propagation = vec![self.ship(EntityKind::Internship, &receipt.entity_id, receipt.revision)];

        self.invalidate(&[INTERNSHIPS_PREFIX, STATS_PREFIX]);
        Ok(MutationOutcome {
            kind: receipt.kind,
            entity_id: receipt.entity_id,
            revision: receipt.revision,
            propagation,
            aggregates: AggregateReport::default(),
        })
    }

    pub fn upsert_candidate(&self, row: &Candidate) -> RepoResult<MutationOutcome> {
        let write = self.repo.upsert_candidate(row)?;
        Ok(self.after_candidate_write(write))
    }

    /// Deletes a candidate and decrements every internship it preferred.
    pub fn delete_candidate(&self, student_id: &str) -> RepoResult<MutationOutcome> {
        let write = self.repo.delete_candidate(student_id)?;
        Ok(self.after_candidate_write(write))
    }

    pub fn insert_allocation(&self, allocation: &Allocation) -> RepoResult<()> {
        self.repo.insert_allocation(allocation)?;
        self.invalidate(&[STATS_PREFIX]);
        Ok(())
    }

    /// Ships pending outbox entries until the outbox is empty or stuck.
    pub fn drain(&self) -> RepoResult<DrainReport> {
        let report = self.propagator.drain_all(self.drain_batch_size)?;
        if report.applied + report.removed + report.unrouted > 0 {
            self.invalidate(&[INTERNSHIPS_PREFIX]);
        }
        Ok(report)
    }

    pub fn rebuild_shards(&self) -> Result<RebuildReport, PropagationError> {
        let report = self.propagator.rebuild_shards()?;
        self.invalidate(&[INTERNSHIPS_PREFIX]);
        Ok(report)
    }

    /// Recounts every aggregate and ships the internships that changed.
    pub fn recompute_all(&self) -> RepoResult<(AggregateReport, Vec<PropagationStatus>)> {
        let aggregates = self.maintainer.recompute_all()?;
        let propagation = aggregates
            .updated
            .iter()
            .map(|update| self.ship(EntityKind::Internship, &update.internship_id, update.revision))
            .collect();
        if !aggregates.updated.is_empty() {
            self.invalidate(&[INTERNSHIPS_PREFIX, STATS_PREFIX]);
        }
        Ok((aggregates, propagation))
    }

    fn after_candidate_write(&self, write: CandidateWrite) -> MutationOutcome {
        let aggregates = self
            .maintainer
            .on_candidate_change(write.previous.as_ref(), write.current.as_ref());

        let receipt = write.receipt;
        let mut propagation = vec![self.ship(EntityKind::Candidate, &receipt.entity_id, receipt.revision)];
        for update in &aggregates.updated {
            propagation.push(self.ship(
                EntityKind::Internship,
                &update.internship_id,
                update.revision,
            ));
        }

        if aggregates.updated.is_empty() {
            self.invalidate(&[CANDIDATES_PREFIX, STATS_PREFIX]);
        } else {
            self.invalidate(&[CANDIDATES_PREFIX, STATS_PREFIX, INTERNSHIPS_PREFIX]);
        }

        if !aggregates.is_clean() {
            warn!(
                "event=candidate_write module=service status=degraded id={} revision={} recompute_failures={}",
                receipt.entity_id,
                receipt.revision,
                aggregates.failures.len()
            );
        }
        MutationOutcome {
            kind: receipt.kind,
            entity_id: receipt.entity_id,
            revision: receipt.revision,
            propagation,
            aggregates,
        }
    }

    fn ship(&self, kind: EntityKind, entity_id: &str, seq: i64) -> PropagationStatus {
        match self.propagator.sync_entity(kind, entity_id, seq) {
            Ok(outcome) => PropagationStatus::Delivered {
                kind,
                entity_id: entity_id.to_string(),
                outcome,
            },
            Err(PropagationError::Exhausted(failure)) => {
                if let Err(err) =
                    outbox_repo::record_failure(self.conn, seq, failure.attempts, &failure.error)
                {
                    warn!(
                        "event=outbox_record_failure module=service status=error kind={} id={entity_id} seq={seq} error={err}",
                        kind.as_str()
                    );
                }
                PropagationStatus::Failed(failure)
            }
            Err(err) => {
                info!(
                    "event=propagation_deferred module=service kind={} id={entity_id} seq={seq} reason={err}",
                    kind.as_str()
                );
                PropagationStatus::Deferred {
                    kind,
                    entity_id: entity_id.to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }

    fn invalidate(&self, prefixes: &[&str]) {
        for prefix in prefixes {
            self.cache.delete_by_prefix(prefix);
        }
    }
}
