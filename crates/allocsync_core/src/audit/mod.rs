//! Read-only integrity auditor.
//!
//! # Responsibility
//! - Inspect schema, referential integrity, replica parity, capacity and
//!   aggregate freshness, and return one structured report.
//!
//! # Invariants
//! - Never mutates: all checks run in one deferred transaction that is
//!   rolled back, and the auditor issues SELECT/PRAGMA reads only.
//! - A failing check is recorded as a failed section; the run always
//!   completes.

pub mod checks;
pub mod report;

use crate::db::now_epoch_ms;
use crate::repo::RepoResult;
use log::{info, warn};
use report::{AuditReport, CheckOutcome, RowCount};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use uuid::Uuid;

const DEFAULT_TOP_N: u32 = 10;

pub struct Auditor<'conn> {
    conn: &'conn Connection,
    top_n: u32,
}

impl<'conn> Auditor<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            top_n: DEFAULT_TOP_N,
        }
    }

    /// Length of the capacity-overage and dangling-preference samples.
    pub fn with_top_n(mut self, top_n: u32) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    pub fn run_audit(&self) -> AuditReport {
        let run_id = Uuid::new_v4();
        let started_at_ms = now_epoch_ms();
        info!("event=audit_run module=audit status=start run_id={run_id}");

        // Read snapshot; dropped without commit, which rolls back.
        let snapshot = match Transaction::new_unchecked(self.conn, TransactionBehavior::Deferred) {
            Ok(tx) => Some(tx),
            Err(err) => {
                warn!("event=audit_run module=audit status=degraded run_id={run_id} error={err}");
                None
            }
        };
        let conn: &Connection = self.conn;
        let top_n = self.top_n;

        let row_counts = checks::expected_tables()
            .into_iter()
            .map(|table| RowCount {
                table: table.to_string(),
                rows: run_check(run_id, &format!("row_count.{table}"), || {
                    checks::row_count(conn, table)
                }),
            })
            .collect();

        let report = AuditReport {
            run_id,
            started_at_ms,
            duration_ms: 0,
            tables: run_check(run_id, "tables", || checks::table_presence(conn)),
            foreign_keys: run_check(run_id, "foreign_keys", || checks::foreign_keys(conn)),
            row_counts,
            orphans: run_check(run_id, "orphans", || checks::orphans(conn)),
            preferences: run_check(run_id, "preferences", || {
                checks::preference_validity(conn, top_n)
            }),
            regional_parity: run_check(run_id, "regional_parity", || {
                checks::regional_parity(conn)
            }),
            tier_parity: run_check(run_id, "tier_parity", || checks::tier_parity(conn)),
            capacity: run_check(run_id, "capacity", || {
                checks::capacity_overages(conn, top_n)
            }),
            stale_aggregates: run_check(run_id, "stale_aggregates", || {
                checks::stale_aggregates(conn)
            }),
            outbox: run_check(run_id, "outbox", || checks::outbox_status(conn)),
            indexes: run_check(run_id, "indexes", || checks::indexes(conn)),
        };
        drop(snapshot);

        let duration_ms = now_epoch_ms().saturating_sub(started_at_ms);
        let failed = report.failed_checks();
        info!(
            "event=audit_run module=audit status={} run_id={run_id} duration_ms={duration_ms} failed_checks={}",
            if failed.is_empty() { "ok" } else { "partial" },
            failed.len()
        );
        AuditReport {
            duration_ms,
            ..report
        }
    }
}

/// Runs the audit with default settings.
pub fn run_audit(conn: &Connection) -> AuditReport {
    Auditor::new(conn).run_audit()
}

fn run_check<T>(run_id: Uuid, name: &str, check: impl FnOnce() -> RepoResult<T>) -> CheckOutcome<T> {
    match check() {
        Ok(value) => CheckOutcome::Passed(value),
        Err(err) => {
            warn!("event=audit_check module=audit status=failed run_id={run_id} check={name} error={err}");
            CheckOutcome::Failed(err.to_string())
        }
    }
}
