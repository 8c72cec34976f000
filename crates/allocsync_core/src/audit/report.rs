//! Audit report model.
//!
//! Every section is a [`CheckOutcome`], so one failing query shows up as a
//! failed section instead of failing the whole run.

use crate::repo::outbox_repo::EntityKind;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum CheckOutcome<T> {
    Passed(T),
    Failed(String),
}

impl<T> CheckOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn passed(&self) -> Option<&T> {
        match self {
            Self::Passed(value) => Some(value),
            Self::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TablePresence {
    pub table: String,
    pub exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteRule {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    NoAction,
}

impl DeleteRule {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CASCADE" => Some(Self::Cascade),
            "SET NULL" => Some(Self::SetNull),
            "SET DEFAULT" => Some(Self::SetDefault),
            "RESTRICT" => Some(Self::Restrict),
            "NO ACTION" | "" => Some(Self::NoAction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub table: String,
    pub column: String,
    pub references_table: String,
    pub references_column: Option<String>,
    pub on_delete: String,
    /// `None` when the store reports a rule this auditor does not know.
    pub delete_rule: Option<DeleteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub table: String,
    pub name: String,
    pub unique: bool,
    /// `c` (CREATE INDEX), `u` (UNIQUE constraint) or `pk`.
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanCounts {
    pub allocations_without_candidate: u64,
    pub allocations_without_internship: u64,
    pub internships_without_company: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingPreference {
    pub student_id: String,
    pub slot: String,
    pub internship_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceValidity {
    /// Offending slots per column; a candidate counts once per slot.
    pub invalid_per_slot: BTreeMap<String, u64>,
    pub total_invalid: u64,
    pub sample: Vec<DanglingPreference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardCount {
    pub shard: String,
    pub expected: u64,
    pub actual: u64,
}

/// Master-versus-replica row parity for one shard family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParityStatus {
    /// Master rows whose routing field maps to a shard.
    pub master_routable: u64,
    /// Master rows left master-only (no or unknown routing value).
    pub master_unrouted: u64,
    pub shard_total: u64,
    pub per_shard: Vec<ShardCount>,
    pub synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityOverage {
    pub internship_id: String,
    pub capacity: u64,
    pub allocated: u64,
    pub over_by: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityStatus {
    /// Highest allocation counts first.
    pub top: Vec<CapacityOverage>,
    /// Internships over capacity.
    pub total_overallocated: u64,
    /// Allocations beyond capacity, summed over those internships.
    pub total_excess: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleAggregate {
    pub internship_id: String,
    pub stored: u64,
    pub actual: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxStatus {
    pub pending: u64,
    /// Pending entries that already failed at least once.
    pub failing: u64,
    pub oldest_pending: Option<PendingChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingChange {
    pub seq: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowCount {
    pub table: String,
    pub rows: CheckOutcome<u64>,
}

/// One full integrity audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub run_id: Uuid,
    pub started_at_ms: i64,
    pub duration_ms: i64,
    pub tables: CheckOutcome<Vec<TablePresence>>,
    pub foreign_keys: CheckOutcome<Vec<ForeignKeyInfo>>,
    pub row_counts: Vec<RowCount>,
    pub orphans: CheckOutcome<OrphanCounts>,
    pub preferences: CheckOutcome<PreferenceValidity>,
    pub regional_parity: CheckOutcome<ParityStatus>,
    pub tier_parity: CheckOutcome<ParityStatus>,
    pub capacity: CheckOutcome<CapacityStatus>,
    pub stale_aggregates: CheckOutcome<Vec<StaleAggregate>>,
    pub outbox: CheckOutcome<OutboxStatus>,
    pub indexes: CheckOutcome<Vec<IndexInfo>>,
}

impl AuditReport {
    /// Names of sections whose check itself failed to run.
    pub fn failed_checks(&self) -> Vec<String> {
        let mut failed = Vec::new();
        let sections: [(&str, bool); 10] = [
            ("tables", self.tables.is_failed()),
            ("foreign_keys", self.foreign_keys.is_failed()),
            ("orphans", self.orphans.is_failed()),
            ("preferences", self.preferences.is_failed()),
            ("regional_parity", self.regional_parity.is_failed()),
            ("tier_parity", self.tier_parity.is_failed()),
            ("capacity", self.capacity.is_failed()),
            ("stale_aggregates", self.stale_aggregates.is_failed()),
            ("outbox", self.outbox.is_failed()),
            ("indexes", self.indexes.is_failed()),
        ];
        for (name, is_failed) in sections {
            if is_failed {
                failed.push(name.to_string());
            }
        }
        for count in &self.row_counts {
            if count.rows.is_failed() {
                failed.push(format!("row_counts.{}", count.table));
            }
        }
        failed
    }

    /// Every check ran and found nothing to report.
    pub fn is_clean(&self) -> bool {
        if !self.failed_checks().is_empty() {
            return false;
        }
        let tables_ok = self
            .tables
            .passed()
            .is_some_and(|tables| tables.iter().all(|table| table.exists));
        let orphans_ok = self.orphans.passed().is_some_and(|orphans| {
            orphans.allocations_without_candidate == 0
                && orphans.allocations_without_internship == 0
                && orphans.internships_without_company == 0
        });
        let prefs_ok = self
            .preferences
            .passed()
            .is_some_and(|prefs| prefs.total_invalid == 0);
        let regions_ok = self.regional_parity.passed().is_some_and(|p| p.synced);
        let tiers_ok = self.tier_parity.passed().is_some_and(|p| p.synced);
        let capacity_ok = self
            .capacity
            .passed()
            .is_some_and(|c| c.total_overallocated == 0);
        let aggregates_ok = self
            .stale_aggregates
            .passed()
            .is_some_and(|stale| stale.is_empty());
        tables_ok
            && orphans_ok
            && prefs_ok
            && regions_ok
            && tiers_ok
            && capacity_ok
            && aggregates_ok
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckOutcome, DeleteRule};

    #[test]
    fn delete_rules_parse_case_insensitively() {
        assert_eq!(DeleteRule::parse("cascade"), Some(DeleteRule::Cascade));
        assert_eq!(DeleteRule::parse("SET NULL"), Some(DeleteRule::SetNull));
        assert_eq!(DeleteRule::parse("NO ACTION"), Some(DeleteRule::NoAction));
        assert_eq!(DeleteRule::parse("EXPLODE"), None);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let passed: CheckOutcome<u64> = CheckOutcome::Passed(3);
        let failed: CheckOutcome<u64> = CheckOutcome::Failed("no such table".to_string());
        assert_eq!(
            serde_json::to_value(&passed).unwrap(),
            serde_json::json!({"status": "passed", "result": 3})
        );
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"status": "failed", "result": "no such table"})
        );
    }
}
