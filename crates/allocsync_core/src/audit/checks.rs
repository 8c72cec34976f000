//! Individual audit queries. Each function is independent and read-only.

use super::report::{
    CapacityOverage, CapacityStatus, DanglingPreference, DeleteRule, ForeignKeyInfo, IndexInfo,
    OrphanCounts, OutboxStatus, ParityStatus, PendingChange, PreferenceValidity, ShardCount,
    StaleAggregate, TablePresence,
};
use crate::repo::master_repo::PREFERENCE_COLUMNS;
use crate::repo::outbox_repo;
use crate::repo::RepoResult;
use crate::shard::replica::replica_row_count;
use crate::shard::router::{route_candidate, route_internship, RegionShard, TierShard};
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};

/// Master tables inspected for keys, counts and indexes.
pub const MASTER_TABLES: [&str; 4] = ["companies", "internships", "candidates", "allocations"];

/// Every table the engine expects to exist.
pub fn expected_tables() -> Vec<&'static str> {
    let mut tables = MASTER_TABLES.to_vec();
    tables.extend(TierShard::ALL.iter().map(|shard| shard.table()));
    tables.extend(RegionShard::ALL.iter().map(|shard| shard.table()));
    tables.push("sync_outbox");
    tables
}

fn count(conn: &Connection, sql: &str) -> RepoResult<u64> {
    let value: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(value.max(0) as u64)
}

pub fn table_presence(conn: &Connection) -> RepoResult<Vec<TablePresence>> {
    let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1;")?;
    let mut presence = Vec::new();
    for table in expected_tables() {
        presence.push(TablePresence {
            table: table.to_string(),
            exists: stmt.exists([table])?,
        });
    }
    Ok(presence)
}

pub fn row_count(conn: &Connection, table: &'static str) -> RepoResult<u64> {
    count(conn, &format!("SELECT COUNT(*) FROM {table};"))
}

pub fn foreign_keys(conn: &Connection) -> RepoResult<Vec<ForeignKeyInfo>> {
    let mut stmt = conn.prepare(
        "SELECT \"table\", \"from\", \"to\", on_delete
         FROM pragma_foreign_key_list(?1)
         ORDER BY id ASC, seq ASC;",
    )?;
    let mut keys = Vec::new();
    for table in MASTER_TABLES {
        let mut rows = stmt.query([table])?;
        while let Some(row) = rows.next()? {
            let on_delete: String = row.get(3)?;
            keys.push(ForeignKeyInfo {
                table: table.to_string(),
                column: row.get(1)?,
                references_table: row.get(0)?,
                references_column: row.get(2)?,
                delete_rule: DeleteRule::parse(&on_delete),
                on_delete,
            });
        }
    }
    Ok(keys)
}

pub fn indexes(conn: &Connection) -> RepoResult<Vec<IndexInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, \"unique\", origin
         FROM pragma_index_list(?1)
         ORDER BY name ASC;",
    )?;
    let mut found = Vec::new();
    for table in MASTER_TABLES {
        let mut rows = stmt.query([table])?;
        while let Some(row) = rows.next()? {
            found.push(IndexInfo {
                table: table.to_string(),
                name: row.get(0)?,
                unique: row.get::<_, i64>(1)? != 0,
                origin: row.get(2)?,
            });
        }
    }
    Ok(found)
}

pub fn orphans(conn: &Connection) -> RepoResult<OrphanCounts> {
    Ok(OrphanCounts {
        allocations_without_candidate: count(
            conn,
            "SELECT COUNT(*) FROM allocations a
             WHERE NOT EXISTS (SELECT 1 FROM candidates c WHERE c.student_id = a.student_id);",
        )?,
        allocations_without_internship: count(
            conn,
            "SELECT COUNT(*) FROM allocations a
             WHERE NOT EXISTS (SELECT 1 FROM internships i WHERE i.internship_id = a.internship_id);",
        )?,
        internships_without_company: count(
            conn,
            "SELECT COUNT(*) FROM internships i
             WHERE i.company_id IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM companies c WHERE c.company_id = i.company_id);",
        )?,
    })
}

/// Preference slots naming an internship that does not exist.
///
/// Each offending slot is counted exactly once.
pub fn preference_validity(conn: &Connection, sample_limit: u32) -> RepoResult<PreferenceValidity> {
    let mut invalid_per_slot = BTreeMap::new();
    let mut total_invalid = 0;
    let mut sample = Vec::new();

    for slot in PREFERENCE_COLUMNS {
        let dangling = format!(
            "FROM candidates c
             WHERE c.{slot} IS NOT NULL
               AND TRIM(c.{slot}) <> ''
               AND NOT EXISTS (SELECT 1 FROM internships i WHERE i.internship_id = c.{slot})"
        );
        let invalid = count(conn, &format!("SELECT COUNT(*) {dangling};"))?;
        invalid_per_slot.insert(slot.to_string(), invalid);
        total_invalid += invalid;

        let remaining = u64::from(sample_limit).saturating_sub(sample.len() as u64);
        if invalid > 0 && remaining > 0 {
            let mut stmt = conn.prepare(&format!(
                "SELECT c.student_id, c.{slot} {dangling} ORDER BY c.student_id ASC LIMIT ?1;"
            ))?;
            let rows = stmt.query_map([remaining as i64], |row| {
                Ok(DanglingPreference {
                    student_id: row.get(0)?,
                    slot: slot.to_string(),
                    internship_id: row.get(1)?,
                })
            })?;
            for row in rows {
                sample.push(row?);
            }
        }
    }

    Ok(PreferenceValidity {
        invalid_per_slot,
        total_invalid,
        sample,
    })
}

/// Candidate master rows versus region replicas.
///
/// States are routed with the same function the propagator uses.
pub fn regional_parity(conn: &Connection) -> RepoResult<ParityStatus> {
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM candidates GROUP BY state;")?;
    let grouped = stmt
        .query_map([], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut expected: HashMap<RegionShard, u64> = HashMap::new();
    let mut unrouted = 0;
    for (state, rows) in grouped {
        let rows = rows.max(0) as u64;
        match state.as_deref().and_then(route_candidate) {
            Some(shard) => *expected.entry(shard).or_default() += rows,
            None => unrouted += rows,
        }
    }

    let mut per_shard = Vec::new();
    for shard in RegionShard::ALL {
        per_shard.push(ShardCount {
            shard: shard.as_str().to_string(),
            expected: expected.get(&shard).copied().unwrap_or(0),
            actual: replica_row_count(conn, shard.table())?,
        });
    }
    Ok(parity(per_shard, unrouted))
}

/// Internship master rows versus tier replicas.
pub fn tier_parity(conn: &Connection) -> RepoResult<ParityStatus> {
    let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM internships GROUP BY tier;")?;
    let grouped = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut expected: HashMap<TierShard, u64> = HashMap::new();
    let mut unrouted = 0;
    for (tier, rows) in grouped {
        let rows = rows.max(0) as u64;
        match route_internship(&tier) {
            Some(shard) => *expected.entry(shard).or_default() += rows,
            None => unrouted += rows,
        }
    }

    let mut per_shard = Vec::new();
    for shard in TierShard::ALL {
        per_shard.push(ShardCount {
            shard: shard.as_str().to_string(),
            expected: expected.get(&shard).copied().unwrap_or(0),
            actual: replica_row_count(conn, shard.table())?,
        });
    }
    Ok(parity(per_shard, unrouted))
}

fn parity(per_shard: Vec<ShardCount>, master_unrouted: u64) -> ParityStatus {
    let master_routable = per_shard.iter().map(|shard| shard.expected).sum();
    let shard_total = per_shard.iter().map(|shard| shard.actual).sum();
    let synced = master_routable == shard_total
        && per_shard.iter().all(|shard| shard.expected == shard.actual);
    ParityStatus {
        master_routable,
        master_unrouted,
        shard_total,
        per_shard,
        synced,
    }
}

/// Internships with more allocation rows than capacity.
pub fn capacity_overages(conn: &Connection, top_n: u32) -> RepoResult<CapacityStatus> {
    const OVER_ALLOCATED: &str = "SELECT i.internship_id, i.capacity, COUNT(*) AS allocated
         FROM allocations a
         JOIN internships i ON i.internship_id = a.internship_id
         GROUP BY i.internship_id, i.capacity
         HAVING COUNT(*) > i.capacity";

    let (total_overallocated, total_excess): (i64, i64) = conn.query_row(
        &format!("SELECT COUNT(*), COALESCE(SUM(allocated - capacity), 0) FROM ({OVER_ALLOCATED});"),
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let mut stmt = conn.prepare(&format!(
        "{OVER_ALLOCATED}
         ORDER BY COUNT(*) DESC, i.internship_id ASC
         LIMIT ?1;"
    ))?;
    let top = stmt
        .query_map([i64::from(top_n)], |row| {
            let capacity = row.get::<_, i64>(1)?.max(0) as u64;
            let allocated = row.get::<_, i64>(2)?.max(0) as u64;
            Ok(CapacityOverage {
                internship_id: row.get(0)?,
                capacity,
                allocated,
                over_by: allocated.saturating_sub(capacity),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CapacityStatus {
        top,
        total_overallocated: total_overallocated.max(0) as u64,
        total_excess: total_excess.max(0) as u64,
    })
}

/// Internships whose stored `preference_count` differs from a fresh recount.
pub fn stale_aggregates(conn: &Connection) -> RepoResult<Vec<StaleAggregate>> {
    let mut stmt = conn.prepare(
        "SELECT internship_id, stored, actual FROM (
             SELECT i.internship_id,
                    i.preference_count AS stored,
                    (SELECT COUNT(*) FROM candidates c
                     WHERE i.internship_id IN
                         (c.pref_1, c.pref_2, c.pref_3, c.pref_4, c.pref_5, c.pref_6)) AS actual
             FROM internships i
         )
         WHERE stored <> actual
         ORDER BY internship_id ASC;",
    )?;
    let stale = stmt
        .query_map([], |row| {
            Ok(StaleAggregate {
                internship_id: row.get(0)?,
                stored: row.get::<_, i64>(1)?.max(0) as u64,
                actual: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(stale)
}

pub fn outbox_status(conn: &Connection) -> RepoResult<OutboxStatus> {
    let pending = outbox_repo::pending_count(conn)?;
    let failing = count(conn, "SELECT COUNT(*) FROM sync_outbox WHERE attempts > 0;")?;
    let oldest_pending = outbox_repo::pending(conn, 1)?
        .into_iter()
        .next()
        .map(|entry| PendingChange {
            seq: entry.seq,
            kind: entry.kind,
            entity_id: entry.entity_id,
            attempts: entry.attempts,
        });
    Ok(OutboxStatus {
        pending,
        failing,
        oldest_pending,
    })
}
