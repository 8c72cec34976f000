//! Read access to replica tables.

use crate::model::candidate::Candidate;
use crate::model::internship::Internship;
use crate::repo::master_repo::{parse_candidate_row, parse_internship_row};
use crate::repo::RepoResult;
use crate::shard::router::{RegionShard, TierShard};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// Internship copy held by a tier shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InternshipReplica {
    pub shard: TierShard,
    pub internship: Internship,
    pub synced_at: i64,
}

/// Candidate copy held by a region shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateReplica {
    pub shard: RegionShard,
    pub candidate: Candidate,
    pub synced_at: i64,
}

const INTERNSHIP_REPLICA_COLUMNS: &str = "internship_id,
    company_id,
    sector,
    tier,
    capacity,
    required_skills,
    stipend,
    location_type,
    state,
    preference_count,
    revision,
    synced_at";

const CANDIDATE_REPLICA_COLUMNS: &str = "student_id,
    state,
    reservation,
    pref_1,
    pref_2,
    pref_3,
    pref_4,
    pref_5,
    pref_6,
    revision,
    synced_at";

/// Lists one tier shard ordered by id.
pub fn list_tier_replica(
    conn: &Connection,
    shard: TierShard,
) -> RepoResult<Vec<InternshipReplica>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INTERNSHIP_REPLICA_COLUMNS} FROM {} ORDER BY internship_id ASC;",
        shard.table()
    ))?;
    let mut rows = stmt.query([])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(InternshipReplica {
            shard,
            internship: parse_internship_row(row)?,
            synced_at: row.get("synced_at")?,
        });
    }
    Ok(items)
}

/// Finds the replica copy of one internship across all tier shards.
pub fn find_internship_replica(
    conn: &Connection,
    internship_id: &str,
) -> RepoResult<Option<InternshipReplica>> {
    for shard in TierShard::ALL {
        let found = conn
            .query_row(
                &format!(
                    "SELECT {INTERNSHIP_REPLICA_COLUMNS} FROM {} WHERE internship_id = ?1;",
                    shard.table()
                ),
                [internship_id],
                |row| {
                    Ok((
                        parse_internship_row(row),
                        row.get::<_, i64>("synced_at")?,
                    ))
                },
            )
            .optional()?;
        if let Some((internship, synced_at)) = found {
            return Ok(Some(InternshipReplica {
                shard,
                internship: internship?,
                synced_at,
            }));
        }
    }
    Ok(None)
}

/// Finds the replica copy of one candidate across all region shards.
pub fn find_candidate_replica(
    conn: &Connection,
    student_id: &str,
) -> RepoResult<Option<CandidateReplica>> {
    for shard in RegionShard::ALL {
        let found = conn
            .query_row(
                &format!(
                    "SELECT {CANDIDATE_REPLICA_COLUMNS} FROM {} WHERE student_id = ?1;",
                    shard.table()
                ),
                [student_id],
                |row| Ok((parse_candidate_row(row), row.get::<_, i64>("synced_at")?)),
            )
            .optional()?;
        if let Some((candidate, synced_at)) = found {
            return Ok(Some(CandidateReplica {
                shard,
                candidate: candidate?,
                synced_at,
            }));
        }
    }
    Ok(None)
}

/// Row count of one replica table.
pub fn replica_row_count(conn: &Connection, table: &'static str) -> RepoResult<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
        row.get(0)
    })?;
    Ok(count.max(0) as u64)
}
