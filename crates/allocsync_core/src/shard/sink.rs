//! Replica write contract and SQLite implementation.
//!
//! # Responsibility
//! - Apply one propagated row to its replica table as a single atomic unit.
//! - Keep every entity in at most one replica of its family.
//!
//! # Invariants
//! - Upserts apply only when the incoming `revision` is strictly newer, so
//!   replaying a payload leaves the replica row byte-identical.
//! - Placing a row into one shard removes older copies from sibling shards
//!   in the same transaction, and is skipped when a sibling already holds
//!   this revision or a newer one.

use crate::db::DbError;
use crate::model::candidate::Candidate;
use crate::model::internship::Internship;
use crate::shard::router::{RegionShard, TierShard};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SinkResult<T> = Result<T, SinkError>;

/// Failure to reach or write a replica store.
#[derive(Debug)]
pub enum SinkError {
    Db(DbError),
    /// Replica store is not reachable right now; retrying may succeed.
    Unavailable(String),
}

impl Display for SinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Unavailable(message) => write!(f, "shard unavailable: {message}"),
        }
    }
}

impl Error for SinkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Unavailable(_) => None,
        }
    }
}

impl From<DbError> for SinkError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Write side of the replica stores.
///
/// `place_*` return `true` when the target row changed and `false` when the
/// replica already held this revision or a newer one.
pub trait ShardSink {
    fn place_internship(&self, shard: TierShard, row: &Internship, synced_at: i64)
        -> SinkResult<bool>;
    /// Removes replica copies whose revision is not newer than `revision`.
    fn remove_internship(&self, internship_id: &str, revision: i64) -> SinkResult<usize>;
    fn place_candidate(&self, shard: RegionShard, row: &Candidate, synced_at: i64)
        -> SinkResult<bool>;
    fn remove_candidate(&self, student_id: &str, revision: i64) -> SinkResult<usize>;
    /// Replaces every replica table with the given rows in one transaction.
    fn replace_all(
        &self,
        internships: &[(TierShard, &Internship)],
        candidates: &[(RegionShard, &Candidate)],
        synced_at: i64,
    ) -> SinkResult<()>;
}

/// SQLite-backed replica writer.
///
/// The connection may point at the master database file or at a separate
/// replica file carrying the same schema.
pub struct SqliteShardSink<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteShardSink<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ShardSink for SqliteShardSink<'_> {
    fn place_internship(
        &self,
        shard: TierShard,
        row: &Internship,
        synced_at: i64,
    ) -> SinkResult<bool> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let siblings = TierShard::ALL
            .into_iter()
            .filter(|other| *other != shard)
            .map(TierShard::table);
        if newest_revision(&tx, siblings, "internship_id", &row.internship_id)?
            .is_some_and(|newest| newest >= row.revision)
        {
            return Ok(false);
        }
        let changed = upsert_internship(&tx, shard, row, synced_at)?;
        if changed {
            for sibling in TierShard::ALL.into_iter().filter(|other| *other != shard) {
                delete_older(
                    &tx,
                    sibling.table(),
                    "internship_id",
                    &row.internship_id,
                    row.revision,
                )?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn remove_internship(&self, internship_id: &str, revision: i64) -> SinkResult<usize> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut removed = 0;
        for shard in TierShard::ALL {
            removed += delete_older(&tx, shard.table(), "internship_id", internship_id, revision)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn place_candidate(
        &self,
        shard: RegionShard,
        row: &Candidate,
        synced_at: i64,
    ) -> SinkResult<bool> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let siblings = RegionShard::ALL
            .into_iter()
            .filter(|other| *other != shard)
            .map(RegionShard::table);
        if newest_revision(&tx, siblings, "student_id", &row.student_id)?
            .is_some_and(|newest| newest >= row.revision)
        {
            return Ok(false);
        }
        let changed = upsert_candidate(&tx, shard, row, synced_at)?;
        if changed {
            for sibling in RegionShard::ALL.into_iter().filter(|other| *other != shard) {
                delete_older(
                    &tx,
                    sibling.table(),
                    "student_id",
                    &row.student_id,
                    row.revision,
                )?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    fn remove_candidate(&self, student_id: &str, revision: i64) -> SinkResult<usize> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let mut removed = 0;
        for shard in RegionShard::ALL {
            removed += delete_older(&tx, shard.table(), "student_id", student_id, revision)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn replace_all(
        &self,
        internships: &[(TierShard, &Internship)],
        candidates: &[(RegionShard, &Candidate)],
        synced_at: i64,
    ) -> SinkResult<()> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        for shard in TierShard::ALL {
            tx.execute(&format!("DELETE FROM {};", shard.table()), [])?;
        }
        for shard in RegionShard::ALL {
            tx.execute(&format!("DELETE FROM {};", shard.table()), [])?;
        }
        for (shard, row) in internships {
            upsert_internship(&tx, *shard, row, synced_at)?;
        }
        for (shard, row) in candidates {
            upsert_candidate(&tx, *shard, row, synced_at)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn upsert_internship(
    conn: &Connection,
    shard: TierShard,
    row: &Internship,
    synced_at: i64,
) -> SinkResult<bool> {
    let table = shard.table();
    let changed = conn.execute(
        &format!(
            "INSERT INTO {table} (
                internship_id,
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
                synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(internship_id) DO UPDATE SET
                company_id = excluded.company_id,
                sector = excluded.sector,
                tier = excluded.tier,
                capacity = excluded.capacity,
                required_skills = excluded.required_skills,
                stipend = excluded.stipend,
                location_type = excluded.location_type,
                state = excluded.state,
                preference_count = excluded.preference_count,
                revision = excluded.revision,
                synced_at = excluded.synced_at
            WHERE excluded.revision > {table}.revision;"
        ),
        params![
            row.internship_id.as_str(),
            row.company_id.as_deref(),
            row.sector.as_str(),
            row.tier.as_str(),
            row.capacity,
            row.required_skills.as_str(),
            row.stipend,
            row.location_type.as_str(),
            row.state.as_str(),
            row.preference_count,
            row.revision,
            synced_at,
        ],
    )?;
    Ok(changed > 0)
}

fn upsert_candidate(
    conn: &Connection,
    shard: RegionShard,
    row: &Candidate,
    synced_at: i64,
) -> SinkResult<bool> {
    let table = shard.table();
    let [p1, p2, p3, p4, p5, p6] = &row.preferences;
    let changed = conn.execute(
        &format!(
            "INSERT INTO {table} (
                student_id,
                state,
                reservation,
                pref_1,
                pref_2,
                pref_3,
                pref_4,
                pref_5,
                pref_6,
                revision,
                synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(student_id) DO UPDATE SET
                state = excluded.state,
                reservation = excluded.reservation,
                pref_1 = excluded.pref_1,
                pref_2 = excluded.pref_2,
                pref_3 = excluded.pref_3,
                pref_4 = excluded.pref_4,
                pref_5 = excluded.pref_5,
                pref_6 = excluded.pref_6,
                revision = excluded.revision,
                synced_at = excluded.synced_at
            WHERE excluded.revision > {table}.revision;"
        ),
        params![
            row.student_id.as_str(),
            row.state.as_deref().unwrap_or_default(),
            row.reservation.as_deref(),
            p1.as_deref(),
            p2.as_deref(),
            p3.as_deref(),
            p4.as_deref(),
            p5.as_deref(),
            p6.as_deref(),
            row.revision,
            synced_at,
        ],
    )?;
    Ok(changed > 0)
}

/// Highest revision held for `key` across `tables`, if any copy exists.
fn newest_revision(
    conn: &Connection,
    tables: impl IntoIterator<Item = &'static str>,
    key_column: &'static str,
    key: &str,
) -> SinkResult<Option<i64>> {
    let mut newest = None;
    for table in tables {
        let revision: Option<i64> = conn.query_row(
            &format!("SELECT MAX(revision) FROM {table} WHERE {key_column} = ?1;"),
            [key],
            |row| row.get(0),
        )?;
        newest = newest.max(revision);
    }
    Ok(newest)
}

fn delete_older(
    conn: &Connection,
    table: &'static str,
    key_column: &'static str,
    key: &str,
    revision: i64,
) -> SinkResult<usize> {
    let removed = conn.execute(
        &format!("DELETE FROM {table} WHERE {key_column} = ?1 AND revision <= ?2;"),
        params![key, revision],
    )?;
    Ok(removed)
}
