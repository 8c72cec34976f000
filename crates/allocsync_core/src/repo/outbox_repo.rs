//! Durable change outbox.
//!
//! # Responsibility
//! - Assign the commit sequence to every master write.
//! - Hold pending propagation work until a replica acknowledges it.
//!
//! # Invariants
//! - `append` must run inside the transaction of the master write it
//!   describes, so a committed row always has a pending entry.
//! - Entries are removed only after the replica applied them.

use crate::repo::RepoResult;
use rusqlite::{params, Connection};
use serde::Serialize;

/// Which master table an outbox entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Internship,
    Candidate,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internship => "internship",
            Self::Candidate => "candidate",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "internship" => Some(Self::Internship),
            "candidate" => Some(Self::Candidate),
            _ => None,
        }
    }
}

/// One pending propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub seq: i64,
    pub kind: EntityKind,
    pub entity_id: String,
    pub attempts: u32,
}

/// Appends an entry and returns its commit sequence.
pub fn append(conn: &Connection, kind: EntityKind, entity_id: &str) -> RepoResult<i64> {
    conn.execute(
        "INSERT INTO sync_outbox (entity_kind, entity_id) VALUES (?1, ?2);",
        params![kind.as_str(), entity_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Oldest pending entries first.
pub fn pending(conn: &Connection, limit: u32) -> RepoResult<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, entity_kind, entity_id, attempts
         FROM sync_outbox
         ORDER BY seq ASC
         LIMIT ?1;",
    )?;
    let mut rows = stmt.query([i64::from(limit)])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let kind_text: String = row.get("entity_kind")?;
        let Some(kind) = EntityKind::parse(&kind_text) else {
            return Err(crate::repo::RepoError::InvalidData(format!(
                "invalid entity kind `{kind_text}` in sync_outbox.entity_kind"
            )));
        };
        entries.push(OutboxEntry {
            seq: row.get("seq")?,
            kind,
            entity_id: row.get("entity_id")?,
            attempts: row.get("attempts")?,
        });
    }
    Ok(entries)
}

/// Acknowledges every entry for the entity up to and including `seq`.
///
/// Earlier entries are covered because propagation always ships the latest
/// master state.
pub fn complete_through(
    conn: &Connection,
    kind: EntityKind,
    entity_id: &str,
    seq: i64,
) -> RepoResult<usize> {
    let removed = conn.execute(
        "DELETE FROM sync_outbox
         WHERE entity_kind = ?1
           AND entity_id = ?2
           AND seq <= ?3;",
        params![kind.as_str(), entity_id, seq],
    )?;
    Ok(removed)
}

/// Records a failed delivery attempt; the entry stays pending.
pub fn record_failure(conn: &Connection, seq: i64, attempts: u32, error: &str) -> RepoResult<()> {
    conn.execute(
        "UPDATE sync_outbox
         SET attempts = attempts + ?2,
             last_error = ?3
         WHERE seq = ?1;",
        params![seq, attempts, error],
    )?;
    Ok(())
}

pub fn pending_count(conn: &Connection) -> RepoResult<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_outbox;", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}
