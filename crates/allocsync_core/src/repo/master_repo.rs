//! Master store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide validated writes over the canonical master tables.
//! - Stamp every internship/candidate write with its commit sequence and
//!   enqueue it for propagation in the same transaction.
//!
//! # Invariants
//! - Write paths call `validate()` before SQL mutations.
//! - `preference_count` is never written from caller input; only the
//!   aggregate maintainer updates it.
//! - Candidate writes return the pre-write snapshot read inside the write
//!   transaction, so the maintainer sees the exact old preference set.

use crate::model::candidate::{Candidate, PREFERENCE_SLOTS};
use crate::model::internship::{Allocation, Company, Internship};
use crate::repo::outbox_repo::{self, EntityKind};
use crate::repo::{RepoError, RepoResult};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior,
};

const INTERNSHIP_SELECT_SQL: &str = "SELECT
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
    revision
FROM internships";

const CANDIDATE_SELECT_SQL: &str = "SELECT
    student_id,
    state,
    reservation,
    pref_1,
    pref_2,
    pref_3,
    pref_4,
    pref_5,
    pref_6,
    revision
FROM candidates";

/// Acknowledgement of one committed master write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub kind: EntityKind,
    pub entity_id: String,
    /// Commit sequence assigned to this write.
    pub revision: i64,
}

/// Result of a committed candidate write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateWrite {
    pub receipt: WriteReceipt,
    /// Row state before the write; `None` for inserts.
    pub previous: Option<Candidate>,
    /// Row state after the write; `None` for deletes.
    pub current: Option<Candidate>,
}

/// Filter for internship listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternshipListQuery {
    pub tier: Option<String>,
    pub state: Option<String>,
    pub limit: Option<u32>,
}

/// Repository interface for master-store operations.
pub trait MasterRepository {
    fn upsert_company(&self, company: &Company) -> RepoResult<()>;
    /// Inserts or replaces an internship, keeping its stored aggregate.
    fn upsert_internship(&self, row: &Internship) -> RepoResult<WriteReceipt>;
    fn delete_internship(&self, internship_id: &str) -> RepoResult<WriteReceipt>;
    fn get_internship(&self, internship_id: &str) -> RepoResult<Option<Internship>>;
    fn list_internships(&self, query: &InternshipListQuery) -> RepoResult<Vec<Internship>>;
    fn upsert_candidate(&self, row: &Candidate) -> RepoResult<CandidateWrite>;
    fn delete_candidate(&self, student_id: &str) -> RepoResult<CandidateWrite>;
    fn get_candidate(&self, student_id: &str) -> RepoResult<Option<Candidate>>;
    /// Counts candidates, optionally restricted to one exact state value.
    fn count_candidates(&self, state: Option<&str>) -> RepoResult<u64>;
    fn insert_allocation(&self, allocation: &Allocation) -> RepoResult<()>;
}

/// SQLite-backed master repository.
pub struct SqliteMasterRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteMasterRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn begin(&self) -> RepoResult<Transaction<'conn>> {
        Ok(Transaction::new_unchecked(
            self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

impl MasterRepository for SqliteMasterRepository<'_> {
    fn upsert_company(&self, company: &Company) -> RepoResult<()> {
        company.validate()?;
        self.conn.execute(
            "INSERT INTO companies (company_id, name) VALUES (?1, ?2)
             ON CONFLICT(company_id) DO UPDATE SET name = excluded.name;",
            params![company.company_id.as_str(), company.name.as_str()],
        )?;
        Ok(())
    }

    fn upsert_internship(&self, row: &Internship) -> RepoResult<WriteReceipt> {
        row.validate()?;

        let tx = self.begin()?;
        let revision = outbox_repo::append(&tx, EntityKind::Internship, &row.internship_id)?;
        tx.execute(
            "INSERT INTO internships (
                internship_id,
                company_id,
                sector,
                tier,
                capacity,
                required_skills,
                stipend,
                location_type,
                state,
                revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(internship_id) DO UPDATE SET
                company_id = excluded.company_id,
                sector = excluded.sector,
                tier = excluded.tier,
                capacity = excluded.capacity,
                required_skills = excluded.required_skills,
                stipend = excluded.stipend,
                location_type = excluded.location_type,
                state = excluded.state,
                revision = excluded.revision,
                updated_at = (strftime('%s', 'now') * 1000);",
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
                revision,
            ],
        )?;
        tx.commit()?;

        Ok(WriteReceipt {
            kind: EntityKind::Internship,
            entity_id: row.internship_id.clone(),
            revision,
        })
    }

    fn delete_internship(&self, internship_id: &str) -> RepoResult<WriteReceipt> {
        let tx = self.begin()?;
        if load_internship(&tx, internship_id)?.is_none() {
            return Err(RepoError::NotFound {
                kind: EntityKind::Internship,
                id: internship_id.to_string(),
            });
        }
        let revision = outbox_repo::append(&tx, EntityKind::Internship, internship_id)?;
        tx.execute(
            "DELETE FROM internships WHERE internship_id = ?1;",
            [internship_id],
        )?;
        tx.commit()?;

        Ok(WriteReceipt {
            kind: EntityKind::Internship,
            entity_id: internship_id.to_string(),
            revision,
        })
    }

    fn get_internship(&self, internship_id: &str) -> RepoResult<Option<Internship>> {
        load_internship(self.conn, internship_id)
    }

    fn list_internships(&self, query: &InternshipListQuery) -> RepoResult<Vec<Internship>> {
        let mut sql = format!("{INTERNSHIP_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(tier) = &query.tier {
            sql.push_str(" AND tier = ?");
            bind_values.push(Value::Text(tier.clone()));
        }
        if let Some(state) = &query.state {
            sql.push_str(" AND state = ?");
            bind_values.push(Value::Text(state.clone()));
        }

        sql.push_str(" ORDER BY internship_id ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_internship_row(row)?);
        }
        Ok(items)
    }

    fn upsert_candidate(&self, row: &Candidate) -> RepoResult<CandidateWrite> {
        row.validate()?;
        let mut normalized = row.clone();
        normalized.normalize();

        let tx = self.begin()?;
        let previous = load_candidate(&tx, &normalized.student_id)?;
        let revision = outbox_repo::append(&tx, EntityKind::Candidate, &normalized.student_id)?;
        let [p1, p2, p3, p4, p5, p6] = &normalized.preferences;
        tx.execute(
            "INSERT INTO candidates (
                student_id,
                state,
                reservation,
                pref_1,
                pref_2,
                pref_3,
                pref_4,
                pref_5,
                pref_6,
                revision
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
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
                updated_at = (strftime('%s', 'now') * 1000);",
            params![
                normalized.student_id.as_str(),
                normalized.state.as_deref(),
                normalized.reservation.as_deref(),
                p1.as_deref(),
                p2.as_deref(),
                p3.as_deref(),
                p4.as_deref(),
                p5.as_deref(),
                p6.as_deref(),
                revision,
            ],
        )?;
        tx.commit()?;

        normalized.revision = revision;
        Ok(CandidateWrite {
            receipt: WriteReceipt {
                kind: EntityKind::Candidate,
                entity_id: normalized.student_id.clone(),
                revision,
            },
            previous,
            current: Some(normalized),
        })
    }

    fn delete_candidate(&self, student_id: &str) -> RepoResult<CandidateWrite> {
        let tx = self.begin()?;
        let Some(previous) = load_candidate(&tx, student_id)? else {
            return Err(RepoError::NotFound {
                kind: EntityKind::Candidate,
                id: student_id.to_string(),
            });
        };
        let revision = outbox_repo::append(&tx, EntityKind::Candidate, student_id)?;
        tx.execute("DELETE FROM candidates WHERE student_id = ?1;", [student_id])?;
        tx.commit()?;

        Ok(CandidateWrite {
            receipt: WriteReceipt {
                kind: EntityKind::Candidate,
                entity_id: student_id.to_string(),
                revision,
            },
            previous: Some(previous),
            current: None,
        })
    }

    fn get_candidate(&self, student_id: &str) -> RepoResult<Option<Candidate>> {
        load_candidate(self.conn, student_id)
    }

    fn count_candidates(&self, state: Option<&str>) -> RepoResult<u64> {
        let count: i64 = match state {
            Some(state) => self.conn.query_row(
                "SELECT COUNT(*) FROM candidates WHERE state = ?1;",
                [state],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM candidates;", [], |row| row.get(0))?,
        };
        Ok(count.max(0) as u64)
    }

    fn insert_allocation(&self, allocation: &Allocation) -> RepoResult<()> {
        allocation.validate()?;
        self.conn.execute(
            "INSERT INTO allocations (student_id, internship_id, category_allotted)
             VALUES (?1, ?2, ?3);",
            params![
                allocation.student_id.as_str(),
                allocation.internship_id.as_str(),
                allocation.category_allotted.as_deref(),
            ],
        )?;
        Ok(())
    }
}

/// Loads one master internship row.
pub fn load_internship(conn: &Connection, internship_id: &str) -> RepoResult<Option<Internship>> {
    let mut stmt = conn.prepare(&format!(
        "{INTERNSHIP_SELECT_SQL} WHERE internship_id = ?1;"
    ))?;
    let mut rows = stmt.query([internship_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_internship_row(row)?));
    }
    Ok(None)
}

/// Loads one master candidate row.
pub fn load_candidate(conn: &Connection, student_id: &str) -> RepoResult<Option<Candidate>> {
    let mut stmt = conn.prepare(&format!("{CANDIDATE_SELECT_SQL} WHERE student_id = ?1;"))?;
    let mut rows = stmt.query([student_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_candidate_row(row)?));
    }
    Ok(None)
}

/// Loads every master internship, ordered by id.
pub fn load_all_internships(conn: &Connection) -> RepoResult<Vec<Internship>> {
    SqliteMasterRepository::new(conn).list_internships(&InternshipListQuery::default())
}

/// Loads every master candidate, ordered by id.
pub fn load_all_candidates(conn: &Connection) -> RepoResult<Vec<Candidate>> {
    let mut stmt = conn.prepare(&format!("{CANDIDATE_SELECT_SQL} ORDER BY student_id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_candidate_row(row)?);
    }
    Ok(items)
}

/// Exact number of candidates whose preference slots contain `internship_id`.
///
/// A candidate listing the same id in several slots counts once.
pub fn count_preferring(conn: &Connection, internship_id: &str) -> RepoResult<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM candidates
         WHERE ?1 IN (pref_1, pref_2, pref_3, pref_4, pref_5, pref_6);",
        [internship_id],
        |row| row.get(0),
    )?;
    u32::try_from(count)
        .map_err(|_| RepoError::InvalidData(format!("preference count {count} out of range")))
}

/// Outcome of [`write_preference_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountWrite {
    /// Stored value changed; carries the new revision.
    Updated(i64),
    Unchanged,
    /// The internship no longer exists.
    Missing,
}

/// Writes a recomputed aggregate and enqueues the row for propagation.
///
/// Must run inside the caller's transaction.
pub fn write_preference_count(
    conn: &Connection,
    internship_id: &str,
    count: u32,
) -> RepoResult<CountWrite> {
    let stored: Option<u32> = conn
        .query_row(
            "SELECT preference_count FROM internships WHERE internship_id = ?1;",
            [internship_id],
            |row| row.get(0),
        )
        .optional()?;
    match stored {
        None => Ok(CountWrite::Missing),
        Some(stored) if stored == count => Ok(CountWrite::Unchanged),
        Some(_) => {
            let revision = outbox_repo::append(conn, EntityKind::Internship, internship_id)?;
            conn.execute(
                "UPDATE internships
                 SET preference_count = ?2,
                     revision = ?3,
                     updated_at = (strftime('%s', 'now') * 1000)
                 WHERE internship_id = ?1;",
                params![internship_id, count, revision],
            )?;
            Ok(CountWrite::Updated(revision))
        }
    }
}

/// Decodes an internship from master or replica columns.
pub fn parse_internship_row(row: &Row<'_>) -> RepoResult<Internship> {
    let internship = Internship {
        internship_id: row.get("internship_id")?,
        company_id: row.get("company_id")?,
        sector: row.get("sector")?,
        tier: row.get("tier")?,
        capacity: row.get("capacity")?,
        required_skills: row.get("required_skills")?,
        stipend: row.get("stipend")?,
        location_type: row.get("location_type")?,
        state: row.get("state")?,
        preference_count: row.get("preference_count")?,
        revision: row.get("revision")?,
    };
    internship.validate()?;
    Ok(internship)
}

/// Decodes a candidate from master or replica columns.
pub fn parse_candidate_row(row: &Row<'_>) -> RepoResult<Candidate> {
    let mut preferences: [Option<String>; PREFERENCE_SLOTS] = Default::default();
    for (index, slot) in preferences.iter_mut().enumerate() {
        *slot = row.get(PREFERENCE_COLUMNS[index])?;
    }
    let candidate = Candidate {
        student_id: row.get("student_id")?,
        state: row
            .get::<_, Option<String>>("state")?
            .filter(|state| !state.is_empty()),
        reservation: row.get("reservation")?,
        preferences,
        revision: row.get("revision")?,
    };
    candidate.validate()?;
    Ok(candidate)
}

/// Preference column names in rank order.
pub const PREFERENCE_COLUMNS: [&str; PREFERENCE_SLOTS] =
    ["pref_1", "pref_2", "pref_3", "pref_4", "pref_5", "pref_6"];
