//! Read-side use cases behind the read-through cache.

use crate::cache::keys::{self, CacheTtls, KeyClass};
use crate::cache::CacheLayer;
use crate::model::internship::Internship;
use crate::repo::master_repo::{InternshipListQuery, MasterRepository, SqliteMasterRepository};
use crate::repo::RepoResult;
use crate::shard::replica::list_tier_replica;
use crate::shard::router::{route_candidate, route_internship, RegionShard, TierShard};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Headline numbers for the admin dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub internships: u64,
    pub candidates: u64,
    pub allocations: u64,
    pub total_capacity: u64,
    /// Keyed by tier shard name; unknown tiers are counted under `unrouted`.
    pub internships_per_tier: BTreeMap<String, u64>,
    /// Keyed by region shard name; missing or unknown states under `unrouted`.
    pub candidates_per_region: BTreeMap<String, u64>,
}

const UNROUTED: &str = "unrouted";

pub struct QueryService<'conn> {
    conn: &'conn Connection,
    repo: SqliteMasterRepository<'conn>,
    cache: CacheLayer,
    ttls: CacheTtls,
}

impl<'conn> QueryService<'conn> {
    pub fn new(conn: &'conn Connection, cache: CacheLayer, ttls: CacheTtls) -> Self {
        Self {
            conn,
            repo: SqliteMasterRepository::new(conn),
            cache,
            ttls,
        }
    }

    pub fn list_internships(&self) -> RepoResult<Vec<Internship>> {
        self.cache.get_or_load(
            &keys::internships_all(),
            self.ttls.ttl(KeyClass::Listing),
            || self.repo.list_internships(&InternshipListQuery::default()),
        )
    }

    /// Served from the tier replica, so it reflects what has been propagated.
    pub fn list_internships_by_tier(&self, tier: TierShard) -> RepoResult<Vec<Internship>> {
        self.cache.get_or_load(
            &keys::internships_by_tier(tier.as_str()),
            self.ttls.ttl(KeyClass::Listing),
            || -> RepoResult<Vec<Internship>> {
                Ok(list_tier_replica(self.conn, tier)?
                    .into_iter()
                    .map(|replica| replica.internship)
                    .collect())
            },
        )
    }

    pub fn list_internships_by_state(&self, state: &str) -> RepoResult<Vec<Internship>> {
        let query = InternshipListQuery {
            state: Some(state.to_string()),
            ..InternshipListQuery::default()
        };
        self.cache.get_or_load(
            &keys::internships_by_state(state),
            self.ttls.ttl(KeyClass::Listing),
            || self.repo.list_internships(&query),
        )
    }

    pub fn candidate_count(&self) -> RepoResult<u64> {
        self.cache.get_or_load(
            &keys::candidates_count(),
            self.ttls.ttl(KeyClass::Statistics),
            || self.repo.count_candidates(None),
        )
    }

    pub fn candidate_count_by_state(&self, state: &str) -> RepoResult<u64> {
        self.cache.get_or_load(
            &keys::candidates_state_count(state),
            self.ttls.ttl(KeyClass::Statistics),
            || self.repo.count_candidates(Some(state)),
        )
    }

    pub fn dashboard_stats(&self) -> RepoResult<DashboardStats> {
        self.cache.get_or_load(
            &keys::stats_dashboard(),
            self.ttls.ttl(KeyClass::Statistics),
            || load_dashboard_stats(self.conn),
        )
    }
}

fn load_dashboard_stats(conn: &Connection) -> RepoResult<DashboardStats> {
    let (internships, total_capacity): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(capacity), 0) FROM internships;",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let candidates: i64 = conn.query_row("SELECT COUNT(*) FROM candidates;", [], |row| row.get(0))?;
    let allocations: i64 =
        conn.query_row("SELECT COUNT(*) FROM allocations;", [], |row| row.get(0))?;

    let mut internships_per_tier: BTreeMap<String, u64> = TierShard::ALL
        .iter()
        .map(|shard| (shard.as_str().to_string(), 0))
        .collect();
    let mut stmt = conn.prepare("SELECT tier, COUNT(*) FROM internships GROUP BY tier;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let tier: String = row.get(0)?;
        let count = row.get::<_, i64>(1)?.max(0) as u64;
        let bucket = route_internship(&tier).map_or(UNROUTED, TierShard::as_str);
        *internships_per_tier.entry(bucket.to_string()).or_default() += count;
    }

    let mut candidates_per_region: BTreeMap<String, u64> = RegionShard::ALL
        .iter()
        .map(|shard| (shard.as_str().to_string(), 0))
        .collect();
    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM candidates GROUP BY state;")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let state: Option<String> = row.get(0)?;
        let count = row.get::<_, i64>(1)?.max(0) as u64;
        let bucket = state
            .as_deref()
            .and_then(route_candidate)
            .map_or(UNROUTED, RegionShard::as_str);
        *candidates_per_region.entry(bucket.to_string()).or_default() += count;
    }

    Ok(DashboardStats {
        internships: internships.max(0) as u64,
        candidates: candidates.max(0) as u64,
        allocations: allocations.max(0) as u64,
        total_capacity: total_capacity.max(0) as u64,
        internships_per_tier,
        candidates_per_region,
    })
}

#[cfg(test)]
mod tests {
    use super::QueryService;
    use crate::cache::keys::CacheTtls;
    use crate::cache::memory::MemoryCache;
    use crate::cache::CacheLayer;
    use crate::db::open_db_in_memory;
    use crate::model::candidate::Candidate;
    use crate::model::internship::Internship;
    use crate::repo::master_repo::{MasterRepository, SqliteMasterRepository};
    use std::sync::Arc;

    #[test]
    fn cached_count_is_served_until_invalidated() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteMasterRepository::new(&conn);
        let cache = CacheLayer::new(Arc::new(MemoryCache::default()));
        let queries = QueryService::new(&conn, cache.clone(), CacheTtls::default());

        repo.upsert_candidate(&Candidate::new("S1", Some("Goa"))).unwrap();
        assert_eq!(queries.candidate_count().unwrap(), 1);

        repo.upsert_candidate(&Candidate::new("S2", Some("Goa"))).unwrap();
        assert_eq!(queries.candidate_count().unwrap(), 1);

        cache.delete_by_prefix("candidates:");
        assert_eq!(queries.candidate_count().unwrap(), 2);
    }

    #[test]
    fn dashboard_buckets_unknown_values() {
        let conn = open_db_in_memory().unwrap();
        let repo = SqliteMasterRepository::new(&conn);
        repo.upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
            .unwrap();
        repo.upsert_internship(&Internship::new("I2", "IT", "Legacy", 6, "Goa"))
            .unwrap();
        repo.upsert_candidate(&Candidate::new("S1", Some("Kerala"))).unwrap();
        repo.upsert_candidate(&Candidate::new("S2", None)).unwrap();

        let stats = QueryService::new(&conn, CacheLayer::disabled(), CacheTtls::default())
            .dashboard_stats()
            .unwrap();

        assert_eq!(stats.internships, 2);
        assert_eq!(stats.total_capacity, 10);
        assert_eq!(stats.internships_per_tier["Tier1"], 1);
        assert_eq!(stats.internships_per_tier["unrouted"], 1);
        assert_eq!(stats.candidates_per_region["south"], 1);
        assert_eq!(stats.candidates_per_region["unrouted"], 1);
        assert_eq!(stats.candidates_per_region["north"], 0);
    }
}
