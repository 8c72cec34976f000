//! Replicated-aggregate synchronization engine for internship allocation data.
//!
//! The master store is the single source of truth. Tier and region replicas,
//! the `preference_count` aggregate and cached reads are all derived from it.

pub mod audit;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod shard;
pub mod sync;

pub use audit::report::AuditReport;
pub use audit::{run_audit, Auditor};
pub use cache::memory::MemoryCache;
pub use cache::{CacheError, CacheLayer, KvCache};
pub use config::{ConfigError, RetryPolicy, SyncConfig};
pub use db::{open_db, open_db_in_memory, open_db_read_only, DbError};
pub use logging::{default_log_level, init_logging, init_stderr_logging, logging_status};
pub use model::candidate::Candidate;
pub use model::internship::{Allocation, Company, Internship};
pub use repo::master_repo::{MasterRepository, SqliteMasterRepository};
pub use repo::{RepoError, RepoResult};
pub use service::query_service::{DashboardStats, QueryService};
pub use service::sync_service::{MutationOutcome, PropagationStatus, SyncService};
pub use shard::router::{route_candidate, route_internship, RegionShard, TierShard};
pub use shard::sink::{ShardSink, SinkError, SqliteShardSink};
pub use sync::aggregate::{AggregateMaintainer, AggregateReport};
pub use sync::locks::KeyedLocks;
pub use sync::propagator::{PropagationError, PropagationFailure, Propagator};
pub use sync::shutdown::ShutdownSignal;

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
