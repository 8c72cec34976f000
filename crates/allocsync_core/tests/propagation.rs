use allocsync_core::repo::outbox_repo::{self, EntityKind};
use allocsync_core::shard::replica::{find_candidate_replica, find_internship_replica};
use allocsync_core::sync::propagator::PropagationOutcome;
use allocsync_core::{
    open_db_in_memory, CacheLayer, Candidate, Internship, KeyedLocks, MasterRepository,
    RegionShard, RetryPolicy, ShutdownSignal, SqliteMasterRepository, SqliteShardSink,
    SyncConfig, SyncService, TierShard,
};
use rusqlite::Connection;
use std::sync::Arc;

#[test]
fn replaying_a_delivered_change_leaves_replica_untouched() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let outcome = service
        .upsert_internship(&Internship::new("I1", "IT", "Tier2", 4, "Goa"))
        .unwrap();
    assert!(outcome.fully_synced());
    let before = find_internship_replica(&conn, "I1").unwrap().unwrap();
    assert_eq!(before.shard, TierShard::Tier2);

    let replay = service
        .propagator()
        .sync_entity(EntityKind::Internship, "I1", outcome.revision)
        .unwrap();
    assert!(matches!(replay, PropagationOutcome::AlreadyCurrent { .. }));

    let after = find_internship_replica(&conn, "I1").unwrap().unwrap();
    assert_eq!(after, before);
}

#[test]
fn tier_change_moves_row_between_shards() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
        .unwrap();
    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier3", 4, "Goa"))
        .unwrap();

    let replica = find_internship_replica(&conn, "I1").unwrap().unwrap();
    assert_eq!(replica.shard, TierShard::Tier3);
    assert_eq!(table_count(&conn, "internships_tier1"), 0);
    assert_eq!(table_count(&conn, "internships_tier3"), 1);
}

#[test]
fn stale_payload_never_overwrites_newer_replica() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let repo = SqliteMasterRepository::new(&conn);

    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
        .unwrap();
    let old = repo.get_internship("I1").unwrap().unwrap();
    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier1", 9, "Goa"))
        .unwrap();

    let late = service.propagator().propagate_internship(&old).unwrap();
    assert!(matches!(late, PropagationOutcome::AlreadyCurrent { .. }));

    let replica = find_internship_replica(&conn, "I1").unwrap().unwrap();
    assert_eq!(replica.internship.capacity, 9);
}

#[test]
fn late_payload_for_old_tier_keeps_a_single_copy() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let repo = SqliteMasterRepository::new(&conn);

    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier3", 4, "Goa"))
        .unwrap();
    let old = repo.get_internship("I1").unwrap().unwrap();
    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
        .unwrap();

    let late = service.propagator().propagate_internship(&old).unwrap();
    assert!(matches!(late, PropagationOutcome::AlreadyCurrent { .. }));

    assert_eq!(table_count(&conn, "internships_tier1"), 1);
    assert_eq!(table_count(&conn, "internships_tier3"), 0);
    let replica = find_internship_replica(&conn, "I1").unwrap().unwrap();
    assert_eq!(replica.shard, TierShard::Tier1);
}

#[test]
fn region_routing_ignores_case_and_spacing() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .upsert_candidate(&Candidate::new("S1", Some("  tamil   NADU ")))
        .unwrap();
    let replica = find_candidate_replica(&conn, "S1").unwrap().unwrap();
    assert_eq!(replica.shard, RegionShard::South);

    service
        .upsert_candidate(&Candidate::new("S1", Some("Punjab")))
        .unwrap();
    let replica = find_candidate_replica(&conn, "S1").unwrap().unwrap();
    assert_eq!(replica.shard, RegionShard::North);
    assert_eq!(table_count(&conn, "candidates_south"), 0);
}

#[test]
fn candidate_moving_to_unknown_state_leaves_every_region() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .upsert_candidate(&Candidate::new("S1", Some("Kerala")))
        .unwrap();
    let outcome = service
        .upsert_candidate(&Candidate::new("S1", Some("Atlantis")))
        .unwrap();

    assert!(matches!(
        &outcome.propagation[0],
        allocsync_core::PropagationStatus::Delivered {
            outcome: PropagationOutcome::Unrouted { removed: 1, .. },
            ..
        }
    ));
    assert!(find_candidate_replica(&conn, "S1").unwrap().is_none());
    assert_eq!(outbox_repo::pending_count(&conn).unwrap(), 0);
}

#[test]
fn deletes_remove_replica_copies() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S1", Some("Goa")))
        .unwrap();

    service.delete_internship("I1").unwrap();
    service.delete_candidate("S1").unwrap();

    assert!(find_internship_replica(&conn, "I1").unwrap().is_none());
    assert!(find_candidate_replica(&conn, "S1").unwrap().is_none());
    assert_eq!(outbox_repo::pending_count(&conn).unwrap(), 0);
}

#[test]
fn drain_delivers_writes_committed_without_propagation() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteMasterRepository::new(&conn);
    repo.upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
        .unwrap();
    repo.upsert_internship(&Internship::new("I1", "IT", "Tier2", 4, "Goa"))
        .unwrap();
    repo.upsert_candidate(&Candidate::new("S1", Some("Bihar")))
        .unwrap();
    assert_eq!(outbox_repo::pending_count(&conn).unwrap(), 3);

    let report = service(&conn).drain().unwrap();

    assert!(report.failures.is_empty());
    assert!(!report.aborted);
    assert_eq!(outbox_repo::pending_count(&conn).unwrap(), 0);
    let replica = find_internship_replica(&conn, "I1").unwrap().unwrap();
    assert_eq!(replica.shard, TierShard::Tier2);
    assert_eq!(table_count(&conn, "internships_tier1"), 0);
    let candidate = find_candidate_replica(&conn, "S1").unwrap().unwrap();
    assert_eq!(candidate.shard, RegionShard::East);
}

#[test]
fn rebuild_matches_master_and_replay_is_a_no_op() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteMasterRepository::new(&conn);
    repo.upsert_internship(&Internship::new("I1", "IT", "Tier1", 4, "Goa"))
        .unwrap();
    repo.upsert_internship(&Internship::new("I2", "IT", "Legacy", 4, "Goa"))
        .unwrap();
    repo.upsert_candidate(&Candidate::new("S1", Some("Gujarat")))
        .unwrap();
    repo.upsert_candidate(&Candidate::new("S2", None)).unwrap();

    let service = service(&conn);
    let rebuilt = service.rebuild_shards().unwrap();
    assert_eq!(rebuilt.internships, 1);
    assert_eq!(rebuilt.unrouted_internships, 1);
    assert_eq!(rebuilt.candidates, 1);
    assert_eq!(rebuilt.unrouted_candidates, 1);

    let snapshot = find_internship_replica(&conn, "I1").unwrap().unwrap();
    let report = service.drain().unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(report.already_current, 2);
    assert_eq!(report.unrouted, 2);
    assert_eq!(find_internship_replica(&conn, "I1").unwrap().unwrap(), snapshot);
}

fn service(conn: &Connection) -> SyncService<'_, SqliteShardSink<'_>> {
    let config = SyncConfig {
        retry: RetryPolicy::immediate(2),
        ..SyncConfig::default()
    };
    SyncService::new(
        conn,
        SqliteShardSink::new(conn),
        CacheLayer::disabled(),
        Arc::new(KeyedLocks::new()),
        ShutdownSignal::new(),
        &config,
    )
}

fn table_count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| row.get(0))
        .unwrap()
}
