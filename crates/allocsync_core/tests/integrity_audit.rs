use allocsync_core::audit::report::CheckOutcome;
use allocsync_core::{
    open_db, open_db_in_memory, open_db_read_only, run_audit, Allocation, Auditor, CacheLayer,
    Candidate, Internship, KeyedLocks, MasterRepository, RetryPolicy, ShutdownSignal,
    SqliteMasterRepository, SqliteShardSink, SyncConfig, SyncService,
};
use rusqlite::Connection;
use std::sync::Arc;

#[test]
fn synchronized_store_audits_clean() {
    let conn = open_db_in_memory().unwrap();
    seed_synced(&conn);

    let report = run_audit(&conn);

    assert!(report.failed_checks().is_empty());
    assert!(report.is_clean());
    let tables = report.tables.passed().unwrap();
    assert_eq!(tables.len(), 12);
    assert!(tables.iter().all(|table| table.exists));
    let regions = report.regional_parity.passed().unwrap();
    assert_eq!(regions.master_routable, 2);
    assert_eq!(regions.master_unrouted, 1);
    assert_eq!(regions.shard_total, 2);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["capacity"]["status"], "passed");
    assert_eq!(json["tier_parity"]["result"]["synced"], true);
}

#[test]
fn foreign_keys_report_delete_rules() {
    let conn = open_db_in_memory().unwrap();

    let report = run_audit(&conn);
    let keys = report.foreign_keys.passed().unwrap();

    let allocation_to_candidate = keys
        .iter()
        .find(|key| key.table == "allocations" && key.references_table == "candidates")
        .unwrap();
    assert_eq!(allocation_to_candidate.on_delete, "CASCADE");
    let internship_to_company = keys
        .iter()
        .find(|key| key.table == "internships" && key.column == "company_id")
        .unwrap();
    assert_eq!(internship_to_company.on_delete, "SET NULL");

    let indexes = report.indexes.passed().unwrap();
    assert!(indexes.iter().any(|index| index.name == "idx_candidates_pref_1"));
}

#[test]
fn capacity_overage_reports_allocated_count() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteMasterRepository::new(&conn);
    repo.upsert_internship(&Internship::new("I1", "IT", "Tier1", 5, "Goa"))
        .unwrap();
    repo.upsert_internship(&Internship::new("I2", "IT", "Tier1", 5, "Goa"))
        .unwrap();
    for n in 0..7 {
        let student_id = format!("S{n}");
        repo.upsert_candidate(&Candidate::new(student_id.as_str(), Some("Goa")))
            .unwrap();
        repo.insert_allocation(&allocation(&student_id, "I1")).unwrap();
    }
    repo.insert_allocation(&allocation("S0", "I2")).unwrap();

    let report = Auditor::new(&conn).with_top_n(3).run_audit();
    let capacity = report.capacity.passed().unwrap();

    assert_eq!(capacity.total_overallocated, 1);
    assert_eq!(capacity.total_excess, 2);
    assert_eq!(capacity.top.len(), 1);
    assert_eq!(capacity.top[0].internship_id, "I1");
    assert_eq!(capacity.top[0].capacity, 5);
    assert_eq!(capacity.top[0].allocated, 7);
    assert_eq!(capacity.top[0].over_by, 2);
    assert!(!report.is_clean());
}

#[test]
fn dangling_preferences_are_counted_once_per_slot() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteMasterRepository::new(&conn);
    repo.upsert_internship(&Internship::new("I1", "IT", "Tier1", 5, "Goa"))
        .unwrap();
    repo.upsert_candidate(
        &Candidate::new("S1", Some("Goa")).with_preferences(["GHOST", "I1", "GHOST"]),
    )
    .unwrap();
    repo.upsert_candidate(&Candidate::new("S2", Some("Goa")).with_preferences(["I1", " "]))
        .unwrap();

    let report = run_audit(&conn);
    let prefs = report.preferences.passed().unwrap();

    assert_eq!(prefs.total_invalid, 2);
    assert_eq!(prefs.invalid_per_slot["pref_1"], 1);
    assert_eq!(prefs.invalid_per_slot["pref_2"], 0);
    assert_eq!(prefs.invalid_per_slot["pref_3"], 1);
    assert_eq!(prefs.sample.len(), 2);
    assert!(prefs
        .sample
        .iter()
        .all(|dangling| dangling.student_id == "S1" && dangling.internship_id == "GHOST"));
}

#[test]
fn missing_replica_row_breaks_regional_parity() {
    let conn = open_db_in_memory().unwrap();
    seed_synced(&conn);
    conn.execute("DELETE FROM candidates_west;", []).unwrap();

    let report = run_audit(&conn);
    let regions = report.regional_parity.passed().unwrap();

    assert!(!regions.synced);
    let west = regions
        .per_shard
        .iter()
        .find(|shard| shard.shard == "west")
        .unwrap();
    assert_eq!(west.expected, 1);
    assert_eq!(west.actual, 0);
    assert!(report.tier_parity.passed().unwrap().synced);
    assert!(!report.is_clean());
}

#[test]
fn missing_table_fails_only_the_checks_that_need_it() {
    let conn = open_db_in_memory().unwrap();
    seed_synced(&conn);
    conn.execute_batch("DROP TABLE internships_tier2;").unwrap();

    let report = run_audit(&conn);

    assert_eq!(
        report.failed_checks(),
        vec![
            "tier_parity".to_string(),
            "row_counts.internships_tier2".to_string()
        ]
    );
    assert!(matches!(report.tier_parity, CheckOutcome::Failed(_)));
    let tier2 = report
        .tables
        .passed()
        .unwrap()
        .iter()
        .find(|table| table.table == "internships_tier2")
        .unwrap();
    assert!(!tier2.exists);
    assert!(report.regional_parity.passed().unwrap().synced);
    assert!(report.capacity.passed().is_some());
    assert!(report.stale_aggregates.passed().unwrap().is_empty());
}

#[test]
fn read_only_audit_sees_stale_aggregates_and_pending_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("allocsync.db");
    {
        let conn = open_db(&path).unwrap();
        seed_synced(&conn);
        conn.execute(
            "UPDATE internships SET preference_count = 9 WHERE internship_id = 'I1';",
            [],
        )
        .unwrap();
        SqliteMasterRepository::new(&conn)
            .upsert_candidate(&Candidate::new("S9", Some("Delhi")))
            .unwrap();
    }

    let conn = open_db_read_only(&path).unwrap();
    let report = run_audit(&conn);

    let stale = report.stale_aggregates.passed().unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].internship_id, "I1");
    assert_eq!(stale[0].stored, 9);
    assert_eq!(stale[0].actual, 2);

    let outbox = report.outbox.passed().unwrap();
    assert_eq!(outbox.pending, 1);
    assert_eq!(outbox.oldest_pending.as_ref().unwrap().entity_id, "S9");
    assert!(!report.regional_parity.passed().unwrap().synced);

    let again = run_audit(&conn);
    assert_eq!(again.outbox.passed().unwrap().pending, 1);
    assert_ne!(again.run_id, report.run_id);
}

#[test]
fn allocation_for_unknown_candidate_is_rejected_by_the_store() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteMasterRepository::new(&conn);
    repo.upsert_internship(&Internship::new("I1", "IT", "Tier1", 5, "Goa"))
        .unwrap();

    let err = repo.insert_allocation(&allocation("NOBODY", "I1")).unwrap_err();

    assert!(err.is_constraint_violation());
    let orphans = run_audit(&conn).orphans.passed().cloned().unwrap();
    assert_eq!(orphans.allocations_without_candidate, 0);
}

/// Two routed candidates, one without a state, two tiered internships.
fn seed_synced(conn: &Connection) {
    let config = SyncConfig {
        retry: RetryPolicy::immediate(2),
        ..SyncConfig::default()
    };
    let service = SyncService::new(
        conn,
        SqliteShardSink::new(conn),
        CacheLayer::disabled(),
        Arc::new(KeyedLocks::new()),
        ShutdownSignal::new(),
        &config,
    );
    service
        .upsert_internship(&Internship::new("I1", "IT", "Tier1", 2, "Goa"))
        .unwrap();
    service
        .upsert_internship(&Internship::new("I2", "Finance", "Tier2", 2, "Kerala"))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S1", Some("Goa")).with_preferences(["I1", "I2"]))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S2", Some("Kerala")).with_preferences(["I1"]))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S3", None))
        .unwrap();
    service.insert_allocation(&allocation("S1", "I1")).unwrap();
}

fn allocation(student_id: &str, internship_id: &str) -> Allocation {
    Allocation {
        student_id: student_id.to_string(),
        internship_id: internship_id.to_string(),
        category_allotted: None,
    }
}
