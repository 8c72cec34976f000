use allocsync_core::shard::replica::find_internship_replica;
use allocsync_core::{
    open_db, open_db_in_memory, CacheLayer, Candidate, Internship, KeyedLocks, RetryPolicy,
    ShutdownSignal, SqliteShardSink, SyncConfig, SyncService,
};
use rusqlite::Connection;
use std::sync::Arc;
use std::thread;

#[test]
fn three_candidates_over_two_internships_count_two_each() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, Arc::new(KeyedLocks::new()));
    for id in ["A", "B"] {
        service
            .upsert_internship(&Internship::new(id, "IT", "Tier1", 5, "Goa"))
            .unwrap();
    }

    let preferences: [&[&str]; 3] = [&["A"], &["A", "B"], &["B"]];
    for (n, prefs) in preferences.into_iter().enumerate() {
        let student_id = format!("S{n}");
        service
            .upsert_candidate(
                &Candidate::new(student_id.as_str(), Some("Goa"))
                    .with_preferences(prefs.iter().copied()),
            )
            .unwrap();
    }

    assert_eq!(preference_count(&conn, "A"), 2);
    assert_eq!(preference_count(&conn, "B"), 2);
}

#[test]
fn counts_match_candidates_preferring_each_internship() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, Arc::new(KeyedLocks::new()));
    for id in ["A", "B", "C"] {
        service
            .upsert_internship(&Internship::new(id, "IT", "Tier1", 5, "Goa"))
            .unwrap();
    }

    service
        .upsert_candidate(&Candidate::new("S1", Some("Goa")).with_preferences(["A", "B"]))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S2", Some("Goa")).with_preferences(["B", "A"]))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S3", Some("Goa")).with_preferences(["C", "C"]))
        .unwrap();

    assert_eq!(preference_count(&conn, "A"), 2);
    assert_eq!(preference_count(&conn, "B"), 2);
    assert_eq!(preference_count(&conn, "C"), 1);
}

#[test]
fn changing_and_deleting_candidates_decrements_old_targets() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, Arc::new(KeyedLocks::new()));
    for id in ["A", "B"] {
        service
            .upsert_internship(&Internship::new(id, "IT", "Tier2", 5, "Goa"))
            .unwrap();
    }
    service
        .upsert_candidate(&Candidate::new("S1", Some("Goa")).with_preferences(["A", "B"]))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S2", Some("Goa")).with_preferences(["A"]))
        .unwrap();

    let outcome = service
        .upsert_candidate(&Candidate::new("S2", Some("Goa")).with_preferences(["B"]))
        .unwrap();
    assert!(outcome.fully_synced());
    assert_eq!(preference_count(&conn, "A"), 1);
    assert_eq!(preference_count(&conn, "B"), 2);

    service.delete_candidate("S1").unwrap();
    assert_eq!(preference_count(&conn, "A"), 0);
    assert_eq!(preference_count(&conn, "B"), 1);

    let replica = find_internship_replica(&conn, "B").unwrap().unwrap();
    assert_eq!(replica.internship.preference_count, 1);
}

#[test]
fn late_internship_picks_up_existing_preferences() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, Arc::new(KeyedLocks::new()));

    let outcome = service
        .upsert_candidate(&Candidate::new("S1", None).with_preferences(["Z"]))
        .unwrap();
    assert_eq!(outcome.aggregates.missing, vec!["Z".to_string()]);

    let outcome = service
        .upsert_internship(&Internship::new("Z", "IT", "Tier3", 1, "Goa"))
        .unwrap();
    assert_eq!(outcome.aggregates.updated.len(), 1);
    assert_eq!(preference_count(&conn, "Z"), 1);

    let replica = find_internship_replica(&conn, "Z").unwrap().unwrap();
    assert_eq!(replica.internship.preference_count, 1);
}

#[test]
fn recompute_all_repairs_drifted_counts() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, Arc::new(KeyedLocks::new()));
    service
        .upsert_internship(&Internship::new("A", "IT", "Tier1", 5, "Goa"))
        .unwrap();
    service
        .upsert_candidate(&Candidate::new("S1", Some("Goa")).with_preferences(["A"]))
        .unwrap();
    conn.execute(
        "UPDATE internships SET preference_count = 7 WHERE internship_id = 'A';",
        [],
    )
    .unwrap();

    let (aggregates, propagation) = service.recompute_all().unwrap();

    assert_eq!(aggregates.updated.len(), 1);
    assert!(propagation.iter().all(|status| status.is_delivered()));
    assert_eq!(preference_count(&conn, "A"), 1);
    let replica = find_internship_replica(&conn, "A").unwrap().unwrap();
    assert_eq!(replica.internship.preference_count, 1);

    let (again, _) = service.recompute_all().unwrap();
    assert!(again.updated.is_empty());
    assert_eq!(again.unchanged, vec!["A".to_string()]);
}

#[test]
fn concurrent_writers_converge_to_exact_counts() {
    const WRITERS: usize = 4;
    const CANDIDATES_PER_WRITER: usize = 8;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("allocsync.db");
    let locks = Arc::new(KeyedLocks::new());

    {
        let conn = open_db(&path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        let service = service(&conn, locks.clone());
        for id in ["A", "B"] {
            service
                .upsert_internship(&Internship::new(id, "IT", "Tier1", 50, "Goa"))
                .unwrap();
        }
    }

    let connections = (0..WRITERS)
        .map(|_| open_db(&path).unwrap())
        .collect::<Vec<_>>();
    let handles = connections
        .into_iter()
        .enumerate()
        .map(|(writer, conn)| {
            let locks = locks.clone();
            thread::spawn(move || {
                let service = service(&conn, locks);
                for n in 0..CANDIDATES_PER_WRITER {
                    let student_id = format!("S{writer}_{n}");
                    service
                        .upsert_candidate(
                            &Candidate::new(student_id.as_str(), Some("Goa"))
                                .with_preferences(["A", "B"]),
                        )
                        .unwrap();
                    if n % 2 == 0 {
                        service
                            .upsert_candidate(
                                &Candidate::new(student_id.as_str(), Some("Goa"))
                                    .with_preferences(["B"]),
                            )
                            .unwrap();
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    let conn = open_db(&path).unwrap();
    let total = WRITERS * CANDIDATES_PER_WRITER;
    assert_eq!(preference_count(&conn, "A"), (total / 2) as i64);
    assert_eq!(preference_count(&conn, "B"), total as i64);
    let replica = find_internship_replica(&conn, "B").unwrap().unwrap();
    assert_eq!(replica.internship.preference_count, total as u32);
}

fn service(conn: &Connection, locks: Arc<KeyedLocks>) -> SyncService<'_, SqliteShardSink<'_>> {
    let config = SyncConfig {
        retry: RetryPolicy::immediate(3),
        ..SyncConfig::default()
    };
    SyncService::new(
        conn,
        SqliteShardSink::new(conn),
        CacheLayer::disabled(),
        locks,
        ShutdownSignal::new(),
        &config,
    )
}

fn preference_count(conn: &Connection, internship_id: &str) -> i64 {
    conn.query_row(
        "SELECT preference_count FROM internships WHERE internship_id = ?1;",
        [internship_id],
        |row| row.get(0),
    )
    .unwrap()
}
