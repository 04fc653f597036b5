//! Ordered scans, reverse scans, and phantom avoidance.

mod common;

use std::sync::{Arc, Barrier};

use basalt::{ConcurrencyControlProtocol, TxStatus};
use common::{decode_i64, encode_i64, run_handler, volatile_db};

#[test]
fn scan_returns_keys_in_order_with_values() {
    let db = volatile_db(ConcurrencyControlProtocol::SiloNwr);
    run_handler(&db, |tx| {
        tx.write("alice", &encode_i64(1));
        tx.write("bob", &encode_i64(2));
        tx.write("carol", &encode_i64(3));
    });
    db.fence();

    run_handler(&db, |tx| {
        let mut seen = Vec::new();
        let count = tx.scan("alice", Some("carol"), |key, value| {
            seen.push((key.to_string(), decode_i64(value)));
            false
        });
        assert_eq!(count, Some(3));
        assert_eq!(
            seen,
            vec![
                ("alice".to_string(), 1),
                ("bob".to_string(), 2),
                ("carol".to_string(), 3)
            ]
        );
    });
}

#[test]
fn scan_bounds_are_inclusive_and_end_is_optional() {
    let db = volatile_db(ConcurrencyControlProtocol::Silo);
    run_handler(&db, |tx| {
        for key in ["a", "b", "c", "d"] {
            tx.write(key, b"v");
        }
    });
    db.fence();

    run_handler(&db, |tx| {
        let mut seen = Vec::new();
        let count = tx.scan("b", Some("c"), |key, _| {
            seen.push(key.to_string());
            false
        });
        assert_eq!(count, Some(2));
        assert_eq!(seen, vec!["b", "c"]);

        let mut unbounded = Vec::new();
        let count = tx.scan("b", None, |key, _| {
            unbounded.push(key.to_string());
            false
        });
        assert_eq!(count, Some(3));
        assert_eq!(unbounded, vec!["b", "c", "d"]);
    });
}

#[test]
fn scan_observes_own_uncommitted_writes() {
    let db = volatile_db(ConcurrencyControlProtocol::SiloNwr);
    run_handler(&db, |tx| {
        tx.write("alice", &encode_i64(1));
        tx.write("carol", &encode_i64(3));
    });
    db.fence();

    run_handler(&db, |tx| {
        tx.insert("bob", &encode_i64(2));
        let mut seen = Vec::new();
        let count = tx.scan("alice", Some("carol"), |key, _| {
            seen.push(key.to_string());
            false
        });
        assert_eq!(count, Some(3));
        assert_eq!(seen, vec!["alice", "bob", "carol"]);
    });
}

#[test]
fn scan_skips_keys_deleted_in_the_same_transaction() {
    let db = volatile_db(ConcurrencyControlProtocol::SiloNwr);
    run_handler(&db, |tx| {
        tx.write("alice", &encode_i64(1));
        tx.write("bob", &encode_i64(2));
    });
    db.fence();

    run_handler(&db, |tx| {
        tx.delete("bob");
        let mut seen = Vec::new();
        let count = tx.scan("alice", Some("carol"), |key, _| {
            seen.push(key.to_string());
            false
        });
        assert_eq!(count, Some(1));
        assert_eq!(seen, vec!["alice"]);
    });
}

#[test]
fn scan_cancels_when_the_visitor_returns_true() {
    let db = volatile_db(ConcurrencyControlProtocol::Silo);
    run_handler(&db, |tx| {
        for key in ["a", "b", "c"] {
            tx.write(key, b"v");
        }
    });
    db.fence();

    run_handler(&db, |tx| {
        let mut seen = Vec::new();
        let count = tx.scan("a", None, |key, _| {
            seen.push(key.to_string());
            key == "b"
        });
        assert_eq!(count, Some(2));
        assert_eq!(seen, vec!["a", "b"]);
    });
}

#[test]
fn reverse_scan_returns_keys_in_descending_order() {
    let db = volatile_db(ConcurrencyControlProtocol::SiloNwr);
    run_handler(&db, |tx| {
        tx.write("alice", &encode_i64(1));
        tx.write("bob", &encode_i64(2));
        tx.write("carol", &encode_i64(3));
    });
    db.fence();

    run_handler(&db, |tx| {
        let mut seen = Vec::new();
        let count = tx.scan_reverse("alice", Some("carol"), |key, value| {
            seen.push((key.to_string(), decode_i64(value)));
            false
        });
        assert_eq!(count, Some(3));
        assert_eq!(
            seen,
            vec![
                ("carol".to_string(), 3),
                ("bob".to_string(), 2),
                ("alice".to_string(), 1)
            ]
        );
    });
}

#[test]
fn reverse_scan_after_delete_skips_the_deleted_key() {
    let db = volatile_db(ConcurrencyControlProtocol::SiloNwr);
    run_handler(&db, |tx| {
        tx.write("alice", &encode_i64(1));
        tx.write("bob", &encode_i64(2));
        tx.write("carol", &encode_i64(3));
    });
    db.fence();
    assert_eq!(run_handler(&db, |tx| tx.delete("bob")), TxStatus::Committed);
    db.fence();

    run_handler(&db, |tx| {
        let mut seen = Vec::new();
        let count = tx.scan_reverse("alice", Some("carol"), |key, value| {
            seen.push((key.to_string(), decode_i64(value)));
            false
        });
        assert_eq!(count, Some(2));
        assert_eq!(
            seen,
            vec![("carol".to_string(), 3), ("alice".to_string(), 1)]
        );
    });
}

#[test]
fn reverse_scan_without_an_end_runs_from_the_maximum_key_down() {
    let db = volatile_db(ConcurrencyControlProtocol::Silo);
    run_handler(&db, |tx| {
        for key in ["bob", "carol", "dave"] {
            tx.write(key, b"v");
        }
    });
    db.fence();

    run_handler(&db, |tx| {
        let mut seen = Vec::new();
        let count = tx.scan_reverse("carol", None, |key, _| {
            seen.push(key.to_string());
            false
        });
        assert_eq!(count, Some(2));
        assert_eq!(seen, vec!["dave", "carol"]);
    });
}

/// A scan of `[alice, carol]` and a concurrent insert of `bob` must not
/// both commit.
#[test]
fn range_scan_phantom_is_prevented() {
    let db = Arc::new(volatile_db(ConcurrencyControlProtocol::SiloNwr));
    run_handler(&db, |tx| {
        tx.write("alice", &encode_i64(1));
        tx.write("carol", &encode_i64(3));
    });
    db.fence();

    let both_started = Arc::new(Barrier::new(2));
    let scan_done = Arc::new(Barrier::new(2));

    let scanner = {
        let db = db.clone();
        let both_started = both_started.clone();
        let scan_done = scan_done.clone();
        std::thread::spawn(move || {
            let mut tx = db.begin_transaction();
            both_started.wait();
            let count = tx.scan("alice", Some("carol"), |_, _| false);
            scan_done.wait();
            let committed = db.end_transaction(tx, |_| {});
            (count.is_some(), committed)
        })
    };
    let inserter = {
        let db = db.clone();
        std::thread::spawn(move || {
            let mut tx = db.begin_transaction();
            both_started.wait();
            scan_done.wait();
            tx.insert("bob", &encode_i64(2));
            db.end_transaction(tx, |_| {})
        })
    };

    let (scan_succeeded, scanner_committed) = scanner.join().unwrap();
    let inserter_committed = inserter.join().unwrap();

    assert!(scan_succeeded);
    assert!(scanner_committed);
    // The insert hit the scanner's predicate and had to abort.
    assert!(!inserter_committed);
}
