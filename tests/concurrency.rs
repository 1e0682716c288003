// Concurrent-session behavior: lock conflicts, deadlock victims,
// parallel writers, and session caps.

use anchordb::{Database, DbConfig, DbError, IsolationLevel, Value};
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> DbConfig {
    DbConfig {
        data_dir: dir.path().to_path_buf(),
        ..DbConfig::default()
    }
}

fn short_timeout_config(dir: &TempDir) -> DbConfig {
    DbConfig {
        query_timeout: Duration::from_millis(400),
        ..config(dir)
    }
}

#[test]
fn test_write_write_conflict_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open("c.adb", short_timeout_config(&dir)).unwrap();
    let holder = db.connect_as("holder").unwrap();
    holder.execute("CREATE TABLE t (id INTEGER, v INTEGER);").unwrap();
    holder.execute("INSERT INTO t VALUES (1, 10);").unwrap();

    holder.begin(IsolationLevel::ReadCommitted).unwrap();
    holder.execute("UPDATE t SET v = 11 WHERE id = 1;").unwrap();

    // Second writer cannot get the row X lock before its deadline.
    let waiter = db.connect_as("waiter").unwrap();
    let err = waiter
        .execute("UPDATE t SET v = 12 WHERE id = 1;")
        .unwrap_err();
    assert!(
        matches!(err, DbError::LockTimeout(_)),
        "expected lock timeout, got {:?}",
        err
    );

    holder.commit().unwrap();
    // Lock released: the same statement now succeeds.
    waiter.execute("UPDATE t SET v = 12 WHERE id = 1;").unwrap();
    let result = waiter.execute("SELECT v FROM t;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(12)]]);
}

#[test]
fn test_deadlock_chooses_youngest_victim() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open("dl.adb", config(&dir)).unwrap();
    let setup = db.connect().unwrap();
    setup.execute("CREATE TABLE a (id INTEGER, v INTEGER);").unwrap();
    setup.execute("CREATE TABLE b (id INTEGER, v INTEGER);").unwrap();
    setup.execute("INSERT INTO a VALUES (1, 0);").unwrap();
    setup.execute("INSERT INTO b VALUES (1, 0);").unwrap();

    let older = db.connect_as("older").unwrap();
    older.begin(IsolationLevel::ReadCommitted).unwrap();
    older.execute("UPDATE a SET v = 1 WHERE id = 1;").unwrap();

    let younger = db.connect_as("younger").unwrap();
    younger.begin(IsolationLevel::ReadCommitted).unwrap();
    younger.execute("UPDATE b SET v = 2 WHERE id = 1;").unwrap();

    // Older blocks on b; younger then closes the cycle on a and is
    // wounded.
    let db2 = db.clone();
    let older_thread = std::thread::spawn(move || {
        let result = older.execute("UPDATE b SET v = 3 WHERE id = 1;");
        (older, result)
    });
    std::thread::sleep(Duration::from_millis(150));
    let younger_result = younger.execute("UPDATE a SET v = 4 WHERE id = 1;");
    assert!(
        matches!(younger_result, Err(DbError::Deadlock(_))),
        "younger transaction should be the victim, got {:?}",
        younger_result
    );
    // The victim's transaction was rolled back automatically; the older
    // transaction's blocked statement completes.
    let (older, older_result) = older_thread.join().unwrap();
    older_result.unwrap();
    older.commit().unwrap();

    let check = db2.connect().unwrap();
    let result = check.execute("SELECT v FROM b;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(3)]]);
    // b's v=2 from the wounded transaction is gone.
    let result = check.execute("SELECT v FROM a;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn test_concurrent_inserts_from_many_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open("p.adb", config(&dir)).unwrap();
    let setup = db.connect().unwrap();
    setup.execute("CREATE TABLE t (worker INTEGER, n INTEGER);").unwrap();

    let mut handles = Vec::new();
    for worker in 0..4i64 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let session = db.connect_as(&format!("w{}", worker)).unwrap();
            for n in 0..25i64 {
                session
                    .execute(&format!("INSERT INTO t VALUES ({}, {});", worker, n))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let result = setup.execute("SELECT COUNT(*) FROM t;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(100)]]);
    // Every worker's rows all arrived.
    let result = setup
        .execute("SELECT worker, COUNT(*) FROM t GROUP BY worker ORDER BY worker;")
        .unwrap();
    assert_eq!(result.rows.len(), 4);
    for row in &result.rows {
        assert_eq!(row[1], Value::Integer(25));
    }
}

#[test]
fn test_incompatible_modes_never_coexist() {
    // Readers under RR hold shared row locks to commit; a writer's
    // update cannot interleave with them.
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open("rw.adb", config(&dir)).unwrap();
    let reader = db.connect_as("reader").unwrap();
    reader.execute("CREATE TABLE t (id INTEGER, v INTEGER);").unwrap();
    reader.execute("INSERT INTO t VALUES (1, 100);").unwrap();

    reader.begin(IsolationLevel::RepeatableRead).unwrap();
    let before = reader.execute("SELECT v FROM t;").unwrap();

    let db2 = db.clone();
    let writer = std::thread::spawn(move || {
        let session = db2.connect_as("writer").unwrap();
        session.execute("UPDATE t SET v = 200 WHERE id = 1;").unwrap();
    });
    std::thread::sleep(Duration::from_millis(100));
    // Still unchanged from this transaction's viewpoint.
    let during = reader.execute("SELECT v FROM t;").unwrap();
    assert_eq!(before.rows, during.rows);
    reader.commit().unwrap();
    writer.join().unwrap();
}

#[test]
fn test_session_limit_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let limited = DbConfig {
        max_sessions: 2,
        max_sessions_per_user: 1,
        ..config(&dir)
    };
    let db = Database::open("s.adb", limited).unwrap();
    let a = db.connect_as("alice").unwrap();
    assert!(matches!(
        db.connect_as("alice"),
        Err(DbError::TooManySessions)
    ));
    let _b = db.connect_as("bob").unwrap();
    assert!(matches!(
        db.connect_as("carol"),
        Err(DbError::TooManySessions)
    ));
    drop(a);
    assert!(db.connect_as("carol").is_ok());
}

#[test]
fn test_ddl_is_exclusive_with_readers() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open("ddl.adb", short_timeout_config(&dir)).unwrap();
    let reader = db.connect_as("reader").unwrap();
    reader.execute("CREATE TABLE t (x INTEGER);").unwrap();
    reader.execute("INSERT INTO t VALUES (1);").unwrap();

    // A repeatable-read transaction holds shared locks (and database
    // IS) until commit; DDL needs database X and must wait it out.
    reader.begin(IsolationLevel::RepeatableRead).unwrap();
    reader.execute("SELECT x FROM t;").unwrap();

    let ddl = db.connect_as("ddl").unwrap();
    let err = ddl.execute("CREATE TABLE other (y INTEGER);").unwrap_err();
    assert!(matches!(err, DbError::LockTimeout(_)));

    reader.commit().unwrap();
    ddl.execute("CREATE TABLE other (y INTEGER);").unwrap();
}
