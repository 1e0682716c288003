// End-to-end SQL scenarios through the public API: create, load,
// query, join, aggregate, and the compile-time rejections.

use anchordb::{Database, DbConfig, DbError, ErrorCode, Value};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Database {
    let config = DbConfig {
        data_dir: dir.path().to_path_buf(),
        ..DbConfig::default()
    };
    Database::open("test.adb", config).unwrap()
}

fn load_users(session: &anchordb::SessionHandle) {
    session
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER);")
        .unwrap();
    session
        .execute("INSERT INTO users VALUES (1, 'Alice', 30), (2, 'Bob', 25);")
        .unwrap();
}

fn load_orders(session: &anchordb::SessionHandle) {
    session
        .execute("CREATE TABLE orders (uid INTEGER, amt REAL);")
        .unwrap();
    session
        .execute("INSERT INTO orders VALUES (1, 10.0), (1, 15.5), (2, 7.25);")
        .unwrap();
}

#[test]
fn test_create_insert_point_select() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    let result = session
        .execute("SELECT name FROM users WHERE id = 2;")
        .unwrap();
    assert_eq!(result.columns, vec!["name"]);
    assert_eq!(result.rows, vec![vec![Value::Text("Bob".into())]]);
}

#[test]
fn test_filter_project_arithmetic_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);
    session
        .execute("INSERT INTO users VALUES (3, 'Cleo', 40);")
        .unwrap();

    let result = session
        .execute(
            "SELECT name, age + 1 AS next_age FROM users WHERE age >= 30 ORDER BY age DESC;",
        )
        .unwrap();
    assert_eq!(result.columns, vec!["name", "next_age"]);
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Text("Cleo".into()), Value::Integer(41)],
            vec![Value::Text("Alice".into()), Value::Integer(31)],
        ]
    );
}

#[test]
fn test_aggregate_group_by() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_orders(&session);

    let result = session
        .execute("SELECT uid, COUNT(*), SUM(amt) FROM orders GROUP BY uid ORDER BY uid;")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Integer(1), Value::Integer(2), Value::Real(25.5)],
            vec![Value::Integer(2), Value::Integer(1), Value::Real(7.25)],
        ]
    );
}

#[test]
fn test_update_with_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    session
        .execute("BEGIN; UPDATE users SET age = 99 WHERE id = 1; ROLLBACK;")
        .unwrap();
    let result = session
        .execute("SELECT age FROM users WHERE id = 1;")
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(30)]]);
}

#[test]
fn test_equi_join() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);
    load_orders(&session);

    let result = session
        .execute(
            "SELECT u.name, o.amt FROM users u JOIN orders o ON u.id = o.uid \
             WHERE o.amt > 10 ORDER BY o.amt;",
        )
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Text("Alice".into()), Value::Real(15.5)]]
    );
}

#[test]
fn test_aggregate_placement_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    let err = session
        .execute("SELECT name, COUNT(*) FROM users;")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Semantic);
    match err {
        DbError::AggregatePlacement(msg) => assert!(msg.contains("name")),
        other => panic!("expected aggregate placement error, got {:?}", other),
    }
}

#[test]
fn test_left_and_right_outer_joins() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);
    session
        .execute("CREATE TABLE orders (uid INTEGER, amt REAL);")
        .unwrap();
    session
        .execute("INSERT INTO orders VALUES (1, 10.0), (7, 3.0);")
        .unwrap();

    let result = session
        .execute(
            "SELECT u.name, o.amt FROM users u LEFT OUTER JOIN orders o ON u.id = o.uid \
             ORDER BY u.id;",
        )
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Text("Alice".into()), Value::Real(10.0)],
            vec![Value::Text("Bob".into()), Value::Null],
        ]
    );

    let result = session
        .execute(
            "SELECT u.name, o.amt FROM users u RIGHT OUTER JOIN orders o ON u.id = o.uid \
             ORDER BY o.amt;",
        )
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Null, Value::Real(3.0)],
            vec![Value::Text("Alice".into()), Value::Real(10.0)],
        ]
    );
}

#[test]
fn test_predicates_like_in_between() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);
    session
        .execute("INSERT INTO users VALUES (3, 'Cleo', 40), (4, 'Carl', NULL);")
        .unwrap();

    let result = session
        .execute("SELECT name FROM users WHERE name LIKE 'C%' ORDER BY id;")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Text("Cleo".into())],
            vec![Value::Text("Carl".into())],
        ]
    );

    let result = session
        .execute("SELECT name FROM users WHERE id IN (2, 4) ORDER BY id;")
        .unwrap();
    assert_eq!(result.rows.len(), 2);

    let result = session
        .execute("SELECT name FROM users WHERE age BETWEEN 26 AND 40 ORDER BY age;")
        .unwrap();
    // NULL age is neither in nor out: simply not returned.
    assert_eq!(
        result.rows,
        vec![
            vec![Value::Text("Alice".into())],
            vec![Value::Text("Cleo".into())],
        ]
    );

    let result = session
        .execute("SELECT name FROM users WHERE age IS NULL;")
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("Carl".into())]]);
}

#[test]
fn test_defaults_and_explicit_columns() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    session
        .execute(
            "CREATE TABLE memos (id INTEGER PRIMARY KEY, body TEXT DEFAULT 'n/a', \
             score REAL DEFAULT 1 + 1);",
        )
        .unwrap();
    session.execute("INSERT INTO memos (id) VALUES (1);").unwrap();

    let result = session.execute("SELECT body, score FROM memos;").unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Text("n/a".into()), Value::Real(2.0)]]
    );
}

#[test]
fn test_not_null_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    let err = session
        .execute("INSERT INTO users VALUES (9, NULL, 1);")
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Semantic);

    // A failed autocommit statement leaves no residue.
    let result = session.execute("SELECT COUNT(*) FROM users;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(2)]]);
}

#[test]
fn test_limit_offset_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    session
        .execute("CREATE TABLE nums (n INTEGER, tag TEXT);")
        .unwrap();
    session
        .execute(
            "INSERT INTO nums VALUES (3, 'x'), (1, 'x'), (2, 'y'), (1, 'x'), (2, 'y');",
        )
        .unwrap();

    let result = session
        .execute("SELECT n FROM nums ORDER BY n LIMIT 2 OFFSET 1;")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]
    );

    let result = session
        .execute("SELECT DISTINCT n, tag FROM nums ORDER BY n;")
        .unwrap();
    assert_eq!(result.rows.len(), 3);
}

#[test]
fn test_scalar_functions_and_avg() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_orders(&session);

    let result = session
        .execute("SELECT AVG(amt), MIN(amt), MAX(amt) FROM orders;")
        .unwrap();
    let avg = match &result.rows[0][0] {
        Value::Real(r) => *r,
        other => panic!("expected real, got {:?}", other),
    };
    assert!((avg - (10.0 + 15.5 + 7.25) / 3.0).abs() < 1e-9);
    assert_eq!(result.rows[0][1], Value::Real(7.25));
    assert_eq!(result.rows[0][2], Value::Real(15.5));

    let result = session
        .execute("SELECT UPPER('abc'), LENGTH('hello');")
        .unwrap();
    assert_eq!(
        result.rows,
        vec![vec![Value::Text("ABC".into()), Value::Integer(5)]]
    );
}

#[test]
fn test_insert_select_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);
    session
        .execute("CREATE TABLE archive (id INTEGER, name TEXT);")
        .unwrap();

    let result = session
        .execute("INSERT INTO archive SELECT id, name FROM users;")
        .unwrap();
    assert_eq!(result.rows_affected, 2);

    let result = session.execute("DELETE FROM archive WHERE id = 1;").unwrap();
    assert_eq!(result.rows_affected, 1);
    let result = session.execute("SELECT COUNT(*) FROM archive;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(1)]]);
}

#[test]
fn test_division_by_zero_yields_null() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    let result = session
        .execute("SELECT age / 0 FROM users WHERE id = 1;")
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Null]]);
}

#[test]
fn test_prepared_statements_with_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    let stmt = session
        .prepare("SELECT name FROM users WHERE id = ?")
        .unwrap();
    let result = session
        .execute_prepared(stmt, &[Value::Integer(1)])
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("Alice".into())]]);
    let result = session
        .execute_prepared(stmt, &[Value::Integer(2)])
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Text("Bob".into())]]);
}

#[test]
fn test_prepared_statement_survives_ddl_via_recompile() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    let stmt = session
        .prepare("SELECT COUNT(*) FROM users")
        .unwrap();
    // DDL bumps the schema version; the prepared statement must be
    // recompiled, not run stale.
    session
        .execute("CREATE TABLE unrelated (x INTEGER);")
        .unwrap();
    let result = session.execute_prepared(stmt, &[]).unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(2)]]);
}

#[test]
fn test_drop_table() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    load_users(&session);

    session.execute("DROP TABLE users;").unwrap();
    let err = session.execute("SELECT * FROM users;").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Semantic);
    // Idempotent with IF EXISTS, an error without.
    session.execute("DROP TABLE IF EXISTS users;").unwrap();
    assert!(session.execute("DROP TABLE users;").is_err());
}

#[test]
fn test_syntax_error_reports_position() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();

    let err = session.execute("SELEC 1;").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Syntax);
    let err = session.execute("SELECT 'unterminated;").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Lexical);
    let err = session.execute("   ").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Syntax);
}

#[test]
fn test_multi_page_table_scan() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let session = db.connect().unwrap();
    session
        .execute("CREATE TABLE big (id INTEGER, payload TEXT);")
        .unwrap();
    // Enough data to span several 4 KiB pages.
    for chunk in 0..10 {
        let mut values = Vec::new();
        for i in 0..50 {
            let id = chunk * 50 + i;
            values.push(format!("({}, '{}')", id, "p".repeat(100)));
        }
        session
            .execute(&format!("INSERT INTO big VALUES {};", values.join(", ")))
            .unwrap();
    }
    let result = session.execute("SELECT COUNT(*) FROM big;").unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(500)]]);
    let result = session
        .execute("SELECT id FROM big WHERE id = 437;")
        .unwrap();
    assert_eq!(result.rows, vec![vec![Value::Integer(437)]]);
}
