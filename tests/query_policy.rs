use chaindb::{
    AuthAction, ChaindbConfig, ChaindbErrorCode, Connection, TransactionType, Whitelist,
};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Connection {
    Connection::open(dir.path().join("policy.db"), ChaindbConfig::default()).expect("open")
}

fn commit_one(conn: &mut Connection, query: &str) {
    conn.begin(TransactionType::Shared).expect("begin");
    conn.write(query).expect("write");
    conn.prepare().expect("prepare");
    conn.commit().expect("commit");
}

#[test]
fn whitelist_limits_reads_to_declared_columns() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut conn = open(&dir);
    commit_one(&mut conn, "CREATE TABLE secrets (visible TEXT, hidden TEXT);");
    commit_one(&mut conn, "INSERT INTO secrets VALUES ('open', 'classified');");

    let mut whitelist = Whitelist::new();
    whitelist.allow("secrets", "visible");
    conn.set_whitelist(Some(whitelist));

    assert_eq!(
        conn.read("SELECT visible FROM secrets;").expect("read"),
        "open"
    );

    // Non-whitelisted columns are substituted with NULL, not refused.
    let rows = conn
        .read_rows("SELECT hidden FROM secrets;")
        .expect("read succeeds");
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0][0], None);

    // The engine's internal schema-version probe stays allowed; every other
    // pragma is refused.
    conn.read("PRAGMA schema_version;").expect("schema_version");
    let err = conn.read("PRAGMA user_version;").unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::PolicyDenied);

    conn.set_whitelist(None);
    // The NULL result was cached under this query text; a rollback clears
    // the cache so the read re-executes without the policy.
    conn.rollback().expect("cache clear");
    assert_eq!(
        conn.read("SELECT hidden FROM secrets;").expect("read"),
        "classified"
    );
}

#[test]
fn whitelist_denies_mutations() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut conn = open(&dir);
    commit_one(&mut conn, "CREATE TABLE t (a INTEGER);");

    conn.begin(TransactionType::Shared).expect("begin");
    let mut whitelist = Whitelist::new();
    whitelist.allow("t", "a");
    conn.set_whitelist(Some(whitelist));

    let err = conn.write("INSERT INTO t VALUES (1);").unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::PolicyDenied);
    let err = conn.write("CREATE TABLE other (b INTEGER);").unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::PolicyDenied);

    // BEGIN/ROLLBACK are themselves transaction actions, so the policy must
    // come off before ending the transaction.
    conn.set_whitelist(None);
    conn.rollback().expect("rollback");
    assert_eq!(conn.read("SELECT COUNT(*) FROM t;").expect("count"), "0");
}

#[test]
fn rewrite_reroutes_denied_writes() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut conn = open(&dir);
    commit_one(&mut conn, "CREATE TABLE t1 (a INTEGER);");
    commit_one(&mut conn, "CREATE TABLE t2 (a INTEGER);");

    conn.enable_rewrite(true);
    conn.set_rewrite_handler(|action: &AuthAction<'_>| match action {
        AuthAction::Insert { table_name } if *table_name == "t1" => {
            Some("INSERT INTO t2 VALUES (42);".to_string())
        }
        _ => None,
    });

    conn.begin(TransactionType::Shared).expect("begin");
    conn.write("INSERT INTO t1 VALUES (1);").expect("rewritten write");
    conn.prepare().expect("prepare");
    conn.commit().expect("commit");
    conn.enable_rewrite(false);

    assert_eq!(conn.read("SELECT COUNT(*) FROM t1;").expect("count"), "0");
    assert_eq!(conn.read("SELECT a FROM t2;").expect("value"), "42");

    // The journal carries the rewritten query, so followers replay what
    // actually executed.
    let (query, _) = conn.get_commit(3).expect("get").expect("row");
    assert_eq!(query, "INSERT INTO t2 VALUES (42);");
}

#[test]
fn cache_serves_identical_reads_until_invalidated() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut conn = open(&dir);
    commit_one(&mut conn, "CREATE TABLE t (a INTEGER);");

    conn.begin(TransactionType::Shared).expect("begin");
    assert_eq!(conn.read("SELECT COUNT(*) FROM t;").expect("count"), "0");
    assert_eq!(conn.read("SELECT COUNT(*) FROM t;").expect("count"), "0");
    assert_eq!(conn.cache_hits(), 1);

    // A write invalidates: the same query re-executes and sees the new row.
    conn.write("INSERT INTO t VALUES (1);").expect("write");
    assert_eq!(conn.read("SELECT COUNT(*) FROM t;").expect("count"), "1");
    assert_eq!(conn.cache_hits(), 1);
    conn.prepare().expect("prepare");
    conn.commit().expect("commit");

    // Commit cleared the cache as well.
    assert_eq!(conn.read("SELECT COUNT(*) FROM t;").expect("count"), "1");
    assert_eq!(conn.cache_hits(), 0);
}

#[test]
fn non_deterministic_queries_are_never_cached() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut conn = open(&dir);
    commit_one(&mut conn, "CREATE TABLE t (a INTEGER);");

    conn.begin(TransactionType::Shared).expect("begin");
    conn.read("SELECT random();").expect("read");
    conn.read("SELECT random();").expect("read");
    assert_eq!(conn.cache_hits(), 0);

    conn.read("SELECT datetime('now');").expect("read");
    conn.read("SELECT datetime('now');").expect("read");
    assert_eq!(conn.cache_hits(), 0);

    // Deterministic functions still cache.
    conn.read("SELECT abs(-3);").expect("read");
    conn.read("SELECT abs(-3);").expect("read");
    assert_eq!(conn.cache_hits(), 1);
    conn.rollback().expect("rollback");
}

#[test]
fn schema_helpers_converge_and_verify() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut conn = open(&dir);

    conn.begin(TransactionType::Shared).expect("begin");
    assert_eq!(
        conn.verify_table("users", "CREATE TABLE users ( id INTEGER PRIMARY KEY, name TEXT )")
            .expect("verify"),
        chaindb::SchemaCheck::Created
    );
    // Whitespace differences are not a mismatch.
    assert_eq!(
        conn.verify_table("users", "CREATE TABLE users (id INTEGER PRIMARY KEY,  name TEXT)")
            .expect("verify"),
        chaindb::SchemaCheck::Matches
    );
    assert_eq!(
        conn.verify_table("users", "CREATE TABLE users ( id INTEGER PRIMARY KEY )")
            .expect("verify"),
        chaindb::SchemaCheck::Mismatch
    );

    assert_eq!(
        conn.verify_index("users_name", "users", "(name)", false, false)
            .expect("verify"),
        chaindb::SchemaCheck::Missing
    );
    assert_eq!(
        conn.verify_index("users_name", "users", "(name)", false, true)
            .expect("verify"),
        chaindb::SchemaCheck::Created
    );
    assert_eq!(
        conn.verify_index("users_name", "users", "(name)", false, false)
            .expect("verify"),
        chaindb::SchemaCheck::Matches
    );

    assert!(conn.add_column("users", "email", "TEXT").expect("add"));
    assert!(!conn.add_column("users", "email", "TEXT").expect("add again"));
    conn.prepare().expect("prepare");
    conn.commit().expect("commit");

    // Schema changes were journaled like any other write.
    let (query, _) = conn.get_commit(1).expect("get").expect("row");
    assert!(query.contains("CREATE TABLE users"));
    assert!(query.contains("CREATE INDEX users_name"));
    assert!(query.contains("ADD COLUMN email"));
}
