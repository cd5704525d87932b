use crate::error::ChaindbErrorCode;
use crate::{ChaindbConfig, ChaindbError, Connection, TransactionType, chain_hash, resolve_filename};
use sha1::{Digest, Sha1};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

fn test_config() -> ChaindbConfig {
    ChaindbConfig {
        // Granular enough that short queries hit the progress handler.
        progress_handler_interval: 10_000,
        ..ChaindbConfig::default()
    }
}

fn open_temp(config: ChaindbConfig) -> (TempDir, Connection) {
    let dir = tempfile::tempdir().expect("temp dir");
    let conn = Connection::open(dir.path().join("test.db"), config).expect("open");
    (dir, conn)
}

// Keeps the engine busy long enough for the progress handler to fire.
const LONG_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                          WHERE x < 5000000) SELECT COUNT(*) FROM c;";

#[test]
fn chain_hash_is_hex_sha1_of_previous_and_query() {
    // SHA-1 of the empty string, the chain's genesis.
    assert_eq!(
        chain_hash("", ""),
        "da39a3ee5e6b4b0d3255bfef95601890afd80709"
    );

    let query = "INSERT INTO t VALUES (1);";
    let expected = hex::encode(Sha1::digest(query.as_bytes()));
    assert_eq!(chain_hash("", query), expected);

    let mut hasher = Sha1::new();
    hasher.update(expected.as_bytes());
    hasher.update(query.as_bytes());
    assert_eq!(chain_hash(&expected, query), hex::encode(hasher.finalize()));
}

#[test]
fn resolve_filename_passes_memory_sentinel_through() {
    assert_eq!(
        resolve_filename(Path::new(":memory:")).expect("resolve"),
        Path::new(":memory:")
    );
}

#[test]
fn resolve_filename_canonicalizes_missing_files_via_parent() {
    let dir = tempfile::tempdir().expect("temp dir");
    let resolved = resolve_filename(&dir.path().join("new.db")).expect("resolve");
    assert!(resolved.is_absolute());
    assert_eq!(resolved.file_name().unwrap(), "new.db");
}

#[test]
fn transaction_state_is_enforced() {
    let (_dir, mut conn) = open_temp(test_config());

    let err = conn.write("INSERT INTO t VALUES (1);").unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::InvalidState);

    let err = conn.commit().unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::InvalidState);

    conn.begin(TransactionType::Shared).expect("begin");
    let err = conn.begin(TransactionType::Shared).unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::InvalidState);

    // Commit without prepare is refused.
    conn.write("CREATE TABLE t (a INTEGER);").expect("write");
    let err = conn.commit().unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::InvalidState);
    conn.rollback().expect("rollback");

    // Rollback outside a transaction is a no-op.
    conn.rollback().expect("rollback is idempotent");
}

#[test]
fn writes_require_trailing_semicolon() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.begin(TransactionType::Shared).expect("begin");
    let err = conn.write("CREATE TABLE t (a INTEGER)").unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::InvalidState);
    conn.rollback().expect("rollback");
}

#[test]
fn deterministic_reads_hit_the_cache() {
    let (_dir, mut conn) = open_temp(test_config());
    let first = conn.read("SELECT 1, 'x';").expect("read");
    assert_eq!(first, "1");
    assert_eq!(conn.cache_hits(), 0);
    let second = conn.read("SELECT 1, 'x';").expect("read");
    assert_eq!(second, first);
    assert_eq!(conn.cache_hits(), 1);
    assert_eq!(conn.query_count(), 2);
}

#[test]
fn non_deterministic_reads_bypass_the_cache() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.read("SELECT random();").expect("read");
    conn.read("SELECT random();").expect("read");
    assert_eq!(conn.cache_hits(), 0);
    assert_eq!(conn.query_count(), 2);
}

#[test]
fn noop_update_mode_skips_execution() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.begin(TransactionType::Shared).expect("begin");
    conn.write("CREATE TABLE t (a INTEGER);").expect("create");
    conn.prepare().expect("prepare");
    conn.commit().expect("commit");

    conn.set_update_noop_mode(true).expect("enable noop");
    conn.begin(TransactionType::Shared).expect("begin");
    conn.write("INSERT INTO t VALUES (1);").expect("noop write");
    // The write neither executed nor entered the uncommitted buffer.
    assert!(conn.uncommitted_query.is_empty());
    assert_eq!(conn.read("SELECT COUNT(*) FROM t;").expect("count"), "0");
    conn.rollback().expect("rollback");

    conn.set_update_noop_mode(false).expect("disable noop");
    assert!(!conn.update_noop_mode());
}

#[test]
fn timeout_interrupts_long_reads() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.start_timing(Duration::from_millis(5));
    std::thread::sleep(Duration::from_millis(10));
    let err = conn.read(LONG_QUERY).unwrap_err();
    match err {
        ChaindbError::Timeout { elapsed } => assert!(elapsed >= Duration::from_millis(5)),
        other => panic!("expected timeout, got {other:?}"),
    }
    // The budget is consumed by the error; later reads run normally.
    assert_eq!(conn.read("SELECT 1;").expect("read"), "1");
}

#[test]
fn checkpoint_pressure_interrupts_reads_once() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.shared.checkpoint_thread_busy.store(1, Ordering::Release);
    let err = conn.read(LONG_QUERY).unwrap_err();
    assert_eq!(err.code(), ChaindbErrorCode::CheckpointRequired);
    conn.shared.checkpoint_thread_busy.store(0, Ordering::Release);
    // The abandon flag was cleared when the error was raised.
    assert_eq!(conn.read("SELECT 1;").expect("read"), "1");
}

#[test]
fn timeout_beats_checkpoint_pressure() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.shared.checkpoint_thread_busy.store(1, Ordering::Release);
    conn.start_timing(Duration::from_millis(5));
    std::thread::sleep(Duration::from_millis(10));
    let err = conn.read(LONG_QUERY).unwrap_err();
    conn.shared.checkpoint_thread_busy.store(0, Ordering::Release);
    assert_eq!(err.code(), ChaindbErrorCode::Timeout);
    // Handling the timeout also cleared the checkpoint flag: no stale
    // CheckpointRequired on the next call.
    assert_eq!(conn.read("SELECT 1;").expect("read"), "1");
}

#[test]
fn disabled_checkpoint_interrupt_lets_reads_finish() {
    let mut config = test_config();
    config.progress_handler_interval = 100_000;
    let (_dir, mut conn) = open_temp(config);
    conn.shared.checkpoint_thread_busy.store(1, Ordering::Release);
    conn.set_checkpoint_interrupt_enabled(false);
    let short = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                 WHERE x < 500000) SELECT COUNT(*) FROM c;";
    assert_eq!(conn.read(short).expect("read"), "500000");
    conn.shared.checkpoint_thread_busy.store(0, Ordering::Release);
    conn.set_checkpoint_interrupt_enabled(true);
}

#[test]
fn duplicated_connections_stripe_over_journal_tables() {
    let mut config = test_config();
    config.min_journal_tables = 3;
    let (_dir, conn) = open_temp(config);
    assert_eq!(conn.journal_table(), "journal");

    let peers: Vec<Connection> = (0..4).map(|_| conn.duplicate().expect("duplicate")).collect();
    let tables: Vec<&str> = peers.iter().map(|p| p.journal_table()).collect();
    // The plain `journal` slot is reserved; stripes round-robin.
    assert_eq!(
        tables,
        vec!["journal0000", "journal0001", "journal0002", "journal0000"]
    );
}

#[test]
fn single_journal_table_means_no_striping() {
    let (_dir, conn) = open_temp(test_config());
    let peer = conn.duplicate().expect("duplicate");
    assert_eq!(peer.journal_table(), "journal");
}

#[test]
fn duplicated_connections_share_commit_state() {
    let (_dir, mut conn) = open_temp(test_config());
    let peer = conn.duplicate().expect("duplicate");

    conn.begin(TransactionType::Shared).expect("begin");
    conn.write("CREATE TABLE t (a INTEGER);").expect("write");
    conn.prepare().expect("prepare");
    conn.commit().expect("commit");

    assert_eq!(peer.commit_count(), 1);
    assert_eq!(peer.committed_hash(), conn.committed_hash());
}

#[test]
fn exclusive_begin_holds_the_commit_lock() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.begin(TransactionType::Exclusive).expect("begin");
    assert!(conn.commit_lock_guard.is_some());
    conn.rollback().expect("rollback");
    assert!(conn.commit_lock_guard.is_none());
}

#[test]
fn prepare_populates_the_shared_prepared_map() {
    let (_dir, mut conn) = open_temp(test_config());
    conn.begin(TransactionType::Shared).expect("begin");
    conn.write("CREATE TABLE t (a INTEGER);").expect("write");
    conn.prepare().expect("prepare");
    assert_eq!(conn.prepared_commit_id, Some(1));
    conn.commit().expect("commit");

    let committed = conn.pop_committed_transactions();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[&1].query, "CREATE TABLE t (a INTEGER);");
    assert_eq!(committed[&1].hash, conn.committed_hash());
    assert_eq!(committed[&1].db_count_at_start, 0);
}
