//! chaindb: a transactional wrapper around an embedded SQLite engine.
//!
//! The wrapper presents a single-writer, many-readers, replication-ready
//! transaction API on top of the engine:
//!
//! - every committed write is appended to a hash-chained journal inside the
//!   database file, so replicas can verify and replay the exact commit
//!   order;
//! - a process-wide commit lock per database file serializes journal
//!   appends and engine COMMITs, giving one total order of commit ids;
//! - a checkpoint coordinator drains in-flight transactions and runs
//!   restart checkpoints when the write-ahead log grows too large, trading
//!   transaction latency against log growth;
//! - reads and writes pass through an authorizer (whitelist enforcement,
//!   query rewriting, determinism tracking) and deterministic read results
//!   are served from a per-transaction cache.
//!
//! Each [`Connection`] owns a dedicated engine handle and is expected to be
//! used by one thread at a time; connections to the same file coordinate
//! through shared per-file state. Use [`Connection::duplicate`] to open
//! additional handles that share that state.

pub mod authorizer;
pub mod checkpoint;
pub mod config;
pub mod error;
mod journal;
pub mod schema;
pub mod shared;

#[cfg(test)]
mod lib_tests;

use crate::authorizer::AuthorizerState;
use crate::checkpoint::WalHookContext;
use crate::shared::SharedData;
use lru::LruCache;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use rusqlite::ffi;
use rusqlite::hooks::AuthContext;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use crate::authorizer::{RewriteHandler, Whitelist};
pub use crate::checkpoint::CheckpointListener;
pub use crate::config::{ChaindbConfig, Synchronous, Tunables};
pub use crate::error::{ChaindbError, ChaindbErrorCode};
pub use crate::schema::SchemaCheck;
pub use crate::shared::CommittedTransaction;
pub use rusqlite::hooks::{AuthAction, Authorization};

/// Transaction entry modes. EXCLUSIVE takes the commit lock at `begin`;
/// SHARED defers it to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Shared,
    Exclusive,
}

/// Result set of a read. NULL renders as `None`, numbers as decimal text,
/// text verbatim, and blob columns hex-encoded. Cached results are re-served
/// as byte-identical clones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row, the way scalar reads are consumed.
    pub fn first_cell(&self) -> Option<&str> {
        self.rows
            .first()
            .and_then(|row| row.first())
            .and_then(|cell| cell.as_deref())
    }
}

/// Wall-clock spent in each phase of the most recent transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionTiming {
    pub begin: Duration,
    pub read: Duration,
    pub write: Duration,
    pub prepare: Duration,
    pub commit: Duration,
    pub rollback: Duration,
}

impl TransactionTiming {
    pub fn total(&self) -> Duration {
        self.begin + self.read + self.write + self.prepare + self.commit + self.rollback
    }
}

#[derive(Default)]
struct TimeoutState {
    start: Option<Instant>,
    limit: Option<Instant>,
    error: Option<Duration>,
}

/// State shared between a connection and its progress handler. The handler
/// runs inside the engine mid-query; it only flips flags here, and the next
/// read/write boundary turns them into errors.
pub(crate) struct InterruptState {
    timeout: Mutex<TimeoutState>,
    abandon_for_checkpoint: AtomicBool,
    enable_checkpoint_interrupt: AtomicBool,
    shared: Arc<SharedData>,
}

impl InterruptState {
    fn new(shared: Arc<SharedData>) -> Self {
        Self {
            timeout: Mutex::new(TimeoutState::default()),
            abandon_for_checkpoint: AtomicBool::new(false),
            enable_checkpoint_interrupt: AtomicBool::new(true),
            shared,
        }
    }

    /// Progress-handler body. Returning true interrupts the engine. Timeout
    /// is checked first so a checkpoint-pressure interrupt can never starve
    /// timeout detection.
    fn on_progress(&self) -> bool {
        {
            let mut timeout = self.timeout.lock();
            if let (Some(start), Some(limit)) = (timeout.start, timeout.limit) {
                if Instant::now() > limit {
                    timeout.error = Some(start.elapsed());
                    return true;
                }
            }
        }
        if self.shared.checkpoint_busy() {
            if self.enable_checkpoint_interrupt.load(Ordering::Relaxed) {
                info!("abandoning transaction to unblock checkpoint");
                self.abandon_for_checkpoint.store(true, Ordering::Relaxed);
                return true;
            }
            debug!("not abandoning transaction, checkpoint interrupt disabled");
        }
        false
    }
}

// Page logging serializes the COMMIT step process-wide so attempt ids are
// monotonic with the order commits reach the engine.
static TRANSACTION_ATTEMPT_COUNT: AtomicI64 = AtomicI64::new(0);
static PAGE_LOG_MUTEX: Mutex<()> = Mutex::new(());

/// One logical user of the database. Owns a dedicated engine handle opened
/// on the shared file; transaction state is connection-local while commit
/// ordering, the journal hash chain, and checkpointing coordinate through
/// the per-file [`shared::SharedData`].
pub struct Connection {
    filename: PathBuf,
    config: ChaindbConfig,
    conn: rusqlite::Connection,
    shared: Arc<SharedData>,
    journal_names: Vec<String>,
    journal_name: String,
    journal_size: u64,
    auth: Arc<AuthorizerState>,
    interrupt: Arc<InterruptState>,
    destructor_lock: Arc<Mutex<()>>,
    // Owned by the connection so the pointer registered with the engine
    // stays valid; dropped only after the hook is unregistered.
    _wal_hook: Box<WalHookContext>,
    inside_transaction: bool,
    commit_lock_guard: Option<ArcMutexGuard<RawMutex, ()>>,
    auto_rolled_back: bool,
    noop_update_mode: bool,
    uncommitted_query: String,
    uncommitted_hash: String,
    prepared_commit_id: Option<u64>,
    current_transaction_attempt: Option<i64>,
    db_count_at_start: u64,
    query_cache: LruCache<String, QueryResult>,
    query_count: u64,
    cache_hits: u64,
    timing: TransactionTiming,
}

impl Connection {
    /// Opens (or creates) a database at `filename`. The path is resolved to
    /// its canonical absolute form so every connection to the same file
    /// shares one [`shared::SharedData`]; the `:memory:` sentinel is passed
    /// through unchanged (each handle then gets a private database, so only
    /// single-connection use is sensible).
    pub fn open(
        filename: impl AsRef<Path>,
        config: ChaindbConfig,
    ) -> Result<Connection, ChaindbError> {
        config.validate()?;
        let filename = resolve_filename(filename.as_ref())?;
        Self::open_internal(filename, config, None)
    }

    /// Opens a peer connection: same file and shared state, fresh engine
    /// handle, and a striped journal-table assignment so concurrent writers
    /// spread their journal appends.
    pub fn duplicate(&self) -> Result<Connection, ChaindbError> {
        Self::open_internal(self.filename.clone(), self.config.clone(), Some(self))
    }

    fn open_internal(
        filename: PathBuf,
        config: ChaindbConfig,
        peer: Option<&Connection>,
    ) -> Result<Connection, ChaindbError> {
        info!(
            filename = %filename.display(),
            exists = filename.exists(),
            "opening database"
        );
        // The per-connection engine mutex is off; callers serialize their
        // own use of a connection.
        let mut conn = rusqlite::Connection::open_with_flags(
            &filename,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // DDL-time default, must be set before any table exists.
        run_pragma(&conn, "PRAGMA legacy_file_format = OFF;")?;

        let (journal_names, shared, journal_size) = match peer {
            Some(peer) => (
                peer.journal_names.clone(),
                Arc::clone(&peer.shared),
                peer.journal_size,
            ),
            None => {
                let names = journal::initialize(&conn, config.min_journal_tables)?;
                let shared = SharedData::for_database(&filename, &conn, &names)?;
                let size = journal::journal_size(&conn, &names)?;
                (names, shared, size)
            }
        };
        let journal_name = match peer {
            None => journal_names[0].clone(),
            Some(_) => assign_striped_journal(&journal_names, &shared),
        };

        // WAL is what allows simultaneous reading and writing.
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            // In-memory databases report `memory`; checkpointing is a no-op there.
            warn!(journal_mode = %journal_mode, "engine did not enter WAL journaling");
        }
        if config.mmap_size_gb > 0 {
            let bytes = config.mmap_size_gb * 1024 * 1024 * 1024;
            run_pragma(&conn, &format!("PRAGMA mmap_size = {bytes};"))?;
        }
        debug!(cache_size_kb = config.cache_size_kb, "setting page cache size");
        run_pragma(&conn, &format!("PRAGMA cache_size = -{};", config.cache_size_kb))?;
        match config.synchronous {
            Some(synchronous) => {
                run_pragma(
                    &conn,
                    &format!("PRAGMA synchronous = {};", synchronous.as_str()),
                )?;
            }
            None => debug!("using engine default synchronous mode"),
        }

        // Checkpointing is ours: registering the WAL hook displaces the
        // engine's autocheckpoint handler.
        let destructor_lock = Arc::new(Mutex::new(()));
        let wal_hook = WalHookContext::new(Arc::clone(&shared), Arc::clone(&destructor_lock));
        checkpoint::register_wal_hook(&conn, &wal_hook);

        conn.trace(Some(trace_statement));

        let auth = Arc::new(AuthorizerState::new());
        {
            let auth = AssertUnwindSafe(Arc::clone(&auth));
            conn.authorizer(Some(move |ctx: AuthContext<'_>| auth.authorize(&ctx)));
        }

        let interrupt = Arc::new(InterruptState::new(Arc::clone(&shared)));
        {
            let interrupt = AssertUnwindSafe(Arc::clone(&interrupt));
            conn.progress_handler(
                config.progress_handler_interval as i32,
                Some(move || interrupt.on_progress()),
            );
        }

        let cache_capacity =
            NonZeroUsize::new(config.query_cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Ok(Connection {
            filename,
            config,
            conn,
            shared,
            journal_names,
            journal_name,
            journal_size,
            auth,
            interrupt,
            destructor_lock,
            _wal_hook: wal_hook,
            inside_transaction: false,
            commit_lock_guard: None,
            auto_rolled_back: false,
            noop_update_mode: false,
            uncommitted_query: String::new(),
            uncommitted_hash: String::new(),
            prepared_commit_id: None,
            current_transaction_attempt: None,
            db_count_at_start: 0,
            query_cache: LruCache::new(cache_capacity),
            query_count: 0,
            cache_hits: 0,
            timing: TransactionTiming::default(),
        })
    }

    /// Stalls while a checkpoint coordinator is draining transactions. Call
    /// before `begin` on latency-tolerant paths so the coordinator is not
    /// starved by a steady stream of new transactions.
    pub fn wait_for_checkpoint(&self) {
        self.shared.wait_for_checkpoint();
    }

    /// Opens a transaction with the engine's optimistic concurrent BEGIN.
    /// EXCLUSIVE additionally takes the commit lock up front, guaranteeing
    /// this transaction commits next.
    pub fn begin(&mut self, txn_type: TransactionType) -> Result<(), ChaindbError> {
        if self.inside_transaction
            || !self.uncommitted_query.is_empty()
            || !self.uncommitted_hash.is_empty()
        {
            return Err(ChaindbError::invalid_state("begin inside open transaction"));
        }
        if txn_type == TransactionType::Exclusive {
            self.commit_lock_guard = Some(self.shared.lock_commit_lock());
            self.shared.commit_lock_timer.start("EXCLUSIVE");
        }
        self.shared.increment_transaction_count();

        // Reset before the query; the progress handler may set these while
        // BEGIN itself runs.
        self.interrupt
            .abandon_for_checkpoint
            .store(false, Ordering::Relaxed);
        self.auto_rolled_back = false;

        debug!("beginning transaction");
        let before = Instant::now();
        self.current_transaction_attempt = None;
        if let Err(err) = self.execute_begin() {
            // A failed BEGIN must leak neither the transaction count nor the
            // commit lock.
            self.shared.decrement_transaction_count();
            if self.commit_lock_guard.is_some() {
                self.shared.commit_lock_timer.stop();
                self.commit_lock_guard = None;
            }
            return Err(err.into());
        }
        self.inside_transaction = true;

        // Another writer may commit between BEGIN and this load, leaving the
        // count slightly behind the true snapshot. Accepted: the worst case
        // is a follower waiting for one extra commit before replaying;
        // locking across BEGIN would be worse.
        self.db_count_at_start = self.shared.commit_count();
        self.query_cache.clear();
        self.query_count = 0;
        self.cache_hits = 0;
        self.timing = TransactionTiming {
            begin: before.elapsed(),
            ..TransactionTiming::default()
        };
        Ok(())
    }

    fn execute_begin(&self) -> Result<(), rusqlite::Error> {
        if self
            .shared
            .concurrent_begin_supported
            .load(Ordering::Relaxed)
        {
            match self.conn.execute_batch("BEGIN CONCURRENT") {
                Ok(()) => return Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.extended_code == ffi::SQLITE_ERROR =>
                {
                    self.shared
                        .concurrent_begin_supported
                        .store(false, Ordering::Relaxed);
                    info!("engine lacks BEGIN CONCURRENT, falling back to deferred BEGIN");
                }
                Err(err) => return Err(err),
            }
        }
        self.conn.execute_batch("BEGIN")
    }

    /// Runs a read-only query and returns the first cell of the first row,
    /// or the empty string when the result set is empty.
    pub fn read(&mut self, query: &str) -> Result<String, ChaindbError> {
        let result = self.read_rows(query)?;
        Ok(result.first_cell().unwrap_or_default().to_string())
    }

    /// Runs a read-only query. Results of deterministic queries are cached
    /// for the remainder of the transaction and re-served byte-identically;
    /// any write, commit, or rollback clears the cache.
    pub fn read_rows(&mut self, query: &str) -> Result<QueryResult, ChaindbError> {
        let before = Instant::now();
        self.query_count += 1;
        if let Some(hit) = self.query_cache.get(query) {
            self.cache_hits += 1;
            return Ok(hit.clone());
        }

        self.auth.reset_deterministic();
        let result = self.run_select(query);
        if let Ok(rows) = &result {
            // The authorizer clears the flag when it sees a
            // non-deterministic function during statement compilation.
            if self.auth.is_deterministic() {
                self.query_cache.put(query.to_string(), rows.clone());
            }
        }
        self.check_interrupt_errors("read")?;
        self.timing.read += before.elapsed();
        result.map_err(error::map_query_error)
    }

    /// Executes a write. In noop-update mode the query is not executed:
    /// non-idempotent writes reaching this path are caller bugs and are
    /// logged loudly.
    pub fn write(&mut self, query: &str) -> Result<(), ChaindbError> {
        if self.noop_update_mode {
            warn!(query, "non-idempotent write in noop-update mode, skipping execution");
            return Ok(());
        }
        self.write_inner(query, false)
    }

    /// Executes a write that is safe to replay.
    pub fn write_idempotent(&mut self, query: &str) -> Result<(), ChaindbError> {
        self.write_inner(query, false)
    }

    /// Executes a write and journals it even when it changed no rows.
    pub fn write_unmodified(&mut self, query: &str) -> Result<(), ChaindbError> {
        self.write_inner(query, true)
    }

    fn write_inner(&mut self, query: &str, always_keep: bool) -> Result<(), ChaindbError> {
        if !self.inside_transaction {
            return Err(ChaindbError::invalid_state("write outside transaction"));
        }
        self.query_cache.clear();
        self.query_count += 1;
        if !query.is_empty() && !query.ends_with(';') {
            return Err(ChaindbError::invalid_state(
                "write queries must end with a semicolon",
            ));
        }
        if query.to_ascii_uppercase().contains("CURRENT_TIMESTAMP") {
            warn!(query, "CURRENT_TIMESTAMP in a journaled write replays incorrectly");
        }

        // Journal the query only if it changed something: compare schema
        // version and total changes around the execution.
        let schema_before = self.schema_version()?;
        let changes_before = self.total_changes();

        let before = Instant::now();
        let mut executed_rewritten: Option<String> = None;
        let result = if self.auth.rewrite_enabled() {
            match self.conn.execute_batch(query) {
                Err(err) if error::is_auth_denied(&err) => {
                    match self.auth.take_rewritten_query() {
                        Some(rewritten) => {
                            if !rewritten.ends_with(';') {
                                return Err(ChaindbError::invalid_state(
                                    "rewritten queries must end with a semicolon",
                                ));
                            }
                            self.auth.set_running_rewritten(true);
                            let rewrite_result = self.conn.execute_batch(&rewritten);
                            self.auth.set_running_rewritten(false);
                            if rewrite_result.is_ok() {
                                executed_rewritten = Some(rewritten);
                            }
                            rewrite_result
                        }
                        None => Err(err),
                    }
                }
                other => other,
            }
        } else {
            self.conn.execute_batch(query)
        };
        self.check_interrupt_errors("write")?;
        self.timing.write += before.elapsed();
        result.map_err(error::map_query_error)?;

        let schema_after = self.schema_version()?;
        let changes_after = self.total_changes();
        if always_keep || schema_after > schema_before || changes_after > changes_before {
            self.uncommitted_query
                .push_str(executed_rewritten.as_deref().unwrap_or(query));
        }
        Ok(())
    }

    /// Locks the commit order slot and appends the uncommitted queries to
    /// this connection's journal table under the next commit id. On journal
    /// failure the transaction is rolled back (releasing the commit lock)
    /// and `JournalInsert` is returned.
    pub fn prepare(&mut self) -> Result<(), ChaindbError> {
        if !self.inside_transaction {
            return Err(ChaindbError::invalid_state("prepare outside transaction"));
        }
        // Taking the commit lock here fixes the order commits appear in the
        // journal.
        if self.commit_lock_guard.is_none() {
            self.commit_lock_guard = Some(self.shared.lock_commit_lock());
            self.shared.commit_lock_timer.start("SHARED");
        }

        // Safe to read lock-free: we hold the commit lock, so nobody else
        // can advance the commit count or the hash.
        let commit_count = self.shared.commit_count();
        let last_committed_hash = self.shared.last_committed_hash();
        self.uncommitted_hash = chain_hash(&last_committed_hash, &self.uncommitted_query);
        let commit_id = commit_count + 1;

        let before = Instant::now();
        self.shared.prepare_transaction_info(
            commit_id,
            &self.uncommitted_query,
            &self.uncommitted_hash,
            self.db_count_at_start,
        );
        self.prepared_commit_id = Some(commit_id);
        let insert = self.conn.execute(
            &format!("INSERT INTO {} VALUES (?1, ?2, ?3)", self.journal_name),
            rusqlite::params![commit_id as i64, self.uncommitted_query, self.uncommitted_hash],
        );
        self.timing.prepare += before.elapsed();

        if let Err(err) = insert {
            warn!(error = %err, "unable to prepare transaction, rolling back");
            self.rollback()?;
            return Err(ChaindbError::JournalInsert {
                message: err.to_string(),
            });
        }
        debug!(commit_id, "prepared transaction");
        Ok(())
    }

    /// Issues the engine COMMIT and publishes the journal entry. On a
    /// snapshot conflict the commit lock is NOT released until the caller
    /// invokes [`rollback`](Self::rollback); the raw engine code is carried
    /// in [`ChaindbError::CommitConflict`].
    pub fn commit(&mut self) -> Result<(), ChaindbError> {
        if !self.inside_transaction {
            return Err(ChaindbError::invalid_state("commit outside transaction"));
        }
        if self.uncommitted_hash.is_empty() {
            return Err(ChaindbError::invalid_state("commit before prepare"));
        }

        // Trim the oldest journal rows as we go rather than letting the
        // table grow without bound.
        let mut new_journal_size = self.journal_size + 1;
        if new_journal_size > self.config.max_journal_size {
            let before = Instant::now();
            self.conn.execute_batch(&journal::trim_statement(
                &self.journal_name,
                self.config.max_journal_size,
            ))?;
            new_journal_size =
                journal::journal_size(&self.conn, std::slice::from_ref(&self.journal_name))?;
            self.timing.write += before.elapsed();
        }

        debug!("committing transaction");
        let before = Instant::now();
        let result = if self.config.page_logging_enabled {
            let _page_log = PAGE_LOG_MUTEX.lock();
            self.current_transaction_attempt =
                Some(TRANSACTION_ATTEMPT_COUNT.fetch_add(1, Ordering::Relaxed));
            self.conn.execute_batch("COMMIT")
        } else {
            self.conn.execute_batch("COMMIT")
        };

        match result {
            Ok(()) => {
                self.timing.commit += before.elapsed();
                self.journal_size = new_journal_size;
                self.shared.increment_commit(&self.uncommitted_hash);
                debug!(
                    commit_count = self.shared.commit_count(),
                    "commit successful, releasing commit lock"
                );
                if let Some(attempt) = self.current_transaction_attempt.take() {
                    debug!(attempt, "page-logged transaction committed");
                }
                self.inside_transaction = false;
                self.uncommitted_query.clear();
                self.uncommitted_hash.clear();
                self.prepared_commit_id = None;
                self.shared.commit_lock_timer.stop();
                self.commit_lock_guard = None;
                self.query_cache.clear();
                self.shared.decrement_transaction_count();

                // Opportunistic passive checkpoint, without the commit lock
                // and only when no coordinator is running.
                if !self.shared.checkpoint_busy()
                    && self.shared.current_page_count.load(Ordering::Acquire) as i64
                        >= config::passive_checkpoint_page_min()
                {
                    checkpoint::passive_checkpoint(&self.conn, &self.shared);
                }
                info!(
                    queries = self.query_count,
                    cache_hits = self.cache_hits,
                    "transaction committed"
                );
                self.query_count = 0;
                self.cache_hits = 0;
                self.db_count_at_start = 0;
                self.interrupt
                    .enable_checkpoint_interrupt
                    .store(true, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.interrupt
                    .enable_checkpoint_interrupt
                    .store(true, Ordering::Relaxed);
                if let Some(attempt) = self.current_transaction_attempt.take() {
                    debug!(attempt, "page-logged transaction conflicted");
                }
                if let Some(code) = error::commit_conflict_code(&err) {
                    info!(code, "commit conflict, waiting for rollback");
                    Err(ChaindbError::CommitConflict { code })
                } else {
                    Err(ChaindbError::Engine(err))
                }
            }
        }
    }

    /// Cancels the open transaction, if any, releasing the commit lock when
    /// held. Safe to call unconditionally; a rollback with no open
    /// transaction is a no-op.
    pub fn rollback(&mut self) -> Result<(), ChaindbError> {
        let mut rollback_result = Ok(());
        if self.inside_transaction {
            if self.auto_rolled_back {
                info!("transaction was automatically rolled back, not sending ROLLBACK");
                self.auto_rolled_back = false;
            } else {
                if !self.uncommitted_query.is_empty() {
                    let preview: String = self.uncommitted_query.chars().take(100).collect();
                    info!(query = %preview, "rolling back transaction");
                }
                let before = Instant::now();
                if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                    warn!(error = %err, "ROLLBACK failed");
                    rollback_result = Err(ChaindbError::Engine(err));
                }
                self.timing.rollback += before.elapsed();
            }
            if let Some(attempt) = self.current_transaction_attempt.take() {
                debug!(attempt, "page-logged transaction rolled back");
            }
            self.inside_transaction = false;
            self.uncommitted_hash.clear();
            self.uncommitted_query.clear();
            if let Some(commit_id) = self.prepared_commit_id.take() {
                self.shared.discard_prepared(commit_id);
            }
            // Only release when previously locked: rollback may cancel a
            // transaction that never reached prepare.
            if self.commit_lock_guard.is_some() {
                self.shared.commit_lock_timer.stop();
                self.commit_lock_guard = None;
            }
            self.shared.decrement_transaction_count();
        } else {
            debug!("rolling back outside transaction, ignoring");
        }
        self.query_cache.clear();
        debug!(
            queries = self.query_count,
            cache_hits = self.cache_hits,
            "transaction rollback complete"
        );
        self.query_count = 0;
        self.cache_hits = 0;
        self.db_count_at_start = 0;
        self.interrupt
            .enable_checkpoint_interrupt
            .store(true, Ordering::Relaxed);
        rollback_result
    }

    /// Inspects the interrupt flags after an engine call and converts them
    /// into errors, timeout first. The checkpoint flag is cleared even when
    /// a timeout wins so an already-handled checkpoint interrupt is never
    /// reported twice.
    fn check_interrupt_errors(&mut self, operation: &str) -> Result<(), ChaindbError> {
        let mut timeout_elapsed = None;
        {
            let mut timeout = self.interrupt.timeout.lock();
            if let (Some(start), Some(limit)) = (timeout.start, timeout.limit) {
                if timeout.error.is_none() && Instant::now() > limit {
                    timeout.error = Some(start.elapsed());
                }
            }
            if let Some(elapsed) = timeout.error {
                timeout_elapsed = Some(elapsed);
                *timeout = TimeoutState::default();
            }
        }
        let abandoned = self
            .interrupt
            .abandon_for_checkpoint
            .load(Ordering::Relaxed);

        // If the engine already cleared its transaction state, the later
        // rollback() must not send a redundant ROLLBACK.
        if (timeout_elapsed.is_some() || abandoned)
            && self.inside_transaction
            && self.conn.is_autocommit()
        {
            warn!(operation, "transaction automatically rolled back by interrupt");
            self.auto_rolled_back = true;
        }
        self.interrupt
            .abandon_for_checkpoint
            .store(false, Ordering::Relaxed);

        if let Some(elapsed) = timeout_elapsed {
            return Err(ChaindbError::Timeout { elapsed });
        }
        if abandoned {
            return Err(ChaindbError::CheckpointRequired);
        }
        Ok(())
    }

    fn run_select(&self, query: &str) -> Result<QueryResult, rusqlite::Error> {
        let mut stmt = self.conn.prepare(query)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        let column_count = columns.len();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut rendered = Vec::with_capacity(column_count);
            for index in 0..column_count {
                rendered.push(match row.get_ref(index)? {
                    rusqlite::types::ValueRef::Null => None,
                    rusqlite::types::ValueRef::Integer(value) => Some(value.to_string()),
                    rusqlite::types::ValueRef::Real(value) => Some(value.to_string()),
                    rusqlite::types::ValueRef::Text(value) => {
                        Some(String::from_utf8_lossy(value).into_owned())
                    }
                    rusqlite::types::ValueRef::Blob(value) => Some(hex::encode(value)),
                });
            }
            out.push(rendered);
        }
        Ok(QueryResult {
            columns,
            rows: out,
        })
    }

    fn schema_version(&self) -> Result<i64, ChaindbError> {
        Ok(self
            .conn
            .query_row("PRAGMA schema_version;", [], |row| row.get(0))?)
    }

    fn total_changes(&self) -> i64 {
        // Not surfaced by the binding; the handle is valid for the lifetime
        // of self.conn.
        unsafe { ffi::sqlite3_total_changes(self.conn.handle()) as i64 }
    }

    // ---- policy ---------------------------------------------------------

    /// Installs or clears the read whitelist. With a whitelist installed,
    /// mutations and DDL are denied and reads outside the declared
    /// (table, column) pairs come back NULL.
    pub fn set_whitelist(&self, whitelist: Option<Whitelist>) {
        self.auth.set_whitelist(whitelist);
    }

    pub fn enable_rewrite(&self, enable: bool) {
        self.auth.set_rewrite_enabled(enable);
    }

    /// Registers the handler consulted for each parsed action while rewrite
    /// is enabled. Returning a replacement query denies the original
    /// statement and executes the replacement in its place.
    pub fn set_rewrite_handler(
        &self,
        handler: impl Fn(&AuthAction<'_>) -> Option<String> + Send + 'static,
    ) {
        self.auth.set_rewrite_handler(Box::new(handler));
    }

    /// Switches noop-update mode, journaling the switch when inside a
    /// transaction so followers replay it.
    pub fn set_update_noop_mode(&mut self, enabled: bool) -> Result<(), ChaindbError> {
        if self.noop_update_mode == enabled {
            return Ok(());
        }
        // Engines without noop-update support ignore the pragma silently.
        let query = format!(
            "PRAGMA noop_update = {};",
            if enabled { "ON" } else { "OFF" }
        );
        run_pragma(&self.conn, &query)?;
        self.noop_update_mode = enabled;
        if self.inside_transaction {
            self.uncommitted_query.push_str(&query);
        }
        Ok(())
    }

    pub fn update_noop_mode(&self) -> bool {
        self.noop_update_mode
    }

    /// Arms the per-transaction time budget. The progress handler interrupts
    /// the engine once the budget is exceeded and the next read/write raises
    /// [`ChaindbError::Timeout`].
    pub fn start_timing(&self, budget: Duration) {
        let now = Instant::now();
        let mut timeout = self.interrupt.timeout.lock();
        timeout.start = Some(now);
        timeout.limit = Some(now + budget);
        timeout.error = None;
    }

    pub fn reset_timing(&self) {
        *self.interrupt.timeout.lock() = TimeoutState::default();
    }

    /// Allows or forbids the checkpoint coordinator to interrupt this
    /// connection's in-flight queries. Reset to enabled at the end of every
    /// transaction.
    pub fn set_checkpoint_interrupt_enabled(&self, enabled: bool) {
        self.interrupt
            .enable_checkpoint_interrupt
            .store(enabled, Ordering::Relaxed);
    }

    // ---- replication feed -----------------------------------------------

    /// Reads `(query, hash)` for a commit id, across all journal tables.
    pub fn get_commit(&self, id: u64) -> Result<Option<(String, String)>, ChaindbError> {
        Ok(journal::get_commit(&self.conn, &self.journal_names, id)?)
    }

    /// Reads `(hash, query)` rows for ids in `[from, to]` ordered by id; a
    /// `to` of zero leaves the range unbounded above.
    pub fn get_commits(&self, from: u64, to: u64) -> Result<Vec<(String, String)>, ChaindbError> {
        debug!(from, to, "reading commit range");
        Ok(journal::get_commits(&self.conn, &self.journal_names, from, to)?)
    }

    pub fn committed_hash(&self) -> String {
        self.shared.last_committed_hash()
    }

    pub fn commit_count(&self) -> u64 {
        self.shared.commit_count()
    }

    /// Commit count observed when the current transaction began.
    pub fn db_count_at_start(&self) -> u64 {
        self.db_count_at_start
    }

    /// Atomically drains the committed-transaction feed, ascending by commit
    /// id. The caller (replication) ships the entries elsewhere.
    pub fn pop_committed_transactions(&self) -> BTreeMap<u64, CommittedTransaction> {
        self.shared.pop_committed_transactions()
    }

    /// Rowid generated by the most recent INSERT on this connection.
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Rows changed by the most recent write on this connection.
    pub fn last_write_change_count(&self) -> u64 {
        self.conn.changes() as u64
    }

    // ---- checkpoint listeners -------------------------------------------

    pub fn add_checkpoint_listener(&self, listener: Arc<dyn CheckpointListener>) {
        self.shared.add_checkpoint_listener(listener);
    }

    pub fn remove_checkpoint_listener(&self, listener: &Arc<dyn CheckpointListener>) {
        self.shared.remove_checkpoint_listener(listener);
    }

    // ---- introspection --------------------------------------------------

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Journal table this connection appends to.
    pub fn journal_table(&self) -> &str {
        &self.journal_name
    }

    pub fn query_count(&self) -> u64 {
        self.query_count
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    pub fn last_transaction_timing(&self) -> TransactionTiming {
        self.timing
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Blocks while a checkpoint coordinator spawned from this
        // connection's WAL hook still holds the guard.
        let destructor_lock = Arc::clone(&self.destructor_lock);
        let _guard = destructor_lock.lock();
        if self.inside_transaction || !self.uncommitted_query.is_empty() {
            info!("rolling back in destructor");
            if let Err(err) = self.rollback() {
                warn!(error = %err, "rollback in destructor failed");
            }
        }
        checkpoint::clear_wal_hook(&self.conn);
        self.conn
            .authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
        self.conn.progress_handler(0, None::<fn() -> bool>);
        debug!(filename = %self.filename.display(), "closing database");
    }
}

/// One link of the journal chain: hex SHA-1 over the previous hash
/// concatenated with the committed query text.
pub(crate) fn chain_hash(previous_hash: &str, query: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonicalizes a database path so all connections to one file share state.
/// For a file that does not exist yet, the parent directory is resolved and
/// the file name re-attached.
fn resolve_filename(filename: &Path) -> Result<PathBuf, ChaindbError> {
    if filename == Path::new(":memory:") {
        return Ok(filename.to_path_buf());
    }
    if filename.exists() {
        return Ok(filename.canonicalize()?);
    }
    let parent = match filename.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = filename
        .file_name()
        .ok_or_else(|| ChaindbError::InvalidConfig {
            message: format!("cannot resolve database path: {}", filename.display()),
        })?;
    Ok(parent.canonicalize()?.join(file_name))
}

/// Picks the journal table for a duplicated connection. Slot 0, the plain
/// `journal` table, is reserved for original connections; striped writers
/// round-robin over the rest. With a single table there is nothing to
/// stripe over.
fn assign_striped_journal(journal_names: &[String], shared: &SharedData) -> String {
    if journal_names.len() <= 1 {
        return journal_names[0].clone();
    }
    let stripe_count = journal_names.len() - 1;
    let next = shared.next_journal_count.fetch_add(1, Ordering::Relaxed) as usize;
    journal_names[(next % stripe_count) + 1].clone()
}

/// Runs a pragma, draining any rows it returns (several pragmas echo the
/// value they set).
fn run_pragma(conn: &rusqlite::Connection, sql: &str) -> Result<(), rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

fn trace_statement(sql: &str) {
    if config::trace_enabled() {
        debug!(sql, "statement trace");
    }
}
