//! Process-wide state shared by every connection to the same database file:
//! the commit serialization point, transaction counters, checkpoint
//! coordination primitives, and the prepared/committed transaction maps that
//! feed replication.

use crate::checkpoint::CheckpointListener;
use crate::error::ChaindbError;
use crate::journal;
use once_cell::sync::Lazy;
use parking_lot::{ArcMutexGuard, Condvar, Mutex, MutexGuard, RawMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// A committed write as handed to the replication layer. The same shape is
/// used for transactions sitting between `prepare` and `commit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub query: String,
    pub hash: String,
    /// Commit count observed when the writing transaction began; followers
    /// wait for this many commits before replaying.
    pub db_count_at_start: u64,
}

/// Accumulates how long the commit lock is held, tagged by acquisition path.
pub(crate) struct CommitLockTimer {
    inner: Mutex<TimerInner>,
}

struct TimerInner {
    current: Option<(&'static str, Instant)>,
    totals: BTreeMap<&'static str, Duration>,
}

impl CommitLockTimer {
    fn new() -> Self {
        let mut totals = BTreeMap::new();
        totals.insert("EXCLUSIVE", Duration::ZERO);
        totals.insert("SHARED", Duration::ZERO);
        Self {
            inner: Mutex::new(TimerInner {
                current: None,
                totals,
            }),
        }
    }

    pub(crate) fn start(&self, label: &'static str) {
        self.inner.lock().current = Some((label, Instant::now()));
    }

    pub(crate) fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some((label, since)) = inner.current.take() {
            let held = since.elapsed();
            *inner.totals.entry(label).or_insert(Duration::ZERO) += held;
            debug!(label, held_us = held.as_micros() as u64, "commit lock released");
        }
    }

    pub(crate) fn totals(&self) -> BTreeMap<&'static str, Duration> {
        self.inner.lock().totals.clone()
    }
}

struct InternalState {
    prepared: BTreeMap<u64, CommittedTransaction>,
    committed: BTreeMap<u64, CommittedTransaction>,
    listeners: Vec<Arc<dyn CheckpointListener>>,
}

/// One instance per database file, shared by every connection in the
/// process. Holds the commit lock that serializes journal appends and engine
/// COMMITs, and the coordination state the checkpoint protocol drains.
pub(crate) struct SharedData {
    filename: PathBuf,
    commit_count: AtomicU64,
    last_committed_hash: Mutex<String>,
    /// Round-robin cursor for striped journal assignment of duplicated
    /// connections.
    pub(crate) next_journal_count: AtomicU64,
    /// WAL frames reported by the engine's WAL hook after the latest commit.
    pub(crate) current_page_count: AtomicU64,
    /// Nonzero while a checkpoint coordinator is running; at most one per
    /// SharedData.
    pub(crate) checkpoint_thread_busy: AtomicU32,
    commit_lock: Arc<Mutex<()>>,
    pub(crate) commit_lock_timer: CommitLockTimer,
    /// Coordinators take this exclusively; `wait_for_checkpoint` takes it
    /// shared so new transactions stall while a coordinator drains.
    block_new_transactions: RwLock<()>,
    transaction_count: Mutex<usize>,
    transaction_count_cv: Condvar,
    internal: Mutex<InternalState>,
    /// Cleared the first time the engine rejects `BEGIN CONCURRENT`; the
    /// wrapper then falls back to a plain deferred BEGIN.
    pub(crate) concurrent_begin_supported: AtomicBool,
}

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<SharedData>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl SharedData {
    /// Returns the SharedData for a canonical path, creating it on first use
    /// by reading the highest commit id and its hash out of the journal
    /// tables. Entries die with their last connection.
    pub(crate) fn for_database(
        filename: &Path,
        conn: &rusqlite::Connection,
        journal_names: &[String],
    ) -> Result<Arc<SharedData>, ChaindbError> {
        let mut registry = REGISTRY.lock();
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = registry.get(filename).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let (commit_count, last_committed_hash) =
            journal::initial_commit_state(conn, journal_names)?;
        if commit_count > 0 && last_committed_hash.is_empty() {
            return Err(ChaindbError::Integrity {
                message: format!("loaded commit count {commit_count} with empty hash"),
            });
        }

        let shared = Arc::new(SharedData {
            filename: filename.to_path_buf(),
            commit_count: AtomicU64::new(commit_count),
            last_committed_hash: Mutex::new(last_committed_hash),
            next_journal_count: AtomicU64::new(0),
            current_page_count: AtomicU64::new(0),
            checkpoint_thread_busy: AtomicU32::new(0),
            commit_lock: Arc::new(Mutex::new(())),
            commit_lock_timer: CommitLockTimer::new(),
            block_new_transactions: RwLock::new(()),
            transaction_count: Mutex::new(0),
            transaction_count_cv: Condvar::new(),
            internal: Mutex::new(InternalState {
                prepared: BTreeMap::new(),
                committed: BTreeMap::new(),
                listeners: Vec::new(),
            }),
            concurrent_begin_supported: AtomicBool::new(true),
        });
        registry.insert(filename.to_path_buf(), Arc::downgrade(&shared));
        Ok(shared)
    }

    pub(crate) fn filename(&self) -> &Path {
        &self.filename
    }

    pub(crate) fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::Acquire)
    }

    pub(crate) fn last_committed_hash(&self) -> String {
        self.last_committed_hash.lock().clone()
    }

    /// Publishes a successful commit: bumps the count, moves the prepared
    /// record into the committed map, and stores the new chain hash.
    pub(crate) fn increment_commit(&self, hash: &str) {
        let mut internal = self.internal.lock();
        let commit_id = self.commit_count.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(txn) = internal.prepared.remove(&commit_id) {
            internal.committed.insert(commit_id, txn);
        }
        *self.last_committed_hash.lock() = hash.to_string();
    }

    pub(crate) fn prepare_transaction_info(
        &self,
        commit_id: u64,
        query: &str,
        hash: &str,
        db_count_at_start: u64,
    ) {
        self.internal.lock().prepared.insert(
            commit_id,
            CommittedTransaction {
                query: query.to_string(),
                hash: hash.to_string(),
                db_count_at_start,
            },
        );
    }

    pub(crate) fn discard_prepared(&self, commit_id: u64) {
        self.internal.lock().prepared.remove(&commit_id);
    }

    /// Atomically hands off the committed-transaction map, ascending by
    /// commit id, and clears it.
    pub(crate) fn pop_committed_transactions(&self) -> BTreeMap<u64, CommittedTransaction> {
        std::mem::take(&mut self.internal.lock().committed)
    }

    /// Acquires the process-wide commit lock for this file. The guard is
    /// owned, so it can live in the connection between `prepare` and
    /// `commit`/`rollback`.
    pub(crate) fn lock_commit_lock(&self) -> ArcMutexGuard<RawMutex, ()> {
        self.commit_lock.lock_arc()
    }

    pub(crate) fn increment_transaction_count(&self) {
        {
            let mut count = self.transaction_count.lock();
            *count += 1;
        }
        self.transaction_count_cv.notify_one();
    }

    pub(crate) fn decrement_transaction_count(&self) {
        {
            let mut count = self.transaction_count.lock();
            *count = count.saturating_sub(1);
        }
        self.transaction_count_cv.notify_one();
    }

    pub(crate) fn lock_transaction_count(&self) -> MutexGuard<'_, usize> {
        self.transaction_count.lock()
    }

    pub(crate) fn wait_transaction_change(&self, guard: &mut MutexGuard<'_, usize>) {
        self.transaction_count_cv.wait(guard);
    }

    /// Stalls while a checkpoint coordinator holds the block exclusively.
    pub(crate) fn wait_for_checkpoint(&self) {
        drop(self.block_new_transactions.read());
    }

    pub(crate) fn block_new_transactions_exclusive(
        &self,
    ) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.block_new_transactions.write()
    }

    pub(crate) fn checkpoint_busy(&self) -> bool {
        self.checkpoint_thread_busy.load(Ordering::Acquire) != 0
    }

    pub(crate) fn add_checkpoint_listener(&self, listener: Arc<dyn CheckpointListener>) {
        self.internal.lock().listeners.push(listener);
    }

    pub(crate) fn remove_checkpoint_listener(&self, listener: &Arc<dyn CheckpointListener>) {
        self.internal
            .lock()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn listeners(&self) -> Vec<Arc<dyn CheckpointListener>> {
        self.internal.lock().listeners.clone()
    }

    // Listeners run outside the internal lock so they may add or remove
    // themselves without deadlocking.
    pub(crate) fn notify_checkpoint_required(&self) {
        for listener in self.listeners() {
            listener.checkpoint_required(&self.filename);
        }
    }

    pub(crate) fn notify_checkpoint_complete(&self) {
        for listener in self.listeners() {
            listener.checkpoint_complete(&self.filename);
        }
    }
}
