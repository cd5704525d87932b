//! Checkpoint coordination: the WAL hook that watches log growth, the
//! background coordinator that drains in-flight transactions and runs a
//! restart checkpoint, and the opportunistic passive checkpoint used on the
//! commit path.

use crate::config;
use crate::shared::SharedData;
use parking_lot::Mutex;
use rusqlite::ffi;
use std::ffi::c_void;
use std::os::raw::{c_char, c_int};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Observer of the checkpoint protocol. `checkpoint_required` fires while a
/// coordinator is waiting on in-flight transactions; implementations are
/// expected to nudge or cancel their transactions, not to start new work on
/// the database (the coordinator holds the transaction-count lock while
/// notifying).
pub trait CheckpointListener: Send + Sync {
    fn checkpoint_required(&self, db: &Path);
    fn checkpoint_complete(&self, db: &Path);
}

/// State handed to the engine's WAL hook. Boxed and owned by the connection
/// so the pointer registered with the engine stays stable; the connection
/// unregisters the hook before dropping the box.
pub(crate) struct WalHookContext {
    shared: Arc<SharedData>,
    destructor_lock: Arc<Mutex<()>>,
}

impl WalHookContext {
    pub(crate) fn new(shared: Arc<SharedData>, destructor_lock: Arc<Mutex<()>>) -> Box<Self> {
        Box::new(Self {
            shared,
            destructor_lock,
        })
    }

    /// Invoked after every commit with the current WAL frame count.
    fn on_commit(&self, pages: c_int) {
        let pages = pages.max(0) as u64;
        self.shared
            .current_page_count
            .store(pages, Ordering::Release);
        if (pages as i64) < config::full_checkpoint_page_min() {
            // Passive checkpoints are the commit path's job.
            return;
        }
        info!(pages, "WAL past full-checkpoint threshold, beginning complete checkpoint");
        if self
            .shared
            .checkpoint_thread_busy
            .fetch_add(1, Ordering::AcqRel)
            != 0
        {
            debug!("checkpoint coordinator already running");
            return;
        }

        // The destructor lock is acquired here, on the hook thread, and
        // moved into the coordinator, so the connection's destructor blocks
        // until the coordinator finishes. Destroying a connection while its
        // WAL hook is still executing remains unsafe; destruction is only
        // safe between operations.
        let destructor_guard = self.destructor_lock.lock_arc();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("chaindb-checkpoint".into())
            .spawn(move || {
                let _destructor_guard = destructor_guard;
                run_coordinator(shared);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn checkpoint coordinator");
            self.shared.checkpoint_thread_busy.store(0, Ordering::Release);
        }
    }
}

unsafe extern "C" fn wal_hook_trampoline(
    ctx: *mut c_void,
    _db: *mut ffi::sqlite3,
    _db_name: *const c_char,
    pages: c_int,
) -> c_int {
    let ctx = &*(ctx as *const WalHookContext);
    // Engine callbacks must not unwind across the FFI boundary.
    let _ = catch_unwind(AssertUnwindSafe(|| ctx.on_commit(pages)));
    ffi::SQLITE_OK
}

/// Registers the WAL hook on a raw engine handle. Registering our own hook
/// also disables the engine's automatic checkpointing, which uses the same
/// slot.
pub(crate) fn register_wal_hook(conn: &rusqlite::Connection, ctx: &WalHookContext) {
    unsafe {
        ffi::sqlite3_wal_hook(
            conn.handle(),
            Some(wal_hook_trampoline),
            ctx as *const WalHookContext as *mut c_void,
        );
    }
}

pub(crate) fn clear_wal_hook(conn: &rusqlite::Connection) {
    unsafe {
        ffi::sqlite3_wal_hook(conn.handle(), None, std::ptr::null_mut());
    }
}

/// The coordinator loop. Holds `block_new_transactions` exclusively for its
/// whole run, waits for the in-flight transaction count to reach zero, then
/// performs a restart checkpoint on its own engine handle.
fn run_coordinator(shared: Arc<SharedData>) {
    let start = Instant::now();
    let block = shared.block_new_transactions_exclusive();
    loop {
        let mut count_guard = shared.lock_transaction_count();
        let count = *count_guard;
        let pages = shared.current_page_count.load(Ordering::Acquire) as i64;

        // A passive checkpoint may have drained the WAL while we were
        // waiting; half the threshold keeps this loop from bouncing off the
        // limit on every pass.
        if pages < config::full_checkpoint_page_min() / 2 {
            info!(pages, "WAL drained below half threshold, exiting checkpoint loop");
            break;
        }
        info!(remaining = count, "waiting on in-flight transactions before checkpoint");
        shared.notify_checkpoint_required();

        if count == 0 {
            let checkpoint_start = Instant::now();
            info!(
                waited_ms = start.elapsed().as_millis() as u64,
                "pending transactions drained, starting restart checkpoint"
            );
            match restart_checkpoint(shared.filename()) {
                Ok((busy, total_frames, frames_checkpointed)) => info!(
                    busy,
                    total_frames,
                    frames_checkpointed,
                    elapsed_ms = checkpoint_start.elapsed().as_millis() as u64,
                    "restart checkpoint complete"
                ),
                Err(err) => warn!(error = %err, "restart checkpoint failed"),
            }
            shared.notify_checkpoint_complete();
            break;
        }

        shared.wait_transaction_change(&mut count_guard);
    }
    drop(block);
    shared.checkpoint_thread_busy.store(0, Ordering::Release);
}

/// Runs `PRAGMA wal_checkpoint(mode)` and returns `(busy, log, checkpointed)`
/// as reported by the engine.
pub(crate) fn wal_checkpoint(
    conn: &rusqlite::Connection,
    mode: &str,
) -> Result<(i64, i64, i64), rusqlite::Error> {
    conn.query_row(&format!("PRAGMA wal_checkpoint({mode});"), [], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })
}

// The coordinator runs on its own engine handle: wrapper connections are
// single-thread affine, and any handle on the file can checkpoint its WAL.
fn restart_checkpoint(path: &Path) -> Result<(i64, i64, i64), rusqlite::Error> {
    let conn = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    wal_checkpoint(&conn, "RESTART")
}

/// Best-effort passive checkpoint on the commit path. Never propagates:
/// opportunistic maintenance must not fail a committed transaction.
pub(crate) fn passive_checkpoint(conn: &rusqlite::Connection, shared: &SharedData) {
    let start = Instant::now();
    match wal_checkpoint(conn, "PASSIVE") {
        Ok((busy, total_frames, frames_checkpointed)) => info!(
            pages = shared.current_page_count.load(Ordering::Acquire),
            busy,
            total_frames,
            frames_checkpointed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "passive checkpoint complete"
        ),
        Err(err) => warn!(error = %err, "passive checkpoint failed"),
    }
}
