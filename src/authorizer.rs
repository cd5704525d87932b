//! Per-connection query authorization: whitelist enforcement, query
//! rewriting, and the non-deterministic-function tracking that gates the
//! read cache.
//!
//! The engine invokes the authorizer for each parsed action while a
//! statement is compiled. The connection shares an [`AuthorizerState`] with
//! the registered callback; the write path consults it afterwards to decide
//! whether a denied statement should be re-run rewritten, and the read path
//! consults the determinism flag to decide whether the result is cacheable.

use parking_lot::{Mutex, RwLock};
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Functions whose results vary between executions. A query that touches any
/// of these is never inserted into the deterministic-read cache.
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "random",
    "date",
    "time",
    "datetime",
    "julianday",
    "strftime",
    "changes",
    "last_insert_rowid",
    "sqlite_version",
];

pub(crate) fn is_non_deterministic_function(name: &str) -> bool {
    NON_DETERMINISTIC_FUNCTIONS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

/// Read policy: tables mapped to the set of columns a connection may read.
/// With a whitelist installed, every mutation and DDL action is denied and
/// reads outside the declared pairs are substituted with NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whitelist {
    tables: HashMap<String, HashSet<String>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants read access to `column` of `table`.
    pub fn allow(&mut self, table: impl Into<String>, column: impl Into<String>) {
        self.tables
            .entry(table.into())
            .or_default()
            .insert(column.into());
    }

    pub fn allows(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .map(|columns| columns.contains(column))
            .unwrap_or(false)
    }
}

/// Inspects a parsed action and optionally supplies a replacement query. The
/// original statement is then denied and the replacement executed in its
/// place.
pub type RewriteHandler = Box<dyn Fn(&AuthAction<'_>) -> Option<String> + Send>;

/// State shared between a connection and its registered authorizer callback.
pub(crate) struct AuthorizerState {
    whitelist: RwLock<Option<Whitelist>>,
    rewrite_enabled: AtomicBool,
    currently_running_rewritten: AtomicBool,
    rewritten_query: Mutex<Option<String>>,
    rewrite_handler: Mutex<Option<RewriteHandler>>,
    deterministic_query: AtomicBool,
}

impl AuthorizerState {
    pub(crate) fn new() -> Self {
        Self {
            whitelist: RwLock::new(None),
            rewrite_enabled: AtomicBool::new(false),
            currently_running_rewritten: AtomicBool::new(false),
            rewritten_query: Mutex::new(None),
            rewrite_handler: Mutex::new(None),
            deterministic_query: AtomicBool::new(true),
        }
    }

    pub(crate) fn set_whitelist(&self, whitelist: Option<Whitelist>) {
        *self.whitelist.write() = whitelist;
    }

    pub(crate) fn set_rewrite_enabled(&self, enabled: bool) {
        self.rewrite_enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn rewrite_enabled(&self) -> bool {
        self.rewrite_enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rewrite_handler(&self, handler: RewriteHandler) {
        *self.rewrite_handler.lock() = Some(handler);
    }

    pub(crate) fn set_running_rewritten(&self, running: bool) {
        self.currently_running_rewritten
            .store(running, Ordering::Relaxed);
    }

    /// Hands the pending rewritten query to the write path, clearing the slot.
    pub(crate) fn take_rewritten_query(&self) -> Option<String> {
        self.rewritten_query.lock().take()
    }

    pub(crate) fn reset_deterministic(&self) {
        self.deterministic_query.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_deterministic(&self) -> bool {
        self.deterministic_query.load(Ordering::Relaxed)
    }

    /// The authorizer callback. Contract, in priority order: rewrite check,
    /// determinism tracking, whitelist policy, default allow.
    pub(crate) fn authorize(&self, ctx: &AuthContext<'_>) -> Authorization {
        if self.rewrite_enabled.load(Ordering::Relaxed)
            && !self.currently_running_rewritten.load(Ordering::Relaxed)
        {
            let handler = self.rewrite_handler.lock();
            if let Some(handler) = handler.as_ref() {
                if let Some(replacement) = handler(&ctx.action) {
                    *self.rewritten_query.lock() = Some(replacement);
                    // Deny the original; the write path re-runs the rewrite.
                    return Authorization::Deny;
                }
            }
        }

        if let AuthAction::Function { function_name } = &ctx.action {
            if is_non_deterministic_function(function_name) {
                self.deterministic_query.store(false, Ordering::Relaxed);
            }
        }

        let whitelist = self.whitelist.read();
        let Some(whitelist) = whitelist.as_ref() else {
            return Authorization::Allow;
        };

        match &ctx.action {
            AuthAction::Select | AuthAction::Analyze { .. } | AuthAction::Function { .. } => {
                Authorization::Allow
            }
            // The engine reads schema_version internally on the write path;
            // a value means the caller tried to *set* it, which can corrupt
            // the database.
            AuthAction::Pragma {
                pragma_name,
                pragma_value,
            } => {
                if pragma_name.eq_ignore_ascii_case("schema_version") && pragma_value.is_none() {
                    Authorization::Allow
                } else {
                    Authorization::Deny
                }
            }
            AuthAction::Read {
                table_name,
                column_name,
            } => {
                if whitelist.allows(table_name, column_name) {
                    Authorization::Allow
                } else {
                    warn!(
                        table = table_name,
                        column = column_name,
                        "[security] read of non-whitelisted column, substituting NULL"
                    );
                    Authorization::Ignore
                }
            }
            // Every mutation and DDL action lands here.
            _ => Authorization::Deny,
        }
    }
}
