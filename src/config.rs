use crate::error::ChaindbError;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Pass-through of the engine's fsync-strength pragma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Synchronous {
    Off,
    Normal,
    Full,
    Extra,
}

impl Synchronous {
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Off => "OFF",
            Synchronous::Normal => "NORMAL",
            Synchronous::Full => "FULL",
            Synchronous::Extra => "EXTRA",
        }
    }
}

/// Per-connection configuration. Connections created with
/// [`Connection::duplicate`](crate::Connection::duplicate) inherit the
/// originating connection's config verbatim.
#[derive(Debug, Clone)]
pub struct ChaindbConfig {
    /// Engine page-cache size in KiB.
    pub cache_size_kb: i64,
    /// Maximum journal rows retained per journal table; older rows are
    /// trimmed on the commit path.
    pub max_journal_size: u64,
    /// Number of striped `journalNNNN` tables to pre-create alongside the
    /// plain `journal` table. Zero means only `journal` exists and duplicated
    /// connections do not stripe.
    pub min_journal_tables: usize,
    /// `PRAGMA synchronous` override; `None` keeps the engine default.
    pub synchronous: Option<Synchronous>,
    /// Memory-mapped I/O window in GiB; zero disables mmap.
    pub mmap_size_gb: u64,
    /// Serializes COMMIT under a process-wide mutex and tags each attempt
    /// with a monotonic id for page-level write analysis.
    pub page_logging_enabled: bool,
    /// Engine operations between progress-handler callbacks. The default is
    /// granular enough for sub-second timeout detection on large queries.
    pub progress_handler_interval: u32,
    /// Entry capacity of the per-transaction deterministic-read cache.
    pub query_cache_capacity: usize,
}

impl Default for ChaindbConfig {
    fn default() -> Self {
        Self {
            cache_size_kb: 2_000,
            max_journal_size: 1_000_000,
            min_journal_tables: 0,
            synchronous: None,
            mmap_size_gb: 0,
            page_logging_enabled: false,
            progress_handler_interval: 1_000_000,
            query_cache_capacity: 4_096,
        }
    }
}

impl ChaindbConfig {
    pub(crate) fn validate(&self) -> Result<(), ChaindbError> {
        if self.cache_size_kb <= 0 {
            return Err(ChaindbError::InvalidConfig {
                message: "cache_size_kb must be positive".into(),
            });
        }
        if self.max_journal_size == 0 {
            return Err(ChaindbError::InvalidConfig {
                message: "max_journal_size must be positive".into(),
            });
        }
        // Striped journal names are formatted with four digits.
        if self.min_journal_tables >= 10_000 {
            return Err(ChaindbError::InvalidConfig {
                message: "min_journal_tables must be below 10000".into(),
            });
        }
        if self.progress_handler_interval == 0 {
            return Err(ChaindbError::InvalidConfig {
                message: "progress_handler_interval must be positive".into(),
            });
        }
        Ok(())
    }
}

// Process-wide tunables shared by every connection on every database file.
// Pages are assumed to be 4 KiB, so the defaults are roughly 10 MiB and
// 100 MiB of WAL growth.
static PASSIVE_CHECKPOINT_PAGE_MIN: AtomicI64 = AtomicI64::new(2_500);
static FULL_CHECKPOINT_PAGE_MIN: AtomicI64 = AtomicI64::new(25_000);
static ENABLE_TRACE: AtomicBool = AtomicBool::new(false);

/// Snapshot of the process-wide tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// WAL frame count above which the commit path runs a passive checkpoint.
    pub passive_checkpoint_page_min: i64,
    /// WAL frame count above which the WAL hook starts a full (restart)
    /// checkpoint coordinator.
    pub full_checkpoint_page_min: i64,
    /// Log every statement the engine executes.
    pub enable_trace: bool,
}

impl Tunables {
    pub fn current() -> Self {
        Self {
            passive_checkpoint_page_min: PASSIVE_CHECKPOINT_PAGE_MIN.load(Ordering::Relaxed),
            full_checkpoint_page_min: FULL_CHECKPOINT_PAGE_MIN.load(Ordering::Relaxed),
            enable_trace: ENABLE_TRACE.load(Ordering::Relaxed),
        }
    }

    pub fn apply(self) {
        PASSIVE_CHECKPOINT_PAGE_MIN.store(self.passive_checkpoint_page_min, Ordering::Relaxed);
        FULL_CHECKPOINT_PAGE_MIN.store(self.full_checkpoint_page_min, Ordering::Relaxed);
        ENABLE_TRACE.store(self.enable_trace, Ordering::Relaxed);
    }
}

pub(crate) fn passive_checkpoint_page_min() -> i64 {
    PASSIVE_CHECKPOINT_PAGE_MIN.load(Ordering::Relaxed)
}

pub(crate) fn full_checkpoint_page_min() -> i64 {
    FULL_CHECKPOINT_PAGE_MIN.load(Ordering::Relaxed)
}

pub(crate) fn trace_enabled() -> bool {
    ENABLE_TRACE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::{ChaindbConfig, Synchronous, Tunables};

    #[test]
    fn default_config_is_valid() {
        assert!(ChaindbConfig::default().validate().is_ok());
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = ChaindbConfig::default();
        config.cache_size_kb = 0;
        assert!(config.validate().is_err());

        let mut config = ChaindbConfig::default();
        config.max_journal_size = 0;
        assert!(config.validate().is_err());

        let mut config = ChaindbConfig::default();
        config.min_journal_tables = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn synchronous_pragma_values() {
        assert_eq!(Synchronous::Off.as_str(), "OFF");
        assert_eq!(Synchronous::Extra.as_str(), "EXTRA");
    }

    #[test]
    fn tunables_round_trip() {
        // High values so concurrently running tests cannot cross a
        // checkpoint threshold while this test holds the modified settings.
        let before = Tunables::current();
        let modified = Tunables {
            passive_checkpoint_page_min: 5_000_000,
            full_checkpoint_page_min: 10_000_000,
            enable_trace: false,
        };
        modified.apply();
        assert_eq!(Tunables::current(), modified);
        before.apply();
    }
}
