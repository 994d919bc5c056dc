//! Application configuration constants.
//! Tuning and defaults in one place.

use std::sync::OnceLock;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived names: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    db_filename: String,
    config_filename: String,
    db_env_key: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache names from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                db_filename: format!("{pkg}.db"),
                config_filename: format!("{pkg}.toml"),
                db_env_key: format!("{}_DB", pkg.to_uppercase()),
            }
        })
    }

    /// Default database file, relative to the working directory.
    pub fn db_filename(&self) -> &str {
        &self.db_filename
    }

    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }

    /// Environment variable holding the database path (`PASSBATCH_DB`).
    pub fn db_env_key(&self) -> &str {
        &self.db_env_key
    }
}

// ---- Worker threads ----

/// Worker pool limits for async stages and multi-threaded steps.
/// Use [`WorkerPoolLimits::current()`] to fill `all_threads` from rayon; the rest are const.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPoolLimits {
    /// Available threads (from rayon); set by [`WorkerPoolLimits::current()`].
    pub all_threads: usize,
    /// Minimum pool size.
    pub floor: usize,
    /// Maximum pool size. SQLite has one writer at a time; more workers only queue on the lock.
    pub max: usize,
}

impl Default for WorkerPoolLimits {
    fn default() -> Self {
        Self {
            all_threads: 0, // use current() to set from rayon
            floor: Self::FLOOR_THREADS,
            max: Self::MAX_THREADS,
        }
    }
}

impl WorkerPoolLimits {
    pub const FLOOR_THREADS: usize = 2;
    pub const MAX_THREADS: usize = 8;

    /// Build limits with `all_threads` set from `rayon::current_num_threads()`.
    pub fn current() -> Self {
        Self {
            all_threads: rayon::current_num_threads(),
            ..Self::default()
        }
    }

    /// Default pool size: available threads clamped to `[floor, max]`.
    pub fn default_size(&self) -> usize {
        self.all_threads.clamp(self.floor, self.max)
    }
}

// ---- Store ----

/// SQLite connection and cursor tuning.
pub struct StoreTuning {
    /// How long a connection waits on a locked database before failing (ms).
    pub busy_timeout_ms: u64,
    /// Rows a cursor reader thread may buffer ahead of the step.
    pub cursor_fetch_size: usize,
}

pub const STORE: StoreTuning = StoreTuning {
    busy_timeout_ms: 5_000,
    cursor_fetch_size: 256,
};

// ---- Job defaults ----

/// Chunk and page sizes the jobs use unless `[jobs.<name>]` overrides them.
pub struct JobDefaults;

impl JobDefaults {
    pub const EXPIRE_PASSES_CHUNK: usize = 5;
    pub const USE_PASSES_CHUNK: usize = 10;
    pub const NOTIFICATION_CHUNK: usize = 10;
    pub const STATISTICS_CHUNK: usize = 10;
    /// Minutes ahead of class start that a reminder is created.
    pub const NOTIFY_BEFORE_MINUTES: i64 = 10;
    /// Bulk passes starting after `now - this` are distributed.
    pub const BULK_PASS_LOOKBACK_DAYS: i64 = 1;
}
