//! # Configuration
//!
//! Plain structs with sensible defaults. Nothing here reads files; the only
//! external source is the process environment, and only when the caller asks
//! for it through [`SqliteConfig::from_env`].
//!
//! ## Environment Variables
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `SPITESTORE_PAGE_SIZE` | `page_size` | 128 |
//! | `SPITESTORE_READER_THREADS` | `reader_threads` | CPU count, 1-16 |
//! | `SPITESTORE_BATCH_TIMEOUT_MS` | `writer.batch_timeout` | 10 |
//! | `SPITESTORE_BATCH_MAX_SIZE` | `writer.batch_max_size` | 1000 |
//! | `SPITESTORE_BUSY_TIMEOUT_MS` | `busy_timeout` | 5000 |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread::available_parallelism;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::reader::DEFAULT_PAGE_SIZE;
use crate::types::BucketId;
use crate::writer::WriterConfig;

/// Minimum number of reader threads.
const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
const MAX_READ_THREADS: usize = 16;

/// Default time SQLite waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default interval between polling ticks.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1_000;

/// Default number of commits a polling client reads per page.
pub const DEFAULT_POLLING_BATCH_SIZE: usize = 512;

// =============================================================================
// SQLite Engine
// =============================================================================

/// Settings for [`SqlitePersistence`](crate::sqlite::SqlitePersistence).
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file. Created if missing.
    pub path: PathBuf,

    /// Group-commit settings.
    pub writer: WriterConfig,

    /// Rows fetched per query page.
    pub page_size: usize,

    /// Number of pooled read-only connections.
    pub reader_threads: usize,

    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    /// Defaults for the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let reader_threads = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READ_THREADS)
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        Self {
            path: path.as_ref().to_path_buf(),
            writer: WriterConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            reader_threads,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }

    /// Defaults overridden by `SPITESTORE_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Error::Schema` when a variable is set but does not parse.
    pub fn from_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::new(path);

        if let Some(page_size) = env_var::<usize>("SPITESTORE_PAGE_SIZE")? {
            config.page_size = page_size;
        }
        if let Some(threads) = env_var::<usize>("SPITESTORE_READER_THREADS")? {
            config.reader_threads = threads.clamp(MIN_READ_THREADS, MAX_READ_THREADS);
        }
        if let Some(ms) = env_var::<u64>("SPITESTORE_BATCH_TIMEOUT_MS")? {
            config.writer.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = env_var::<usize>("SPITESTORE_BATCH_MAX_SIZE")? {
            config.writer.batch_max_size = size;
        }
        if let Some(ms) = env_var::<u64>("SPITESTORE_BUSY_TIMEOUT_MS")? {
            config.busy_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the page size (builder style).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the reader thread count (builder style).
    pub fn with_reader_threads(mut self, reader_threads: usize) -> Self {
        self.reader_threads = reader_threads;
        self
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Schema("page_size must be at least 1".into()));
        }
        if self.reader_threads == 0 {
            return Err(Error::Schema("reader_threads must be at least 1".into()));
        }
        if self.writer.batch_max_size == 0 {
            return Err(Error::Schema("batch_max_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Schema(format!("{name} has an invalid value '{raw}'"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Schema(format!("{name}: {e}"))),
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Settings for [`PollingClient`](crate::polling::PollingClient).
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Time between ticks.
    pub interval: Duration,

    /// Restricts the feed to one bucket.
    pub bucket: Option<BucketId>,

    /// Most commits held in memory per read. A tick that fills a page reads
    /// the next one straight away.
    pub max_batch: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS),
            bucket: None,
            max_batch: DEFAULT_POLLING_BATCH_SIZE,
        }
    }
}

impl PollingConfig {
    /// A config with the given interval and no bucket filter.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Sets the page size, at least 1.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}
