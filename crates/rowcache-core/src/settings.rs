//! Settings for rowcache.
//!
//! [`Settings`] holds the database, pool, and cache configuration. A
//! process-wide [`LazySettings`] instance is available as [`SETTINGS`] for
//! applications that configure once at startup; library code takes settings
//! by reference instead of reading the global.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Database connection and pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// The SQL dialect: `"sqlite"`, `"postgresql"`, or `"mysql"`.
    pub dialect: String,
    /// The database name (or file path for `SQLite`).
    pub name: String,
    /// Maximum number of idle connections kept by the pool.
    pub pool_size: usize,
    /// Seconds a physical connection may live before it is replaced.
    pub max_age_secs: u64,
    /// Milliseconds to wait before retrying a deferred close.
    pub close_retry_ms: u64,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl DatabaseSettings {
    /// The connection lifetime as a [`Duration`].
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// The deferred-close retry interval as a [`Duration`].
    pub const fn close_retry(&self) -> Duration {
        Duration::from_millis(self.close_retry_ms)
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            dialect: "sqlite".to_string(),
            name: ":memory:".to_string(),
            pool_size: 5,
            max_age_secs: 3600,
            close_retry_ms: 100,
            options: HashMap::new(),
        }
    }
}

/// Read-through cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Leading component of every cache key.
    pub prefix: String,
    /// Trailing version component of every cache key. Bump to orphan all
    /// previously written entries.
    pub version: String,
    /// Time-to-live in seconds for cached rows, id-lists, and counts.
    pub ttl_secs: u64,
    /// Length bound of a cached ordered id-list, sentinel included.
    pub max_count: usize,
    /// Probability of reporting a cache fallback.
    pub miss_sample_rate: f64,
    /// Reject ineligible predicates instead of falling through to the database.
    pub strict: bool,
}

impl CacheSettings {
    /// The time-to-live as a [`Duration`].
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            prefix: "rowcache".to_string(),
            version: "1".to_string(),
            ttl_secs: 86_400,
            max_count: 200,
            miss_sample_rate: 0.02,
            strict: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Debug mode switches logging to a human-readable format.
    pub debug: bool,
    /// Log filter directive, e.g. `"info"` or `"rowcache_db=debug"`.
    pub log_level: String,
    /// Database and pool settings.
    pub database: DatabaseSettings,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Free-form application settings.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: true,
            log_level: "info".to_string(),
            database: DatabaseSettings::default(),
            cache: CacheSettings::default(),
            extra: HashMap::new(),
        }
    }
}

/// A lazily-initialized, globally-accessible settings container.
///
/// # Panics
///
/// [`get`](LazySettings::get) panics if settings have not been configured.
/// [`configure`](LazySettings::configure) panics if called more than once.
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates a new, unconfigured `LazySettings`.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Configures the global settings. Must be called exactly once.
    ///
    /// # Panics
    ///
    /// Panics if settings have already been configured.
    pub fn configure(&self, settings: Settings) {
        self.inner
            .set(settings)
            .expect("Settings have already been configured");
    }

    /// Returns a reference to the configured settings.
    ///
    /// # Panics
    ///
    /// Panics if settings have not been configured.
    pub fn get(&self) -> &Settings {
        self.inner
            .get()
            .expect("Settings have not been configured. Call SETTINGS.configure() first.")
    }

    /// Returns the configured settings, or `None` before configuration.
    pub fn try_get(&self) -> Option<&Settings> {
        self.inner.get()
    }

    /// Returns `true` if settings have been configured.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();
