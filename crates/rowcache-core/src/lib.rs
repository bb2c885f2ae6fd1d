//! # rowcache-core
//!
//! Foundation types shared by every rowcache crate. This crate has no
//! database or cache dependencies of its own.
//!
//! ## Modules
//!
//! - [`error`] - The ORM error taxonomy and result alias
//! - [`settings`] - Database, pool, and cache configuration
//! - [`settings_loader`] - Loading settings from TOML/JSON plus environment overrides
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{OrmError, OrmResult, ValidationError};
pub use settings::{CacheSettings, DatabaseSettings, Settings, SETTINGS};
