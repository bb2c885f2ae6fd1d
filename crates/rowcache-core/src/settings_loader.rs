//! Settings loading from configuration files.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML or JSON file (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `ROWCACHE_DEBUG` | `debug` |
//! | `ROWCACHE_LOG_LEVEL` | `log_level` |
//! | `ROWCACHE_DB_DIALECT` | `database.dialect` |
//! | `ROWCACHE_DB_NAME` | `database.name` |
//! | `ROWCACHE_DB_POOL_SIZE` | `database.pool_size` |
//! | `ROWCACHE_DB_MAX_AGE` | `database.max_age_secs` |
//! | `ROWCACHE_CACHE_PREFIX` | `cache.prefix` |
//! | `ROWCACHE_CACHE_VERSION` | `cache.version` |
//! | `ROWCACHE_CACHE_TTL` | `cache.ttl_secs` |
//! | `ROWCACHE_CACHE_STRICT` | `cache.strict` |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rowcache_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file_with_env("config/rowcache.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::OrmError;
use crate::settings::Settings;

/// Loads settings from a TOML string. Keys absent from the TOML keep their
/// default values.
pub fn from_toml_str(toml_str: &str) -> Result<Settings, OrmError> {
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| OrmError::Configuration(format!("Failed to parse TOML: {e}")))?;
    merge_over_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Settings, OrmError> {
    let content = read_config(path.as_ref(), "TOML")?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<Settings, OrmError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from a JSON string.
pub fn from_json_str(json_str: &str) -> Result<Settings, OrmError> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| OrmError::Configuration(format!("Failed to parse JSON: {e}")))?;
    merge_over_defaults(json_value, "JSON")
}

/// Loads settings from a JSON file.
pub fn from_json_file(path: impl AsRef<Path>) -> Result<Settings, OrmError> {
    let content = read_config(path.as_ref(), "JSON")?;
    from_json_str(&content)
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `ROWCACHE_*` environment variable overrides to a settings struct.
///
/// Numeric variables that fail to parse are ignored.
pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Applies overrides from an arbitrary variable lookup.
pub fn apply_overrides_from<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("ROWCACHE_DEBUG") {
        settings.debug = parse_bool(&val);
    }
    if let Some(val) = lookup("ROWCACHE_LOG_LEVEL") {
        settings.log_level = val;
    }
    if let Some(val) = lookup("ROWCACHE_DB_DIALECT") {
        settings.database.dialect = val.to_lowercase();
    }
    if let Some(val) = lookup("ROWCACHE_DB_NAME") {
        settings.database.name = val;
    }
    if let Some(size) = lookup("ROWCACHE_DB_POOL_SIZE").and_then(|v| v.parse().ok()) {
        settings.database.pool_size = size;
    }
    if let Some(age) = lookup("ROWCACHE_DB_MAX_AGE").and_then(|v| v.parse().ok()) {
        settings.database.max_age_secs = age;
    }
    if let Some(val) = lookup("ROWCACHE_CACHE_PREFIX") {
        settings.cache.prefix = val;
    }
    if let Some(val) = lookup("ROWCACHE_CACHE_VERSION") {
        settings.cache.version = val;
    }
    if let Some(ttl) = lookup("ROWCACHE_CACHE_TTL").and_then(|v| v.parse().ok()) {
        settings.cache.ttl_secs = ttl;
    }
    if let Some(val) = lookup("ROWCACHE_CACHE_STRICT") {
        settings.cache.strict = parse_bool(&val);
    }
}

// ============================================================
// Helpers
// ============================================================

fn parse_bool(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn read_config(path: &Path, kind: &str) -> Result<String, OrmError> {
    std::fs::read_to_string(path).map_err(|e| {
        OrmError::Configuration(format!(
            "Failed to read {kind} file '{}': {e}",
            path.display()
        ))
    })
}

fn merge_over_defaults(value: serde_json::Value, kind: &str) -> Result<Settings, OrmError> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        OrmError::Configuration(format!("Failed to serialize default settings: {e}"))
    })?;
    let merged = merge_json(default_json, value);
    serde_json::from_value(merged).map_err(|e| {
        OrmError::Configuration(format!("Failed to deserialize settings from {kind}: {e}"))
    })
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(base_v) => merge_json(base_v, override_v),
                    None => override_v,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    // ── TOML loading ────────────────────────────────────────────────

    #[test]
    fn test_from_toml_str_nested_tables() {
        let toml = r#"
            debug = false

            [database]
            dialect = "postgresql"
            pool_size = 12

            [cache]
            prefix = "shop"
            max_count = 50
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.database.dialect, "postgresql");
        assert_eq!(settings.database.pool_size, 12);
        assert_eq!(settings.cache.prefix, "shop");
        assert_eq!(settings.cache.max_count, 50);
        // Defaults preserved inside partially specified tables
        assert_eq!(settings.database.max_age_secs, 3600);
        assert_eq!(settings.cache.version, "1");
    }

    #[test]
    fn test_from_toml_str_empty() {
        let settings = from_toml_str("").unwrap();
        assert!(settings.debug);
        assert_eq!(settings.cache.max_count, 200);
    }

    #[test]
    fn test_from_toml_str_invalid() {
        assert!(matches!(
            from_toml_str("[[invalid toml content"),
            Err(OrmError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_toml_str_wrong_type() {
        let result = from_toml_str("[database]\npool_size = \"many\"");
        assert!(result.is_err());
    }

    // ── JSON loading ────────────────────────────────────────────────

    #[test]
    fn test_from_json_str_basic() {
        let json = r#"{"log_level": "debug", "cache": {"strict": true}}"#;
        let settings = from_json_str(json).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert!(settings.cache.strict);
        assert_eq!(settings.cache.prefix, "rowcache");
    }

    #[test]
    fn test_from_json_str_invalid() {
        assert!(from_json_str("{invalid json").is_err());
    }

    // ── File loading ────────────────────────────────────────────────

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowcache.toml");
        std::fs::write(&path, "[database]\nname = \"app.db\"\n").unwrap();

        let settings = from_toml_file(&path).unwrap();
        assert_eq!(settings.database.name, "app.db");
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowcache.json");
        std::fs::write(&path, r#"{"cache": {"ttl_secs": 60}}"#).unwrap();

        let settings = from_json_file(&path).unwrap();
        assert_eq!(settings.cache.ttl_secs, 60);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let result = from_toml_file("/nonexistent/rowcache.toml");
        assert!(matches!(result, Err(OrmError::Configuration(_))));
    }

    // ── Overrides ───────────────────────────────────────────────────

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ROWCACHE_DEBUG", "0"),
            ("ROWCACHE_DB_DIALECT", "MySQL"),
            ("ROWCACHE_DB_POOL_SIZE", "3"),
            ("ROWCACHE_CACHE_PREFIX", "svc"),
            ("ROWCACHE_CACHE_STRICT", "yes"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_overrides_from(&mut settings, |name| vars.get(name).map(ToString::to_string));

        assert!(!settings.debug);
        assert_eq!(settings.database.dialect, "mysql");
        assert_eq!(settings.database.pool_size, 3);
        assert_eq!(settings.cache.prefix, "svc");
        assert!(settings.cache.strict);
    }

    #[test]
    fn test_unparseable_numeric_override_is_ignored() {
        let mut settings = Settings::default();
        apply_overrides_from(&mut settings, |name| {
            (name == "ROWCACHE_CACHE_TTL").then(|| "soon".to_string())
        });
        assert_eq!(settings.cache.ttl_secs, 86_400);
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[test]
    fn test_merge_json_deep() {
        let base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        let over = serde_json::json!({"a": {"b": 10}});
        let merged = merge_json(base, over);
        assert_eq!(merged, serde_json::json!({"a": {"b": 10, "c": 2}, "d": 3}));
    }
}
