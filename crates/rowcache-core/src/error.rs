//! Error types for rowcache.
//!
//! Every fallible operation in the workspace returns [`OrmResult`]. The
//! variants of [`OrmError`] share one base type so callers can match on the
//! category they care about and let the rest propagate.
//!
//! Programmer errors (an ineligible cache predicate, an update without a
//! unique predicate, a malformed statement) are never retryable. Only
//! [`OrmError::Operational`] reports a condition that may clear up on its own.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Represents a validation error with optional field-level errors.
///
/// # Examples
///
/// ```
/// use rowcache_core::error::ValidationError;
///
/// let err = ValidationError::new("age must be positive", "min_value");
///
/// let mut field_errors = std::collections::HashMap::new();
/// field_errors.insert(
///     "email".to_string(),
///     vec![ValidationError::new("Invalid email address.", "invalid")],
/// );
/// let err = ValidationError::with_field_errors(field_errors);
/// ```
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The primary error message.
    pub message: String,
    /// A short code identifying the failure (e.g. "required", "null").
    pub code: String,
    /// Additional parameters providing context for the error message.
    pub params: HashMap<String, String>,
    /// Per-field validation errors, keyed by field name.
    pub field_errors: HashMap<String, Vec<Self>>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            params: HashMap::new(),
            field_errors: HashMap::new(),
        }
    }

    /// Creates a `ValidationError` containing per-field errors.
    pub fn with_field_errors(field_errors: HashMap<String, Vec<Self>>) -> Self {
        Self {
            message: String::new(),
            code: String::new(),
            params: HashMap::new(),
            field_errors,
        }
    }

    /// Adds a parameter to this validation error.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            write!(f, "{}", self.message)?;
        } else if !self.field_errors.is_empty() {
            let mut fields: Vec<_> = self.field_errors.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let mut first = true;
            for (field, errors) in fields {
                for error in errors {
                    if !first {
                        write!(f, "; ")?;
                    }
                    write!(f, "{field}: {error}")?;
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// The base error type for every rowcache operation.
#[derive(Error, Debug)]
pub enum OrmError {
    // ── Cache eligibility ────────────────────────────────────────────

    /// A predicate used against the cache is not a declared unique or index key.
    #[error("Cache error: {0}")]
    Cache(String),

    // ── Configuration ────────────────────────────────────────────────

    /// The data layer is misconfigured (e.g. no backing store).
    #[error("Database error: {0}")]
    DataBase(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ── Statement construction ───────────────────────────────────────

    /// A statement cannot be built or executed, e.g. an update without a
    /// unique predicate.
    #[error("Expression error: {0}")]
    Expression(String),

    /// The translator was handed a structurally invalid node.
    #[error("Not a valid statement: {0}")]
    NotValidStatement(String),

    // ── Input / schema shape ─────────────────────────────────────────

    /// An order-by signature is malformed or not declared.
    #[error("Order by error: {0}")]
    OrderBy(String),

    /// A field name does not exist on the schema.
    #[error("Invalid field: {0}")]
    InvalidField(String),

    /// A textual value could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// One or more fields failed validation.
    #[error("Validation error: {0}")]
    Validation(ValidationError),

    // ── Execution ────────────────────────────────────────────────────

    /// A lookup expected exactly one row but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// A lookup expected exactly one row but found several.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A driver or connection failure.
    #[error("Operational error: {0}")]
    Operational(String),

    // ── Serialization / IO ───────────────────────────────────────────

    /// A cached payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrmError {
    /// Returns `true` when retrying the same call might succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Operational(_))
    }

    /// Returns `true` for errors caused by the caller misusing the API.
    pub const fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::Cache(_)
                | Self::Expression(_)
                | Self::NotValidStatement(_)
                | Self::OrderBy(_)
                | Self::InvalidField(_)
        )
    }
}

impl From<ValidationError> for OrmError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A convenience type alias for `Result<T, OrmError>`.
pub type OrmResult<T> = Result<T, OrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_simple() {
        let err = ValidationError::new("This field is required.", "required");
        assert_eq!(err.to_string(), "This field is required.");
    }

    #[test]
    fn test_validation_error_display_field_errors_sorted() {
        let mut field_errors = HashMap::new();
        field_errors.insert("name".to_string(), vec![ValidationError::new("empty", "blank")]);
        field_errors.insert("age".to_string(), vec![ValidationError::new("null", "null")]);
        let err = ValidationError::with_field_errors(field_errors);
        assert_eq!(err.to_string(), "age: null; name: empty");
    }

    #[test]
    fn test_validation_error_with_param() {
        let err = ValidationError::new("Too long.", "max_length").with_param("max", "8");
        assert_eq!(err.params.get("max").unwrap(), "8");
    }

    #[test]
    fn test_only_operational_is_retryable() {
        assert!(OrmError::Operational("gone away".into()).is_retryable());
        assert!(!OrmError::Cache("x".into()).is_retryable());
        assert!(!OrmError::NotValidStatement("x".into()).is_retryable());
        assert!(!OrmError::Integrity("x".into()).is_retryable());
    }

    #[test]
    fn test_programmer_errors() {
        assert!(OrmError::Cache("x".into()).is_programmer_error());
        assert!(OrmError::Expression("x".into()).is_programmer_error());
        assert!(OrmError::OrderBy("x".into()).is_programmer_error());
        assert!(!OrmError::DoesNotExist("x".into()).is_programmer_error());
    }

    #[test]
    fn test_display() {
        let err = OrmError::InvalidField("nickname".into());
        assert_eq!(err.to_string(), "Invalid field: nickname");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: OrmError = io_err.into();
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: OrmError = json_err.into();
        assert!(matches!(err, OrmError::Serialization(_)));
    }
}
