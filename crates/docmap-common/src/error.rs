//! Error types for docmap

use std::fmt;
use thiserror::Error;

/// Result type alias for docmap operations
pub type Result<T> = std::result::Result<T, DocmapError>;

/// Engine error code reported when a namespace does not exist
pub const NAMESPACE_NOT_FOUND_CODE: i32 = 26;

/// Engine message reported when a namespace does not exist
pub const NAMESPACE_NOT_FOUND_MESSAGE: &str = "ns not found";

/// A single failed validation rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFailure {
    /// Field path the rule was declared on
    pub field: String,
    /// Rule name (e.g. "required", "email")
    pub rule: String,
    /// Human-readable failure message
    pub message: String,
}

impl RuleFailure {
    pub fn new(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Every rule that failed during one validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationFailures {
    failures: Vec<RuleFailure>,
}

impl ValidationFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: RuleFailure) {
        self.failures.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleFailure> {
        self.failures.iter()
    }

    /// Field names that failed at least one rule, in declaration order
    pub fn fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        for failure in &self.failures {
            if !fields.contains(&failure.field.as_str()) {
                fields.push(&failure.field);
            }
        }
        fields
    }

    /// Returns true if `field` failed the rule named `rule`
    pub fn has(&self, field: &str, rule: &str) -> bool {
        self.failures
            .iter()
            .any(|f| f.field == field && f.rule == rule)
    }

    /// Convert to Result - Ok if nothing failed
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DocmapError::Validate(self))
        }
    }
}

impl fmt::Display for ValidationFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .failures
            .iter()
            .map(|failure| format!("{} ({}): {}", failure.field, failure.rule, failure.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Unified error type for all docmap operations
#[derive(Error, Debug, Clone)]
pub enum DocmapError {
    /// One or more document rules failed; nothing was sent to the engine
    #[error("Document invalid: {0}")]
    Validate(ValidationFailures),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    /// Feature not available on the connected engine; carries the literal text
    #[error("{0}")]
    NotSupported(String),

    /// Namespace missing; carries the engine's literal message
    #[error("{0}")]
    CollectionNotFound(String),

    /// Opaque engine failure; the message is the engine's text, unmodified
    #[error("{message}")]
    Engine { code: Option<i32>, message: String },

    /// Ordered batch insert failed at `index`; earlier documents were rolled back
    #[error("Batch insert failed at document {index}: {message}")]
    BatchInsert { index: usize, message: String },

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl DocmapError {
    /// Shorthand for an engine failure without a numeric code
    pub fn engine(message: impl Into<String>) -> Self {
        DocmapError::Engine {
            code: None,
            message: message.into(),
        }
    }

    /// Shorthand for an engine failure with the engine's numeric code
    pub fn engine_code(code: i32, message: impl Into<String>) -> Self {
        DocmapError::Engine {
            code: Some(code),
            message: message.into(),
        }
    }

    /// The engine's numeric error code, if the engine reported one
    pub fn code(&self) -> Option<i32> {
        match self {
            DocmapError::Engine { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns true if the engine reported a missing namespace
    pub fn is_namespace_not_found(&self) -> bool {
        match self {
            DocmapError::CollectionNotFound(_) => true,
            DocmapError::Engine { code, message } => {
                *code == Some(NAMESPACE_NOT_FOUND_CODE) || message == NAMESPACE_NOT_FOUND_MESSAGE
            }
            _ => false,
        }
    }

    /// Returns true if the error was raised before any engine round-trip
    pub fn is_client_side(&self) -> bool {
        matches!(
            self,
            DocmapError::Validate(_)
                | DocmapError::TypeMismatch(_)
                | DocmapError::InvalidState(_)
                | DocmapError::InvalidName(_)
        )
    }

    /// The rule failures carried by a `Validate` error
    pub fn validation_failures(&self) -> Option<&ValidationFailures> {
        match self {
            DocmapError::Validate(failures) => Some(failures),
            _ => None,
        }
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for DocmapError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match err.kind.as_ref() {
            ErrorKind::Command(command) => {
                DocmapError::engine_code(command.code, command.message.clone())
            }
            ErrorKind::Write(WriteFailure::WriteError(write)) => {
                DocmapError::engine_code(write.code, write.message.clone())
            }
            ErrorKind::Write(WriteFailure::WriteConcernError(concern)) => {
                DocmapError::engine_code(concern.code, concern.message.clone())
            }
            ErrorKind::InsertMany(insert) => {
                let first = insert
                    .write_errors
                    .as_ref()
                    .and_then(|errors| errors.iter().min_by_key(|e| e.index));
                match first {
                    Some(write) => DocmapError::BatchInsert {
                        index: write.index,
                        message: write.message.clone(),
                    },
                    None => DocmapError::engine(err.to_string()),
                }
            }
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::DnsResolve { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => DocmapError::Connection(err.to_string()),
            ErrorKind::BsonSerialization(e) => DocmapError::Serialization(e.to_string()),
            ErrorKind::BsonDeserialization(e) => DocmapError::Deserialization(e.to_string()),
            _ => {
                tracing::debug!("Unclassified driver error: {}", err);
                DocmapError::engine(err.to_string())
            }
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for DocmapError {
    fn from(err: bson::ser::Error) -> Self {
        DocmapError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for DocmapError {
    fn from(err: bson::de::Error) -> Self {
        DocmapError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_displays_literal_message() {
        let err = DocmapError::engine_code(26, "ns not found");
        assert_eq!(err.to_string(), "ns not found");
    }

    #[test]
    fn test_collection_not_found_displays_literal_message() {
        let err = DocmapError::CollectionNotFound("ns not found".to_string());
        assert_eq!(err.to_string(), "ns not found");
    }

    #[test]
    fn test_not_supported_displays_literal_message() {
        let err = DocmapError::NotSupported(
            "Explain of aggregation implemented only from 2.6.0".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "Explain of aggregation implemented only from 2.6.0"
        );
    }

    #[test]
    fn test_error_display_invalid_state() {
        let err = DocmapError::InvalidState("document deleted".to_string());
        assert_eq!(err.to_string(), "Invalid state: document deleted");
    }

    #[test]
    fn test_error_display_batch_insert() {
        let err = DocmapError::BatchInsert {
            index: 1,
            message: "duplicate key".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Batch insert failed at document 1: duplicate key"
        );
    }

    #[test]
    fn test_is_namespace_not_found() {
        assert!(DocmapError::engine_code(26, "whatever").is_namespace_not_found());
        assert!(DocmapError::engine("ns not found").is_namespace_not_found());
        assert!(DocmapError::CollectionNotFound("x".to_string()).is_namespace_not_found());
        assert!(!DocmapError::engine_code(11000, "E11000").is_namespace_not_found());
        assert!(!DocmapError::NotFound("x".to_string()).is_namespace_not_found());
    }

    #[test]
    fn test_is_client_side() {
        assert!(DocmapError::TypeMismatch("x".to_string()).is_client_side());
        assert!(DocmapError::Validate(ValidationFailures::new()).is_client_side());
        assert!(!DocmapError::engine("x").is_client_side());
    }

    #[test]
    fn test_validation_failures_collect_fields() {
        let mut failures = ValidationFailures::new();
        failures.push(RuleFailure::new("email", "required", "is required"));
        failures.push(RuleFailure::new("email", "email", "is not a valid email"));
        failures.push(RuleFailure::new("age", "numeric", "must be numeric"));

        assert_eq!(failures.len(), 3);
        assert_eq!(failures.fields(), vec!["email", "age"]);
        assert!(failures.has("age", "numeric"));
        assert!(!failures.has("age", "required"));

        let err = failures.into_result().unwrap_err();
        assert!(err.validation_failures().is_some());
        assert!(err.to_string().starts_with("Document invalid: email (required)"));
    }

    #[test]
    fn test_empty_failures_into_ok() {
        assert!(ValidationFailures::new().into_result().is_ok());
    }
}
