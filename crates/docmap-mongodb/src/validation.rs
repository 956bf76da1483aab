//! Input validation for names and filters
//!
//! Collection names, field names and caller-supplied filters are checked
//! before they reach the engine.
//!
//! # Checks
//! - Collection name validation (no system collections, no `$`)
//! - Field name validation (no operator injection through field names)
//! - Filter screening for server-side JavaScript operators

use crate::Result;
use bson::Bson;
use docmap_common::DocmapError;

/// Maximum allowed length for collection names (the engine allows 255)
const MAX_COLLECTION_NAME_LENGTH: usize = 120;

/// Maximum allowed length for field names
const MAX_FIELD_NAME_LENGTH: usize = 1024;

/// Validated collection name
///
/// - Not empty
/// - Maximum 120 characters
/// - No null bytes
/// - No "system." prefix
/// - No `$` characters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCollectionName {
    name: String,
}

impl ValidatedCollectionName {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(DocmapError::InvalidName(
                "Collection name cannot be empty".to_string(),
            ));
        }

        if name.len() > MAX_COLLECTION_NAME_LENGTH {
            return Err(DocmapError::InvalidName(format!(
                "Collection name exceeds maximum length of {} characters: '{}'",
                MAX_COLLECTION_NAME_LENGTH, name
            )));
        }

        if name.contains('\0') {
            return Err(DocmapError::InvalidName(
                "Collection name cannot contain null bytes".to_string(),
            ));
        }

        if name.starts_with("system.") {
            return Err(DocmapError::InvalidName(format!(
                "Collection name cannot start with 'system.' (reserved): '{}'",
                name
            )));
        }

        if name.contains('$') {
            return Err(DocmapError::InvalidName(format!(
                "Collection name cannot contain '$' character: '{}'",
                name
            )));
        }

        if name.contains("..") {
            tracing::warn!("Collection name contains suspicious pattern: '{}'", name);
        }

        Ok(ValidatedCollectionName {
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn into_string(self) -> String {
        self.name
    }
}

impl AsRef<str> for ValidatedCollectionName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ValidatedCollectionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Validated document field path
///
/// - Not empty, no empty dot segments
/// - Maximum 1024 characters
/// - No null bytes
/// - No segment starting with `$`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedFieldName {
    name: String,
}

impl ValidatedFieldName {
    pub fn new(name: &str) -> Result<Self> {
        crate::path::check(name)?;

        if name.len() > MAX_FIELD_NAME_LENGTH {
            return Err(DocmapError::InvalidName(format!(
                "Field name exceeds maximum length of {} characters",
                MAX_FIELD_NAME_LENGTH
            )));
        }

        if name.contains('\0') {
            return Err(DocmapError::InvalidName(
                "Field name cannot contain null bytes".to_string(),
            ));
        }

        if name.split(crate::path::SEPARATOR).any(|s| s.starts_with('$')) {
            return Err(DocmapError::InvalidName(format!(
                "Field name cannot start with '$' (reserved for operators): '{}'",
                name
            )));
        }

        Ok(ValidatedFieldName {
            name: name.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn into_string(self) -> String {
        self.name
    }
}

impl AsRef<str> for ValidatedFieldName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// Operators that execute server-side JavaScript
const DANGEROUS_OPERATORS: &[&str] = &["$where", "$function", "$accumulator"];

/// Rejects filters and pipeline stages containing server-side JavaScript
pub fn validate_query(query: &Bson) -> Result<()> {
    match query {
        Bson::Document(doc) => {
            for (key, value) in doc.iter() {
                if DANGEROUS_OPERATORS.contains(&key.as_str()) {
                    return Err(DocmapError::InvalidName(format!(
                        "Dangerous operator '{}' is not allowed",
                        key
                    )));
                }
                validate_query(value)?;
            }
            Ok(())
        }
        Bson::Array(items) => items.iter().try_for_each(validate_query),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_valid_collection_names() {
        for name in ["users", "capped_collection", "a.b"] {
            assert!(ValidatedCollectionName::new(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_invalid_collection_names() {
        assert!(ValidatedCollectionName::new("").is_err());
        assert!(ValidatedCollectionName::new("system.users").is_err());
        assert!(ValidatedCollectionName::new("bad$name").is_err());
        assert!(ValidatedCollectionName::new("nul\0byte").is_err());
        assert!(ValidatedCollectionName::new(&"x".repeat(121)).is_err());
    }

    #[test]
    fn test_validated_collection_name_display() {
        let name = ValidatedCollectionName::new("users").unwrap();
        assert_eq!(name.to_string(), "users");
        assert_eq!(name.as_str(), "users");
    }

    #[test]
    fn test_field_names() {
        assert!(ValidatedFieldName::new("k.kk").is_ok());
        assert!(ValidatedFieldName::new("some-field-name").is_ok());
        assert!(ValidatedFieldName::new("$set").is_err());
        assert!(ValidatedFieldName::new("a.$b").is_err());
        assert!(ValidatedFieldName::new("a..b").is_err());
        assert!(ValidatedFieldName::new("").is_err());
    }

    #[test]
    fn test_validate_safe_query() {
        let query = doc! { "param": { "$gte": 2 }, "$or": [{ "a": 1 }, { "b": 2 }] };
        assert!(validate_query(&Bson::Document(query)).is_ok());
    }

    #[test]
    fn test_validate_query_with_where_operator() {
        let query = doc! { "$where": "this.a == 1" };
        assert!(validate_query(&Bson::Document(query)).is_err());
    }

    #[test]
    fn test_validate_nested_dangerous_operator() {
        let query = doc! { "$and": [{ "a": 1 }, { "$where": "sleep(1000)" }] };
        assert!(validate_query(&Bson::Document(query)).is_err());

        let stage = doc! { "$group": { "_id": 0, "x": { "$accumulator": {} } } };
        assert!(validate_query(&Bson::Document(stage)).is_err());
    }
}
