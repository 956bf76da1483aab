//! Document validation rules
//!
//! A [`RuleDescriptor`] pairs a field path with a [`Rule`]. New rule kinds are
//! new `Rule` implementations; [`validate`] never needs to know about them.
//!
//! Every rule except `required` skips absent or empty values, so `email` on an
//! optional field only fires once the field has a value.

use crate::path;
use bson::{Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result, RuleFailure, ValidationFailures};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Email pattern (RFC 5322 simplified)
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email pattern")
});

/// URL pattern (http/https)
static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("valid url pattern"));

/// A single check applied to one field value
pub trait Rule: Send + Sync + fmt::Debug {
    /// Rule name reported in failures
    fn name(&self) -> &str;

    /// Whether the rule also runs on absent or empty values
    fn checks_empty(&self) -> bool {
        false
    }

    /// Check the value; `Err` carries the failure message
    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String>;
}

/// Field must be present and non-empty
#[derive(Debug, Clone, Copy, Default)]
pub struct Required;

impl Rule for Required {
    fn name(&self) -> &str {
        "required"
    }

    fn checks_empty(&self) -> bool {
        true
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        if is_empty(value) {
            Err("is required".to_string())
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Email;

impl Rule for Email {
    fn name(&self) -> &str {
        "email"
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        match value {
            Some(Bson::String(s)) if EMAIL_REGEX.is_match(s) => Ok(()),
            _ => Err("is not a valid email address".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Url;

impl Rule for Url {
    fn name(&self) -> &str {
        "url"
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        match value {
            Some(Bson::String(s)) if URL_REGEX.is_match(s) => Ok(()),
            _ => Err("is not a valid URL".to_string()),
        }
    }
}

/// Number, or a string that parses as one
#[derive(Debug, Clone, Copy, Default)]
pub struct Numeric;

impl Rule for Numeric {
    fn name(&self) -> &str {
        "numeric"
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        match value {
            Some(Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)) => Ok(()),
            Some(Bson::String(s)) if s.trim().parse::<f64>().is_ok() => Ok(()),
            _ => Err("must be numeric".to_string()),
        }
    }
}

/// Value must be one of a fixed set
#[derive(Debug, Clone)]
pub struct OneOf {
    allowed: Vec<Bson>,
}

impl OneOf {
    pub fn new<I, V>(allowed: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl Rule for OneOf {
    fn name(&self) -> &str {
        "in"
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        match value {
            Some(v) if self.allowed.contains(v) => Ok(()),
            _ => Err(format!(
                "must be one of [{}]",
                self.allowed
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }
}

/// String value must match a regular expression
#[derive(Debug, Clone)]
pub struct Pattern {
    regex: Regex,
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            DocmapError::TypeMismatch(format!("Invalid rule pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { regex })
    }
}

impl Rule for Pattern {
    fn name(&self) -> &str {
        "regex"
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        match value {
            Some(Bson::String(s)) if self.regex.is_match(s) => Ok(()),
            _ => Err(format!("does not match {}", self.regex.as_str())),
        }
    }
}

/// Value must equal a fixed value
#[derive(Debug, Clone)]
pub struct Equals {
    expected: Bson,
}

impl Equals {
    pub fn new(expected: impl Into<Bson>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

impl Rule for Equals {
    fn name(&self) -> &str {
        "equals"
    }

    fn check(&self, value: Option<&Bson>) -> std::result::Result<(), String> {
        match value {
            Some(v) if *v == self.expected => Ok(()),
            _ => Err(format!("must equal {}", self.expected)),
        }
    }
}

/// A rule declared on a field path
#[derive(Debug, Clone)]
pub struct RuleDescriptor {
    field: String,
    rule: Arc<dyn Rule>,
}

impl RuleDescriptor {
    pub fn new(field: impl Into<String>, rule: impl Rule + 'static) -> Self {
        Self {
            field: field.into(),
            rule: Arc::new(rule),
        }
    }

    pub fn required(field: impl Into<String>) -> Self {
        Self::new(field, Required)
    }

    pub fn email(field: impl Into<String>) -> Self {
        Self::new(field, Email)
    }

    pub fn url(field: impl Into<String>) -> Self {
        Self::new(field, Url)
    }

    pub fn numeric(field: impl Into<String>) -> Self {
        Self::new(field, Numeric)
    }

    pub fn one_of<I, V>(field: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        Self::new(field, OneOf::new(allowed))
    }

    pub fn regex(field: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Self::new(field, Pattern::new(pattern)?))
    }

    pub fn equals(field: impl Into<String>, expected: impl Into<Bson>) -> Self {
        Self::new(field, Equals::new(expected))
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn rule_name(&self) -> &str {
        self.rule.name()
    }

    /// Check the rule against `fields`, returning the failure if any
    pub fn check(&self, fields: &BsonDocument) -> Option<RuleFailure> {
        let value = path::get(fields, &self.field);
        if is_empty(value) && !self.rule.checks_empty() {
            return None;
        }
        self.rule
            .check(value)
            .err()
            .map(|message| RuleFailure::new(self.field.clone(), self.rule.name(), message))
    }
}

/// Absent, null, empty string or empty array
pub fn is_empty(value: Option<&Bson>) -> bool {
    match value {
        None | Some(Bson::Null) => true,
        Some(Bson::String(s)) => s.is_empty(),
        Some(Bson::Array(items)) => items.is_empty(),
        _ => false,
    }
}

/// Run every rule and collect every failure
pub fn validate(fields: &BsonDocument, rules: &[RuleDescriptor]) -> Result<()> {
    let mut failures = ValidationFailures::new();
    for descriptor in rules {
        if let Some(failure) = descriptor.check(fields) {
            failures.push(failure);
        }
    }
    failures.into_result()
}
