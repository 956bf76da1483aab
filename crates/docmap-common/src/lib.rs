//! Common utilities for docmap
//!
//! This crate provides the error taxonomy shared by the docmap crates.

pub mod error;

pub use error::{
    DocmapError, Result, RuleFailure, ValidationFailures, NAMESPACE_NOT_FOUND_CODE,
    NAMESPACE_NOT_FOUND_MESSAGE,
};
