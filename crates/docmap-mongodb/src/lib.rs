//! Document mapper for MongoDB-compatible engines
//!
//! This crate maps mutable documents onto collections of a document store and
//! builds the filter, update and aggregation documents sent to it.
//!
//! # Features
//! - Fluent builders for filters ([`Expression`]), updates ([`Operator`]) and
//!   aggregation pipelines ([`Pipeline`])
//! - Documents with dirty tracking; saves send only changed fields
//! - Declarative validation rules checked before every save
//! - All-or-nothing ordered batch inserts
//! - Pluggable engines: the official driver or an in-process engine
//!
//! # Example
//!
//! ```ignore
//! let engine: Arc<dyn EngineClient> = Arc::new(MemoryEngine::new());
//! let database = Database::new(engine, "app")?;
//! let users = database.collection("users")?;
//!
//! let mut user = users.create_document(doc! { "name": "ada" });
//! users.save_document(&mut user).await?;
//!
//! let adults = users.find().where_greater_or_equal("age", 18).to_list().await?;
//! ```

pub mod collection;
pub mod cursor;
pub mod database;
pub mod document;
pub mod engine;
pub mod expression;
pub mod operator;
pub mod path;
pub mod pipeline;
pub mod rules;
pub mod validation;

pub use collection::{Collection, EXPLAIN_UNSUPPORTED};
pub use cursor::Cursor;
pub use database::Database;
pub use docmap_common::{DocmapError, Result, RuleFailure, ValidationFailures};
pub use document::{id_to_string, Document, DocumentModel, DocumentState, PlainModel, ID_FIELD};
pub use engine::{
    CreateCollectionOptions, DeleteOptions, DeleteResult, EngineClient, FindOptions,
    InsertOptions, InsertResult, MemoryEngine, MongoEngine, Namespace, PoolConfig,
    UpdateOptions, UpdateResult,
};
pub use expression::Expression;
pub use operator::Operator;
pub use pipeline::Pipeline;
pub use rules::{Rule, RuleDescriptor};
pub use validation::{validate_query, ValidatedCollectionName, ValidatedFieldName};
