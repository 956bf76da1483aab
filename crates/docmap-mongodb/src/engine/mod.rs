//! Engine client abstraction
//!
//! Everything above this module talks to the storage engine through
//! [`EngineClient`]. Two implementations ship with the crate: [`MongoEngine`]
//! over the official driver and [`MemoryEngine`], an in-process engine.

pub mod memory;
pub mod mongo;

pub use memory::MemoryEngine;
pub use mongo::{MongoEngine, PoolConfig};

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};
use semver::Version;
use std::fmt;

/// Database and collection a request targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// `database.collection`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Options for [`EngineClient::find`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<BsonDocument>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub projection: Option<BsonDocument>,
}

/// Options for [`EngineClient::insert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOptions {
    /// Stop at the first failing document
    pub ordered: bool,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Options for [`EngineClient::update`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
}

/// Options for [`EngineClient::delete`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub multi: bool,
}

/// Options for [`EngineClient::create_collection`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateCollectionOptions {
    pub capped: bool,
    /// Maximum size in bytes (required when capped)
    pub size: Option<u64>,
    /// Maximum number of documents
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertResult {
    /// Identity of every inserted document, in input order
    pub inserted_ids: Vec<Bson>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Connection to a document engine
///
/// Engine failures surface as [`DocmapError::Engine`] with the engine's code
/// and literal message, or as a more specific variant where one applies
/// (`BatchInsert` for a failed ordered insert).
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Run a database command; fails when the reply's `ok` is not 1
    async fn run_command(&self, database: &str, command: BsonDocument) -> Result<BsonDocument>;

    async fn find(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        options: FindOptions,
    ) -> Result<Vec<BsonDocument>>;

    async fn insert(
        &self,
        namespace: &Namespace,
        documents: Vec<BsonDocument>,
        options: InsertOptions,
    ) -> Result<InsertResult>;

    async fn update(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> Result<UpdateResult>;

    async fn delete(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        options: DeleteOptions,
    ) -> Result<DeleteResult>;

    async fn create_collection(
        &self,
        namespace: &Namespace,
        options: CreateCollectionOptions,
    ) -> Result<()>;

    /// Run a command that answers with a cursor and collect every batch
    ///
    /// The default follows `firstBatch` with `getMore` through
    /// [`EngineClient::run_command`] and also accepts the legacy inline
    /// `result` array. Engines whose cursors are tied to a session override
    /// this so every `getMore` runs on the session that opened the cursor.
    async fn run_cursor_command(
        &self,
        database: &str,
        command: BsonDocument,
    ) -> Result<Vec<BsonDocument>> {
        let collection = command
            .iter()
            .next()
            .and_then(|(_, value)| value.as_str())
            .map(str::to_string);
        let reply = self.run_command(database, command).await?;
        drain_cursor(self, database, collection.as_deref(), reply).await
    }
}

/// Collect every document of a command cursor reply
///
/// `getMore` targets the collection named by the cursor's `ns`, falling back
/// to `collection`.
async fn drain_cursor<E: EngineClient + ?Sized>(
    engine: &E,
    database: &str,
    collection: Option<&str>,
    reply: BsonDocument,
) -> Result<Vec<BsonDocument>> {
    if let Some(Bson::Array(result)) = reply.get("result") {
        return documents_of(result);
    }

    let cursor = match reply.get("cursor") {
        Some(Bson::Document(cursor)) => cursor,
        _ => return Err(DocmapError::engine("reply has neither 'cursor' nor 'result'")),
    };
    let collection = match cursor.get("ns") {
        Some(Bson::String(ns)) => ns.split_once('.').map(|(_, name)| name.to_string()),
        _ => None,
    }
    .or_else(|| collection.map(str::to_string))
    .unwrap_or_default();

    let mut documents = match cursor.get("firstBatch") {
        Some(Bson::Array(batch)) => documents_of(batch)?,
        _ => Vec::new(),
    };
    let mut cursor_id = reply_i64(cursor, "id").unwrap_or(0);

    while cursor_id != 0 {
        let more = engine
            .run_command(
                database,
                doc! { "getMore": cursor_id, "collection": collection.as_str() },
            )
            .await?;
        let cursor = match more.get("cursor") {
            Some(Bson::Document(cursor)) => cursor,
            _ => return Err(DocmapError::engine("getMore reply has no 'cursor'")),
        };
        if let Some(Bson::Array(batch)) = cursor.get("nextBatch") {
            documents.extend(documents_of(batch)?);
        }
        cursor_id = reply_i64(cursor, "id").unwrap_or(0);
    }
    Ok(documents)
}

fn documents_of(values: &[Bson]) -> Result<Vec<BsonDocument>> {
    values
        .iter()
        .map(|value| match value {
            Bson::Document(document) => Ok(document.clone()),
            other => Err(DocmapError::Deserialization(format!(
                "Expected a document in cursor batch, got {:?}",
                other.element_type()
            ))),
        })
        .collect()
}

/// Parse an engine version string such as `2.4`, `3.6.23` or `7.0.2-rc1`
///
/// Missing minor/patch components count as zero; pre-release suffixes are
/// ignored.
pub fn parse_engine_version(version: &str) -> Result<Version> {
    let core = version
        .trim()
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();
    let mut parts: Vec<&str> = core.split('.').take(3).collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).map_err(|e| {
        DocmapError::engine(format!("Unrecognised engine version '{}': {}", version, e))
    })
}

/// Read a numeric reply field as `i64`, whatever its BSON width
pub(crate) fn reply_i64(reply: &BsonDocument, key: &str) -> Option<i64> {
    match reply.get(key)? {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        _ => None,
    }
}
