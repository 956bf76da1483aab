//! In-process engine
//!
//! `MemoryEngine` keeps collections in memory behind a `parking_lot::RwLock`
//! and answers the same commands, filters, update modifiers and pipeline
//! stages the collection layer sends to a real deployment. Replies use the
//! engine's field names and error codes so callers cannot tell the two apart
//! for the supported subset.

mod aggregate;
mod filter;
mod update;
mod value;

use super::{
    parse_engine_version, reply_i64, CreateCollectionOptions, DeleteOptions, DeleteResult,
    EngineClient, FindOptions, InsertOptions, InsertResult, Namespace, UpdateOptions,
    UpdateResult,
};
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document as BsonDocument};
use docmap_common::{
    DocmapError, Result, NAMESPACE_NOT_FOUND_CODE, NAMESPACE_NOT_FOUND_MESSAGE,
};
use parking_lot::RwLock;
use semver::Version;
use std::collections::{HashMap, VecDeque};

/// Version reported by `buildInfo` unless configured otherwise
pub const DEFAULT_VERSION: &str = "7.0.0";

/// Smallest storage size of a capped collection, in bytes
const MIN_CAPPED_SIZE: u64 = 4096;

const CURSOR_NOT_FOUND: i32 = 43;
const NAMESPACE_EXISTS: i32 = 48;
const COMMAND_NOT_FOUND: i32 = 59;
const INVALID_OPTIONS: i32 = 72;
const FAILED_TO_PARSE: i32 = 9;

#[derive(Debug, Default)]
struct StoredCollection {
    documents: Vec<BsonDocument>,
    options: CreateCollectionOptions,
}

impl StoredCollection {
    fn size(&self) -> u64 {
        self.documents.iter().map(value::document_size).sum()
    }

    /// Drop the oldest documents until the capped limits hold
    fn evict(&mut self) {
        if !self.options.capped {
            return;
        }
        if let Some(max) = self.options.max.filter(|max| *max > 0) {
            while self.documents.len() as u64 > max {
                self.documents.remove(0);
            }
        }
        if let Some(size) = self.options.size {
            let limit = capped_storage_size(size);
            while self.documents.len() > 1 && self.size() > limit {
                self.documents.remove(0);
            }
        }
    }
}

/// Storage size of a capped collection: at least 4096 bytes, in 256-byte steps
fn capped_storage_size(requested: u64) -> u64 {
    let size = requested.max(MIN_CAPPED_SIZE);
    size.div_ceil(256) * 256
}

#[derive(Debug)]
struct OpenCursor {
    namespace: Namespace,
    remaining: VecDeque<BsonDocument>,
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<Namespace, StoredCollection>,
    cursors: HashMap<i64, OpenCursor>,
    next_cursor_id: i64,
}

/// In-process engine holding every collection in memory
///
/// # Example
///
/// ```ignore
/// let engine: Arc<dyn EngineClient> = Arc::new(MemoryEngine::new());
/// let db = Database::new(engine, "test")?;
/// ```
#[derive(Debug)]
pub struct MemoryEngine {
    state: RwLock<State>,
    version: String,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_version(DEFAULT_VERSION)
    }

    /// Report `version` from `buildInfo` and follow that version's reply shapes
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Engines before 2.6 answer `aggregate` with an inline `result` array
    fn is_legacy(&self) -> bool {
        parse_engine_version(&self.version)
            .map(|v| v < Version::new(2, 6, 0))
            .unwrap_or(false)
    }

    fn dispatch(&self, database: &str, command: &BsonDocument) -> Result<BsonDocument> {
        let (name, argument) = command.iter().next().ok_or_else(|| {
            DocmapError::engine_code(FAILED_TO_PARSE, "no command specified")
        })?;
        tracing::debug!("Memory engine command '{}' on database '{}'", name, database);

        match name.as_str() {
            "ping" => Ok(doc! { "ok": 1.0 }),
            "buildInfo" | "buildinfo" => {
                let version = parse_engine_version(&self.version)?;
                Ok(doc! {
                    "version": self.version.as_str(),
                    "versionArray": [
                        version.major as i32,
                        version.minor as i32,
                        version.patch as i32,
                        0,
                    ],
                    "ok": 1.0,
                })
            }
            "count" => {
                let namespace = Namespace::new(database, collection_argument(name, argument)?);
                let filter = optional_document(command, "query")?;
                let state = self.state.read();
                let mut n = 0_i64;
                if let Some(stored) = state.collections.get(&namespace) {
                    for document in &stored.documents {
                        if filter::matches(document, &filter)? {
                            n += 1;
                        }
                    }
                }
                if let Some(skip) = reply_i64(command, "skip") {
                    n = (n - skip.max(0)).max(0);
                }
                if let Some(limit) = reply_i64(command, "limit").filter(|l| *l != 0) {
                    n = n.min(limit.abs());
                }
                Ok(doc! { "n": n, "ok": 1.0 })
            }
            "distinct" => {
                let namespace = Namespace::new(database, collection_argument(name, argument)?);
                let key = match command.get("key") {
                    Some(Bson::String(key)) => key.as_str(),
                    _ => {
                        return Err(DocmapError::engine_code(
                            FAILED_TO_PARSE,
                            "distinct requires a string 'key'",
                        ))
                    }
                };
                let filter = optional_document(command, "query")?;
                let state = self.state.read();
                let mut values: Vec<Bson> = Vec::new();
                if let Some(stored) = state.collections.get(&namespace) {
                    for document in &stored.documents {
                        if !filter::matches(document, &filter)? {
                            continue;
                        }
                        for found in filter::lookup(document, key) {
                            let candidates: Vec<&Bson> = match found {
                                Bson::Array(items) => items.iter().collect(),
                                other => vec![other],
                            };
                            for candidate in candidates {
                                if !values.iter().any(|v| value::values_equal(v, candidate)) {
                                    values.push(candidate.clone());
                                }
                            }
                        }
                    }
                }
                Ok(doc! { "values": values, "ok": 1.0 })
            }
            "aggregate" => self.aggregate(database, name, argument, command),
            "getMore" => self.get_more(database, argument, command),
            "validate" => {
                let namespace = Namespace::new(database, collection_argument(name, argument)?);
                let state = self.state.read();
                let stored = state
                    .collections
                    .get(&namespace)
                    .ok_or_else(namespace_not_found)?;
                Ok(doc! {
                    "ns": namespace.full_name(),
                    "nrecords": stored.documents.len() as i64,
                    "nIndexes": 1,
                    "keysPerIndex": { "_id_": stored.documents.len() as i64 },
                    "valid": true,
                    "warnings": [],
                    "errors": [],
                    "full": matches!(command.get("full"), Some(Bson::Boolean(true))),
                    "ok": 1.0,
                })
            }
            "collStats" => {
                let namespace = Namespace::new(database, collection_argument(name, argument)?);
                let state = self.state.read();
                let mut reply = doc! { "ns": namespace.full_name() };
                match state.collections.get(&namespace) {
                    Some(stored) => {
                        let count = stored.documents.len() as i64;
                        let size = stored.size() as i64;
                        reply.insert("count", count);
                        reply.insert("size", size);
                        reply.insert("avgObjSize", if count > 0 { size / count } else { 0 });
                        reply.insert("nindexes", 1);
                        reply.insert("capped", stored.options.capped);
                        if stored.options.capped {
                            if let Some(max) = stored.options.max {
                                reply.insert("max", max as i64);
                            }
                            if let Some(size) = stored.options.size {
                                reply.insert("maxSize", capped_storage_size(size) as i64);
                            }
                        }
                    }
                    None => {
                        reply.insert("count", 0_i64);
                        reply.insert("size", 0_i64);
                    }
                }
                reply.insert("ok", 1.0);
                Ok(reply)
            }
            "drop" => {
                let namespace = Namespace::new(database, collection_argument(name, argument)?);
                let mut state = self.state.write();
                state
                    .collections
                    .remove(&namespace)
                    .ok_or_else(namespace_not_found)?;
                state.cursors.retain(|_, cursor| cursor.namespace != namespace);
                Ok(doc! { "ns": namespace.full_name(), "nIndexesWas": 1, "ok": 1.0 })
            }
            "create" => {
                let namespace = Namespace::new(database, collection_argument(name, argument)?);
                let capped = matches!(command.get("capped"), Some(Bson::Boolean(true)));
                let options = CreateCollectionOptions {
                    capped,
                    size: optional_u64(command, "size"),
                    max: optional_u64(command, "max"),
                };
                self.create(&namespace, options)?;
                Ok(doc! { "ok": 1.0 })
            }
            "listCollections" => {
                let filter = optional_document(command, "filter")?;
                let state = self.state.read();
                let mut entries: Vec<(&Namespace, &StoredCollection)> = state
                    .collections
                    .iter()
                    .filter(|(namespace, _)| namespace.database == database)
                    .collect();
                entries.sort_by(|a, b| a.0.collection.cmp(&b.0.collection));

                let mut batch = Vec::new();
                for (namespace, stored) in entries {
                    let mut options = BsonDocument::new();
                    if stored.options.capped {
                        options.insert("capped", true);
                        if let Some(size) = stored.options.size {
                            options.insert("size", size as i64);
                        }
                        if let Some(max) = stored.options.max {
                            options.insert("max", max as i64);
                        }
                    }
                    let entry = doc! {
                        "name": namespace.collection.as_str(),
                        "type": "collection",
                        "options": options,
                    };
                    if filter::matches(&entry, &filter)? {
                        batch.push(Bson::Document(entry));
                    }
                }
                Ok(doc! {
                    "cursor": {
                        "id": 0_i64,
                        "ns": format!("{}.$cmd.listCollections", database),
                        "firstBatch": batch,
                    },
                    "ok": 1.0,
                })
            }
            "dropDatabase" => {
                let mut state = self.state.write();
                state.collections.retain(|namespace, _| namespace.database != database);
                state.cursors.retain(|_, cursor| cursor.namespace.database != database);
                Ok(doc! { "dropped": database, "ok": 1.0 })
            }
            other => Err(DocmapError::engine_code(
                COMMAND_NOT_FOUND,
                format!("no such command: '{}'", other),
            )),
        }
    }

    fn aggregate(
        &self,
        database: &str,
        name: &str,
        argument: &Bson,
        command: &BsonDocument,
    ) -> Result<BsonDocument> {
        let namespace = Namespace::new(database, collection_argument(name, argument)?);
        let pipeline: Vec<BsonDocument> = match command.get("pipeline") {
            Some(Bson::Array(stages)) => stages
                .iter()
                .map(|stage| match stage {
                    Bson::Document(stage) => Ok(stage.clone()),
                    _ => Err(DocmapError::engine_code(
                        14,
                        "Each element of the 'pipeline' array must be an object",
                    )),
                })
                .collect::<Result<_>>()?,
            _ => {
                return Err(DocmapError::engine_code(
                    FAILED_TO_PARSE,
                    "'pipeline' option must be specified as an array",
                ))
            }
        };
        let explain = matches!(command.get("explain"), Some(Bson::Boolean(true)));

        if explain {
            if self.is_legacy() {
                return Err(DocmapError::engine_code(
                    FAILED_TO_PARSE,
                    "unrecognized field 'explain'",
                ));
            }
            return Ok(explain_reply(&namespace, &pipeline));
        }

        let results = {
            let state = self.state.read();
            let source = state
                .collections
                .get(&namespace)
                .map(|stored| stored.documents.clone())
                .unwrap_or_default();
            let resolve = |collection: &str| {
                state
                    .collections
                    .get(&Namespace::new(database, collection))
                    .map(|stored| stored.documents.clone())
                    .unwrap_or_default()
            };
            aggregate::run(source, &pipeline, &resolve)?
        };

        if self.is_legacy() {
            return Ok(doc! {
                "result": results.into_iter().map(Bson::Document).collect::<Vec<_>>(),
                "ok": 1.0,
            });
        }

        let batch_size = match command.get("cursor") {
            Some(Bson::Document(cursor)) => optional_u64(cursor, "batchSize").map(|n| n as usize),
            _ => None,
        };
        Ok(self.open_cursor(namespace, results, batch_size))
    }

    fn open_cursor(
        &self,
        namespace: Namespace,
        results: Vec<BsonDocument>,
        batch_size: Option<usize>,
    ) -> BsonDocument {
        let mut remaining: VecDeque<BsonDocument> = results.into();
        let take = batch_size.unwrap_or(remaining.len()).min(remaining.len());
        let first_batch: Vec<Bson> = remaining.drain(..take).map(Bson::Document).collect();

        let id = if remaining.is_empty() {
            0
        } else {
            let mut state = self.state.write();
            state.next_cursor_id += 1;
            let id = state.next_cursor_id;
            state.cursors.insert(
                id,
                OpenCursor {
                    namespace: namespace.clone(),
                    remaining,
                },
            );
            id
        };

        doc! {
            "cursor": {
                "id": id,
                "ns": namespace.full_name(),
                "firstBatch": first_batch,
            },
            "ok": 1.0,
        }
    }

    fn get_more(
        &self,
        database: &str,
        argument: &Bson,
        command: &BsonDocument,
    ) -> Result<BsonDocument> {
        let id = match argument {
            Bson::Int64(id) => *id,
            Bson::Int32(id) => i64::from(*id),
            _ => {
                return Err(DocmapError::engine_code(
                    FAILED_TO_PARSE,
                    "getMore cursor id must be a long",
                ))
            }
        };
        let batch_size = optional_u64(command, "batchSize").map(|n| n as usize);

        let mut state = self.state.write();
        let cursor = state
            .cursors
            .get_mut(&id)
            .filter(|cursor| cursor.namespace.database == database)
            .ok_or_else(|| {
                DocmapError::engine_code(CURSOR_NOT_FOUND, format!("cursor id {} not found", id))
            })?;
        let take = batch_size
            .unwrap_or(cursor.remaining.len())
            .min(cursor.remaining.len());
        let next_batch: Vec<Bson> = cursor.remaining.drain(..take).map(Bson::Document).collect();
        let ns = cursor.namespace.full_name();
        let exhausted = cursor.remaining.is_empty();
        let next_id = if exhausted { 0 } else { id };
        if exhausted {
            state.cursors.remove(&id);
        }

        Ok(doc! {
            "cursor": {
                "id": next_id,
                "ns": ns,
                "nextBatch": next_batch,
            },
            "ok": 1.0,
        })
    }

    fn create(&self, namespace: &Namespace, options: CreateCollectionOptions) -> Result<()> {
        if options.capped && options.size.is_none() {
            return Err(DocmapError::engine_code(
                INVALID_OPTIONS,
                "the 'size' field is required when 'capped' is true",
            ));
        }
        let mut state = self.state.write();
        if state.collections.contains_key(namespace) {
            return Err(DocmapError::engine_code(
                NAMESPACE_EXISTS,
                format!("Collection {} already exists.", namespace),
            ));
        }
        state.collections.insert(
            namespace.clone(),
            StoredCollection {
                documents: Vec::new(),
                options,
            },
        );
        tracing::debug!("Memory engine created collection {}", namespace);
        Ok(())
    }
}

fn namespace_not_found() -> DocmapError {
    DocmapError::engine_code(NAMESPACE_NOT_FOUND_CODE, NAMESPACE_NOT_FOUND_MESSAGE)
}

fn collection_argument<'a>(command: &str, argument: &'a Bson) -> Result<&'a str> {
    match argument {
        Bson::String(name) if !name.is_empty() => Ok(name.as_str()),
        _ => Err(DocmapError::engine_code(
            FAILED_TO_PARSE,
            format!("collection name has invalid type for '{}'", command),
        )),
    }
}

fn optional_document(command: &BsonDocument, key: &str) -> Result<BsonDocument> {
    match command.get(key) {
        None | Some(Bson::Null) => Ok(BsonDocument::new()),
        Some(Bson::Document(document)) => Ok(document.clone()),
        Some(_) => Err(DocmapError::engine_code(
            FAILED_TO_PARSE,
            format!("'{}' must be an object", key),
        )),
    }
}

fn optional_u64(document: &BsonDocument, key: &str) -> Option<u64> {
    value::as_f64(document.get(key)?)
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64)
}

fn explain_reply(namespace: &Namespace, pipeline: &[BsonDocument]) -> BsonDocument {
    let (query, rest) = match pipeline.split_first() {
        Some((first, rest)) => match first.get("$match") {
            Some(Bson::Document(filter)) => (filter.clone(), rest),
            _ => (BsonDocument::new(), pipeline),
        },
        None => (BsonDocument::new(), pipeline),
    };
    let mut stages = vec![Bson::Document(doc! {
        "$cursor": {
            "queryPlanner": {
                "namespace": namespace.full_name(),
                "parsedQuery": query,
                "winningPlan": { "stage": "COLLSCAN" },
            },
        },
    })];
    stages.extend(rest.iter().cloned().map(Bson::Document));
    doc! { "stages": stages, "ok": 1.0 }
}

fn duplicate_key(namespace: &Namespace, id: &Bson) -> String {
    format!(
        "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
        namespace, id
    )
}

#[async_trait]
impl EngineClient for MemoryEngine {
    async fn run_command(&self, database: &str, command: BsonDocument) -> Result<BsonDocument> {
        self.dispatch(database, &command)
    }

    async fn find(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        options: FindOptions,
    ) -> Result<Vec<BsonDocument>> {
        let mut found = Vec::new();
        {
            let state = self.state.read();
            if let Some(stored) = state.collections.get(namespace) {
                for document in &stored.documents {
                    if filter::matches(document, &filter)? {
                        found.push(document.clone());
                    }
                }
            }
        }

        let mut stages = Vec::new();
        if let Some(sort) = options.sort {
            stages.push(doc! { "$sort": sort });
        }
        if let Some(skip) = options.skip {
            stages.push(doc! { "$skip": skip as i64 });
        }
        if let Some(limit) = options.limit.filter(|l| *l != 0) {
            stages.push(doc! { "$limit": limit.abs() });
        }
        if let Some(projection) = options.projection {
            stages.push(doc! { "$project": projection });
        }
        aggregate::run(found, &stages, &|_: &str| Vec::new())
    }

    async fn insert(
        &self,
        namespace: &Namespace,
        documents: Vec<BsonDocument>,
        options: InsertOptions,
    ) -> Result<InsertResult> {
        let mut state = self.state.write();
        let stored = state.collections.entry(namespace.clone()).or_default();

        let mut inserted_ids = Vec::with_capacity(documents.len());
        let mut first_error: Option<(usize, String)> = None;
        for (index, document) in documents.into_iter().enumerate() {
            let document = match document.get("_id") {
                Some(_) => document,
                None => {
                    let mut with_id = doc! { "_id": ObjectId::new() };
                    with_id.extend(document);
                    with_id
                }
            };
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            let duplicate = stored
                .documents
                .iter()
                .any(|existing| existing.get("_id").map_or(false, |e| value::values_equal(e, &id)));
            if duplicate {
                if first_error.is_none() {
                    first_error = Some((index, duplicate_key(namespace, &id)));
                }
                if options.ordered {
                    break;
                }
                continue;
            }
            stored.documents.push(document);
            stored.evict();
            inserted_ids.push(id);
        }

        tracing::debug!(
            "Memory engine inserted {} document(s) into {}",
            inserted_ids.len(),
            namespace
        );

        match first_error {
            Some((index, message)) => Err(DocmapError::BatchInsert { index, message }),
            None => Ok(InsertResult { inserted_ids }),
        }
    }

    async fn update(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let mut state = self.state.write();
        let mut result = UpdateResult::default();

        if let Some(stored) = state.collections.get_mut(namespace) {
            for document in stored.documents.iter_mut() {
                if !filter::matches(document, &filter)? {
                    continue;
                }
                let mut next = document.clone();
                update::apply(&mut next, &update)?;
                result.matched_count += 1;
                if next != *document {
                    *document = next;
                    result.modified_count += 1;
                }
                if !options.multi {
                    break;
                }
            }
        }

        if result.matched_count == 0 && options.upsert {
            let mut seed = BsonDocument::new();
            for (key, condition) in &filter {
                let is_plain = !key.starts_with('$')
                    && !matches!(condition, Bson::Document(d) if filter::is_operator_document(d));
                if is_plain {
                    crate::path::set(&mut seed, key, condition.clone())?;
                }
            }
            update::apply(&mut seed, &update)?;
            if !seed.contains_key("_id") {
                let mut with_id = doc! { "_id": ObjectId::new() };
                with_id.extend(seed);
                seed = with_id;
            }
            let id = seed.get("_id").cloned();
            let stored = state.collections.entry(namespace.clone()).or_default();
            stored.documents.push(seed);
            stored.evict();
            result.upserted_id = id;
        }

        Ok(result)
    }

    async fn delete(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        let mut state = self.state.write();
        let Some(stored) = state.collections.get_mut(namespace) else {
            return Ok(DeleteResult::default());
        };

        let mut doomed = Vec::new();
        for (index, document) in stored.documents.iter().enumerate() {
            if filter::matches(document, &filter)? {
                doomed.push(index);
                if !options.multi {
                    break;
                }
            }
        }
        for index in doomed.iter().rev() {
            stored.documents.remove(*index);
        }
        Ok(DeleteResult {
            deleted_count: doomed.len() as u64,
        })
    }

    async fn create_collection(
        &self,
        namespace: &Namespace,
        options: CreateCollectionOptions,
    ) -> Result<()> {
        self.create(namespace, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(collection: &str) -> Namespace {
        Namespace::new("test", collection)
    }

    #[tokio::test]
    async fn test_insert_generates_leading_id() {
        let engine = MemoryEngine::new();
        let result = engine
            .insert(&ns("c"), vec![doc! { "a": 1 }], InsertOptions::default())
            .await
            .unwrap();
        assert_eq!(result.inserted_ids.len(), 1);

        let found = engine.find(&ns("c"), doc! {}, FindOptions::default()).await.unwrap();
        assert_eq!(found[0].keys().next().map(String::as_str), Some("_id"));
    }

    #[tokio::test]
    async fn test_ordered_insert_stops_at_duplicate() {
        let engine = MemoryEngine::new();
        let err = engine
            .insert(
                &ns("c"),
                vec![doc! { "_id": 1 }, doc! { "_id": 1 }, doc! { "_id": 2 }],
                InsertOptions::default(),
            )
            .await
            .unwrap_err();
        match err {
            DocmapError::BatchInsert { index, message } => {
                assert_eq!(index, 1);
                assert!(message.starts_with("E11000"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let reply = engine.run_command("test", doc! { "count": "c" }).await.unwrap();
        assert_eq!(reply.get_i64("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capped_collection_evicts_oldest() {
        let engine = MemoryEngine::new();
        engine
            .create_collection(
                &ns("capped"),
                CreateCollectionOptions {
                    capped: true,
                    size: Some(30),
                    max: Some(3),
                },
            )
            .await
            .unwrap();
        for n in 1..=4 {
            engine
                .insert(&ns("capped"), vec![doc! { "param": n }], InsertOptions::default())
                .await
                .unwrap();
        }
        let found = engine.find(&ns("capped"), doc! {}, FindOptions::default()).await.unwrap();
        let params: Vec<i32> = found.iter().map(|d| d.get_i32("param").unwrap()).collect();
        assert_eq!(params, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_capped_requires_size() {
        let engine = MemoryEngine::new();
        let err = engine
            .create_collection(
                &ns("capped"),
                CreateCollectionOptions {
                    capped: true,
                    size: None,
                    max: Some(3),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(INVALID_OPTIONS));
    }

    #[tokio::test]
    async fn test_find_sort_skip_limit_projection() {
        let engine = MemoryEngine::new();
        let docs = (1..=5).map(|n| doc! { "_id": n, "n": n, "x": "y" }).collect();
        engine.insert(&ns("c"), docs, InsertOptions::default()).await.unwrap();

        let options = FindOptions {
            sort: Some(doc! { "n": -1 }),
            skip: Some(1),
            limit: Some(2),
            projection: Some(doc! { "n": 1 }),
        };
        let found = engine.find(&ns("c"), doc! {}, options).await.unwrap();
        assert_eq!(found, vec![doc! { "_id": 4, "n": 4 }, doc! { "_id": 3, "n": 3 }]);
    }

    #[tokio::test]
    async fn test_update_counts_matched_and_modified() {
        let engine = MemoryEngine::new();
        let docs = vec![doc! { "_id": 1, "p": 1 }, doc! { "_id": 2, "p": 1, "k": "v" }];
        engine.insert(&ns("c"), docs, InsertOptions::default()).await.unwrap();

        let result = engine
            .update(
                &ns("c"),
                doc! { "p": 1 },
                doc! { "$set": { "k": "v" } },
                UpdateOptions { multi: true, upsert: false },
            )
            .await
            .unwrap();
        assert_eq!(result.matched_count, 2);
        assert_eq!(result.modified_count, 1);
    }

    #[tokio::test]
    async fn test_upsert_seeds_from_filter() {
        let engine = MemoryEngine::new();
        let result = engine
            .update(
                &ns("c"),
                doc! { "name": "a" },
                doc! { "$inc": { "n": 1 } },
                UpdateOptions { multi: false, upsert: true },
            )
            .await
            .unwrap();
        assert!(result.upserted_id.is_some());
        let found = engine.find(&ns("c"), doc! {}, FindOptions::default()).await.unwrap();
        assert_eq!(found[0].get_str("name").unwrap(), "a");
        assert_eq!(found[0].get_i32("n").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commands_on_missing_namespace() {
        let engine = MemoryEngine::new();
        let err = engine
            .run_command("test", doc! { "validate": "missing" })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ns not found");
        assert!(err.is_namespace_not_found());

        let err = engine.run_command("test", doc! { "drop": "missing" }).await.unwrap_err();
        assert!(err.is_namespace_not_found());

        let stats = engine.run_command("test", doc! { "collStats": "missing" }).await.unwrap();
        assert_eq!(stats.get_f64("ok").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_aggregate_cursor_batches() {
        let engine = MemoryEngine::new();
        let docs = (1..=5).map(|n| doc! { "n": n }).collect();
        engine.insert(&ns("c"), docs, InsertOptions::default()).await.unwrap();

        let reply = engine
            .run_command(
                "test",
                doc! { "aggregate": "c", "pipeline": [], "cursor": { "batchSize": 2 } },
            )
            .await
            .unwrap();
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 2);
        let id = cursor.get_i64("id").unwrap();
        assert_ne!(id, 0);

        let more = engine
            .run_command("test", doc! { "getMore": id, "collection": "c" })
            .await
            .unwrap();
        let cursor = more.get_document("cursor").unwrap();
        assert_eq!(cursor.get_array("nextBatch").unwrap().len(), 3);
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_legacy_aggregate_reply() {
        let engine = MemoryEngine::with_version("2.4.6");
        engine
            .insert(&ns("c"), vec![doc! { "n": 1 }], InsertOptions::default())
            .await
            .unwrap();
        let reply = engine
            .run_command("test", doc! { "aggregate": "c", "pipeline": [] })
            .await
            .unwrap();
        assert_eq!(reply.get_array("result").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let engine = MemoryEngine::new();
        let err = engine.run_command("test", doc! { "frobnicate": 1 }).await.unwrap_err();
        assert_eq!(err.code(), Some(COMMAND_NOT_FOUND));
    }

    #[test]
    fn test_capped_storage_size() {
        assert_eq!(capped_storage_size(30), 4096);
        assert_eq!(capped_storage_size(5000), 5120);
    }
}
