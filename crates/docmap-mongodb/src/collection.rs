//! Collection handle
//!
//! A [`Collection`] is the only path from documents and builders to the
//! engine. It is cheap to clone: the engine handle is shared and the rest is a
//! namespace and a model.

use crate::cursor::Cursor;
use crate::document::{
    id_to_string, Document, DocumentModel, DocumentState, PlainModel, ID_FIELD,
};
use crate::engine::{
    parse_engine_version, reply_i64, DeleteOptions, EngineClient, FindOptions, InsertOptions,
    Namespace, UpdateOptions, UpdateResult,
};
use crate::expression::Expression;
use crate::operator::Operator;
use crate::pipeline::Pipeline;
use crate::validation::{validate_query, ValidatedCollectionName, ValidatedFieldName};
use bson::{doc, oid::ObjectId, Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};
use indexmap::IndexMap;
use semver::Version;
use std::fmt;
use std::sync::Arc;

/// Literal failure text for explain on engines older than 2.6.0
pub const EXPLAIN_UNSUPPORTED: &str = "Explain of aggregation implemented only from 2.6.0";

/// Engine codes meaning "this command does not accept explain"
const EXPLAIN_REJECTED_CODES: &[i32] = &[9, 40415];

/// One named collection of one database
#[derive(Clone)]
pub struct Collection {
    engine: Arc<dyn EngineClient>,
    namespace: Namespace,
    model: Arc<dyn DocumentModel>,
}

impl Collection {
    /// Create a handle; the collection name is validated, the engine is not contacted
    pub fn new(engine: Arc<dyn EngineClient>, database: &str, name: &str) -> Result<Self> {
        let name = ValidatedCollectionName::new(name)?;
        Ok(Self {
            engine,
            namespace: Namespace::new(database, name.into_string()),
            model: Arc::new(PlainModel),
        })
    }

    /// Documents created or loaded through this handle use `model`
    pub fn with_model(mut self, model: Arc<dyn DocumentModel>) -> Self {
        self.model = model;
        self
    }

    pub fn name(&self) -> &str {
        &self.namespace.collection
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub(crate) fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.engine
    }

    pub(crate) fn model(&self) -> Arc<dyn DocumentModel> {
        Arc::clone(&self.model)
    }

    /// Fresh filter builder
    pub fn expression(&self) -> Expression {
        Expression::new()
    }

    /// Fresh update builder
    pub fn operator(&self) -> Operator {
        Operator::new()
    }

    /// Query over this collection
    pub fn find(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    /// Fresh pipeline bound to this collection
    pub fn create_pipeline(&self) -> Pipeline {
        Pipeline::bound(self.clone())
    }

    /// New, unsaved document using this collection's model
    pub fn create_document(&self, fields: BsonDocument) -> Document {
        Document::with_model(fields, self.model())
    }

    /// Load one document by identity; the id type is preserved as given
    pub async fn get_document(&self, id: impl Into<Bson>) -> Result<Document> {
        let id = id.into();
        let mut found = self
            .find()
            .filter(doc! { ID_FIELD: id.clone() })
            .limit(1)
            .to_list()
            .await?;
        if found.is_empty() {
            return Err(DocmapError::NotFound(format!(
                "Document {} not found in {}",
                id, self.namespace
            )));
        }
        Ok(found.remove(0))
    }

    /// Load several documents at once, keyed by stringified id in engine order
    ///
    /// Ids that match nothing are absent from the map.
    pub async fn get_documents<I, V>(&self, ids: I) -> Result<IndexMap<String, Document>>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let ids: Vec<Bson> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(IndexMap::new());
        }
        let documents = self
            .find()
            .filter(Expression::new().where_in(ID_FIELD, ids))
            .to_list()
            .await?;

        let mut by_id = IndexMap::with_capacity(documents.len());
        for document in documents {
            if let Some(id) = document.id() {
                by_id.insert(id_to_string(id), document);
            }
        }
        Ok(by_id)
    }

    /// Validate and persist a document
    ///
    /// New documents are inserted; dirty documents send only their changed
    /// fields. Clean documents are left alone. Nothing reaches the engine when
    /// validation fails.
    pub async fn save_document(&self, document: &mut Document) -> Result<()> {
        match document.state() {
            DocumentState::Deleted => Err(DocmapError::InvalidState(
                "Cannot save a deleted document".to_string(),
            )),
            DocumentState::Clean => Ok(()),
            DocumentState::New => {
                document.validate()?;
                let result = self
                    .engine
                    .insert(
                        &self.namespace,
                        vec![document.to_document()],
                        InsertOptions::default(),
                    )
                    .await
                    .map_err(|e| match e {
                        DocmapError::BatchInsert { message, .. } => DocmapError::engine(message),
                        other => other,
                    })?;
                tracing::debug!("Inserted document into {}", self.namespace);
                document.mark_saved(result.inserted_ids.into_iter().next());
                Ok(())
            }
            DocumentState::Dirty => {
                document.validate()?;
                let id = document.id().cloned().ok_or_else(|| {
                    DocmapError::InvalidState("Persisted document has no identity".to_string())
                })?;
                let update = document.update_document();
                if update.is_empty() {
                    document.mark_saved(None);
                    return Ok(());
                }
                let result = self
                    .engine
                    .update(
                        &self.namespace,
                        doc! { ID_FIELD: id.clone() },
                        update,
                        UpdateOptions::default(),
                    )
                    .await?;
                if result.matched_count == 0 {
                    return Err(DocmapError::NotFound(format!(
                        "Document {} no longer exists in {}",
                        id, self.namespace
                    )));
                }
                tracing::debug!("Updated document {} in {}", id, self.namespace);
                document.mark_saved(None);
                Ok(())
            }
        }
    }

    /// Remove a persisted document; it becomes `Deleted`
    pub async fn delete_document(&self, document: &mut Document) -> Result<()> {
        if document.state() == DocumentState::Deleted {
            return Err(DocmapError::InvalidState(
                "Document has already been deleted".to_string(),
            ));
        }
        let id = match (document.state(), document.id()) {
            (DocumentState::New, _) | (_, None) => {
                return Err(DocmapError::InvalidState(
                    "Cannot delete a document that was never saved".to_string(),
                ))
            }
            (_, Some(id)) => id.clone(),
        };
        let result = self
            .engine
            .delete(
                &self.namespace,
                doc! { ID_FIELD: id.clone() },
                DeleteOptions::default(),
            )
            .await?;
        if result.deleted_count == 0 {
            return Err(DocmapError::NotFound(format!(
                "Document {} not found in {}",
                id, self.namespace
            )));
        }
        document.mark_deleted();
        Ok(())
    }

    /// Insert raw documents in order, all or nothing
    ///
    /// Rules are not applied. Identities are assigned before the insert. If
    /// the engine fails for any reason, every document this call may have
    /// stored is removed again and the engine's error is returned; a rejection
    /// at index `k` surfaces as `BatchInsert { index: k }`.
    pub async fn insert_multiple(&self, documents: Vec<BsonDocument>) -> Result<Vec<Bson>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(documents.len());
        let mut supplied = Vec::new();
        let prepared: Vec<BsonDocument> = documents
            .into_iter()
            .map(|document| {
                let document = match document.get(ID_FIELD) {
                    Some(id) => {
                        supplied.push(id.clone());
                        document
                    }
                    None => {
                        let mut with_id = doc! { ID_FIELD: ObjectId::new() };
                        with_id.extend(document);
                        with_id
                    }
                };
                ids.push(document.get(ID_FIELD).cloned().unwrap_or(Bson::Null));
                document
            })
            .collect();

        // Caller-chosen ids may belong to documents stored before this call
        let preexisting = if supplied.is_empty() {
            Vec::new()
        } else {
            self.existing_ids(supplied).await?
        };

        let count = prepared.len();
        let error = match self
            .engine
            .insert(&self.namespace, prepared, InsertOptions { ordered: true })
            .await
        {
            Ok(_) => {
                tracing::debug!("Inserted {} documents into {}", count, self.namespace);
                return Ok(ids);
            }
            Err(e) => e,
        };

        let attempted = match &error {
            DocmapError::BatchInsert { index, .. } => &ids[..(*index).min(ids.len())],
            _ => &ids[..],
        };
        let rollback: Vec<Bson> = attempted
            .iter()
            .filter(|id| !preexisting.contains(id))
            .cloned()
            .collect();
        if !rollback.is_empty() {
            tracing::warn!(
                "Batch insert into {} failed ({}); removing up to {} document(s)",
                self.namespace,
                error,
                rollback.len()
            );
            let removed = self
                .engine
                .delete(
                    &self.namespace,
                    doc! { ID_FIELD: { "$in": rollback } },
                    DeleteOptions { multi: true },
                )
                .await;
            if let Err(e) = removed {
                tracing::warn!(
                    "Rollback of batch insert into {} failed: {}",
                    self.namespace,
                    e
                );
            }
        }
        Err(error)
    }

    async fn existing_ids(&self, ids: Vec<Bson>) -> Result<Vec<Bson>> {
        let found = self
            .engine
            .find(
                &self.namespace,
                doc! { ID_FIELD: { "$in": ids } },
                FindOptions {
                    projection: Some(doc! { ID_FIELD: 1 }),
                    ..FindOptions::default()
                },
            )
            .await?;
        Ok(found
            .into_iter()
            .filter_map(|document| document.get(ID_FIELD).cloned())
            .collect())
    }

    /// Delete every matching document; an empty expression is refused
    pub async fn delete_documents(&self, expression: &Expression) -> Result<u64> {
        if expression.is_empty() {
            return Err(DocmapError::InvalidState(
                "Refusing to delete with an empty filter; use delete() to drop the collection"
                    .to_string(),
            ));
        }
        let filter = expression.to_document();
        validate_query(&Bson::Document(filter.clone()))?;
        let result = self
            .engine
            .delete(&self.namespace, filter, DeleteOptions { multi: true })
            .await?;
        tracing::debug!(
            "Deleted {} documents from {}",
            result.deleted_count,
            self.namespace
        );
        Ok(result.deleted_count)
    }

    /// Apply `operator` to every document matching `expression`
    pub async fn update_multiple(
        &self,
        expression: &Expression,
        operator: &Operator,
    ) -> Result<UpdateResult> {
        if expression.is_empty() {
            return Err(DocmapError::InvalidState(
                "Refusing to update with an empty filter; use update_all()".to_string(),
            ));
        }
        self.update_matching(expression.to_document(), operator).await
    }

    /// Apply `operator` to every document
    pub async fn update_all(&self, operator: &Operator) -> Result<UpdateResult> {
        self.update_matching(BsonDocument::new(), operator).await
    }

    async fn update_matching(
        &self,
        filter: BsonDocument,
        operator: &Operator,
    ) -> Result<UpdateResult> {
        if operator.is_empty() {
            return Err(DocmapError::InvalidState(
                "Refusing to update with an empty operator".to_string(),
            ));
        }
        validate_query(&Bson::Document(filter.clone()))?;
        let result = self
            .engine
            .update(
                &self.namespace,
                filter,
                operator.to_document(),
                UpdateOptions {
                    multi: true,
                    upsert: false,
                },
            )
            .await?;
        tracing::debug!(
            "Updated {} of {} matched documents in {}",
            result.modified_count,
            result.matched_count,
            self.namespace
        );
        Ok(result)
    }

    /// Distinct values of `field`, optionally restricted by `expression`
    pub async fn get_distinct(
        &self,
        field: &str,
        expression: Option<&Expression>,
    ) -> Result<Vec<Bson>> {
        let field = ValidatedFieldName::new(field)?;
        let query = expression.map(Expression::to_document).unwrap_or_default();
        validate_query(&Bson::Document(query.clone()))?;
        let reply = self
            .command(doc! {
                "distinct": self.name(),
                "key": field.as_str(),
                "query": query,
            })
            .await?;
        match reply.get("values") {
            Some(Bson::Array(values)) => Ok(values.clone()),
            _ => Err(DocmapError::engine(format!(
                "distinct reply from {} has no values",
                self.namespace
            ))),
        }
    }

    /// Run `pipeline` and return every result document in order
    pub async fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<BsonDocument>> {
        let stages = pipeline.to_bson();
        validate_query(&stages)?;
        tracing::debug!("Running 'aggregate' on {}", self.namespace);
        self.engine
            .run_cursor_command(
                &self.namespace.database,
                doc! {
                    "aggregate": self.name(),
                    "pipeline": stages,
                    "cursor": {},
                },
            )
            .await
            .map_err(into_aggregation_error)
    }

    /// Ask the engine how it would run `pipeline`
    pub async fn explain_aggregate(&self, pipeline: &Pipeline) -> Result<BsonDocument> {
        let build_info = self.command(doc! { "buildInfo": 1 }).await?;
        let version = match build_info.get("version") {
            Some(Bson::String(version)) => parse_engine_version(version)?,
            _ => return Err(DocmapError::engine("buildInfo reply has no version")),
        };
        if version < Version::new(2, 6, 0) {
            return Err(DocmapError::NotSupported(EXPLAIN_UNSUPPORTED.to_string()));
        }

        let stages = pipeline.to_bson();
        validate_query(&stages)?;
        let command = doc! {
            "aggregate": self.name(),
            "pipeline": stages,
            "explain": true,
        };
        match self.command(command).await {
            Ok(reply) => Ok(reply),
            Err(DocmapError::Engine { code, message })
                if code.map_or(false, |c| EXPLAIN_REJECTED_CODES.contains(&c))
                    || message.contains("explain") =>
            {
                Err(DocmapError::NotSupported(message))
            }
            Err(e) => Err(into_aggregation_error(e)),
        }
    }

    /// Run the engine's `validate` command
    ///
    /// A missing collection fails with `CollectionNotFound` carrying the
    /// engine's message unchanged.
    pub async fn validate(&self, full: bool) -> Result<BsonDocument> {
        self.command(doc! { "validate": self.name(), "full": full })
            .await
            .map_err(|e| {
                if e.is_namespace_not_found() {
                    DocmapError::CollectionNotFound(e.to_string())
                } else {
                    e
                }
            })
    }

    /// Collection statistics as reported by the engine
    pub async fn stats(&self) -> Result<BsonDocument> {
        self.command(doc! { "collStats": self.name() }).await
    }

    /// Drop the collection; dropping a missing collection succeeds
    pub async fn delete(&self) -> Result<()> {
        match self.command(doc! { "drop": self.name() }).await {
            Ok(_) => {
                tracing::info!("Dropped collection {}", self.namespace);
                Ok(())
            }
            Err(e) if e.is_namespace_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Number of documents; asks the engine on every call
    pub async fn count(&self) -> Result<u64> {
        self.count_matching(BsonDocument::new(), None, None).await
    }

    pub(crate) async fn count_matching(
        &self,
        query: BsonDocument,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<u64> {
        validate_query(&Bson::Document(query.clone()))?;
        let mut command = doc! { "count": self.name(), "query": query };
        if let Some(skip) = skip {
            command.insert("skip", skip as i64);
        }
        if let Some(limit) = limit {
            command.insert("limit", limit);
        }
        let reply = self.command(command).await?;
        let n = reply_i64(&reply, "n")
            .ok_or_else(|| DocmapError::engine("count reply has no 'n'"))?;
        Ok(n.max(0) as u64)
    }

    async fn command(&self, command: BsonDocument) -> Result<BsonDocument> {
        tracing::debug!(
            "Running '{}' on {}",
            command.keys().next().map(String::as_str).unwrap_or_default(),
            self.namespace
        );
        self.engine
            .run_command(&self.namespace.database, command)
            .await
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn into_aggregation_error(error: DocmapError) -> DocmapError {
    match error {
        DocmapError::Engine { message, .. } => DocmapError::Aggregation(message),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        CreateCollectionOptions, DeleteOptions, DeleteResult, FindOptions, InsertOptions,
        InsertResult, MemoryEngine, UpdateOptions, UpdateResult,
    };

    fn collection() -> Collection {
        Collection::new(Arc::new(MemoryEngine::new()), "test", "items").unwrap()
    }

    /// Stores the first half of every insert, then drops the connection
    struct FlakyEngine {
        inner: MemoryEngine,
    }

    #[async_trait::async_trait]
    impl EngineClient for FlakyEngine {
        async fn run_command(&self, database: &str, command: BsonDocument) -> Result<BsonDocument> {
            self.inner.run_command(database, command).await
        }

        async fn find(
            &self,
            namespace: &Namespace,
            filter: BsonDocument,
            options: FindOptions,
        ) -> Result<Vec<BsonDocument>> {
            self.inner.find(namespace, filter, options).await
        }

        async fn insert(
            &self,
            namespace: &Namespace,
            mut documents: Vec<BsonDocument>,
            options: InsertOptions,
        ) -> Result<InsertResult> {
            documents.truncate(documents.len() / 2);
            self.inner.insert(namespace, documents, options).await?;
            Err(DocmapError::Connection("connection reset".to_string()))
        }

        async fn update(
            &self,
            namespace: &Namespace,
            filter: BsonDocument,
            update: BsonDocument,
            options: UpdateOptions,
        ) -> Result<UpdateResult> {
            self.inner.update(namespace, filter, update, options).await
        }

        async fn delete(
            &self,
            namespace: &Namespace,
            filter: BsonDocument,
            options: DeleteOptions,
        ) -> Result<DeleteResult> {
            self.inner.delete(namespace, filter, options).await
        }

        async fn create_collection(
            &self,
            namespace: &Namespace,
            options: CreateCollectionOptions,
        ) -> Result<()> {
            self.inner.create_collection(namespace, options).await
        }
    }

    #[test]
    fn test_invalid_collection_name() {
        let engine: Arc<dyn EngineClient> = Arc::new(MemoryEngine::new());
        assert!(Collection::new(engine, "test", "system.users").is_err());
    }

    #[test]
    fn test_namespace() {
        let collection = collection();
        assert_eq!(collection.name(), "items");
        assert_eq!(collection.namespace().full_name(), "test.items");
        assert!(format!("{:?}", collection).contains("items"));
    }

    #[tokio::test]
    async fn test_destructive_calls_refuse_empty_builders() {
        let collection = collection();
        let err = collection.delete_documents(&Expression::new()).await.unwrap_err();
        assert!(matches!(err, DocmapError::InvalidState(_)));

        let err = collection
            .update_multiple(&Expression::new(), &Operator::new().set("k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, DocmapError::InvalidState(_)));

        let err = collection.update_all(&Operator::new()).await.unwrap_err();
        assert!(matches!(err, DocmapError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_dangerous_filter_is_refused() {
        let collection = collection();
        let expression = Expression::from(doc! { "$where": "sleep(100)" });
        let err = collection.delete_documents(&expression).await.unwrap_err();
        assert!(matches!(err, DocmapError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_interrupted_insert_rolls_back_only_its_own_documents() {
        let inner = MemoryEngine::new();
        let namespace = Namespace::new("test", "items");
        inner
            .insert(&namespace, vec![doc! { "_id": "keep" }], InsertOptions::default())
            .await
            .unwrap();
        let engine: Arc<dyn EngineClient> = Arc::new(FlakyEngine { inner });
        let collection = Collection::new(engine, "test", "items").unwrap();

        let err = collection
            .insert_multiple(vec![
                doc! { "n": 1 },
                doc! { "n": 2 },
                doc! { "_id": "keep", "n": 3 },
                doc! { "n": 4 },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, DocmapError::Connection(_)));
        assert_eq!(collection.count().await.unwrap(), 1);
        assert!(collection.get_document("keep").await.is_ok());
    }
}
