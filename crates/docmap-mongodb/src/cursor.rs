//! Find queries over a collection

use crate::collection::Collection;
use crate::document::Document;
use crate::engine::FindOptions;
use crate::expression::Expression;
use crate::validation::validate_query;
use bson::{Bson, Document as BsonDocument};
use docmap_common::Result;

/// Query builder bound to one collection
///
/// Nothing is sent to the engine until [`Cursor::to_list`],
/// [`Cursor::find_one`] or [`Cursor::count`] runs.
#[derive(Debug, Clone)]
pub struct Cursor {
    collection: Collection,
    expression: Expression,
    sort: Option<BsonDocument>,
    skip: Option<u64>,
    limit: Option<i64>,
    projection: Option<BsonDocument>,
}

impl Cursor {
    pub(crate) fn new(collection: Collection) -> Self {
        Self {
            collection,
            expression: Expression::new(),
            sort: None,
            skip: None,
            limit: None,
            projection: None,
        }
    }

    /// Replace the filter
    pub fn filter(mut self, expression: impl Into<Expression>) -> Self {
        self.expression = expression.into();
        self
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.expression = self.expression.where_eq(field, value);
        self
    }

    pub fn where_not_equal(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.expression = self.expression.where_not_equal(field, value);
        self
    }

    pub fn where_greater(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.expression = self.expression.where_greater(field, value);
        self
    }

    pub fn where_greater_or_equal(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.expression = self.expression.where_greater_or_equal(field, value);
        self
    }

    pub fn where_less(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.expression = self.expression.where_less(field, value);
        self
    }

    pub fn where_less_or_equal(mut self, field: &str, value: impl Into<Bson>) -> Self {
        self.expression = self.expression.where_less_or_equal(field, value);
        self
    }

    pub fn where_in<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.expression = self.expression.where_in(field, values);
        self
    }

    pub fn where_exists(mut self, field: &str) -> Self {
        self.expression = self.expression.where_exists(field);
        self
    }

    /// Set the sort order, e.g. `doc! { "created": -1 }`
    pub fn sort(mut self, sort: BsonDocument) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restrict returned fields with a projection document
    pub fn fields(mut self, projection: BsonDocument) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn get_filter(&self) -> &BsonDocument {
        self.expression.as_document()
    }

    pub fn get_sort(&self) -> Option<&BsonDocument> {
        self.sort.as_ref()
    }

    pub fn get_skip(&self) -> Option<u64> {
        self.skip
    }

    pub fn get_limit(&self) -> Option<i64> {
        self.limit
    }

    /// Execute the query and return every matching document, clean
    pub async fn to_list(self) -> Result<Vec<Document>> {
        let filter = self.expression.into_document();
        validate_query(&Bson::Document(filter.clone()))?;

        let options = FindOptions {
            sort: self.sort,
            skip: self.skip,
            limit: self.limit,
            projection: self.projection,
        };
        let found = self
            .collection
            .engine()
            .find(self.collection.namespace(), filter, options)
            .await?;

        tracing::debug!("Found {} documents in {}", found.len(), self.collection.namespace());
        let model = self.collection.model();
        Ok(found
            .into_iter()
            .map(|fields| Document::persisted(fields, model.clone()))
            .collect())
    }

    /// First matching document, if any
    pub async fn find_one(self) -> Result<Option<Document>> {
        Ok(self.limit(1).to_list().await?.into_iter().next())
    }

    /// Number of matching documents, honoring skip and limit
    pub async fn count(self) -> Result<u64> {
        self.collection
            .count_matching(self.expression.into_document(), self.skip, self.limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use bson::doc;
    use std::sync::Arc;

    fn cursor() -> Cursor {
        Collection::new(Arc::new(MemoryEngine::new()), "test", "users")
            .unwrap()
            .find()
    }

    #[test]
    fn test_cursor_defaults() {
        let cursor = cursor();
        assert_eq!(cursor.collection().name(), "users");
        assert!(cursor.get_filter().is_empty());
        assert!(cursor.get_sort().is_none());
        assert!(cursor.get_skip().is_none());
        assert!(cursor.get_limit().is_none());
    }

    #[test]
    fn test_cursor_builds_filter() {
        let cursor = cursor()
            .where_greater("age", 18)
            .where_less("age", 65)
            .where_eq("status", "active");
        assert_eq!(
            cursor.get_filter(),
            &doc! { "age": { "$gt": 18, "$lt": 65 }, "status": "active" }
        );
    }

    #[test]
    fn test_cursor_chain() {
        let cursor = cursor()
            .filter(doc! { "status": "active" })
            .sort(doc! { "created_at": -1 })
            .skip(20)
            .limit(10);

        assert_eq!(cursor.get_filter(), &doc! { "status": "active" });
        assert_eq!(cursor.get_sort(), Some(&doc! { "created_at": -1 }));
        assert_eq!(cursor.get_skip(), Some(20));
        assert_eq!(cursor.get_limit(), Some(10));
    }
}
