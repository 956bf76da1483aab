//! Aggregation pipeline builder
//!
//! Stages are appended in call order. A pipeline obtained from
//! [`Collection::create_pipeline`] can run itself; one built with
//! [`Pipeline::new`] is a plain value that a collection can run later.

use crate::collection::Collection;
use crate::expression::Expression;
use bson::{doc, Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};

/// Ordered sequence of aggregation stages
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<BsonDocument>,
    collection: Option<Collection>,
}

impl Pipeline {
    /// Create an unbound pipeline
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bound(collection: Collection) -> Self {
        Self {
            stages: Vec::new(),
            collection: Some(collection),
        }
    }

    /// `$match` stage from a raw filter document or an [`Expression`]
    pub fn matching(self, filter: impl Into<Expression>) -> Self {
        let filter: Expression = filter.into();
        self.stage("$match", filter.into_document())
    }

    /// `$group` stage; `_id: null` is added when the specification has no `_id`
    pub fn group(self, mut specification: BsonDocument) -> Self {
        if !specification.contains_key("_id") {
            let mut with_id = doc! { "_id": Bson::Null };
            with_id.extend(specification);
            specification = with_id;
        }
        self.stage("$group", specification)
    }

    pub fn project(self, specification: BsonDocument) -> Self {
        self.stage("$project", specification)
    }

    pub fn add_fields(self, specification: BsonDocument) -> Self {
        self.stage("$addFields", specification)
    }

    /// `$sort` stage, e.g. `doc! { "param": -1 }`
    pub fn sort(self, specification: BsonDocument) -> Self {
        self.stage("$sort", specification)
    }

    pub fn limit(self, limit: i64) -> Self {
        self.stage("$limit", Bson::Int64(limit))
    }

    pub fn skip(self, skip: i64) -> Self {
        self.stage("$skip", Bson::Int64(skip))
    }

    /// `$unwind` stage; the leading `$` of the path is optional
    pub fn unwind(self, path: &str) -> Self {
        let path = if path.starts_with('$') {
            path.to_string()
        } else {
            format!("${}", path)
        };
        self.stage("$unwind", Bson::String(path))
    }

    /// `$lookup` equality join against another collection of the same database
    pub fn lookup(
        self,
        from: &str,
        local_field: &str,
        foreign_field: &str,
        as_field: &str,
    ) -> Self {
        self.stage(
            "$lookup",
            doc! {
                "from": from,
                "localField": local_field,
                "foreignField": foreign_field,
                "as": as_field,
            },
        )
    }

    /// `$count` stage writing the number of documents to `field`
    pub fn count(self, field: &str) -> Self {
        self.stage("$count", Bson::String(field.to_string()))
    }

    /// Append any stage by name
    pub fn stage(mut self, name: &str, body: impl Into<Bson>) -> Self {
        let body: Bson = body.into();
        self.stages.push(doc! { name: body });
        self
    }

    pub fn stages(&self) -> &[BsonDocument] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages as the array sent to the engine
    pub fn to_bson(&self) -> Bson {
        Bson::Array(self.stages.iter().cloned().map(Bson::Document).collect())
    }

    /// Run the pipeline on its collection
    pub async fn aggregate(&self) -> Result<Vec<BsonDocument>> {
        self.collection()?.aggregate(self).await
    }

    /// Ask the engine how it would run the pipeline
    pub async fn explain(&self) -> Result<BsonDocument> {
        self.collection()?.explain_aggregate(self).await
    }

    fn collection(&self) -> Result<&Collection> {
        self.collection.as_ref().ok_or_else(|| {
            DocmapError::InvalidState(
                "Pipeline is not bound to a collection; use Collection::aggregate".to_string(),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_keep_call_order() {
        let pipeline = Pipeline::new()
            .matching(doc! { "param": { "$gte": 2 } })
            .group(doc! { "_id": 0, "sum": { "$sum": "$param" } })
            .sort(doc! { "sum": -1 })
            .skip(1)
            .limit(5);

        assert_eq!(
            pipeline.stages(),
            &[
                doc! { "$match": { "param": { "$gte": 2 } } },
                doc! { "$group": { "_id": 0, "sum": { "$sum": "$param" } } },
                doc! { "$sort": { "sum": -1 } },
                doc! { "$skip": 1_i64 },
                doc! { "$limit": 5_i64 },
            ]
        );
    }

    #[test]
    fn test_matching_accepts_expression() {
        let pipeline =
            Pipeline::new().matching(Expression::new().where_greater_or_equal("param", 2));
        assert_eq!(
            pipeline.stages()[0],
            doc! { "$match": { "param": { "$gte": 2 } } }
        );
    }

    #[test]
    fn test_group_without_id_gets_null_id() {
        let pipeline = Pipeline::new().group(doc! { "total": { "$sum": 1 } });
        assert_eq!(
            pipeline.stages()[0],
            doc! { "$group": { "_id": null, "total": { "$sum": 1 } } }
        );
    }

    #[test]
    fn test_unwind_lookup_count_project() {
        let pipeline = Pipeline::new()
            .unwind("tags")
            .unwind("$items")
            .lookup("users", "user_id", "_id", "user")
            .project(doc! { "_id": 0, "tags": 1 })
            .add_fields(doc! { "n": 1 })
            .count("total");

        assert_eq!(pipeline.len(), 6);
        assert_eq!(pipeline.stages()[0], doc! { "$unwind": "$tags" });
        assert_eq!(pipeline.stages()[1], doc! { "$unwind": "$items" });
        assert_eq!(
            pipeline.stages()[2],
            doc! {
                "$lookup": {
                    "from": "users",
                    "localField": "user_id",
                    "foreignField": "_id",
                    "as": "user",
                }
            }
        );
        assert_eq!(pipeline.stages()[5], doc! { "$count": "total" });
    }

    #[tokio::test]
    async fn test_unbound_pipeline_cannot_run() {
        let err = Pipeline::new().limit(1).aggregate().await.unwrap_err();
        assert!(matches!(err, DocmapError::InvalidState(_)));
    }
}
