//! Operator builder for update-mutation documents

use bson::{Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};

/// Fluent builder for update documents such as `{ "$set": {..}, "$inc": {..} }`
///
/// Each path is written by one clause only. Adding a clause drops every
/// earlier clause whose path equals, contains or sits inside the new one,
/// whatever its kind; rename targets count as paths too. Repeating a call
/// for the same kind and field overwrites the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Operator {
    operators: BsonDocument,
}

impl Operator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(self, field: &str, value: impl Into<Bson>) -> Self {
        self.add("$set", field, value.into())
    }

    pub fn unset(self, field: &str) -> Self {
        self.add("$unset", field, Bson::String(String::new()))
    }

    /// Increment a numeric field; `delta` must be numeric
    pub fn inc(self, field: &str, delta: impl Into<Bson>) -> Result<Self> {
        let delta = numeric("$inc", field, delta.into())?;
        Ok(self.add("$inc", field, delta))
    }

    /// Multiply a numeric field; `factor` must be numeric
    pub fn mul(self, field: &str, factor: impl Into<Bson>) -> Result<Self> {
        let factor = numeric("$mul", field, factor.into())?;
        Ok(self.add("$mul", field, factor))
    }

    pub fn push(self, field: &str, value: impl Into<Bson>) -> Self {
        self.add("$push", field, value.into())
    }

    /// Append every element of `values`
    pub fn push_each<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let each: Vec<Bson> = values.into_iter().map(Into::into).collect();
        self.add("$push", field, Bson::Document(bson::doc! { "$each": each }))
    }

    pub fn add_to_set(self, field: &str, value: impl Into<Bson>) -> Self {
        self.add("$addToSet", field, value.into())
    }

    /// Remove every array element equal to (or matching) `value`
    pub fn pull(self, field: &str, value: impl Into<Bson>) -> Self {
        self.add("$pull", field, value.into())
    }

    /// Remove the last array element
    pub fn pop(self, field: &str) -> Self {
        self.add("$pop", field, Bson::Int32(1))
    }

    /// Remove the first array element
    pub fn pop_first(self, field: &str) -> Self {
        self.add("$pop", field, Bson::Int32(-1))
    }

    pub fn rename(self, old_name: &str, new_name: &str) -> Self {
        self.add("$rename", old_name, Bson::String(new_name.to_string()))
    }

    /// Returns true if no clause was added
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Get the update document
    pub fn to_document(&self) -> BsonDocument {
        self.operators.clone()
    }

    pub fn into_document(self) -> BsonDocument {
        self.operators
    }

    fn add(mut self, operator: &str, field: &str, value: Bson) -> Self {
        let touched = clause_paths(operator, field, &value);
        let mut emptied = Vec::new();
        for (kind, clauses) in self.operators.iter_mut() {
            let Bson::Document(clauses) = clauses else {
                continue;
            };
            let conflicting: Vec<String> = clauses
                .iter()
                .filter(|(existing, existing_value)| {
                    if kind == operator && existing.as_str() == field {
                        return false;
                    }
                    clause_paths(kind, existing, existing_value)
                        .iter()
                        .any(|path| touched.iter().any(|t| overlaps(path, t)))
                })
                .map(|(existing, _)| existing.clone())
                .collect();
            for existing in conflicting {
                clauses.remove(&existing);
            }
            if clauses.is_empty() {
                emptied.push(kind.clone());
            }
        }
        for kind in emptied {
            self.operators.remove(&kind);
        }

        match self.operators.get_mut(operator) {
            Some(Bson::Document(clauses)) => {
                clauses.insert(field, value);
            }
            _ => {
                let mut clauses = BsonDocument::new();
                clauses.insert(field, value);
                self.operators.insert(operator, clauses);
            }
        }
        self
    }
}

/// Paths written by one clause; a rename also writes its target
fn clause_paths<'a>(operator: &str, field: &'a str, value: &'a Bson) -> Vec<&'a str> {
    match value {
        Bson::String(target) if operator == "$rename" => vec![field, target.as_str()],
        _ => vec![field],
    }
}

/// The engine rejects an update touching a path and one of its ancestors
fn overlaps(a: &str, b: &str) -> bool {
    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    match longer.strip_prefix(shorter) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

fn numeric(operator: &str, field: &str, value: Bson) -> Result<Bson> {
    match value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => Ok(value),
        other => Err(DocmapError::TypeMismatch(format!(
            "{} on '{}' requires a numeric value, got {:?}",
            operator,
            field,
            other.element_type()
        ))),
    }
}

impl From<Operator> for BsonDocument {
    fn from(operator: Operator) -> Self {
        operator.operators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_empty_operator() {
        assert!(Operator::new().is_empty());
        assert_eq!(Operator::new().to_document(), doc! {});
    }

    #[test]
    fn test_groups_by_kind() {
        let op = Operator::new()
            .set("k", "v")
            .set("a.b", 1)
            .inc("counter", 2)
            .unwrap()
            .unset("old");
        assert_eq!(
            op.to_document(),
            doc! {
                "$set": { "k": "v", "a.b": 1 },
                "$inc": { "counter": 2 },
                "$unset": { "old": "" },
            }
        );
    }

    #[test]
    fn test_same_kind_same_field_last_write_wins() {
        let op = Operator::new().set("k", "v1").set("k", "v2");
        assert_eq!(op.to_document(), doc! { "$set": { "k": "v2" } });
    }

    #[test]
    fn test_field_moves_between_kinds() {
        let op = Operator::new().set("n", 1).set("m", 2).inc("n", 5).unwrap();
        assert_eq!(
            op.to_document(),
            doc! { "$set": { "m": 2 }, "$inc": { "n": 5 } }
        );

        let op = Operator::new().set("n", 1).unset("n");
        assert_eq!(op.to_document(), doc! { "$unset": { "n": "" } });
    }

    #[test]
    fn test_inc_rejects_non_numeric() {
        let err = Operator::new().inc("n", "one").unwrap_err();
        assert!(matches!(err, DocmapError::TypeMismatch(_)));

        let err = Operator::new().mul("n", true).unwrap_err();
        assert!(matches!(err, DocmapError::TypeMismatch(_)));

        assert!(Operator::new().inc("n", 1.5).is_ok());
        assert!(Operator::new().inc("n", -3_i64).is_ok());
    }

    #[test]
    fn test_array_operators() {
        let op = Operator::new()
            .push("tags", "a")
            .push_each("list", vec![1, 2])
            .pull("removed", "x")
            .pop("stack")
            .pop_first("queue")
            .add_to_set("unique", 3);
        assert_eq!(
            op.to_document(),
            doc! {
                "$push": { "tags": "a", "list": { "$each": [1, 2] } },
                "$pull": { "removed": "x" },
                "$pop": { "stack": 1, "queue": -1 },
                "$addToSet": { "unique": 3 },
            }
        );
    }

    #[test]
    fn test_parent_and_child_paths_conflict() {
        let op = Operator::new().set("a", 1).inc("a.b", 1).unwrap();
        assert_eq!(op.to_document(), doc! { "$inc": { "a.b": 1 } });

        let op = Operator::new().set("a.b", 1).set("a.c", 2).unset("a");
        assert_eq!(op.to_document(), doc! { "$unset": { "a": "" } });

        let op = Operator::new().set("ab", 1).set("a", 2);
        assert_eq!(op.to_document(), doc! { "$set": { "ab": 1, "a": 2 } });
    }

    #[test]
    fn test_rename_target_conflicts() {
        let op = Operator::new().rename("a", "b").set("b", 1);
        assert_eq!(op.to_document(), doc! { "$set": { "b": 1 } });

        let op = Operator::new().set("b.c", 1).rename("a", "b");
        assert_eq!(op.to_document(), doc! { "$rename": { "a": "b" } });
    }

    #[test]
    fn test_rename() {
        let op = Operator::new().rename("old", "new");
        assert_eq!(op.to_document(), doc! { "$rename": { "old": "new" } });
    }
}
