//! Expression builder for filter documents
//!
//! Each `where_*` call appends one clause. Top-level clauses combine with an
//! implicit AND; `$or`/`$nor` groups sit next to them as siblings.

use bson::{doc, Bson, Document as BsonDocument};

/// Fluent builder for query filter documents
///
/// # Example
///
/// ```ignore
/// let filter = Expression::new()
///     .where_greater("param", 2)
///     .where_less("param", 10)
///     .to_document();
/// assert_eq!(filter, doc! { "param": { "$gt": 2, "$lt": 10 } });
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expression {
    filter: BsonDocument,
}

impl Expression {
    /// Create an empty expression (matches every document)
    pub fn new() -> Self {
        Self::default()
    }

    /// Field equals value
    pub fn where_eq(mut self, field: &str, value: impl Into<Bson>) -> Self {
        let value = value.into();
        if self.filter.contains_key(field) {
            self.push_and(doc! { field: value });
        } else {
            self.filter.insert(field, value);
        }
        self
    }

    pub fn where_greater(self, field: &str, value: impl Into<Bson>) -> Self {
        self.where_operator(field, "$gt", value.into())
    }

    pub fn where_greater_or_equal(self, field: &str, value: impl Into<Bson>) -> Self {
        self.where_operator(field, "$gte", value.into())
    }

    pub fn where_less(self, field: &str, value: impl Into<Bson>) -> Self {
        self.where_operator(field, "$lt", value.into())
    }

    pub fn where_less_or_equal(self, field: &str, value: impl Into<Bson>) -> Self {
        self.where_operator(field, "$lte", value.into())
    }

    pub fn where_not_equal(self, field: &str, value: impl Into<Bson>) -> Self {
        self.where_operator(field, "$ne", value.into())
    }

    /// Field value is one of `values`
    pub fn where_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.where_operator(field, "$in", to_array(values))
    }

    pub fn where_not_in<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.where_operator(field, "$nin", to_array(values))
    }

    /// Array field contains every one of `values`
    pub fn where_all<I, V>(self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        self.where_operator(field, "$all", to_array(values))
    }

    pub fn where_exists(self, field: &str) -> Self {
        self.where_operator(field, "$exists", Bson::Boolean(true))
    }

    pub fn where_not_exists(self, field: &str) -> Self {
        self.where_operator(field, "$exists", Bson::Boolean(false))
    }

    /// Field matches a regular expression; `options` uses the engine's flags (`i`, `m`, `x`, `s`)
    pub fn where_regex(self, field: &str, pattern: &str, options: &str) -> Self {
        let mut regex = doc! { "$regex": pattern };
        if !options.is_empty() {
            regex.insert("$options", options);
        }
        self.where_operators(field, regex)
    }

    /// Array field has exactly `size` elements
    pub fn where_array_size(self, field: &str, size: i64) -> Self {
        self.where_operator(field, "$size", Bson::Int64(size))
    }

    /// At least one array element matches `expression`
    pub fn where_elem_match(self, field: &str, expression: Expression) -> Self {
        self.where_operator(field, "$elemMatch", Bson::Document(expression.filter))
    }

    /// Any of `expressions` matches
    pub fn where_or(self, expressions: impl IntoIterator<Item = Expression>) -> Self {
        self.where_logical("$or", expressions)
    }

    /// None of `expressions` matches
    pub fn where_nor(self, expressions: impl IntoIterator<Item = Expression>) -> Self {
        self.where_logical("$nor", expressions)
    }

    /// `expression` does not match
    ///
    /// The engine has no top-level `$not`, so this is written as a one-element `$nor`.
    pub fn where_not(self, expression: Expression) -> Self {
        self.where_logical("$nor", std::iter::once(expression))
    }

    /// Returns true if no clause was added
    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }

    /// Get the filter document
    pub fn to_document(&self) -> BsonDocument {
        self.filter.clone()
    }

    pub fn as_document(&self) -> &BsonDocument {
        &self.filter
    }

    pub fn into_document(self) -> BsonDocument {
        self.filter
    }

    fn where_operator(self, field: &str, operator: &str, value: Bson) -> Self {
        self.where_operators(field, doc! { operator: value })
    }

    /// Adds `operators` as one clause on `field`
    ///
    /// Merges into the field's operator document unless one of the operators
    /// is already there; otherwise the whole clause goes under `$and`.
    fn where_operators(mut self, field: &str, operators: BsonDocument) -> Self {
        match self.filter.get_mut(field) {
            None => {
                self.filter.insert(field, operators);
            }
            Some(Bson::Document(existing))
                if is_operator_document(existing)
                    && operators.keys().all(|k| !existing.contains_key(k)) =>
            {
                existing.extend(operators);
            }
            Some(_) => self.push_and(doc! { field: operators }),
        }
        self
    }

    fn where_logical(
        mut self,
        operator: &str,
        expressions: impl IntoIterator<Item = Expression>,
    ) -> Self {
        let clauses: Vec<Bson> = expressions
            .into_iter()
            .map(|e| Bson::Document(e.filter))
            .collect();
        if clauses.is_empty() {
            return self;
        }
        if self.filter.contains_key(operator) {
            self.push_and(doc! { operator: clauses });
        } else {
            self.filter.insert(operator, clauses);
        }
        self
    }

    fn push_and(&mut self, clause: BsonDocument) {
        match self.filter.get_mut("$and") {
            Some(Bson::Array(clauses)) => clauses.push(Bson::Document(clause)),
            _ => {
                self.filter.insert("$and", vec![Bson::Document(clause)]);
            }
        }
    }
}

fn to_array<I, V>(values: I) -> Bson
where
    I: IntoIterator<Item = V>,
    V: Into<Bson>,
{
    Bson::Array(values.into_iter().map(Into::into).collect())
}

fn is_operator_document(doc: &BsonDocument) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

impl From<BsonDocument> for Expression {
    fn from(filter: BsonDocument) -> Self {
        Self { filter }
    }
}

impl From<Expression> for BsonDocument {
    fn from(expression: Expression) -> Self {
        expression.filter
    }
}
