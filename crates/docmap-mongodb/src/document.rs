//! Mutable documents with dirty tracking and validation
//!
//! A [`Document`] wraps a field map and remembers which top-level fields
//! changed since it was last persisted. Validation rules come from the
//! document's [`DocumentModel`], so different collections can attach
//! different rule sets to otherwise identical documents.

use crate::path;
use crate::rules::{self, RuleDescriptor};
use crate::validation::ValidatedFieldName;
use bson::{doc, Bson, Document as BsonDocument};
use docmap_common::{DocmapError, Result};
use indexmap::IndexSet;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;

/// Name of the identity field
pub const ID_FIELD: &str = "_id";

/// Supplies the validation rules for a kind of document
///
/// # Example
///
/// ```ignore
/// struct Account;
///
/// impl DocumentModel for Account {
///     fn rules(&self) -> Vec<RuleDescriptor> {
///         vec![
///             RuleDescriptor::required("email"),
///             RuleDescriptor::email("email"),
///         ]
///     }
/// }
/// ```
pub trait DocumentModel: Send + Sync {
    /// Rules every save must pass; none by default
    fn rules(&self) -> Vec<RuleDescriptor> {
        Vec::new()
    }
}

/// Model without rules
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainModel;

impl DocumentModel for PlainModel {}

/// Persistence state of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    /// Never saved
    New,
    /// Matches what was last persisted
    Clean,
    /// Persisted, with unsaved changes
    Dirty,
    /// Removed from the engine; terminal
    Deleted,
}

/// A document of a collection
#[derive(Clone)]
pub struct Document {
    fields: BsonDocument,
    state: DocumentState,
    dirty: IndexSet<String>,
    model: Arc<dyn DocumentModel>,
}

impl Document {
    /// Create a new, unsaved document without rules
    pub fn new(fields: BsonDocument) -> Self {
        Self::with_model(fields, Arc::new(PlainModel))
    }

    /// Create a new, unsaved document validated by `model`
    pub fn with_model(fields: BsonDocument, model: Arc<dyn DocumentModel>) -> Self {
        Self {
            fields,
            state: DocumentState::New,
            dirty: IndexSet::new(),
            model,
        }
    }

    /// Wrap fields read back from the engine
    pub(crate) fn persisted(fields: BsonDocument, model: Arc<dyn DocumentModel>) -> Self {
        Self {
            fields,
            state: DocumentState::Clean,
            dirty: IndexSet::new(),
            model,
        }
    }

    /// Create a new document from any serializable value
    pub fn from_struct<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(bson::to_document(value)?))
    }

    /// Deserialize the current fields into `T`
    pub fn to_struct<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bson::from_document(self.fields.clone())?)
    }

    /// The document identity, if one has been assigned
    pub fn id(&self) -> Option<&Bson> {
        self.fields.get(ID_FIELD)
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Read a field by dot path
    pub fn get(&self, field: &str) -> Option<&Bson> {
        path::get(&self.fields, field)
    }

    pub fn has(&self, field: &str) -> bool {
        path::contains(&self.fields, field)
    }

    /// Write a field by dot path
    ///
    /// `_id` can be written only while the document has no identity.
    pub fn set(&mut self, field: &str, value: impl Into<Bson>) -> Result<&mut Self> {
        let field = ValidatedFieldName::new(field)?;
        self.ensure_mutable()?;
        let value = value.into();

        if path::top_level(field.as_str()) == ID_FIELD {
            match self.id() {
                Some(current) if field.as_str() == ID_FIELD && *current == value => {
                    return Ok(self);
                }
                Some(_) => {
                    return Err(DocmapError::InvalidState(
                        "Document identity is immutable once assigned".to_string(),
                    ));
                }
                None => {}
            }
        }

        path::set(&mut self.fields, field.as_str(), value)?;
        self.touch(field.as_str());
        Ok(self)
    }

    /// Remove a field by dot path; the next save sends `$unset`
    pub fn unset(&mut self, field: &str) -> Result<&mut Self> {
        let field = ValidatedFieldName::new(field)?;
        self.ensure_mutable()?;
        if path::top_level(field.as_str()) == ID_FIELD && self.id().is_some() {
            return Err(DocmapError::InvalidState(
                "Document identity is immutable once assigned".to_string(),
            ));
        }
        if path::remove(&mut self.fields, field.as_str()).is_some() {
            self.touch(field.as_str());
        }
        Ok(self)
    }

    /// Set every field of `fields`
    pub fn merge(&mut self, fields: BsonDocument) -> Result<&mut Self> {
        for (field, value) in fields {
            self.set(&field, value)?;
        }
        Ok(self)
    }

    /// Rules declared by the document's model
    pub fn rules(&self) -> Vec<RuleDescriptor> {
        self.model.rules()
    }

    /// Run every rule; fails with all failing rules at once
    pub fn validate(&self) -> Result<()> {
        rules::validate(&self.fields, &self.rules())
    }

    /// Snapshot of the current fields, unsaved changes included
    pub fn to_document(&self) -> BsonDocument {
        self.fields.clone()
    }

    pub fn as_document(&self) -> &BsonDocument {
        &self.fields
    }

    /// Top-level fields changed since the last save
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Update document writing only the dirty fields
    pub(crate) fn update_document(&self) -> BsonDocument {
        let mut set = BsonDocument::new();
        let mut unset = BsonDocument::new();
        for field in &self.dirty {
            match self.fields.get(field) {
                Some(value) => {
                    set.insert(field.clone(), value.clone());
                }
                None => {
                    unset.insert(field.clone(), "");
                }
            }
        }

        let mut update = BsonDocument::new();
        if !set.is_empty() {
            update.insert("$set", set);
        }
        if !unset.is_empty() {
            update.insert("$unset", unset);
        }
        update
    }

    /// Record a successful save; `id` is the identity the engine assigned
    pub(crate) fn mark_saved(&mut self, id: Option<Bson>) {
        if let Some(id) = id {
            if !self.fields.contains_key(ID_FIELD) {
                let mut fields = doc! { ID_FIELD: id };
                fields.extend(std::mem::take(&mut self.fields));
                self.fields = fields;
            }
        }
        self.dirty.clear();
        self.state = DocumentState::Clean;
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.dirty.clear();
        self.state = DocumentState::Deleted;
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.state == DocumentState::Deleted {
            return Err(DocmapError::InvalidState(
                "Document has been deleted".to_string(),
            ));
        }
        Ok(())
    }

    fn touch(&mut self, field: &str) {
        self.dirty.insert(path::top_level(field).to_string());
        if self.state == DocumentState::Clean {
            self.state = DocumentState::Dirty;
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("fields", &self.fields)
            .field("state", &self.state)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Stable string form of an identity, used as a map key
///
/// Object ids give their hex form and strings are kept as they are. Every
/// other type is prefixed with its kind, so `1` and `"1"` stay distinct.
/// Numbers share one kind because the engine treats `1` and `1.0` as the
/// same identity.
pub fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => format!("number:{}", n),
        Bson::Int64(n) => format!("number:{}", n),
        Bson::Double(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
            format!("number:{}", *f as i64)
        }
        Bson::Double(f) => format!("number:{}", f),
        other => format!("{:?}:{}", other.element_type(), other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;
    use serde::Deserialize;

    struct RequiresName;

    impl DocumentModel for RequiresName {
        fn rules(&self) -> Vec<RuleDescriptor> {
            vec![
                RuleDescriptor::required("name"),
                RuleDescriptor::email("email"),
            ]
        }
    }

    #[test]
    fn test_new_document_state() {
        let document = Document::new(doc! { "param": 1 });
        assert_eq!(document.state(), DocumentState::New);
        assert!(document.id().is_none());
        assert_eq!(document.dirty_fields().count(), 0);
    }

    #[test]
    fn test_set_and_get_dot_path() {
        let mut document = Document::new(doc! { "k": { "f": "F1" } });
        document.set("k.kk", "A").unwrap();
        assert_eq!(document.get("k.kk"), Some(&Bson::String("A".to_string())));
        assert_eq!(document.to_document(), doc! { "k": { "f": "F1", "kk": "A" } });
        assert!(document.has("k.f"));
    }

    #[test]
    fn test_clean_becomes_dirty_on_set() {
        let mut document = Document::persisted(
            doc! { "_id": 1, "a": 1, "k": { "f": "F1" } },
            Arc::new(PlainModel),
        );
        assert_eq!(document.state(), DocumentState::Clean);

        document.set("a", 2).unwrap().set("k.kk", "B").unwrap();
        assert_eq!(document.state(), DocumentState::Dirty);
        assert_eq!(document.dirty_fields().collect::<Vec<_>>(), vec!["a", "k"]);
        assert_eq!(
            document.update_document(),
            doc! { "$set": { "a": 2, "k": { "f": "F1", "kk": "B" } } }
        );
    }

    #[test]
    fn test_unset_is_sent_as_unset() {
        let mut document =
            Document::persisted(doc! { "_id": 1, "a": 1, "b": 2 }, Arc::new(PlainModel));
        document.unset("b").unwrap();
        assert_eq!(document.update_document(), doc! { "$unset": { "b": "" } });

        let mut untouched = Document::persisted(doc! { "_id": 1 }, Arc::new(PlainModel));
        untouched.unset("missing").unwrap();
        assert_eq!(untouched.state(), DocumentState::Clean);
    }

    #[test]
    fn test_huge_array_index_is_refused() {
        let mut document = Document::new(doc! { "tags": ["x"] });
        assert!(document.set("tags.18446744073709551615", 1).is_err());
        assert_eq!(document.to_document(), doc! { "tags": ["x"] });
    }

    #[test]
    fn test_id_is_immutable_once_assigned() {
        let mut document = Document::new(doc! {});
        document.set("_id", "abcdef").unwrap();
        assert_eq!(document.id(), Some(&Bson::String("abcdef".to_string())));

        document.set("_id", "abcdef").unwrap();
        let err = document.set("_id", "other").unwrap_err();
        assert!(matches!(err, DocmapError::InvalidState(_)));
        assert!(document.unset("_id").is_err());
    }

    #[test]
    fn test_mark_saved_puts_id_first() {
        let mut document = Document::new(doc! { "a": 1 });
        document.set("b", 2).unwrap();
        let oid = ObjectId::new();
        document.mark_saved(Some(Bson::ObjectId(oid)));

        assert_eq!(document.state(), DocumentState::Clean);
        assert_eq!(document.dirty_fields().count(), 0);
        assert_eq!(document.to_document(), doc! { "_id": oid, "a": 1, "b": 2 });
    }

    #[test]
    fn test_deleted_document_rejects_mutation() {
        let mut document = Document::new(doc! { "a": 1 });
        document.mark_deleted();
        assert_eq!(document.state(), DocumentState::Deleted);
        assert!(matches!(
            document.set("a", 2).unwrap_err(),
            DocmapError::InvalidState(_)
        ));
    }

    #[test]
    fn test_validate_uses_model_rules() {
        let mut document = Document::with_model(doc! { "email": "bad" }, Arc::new(RequiresName));
        let err = document.validate().unwrap_err();
        let failures = err.validation_failures().unwrap();
        assert_eq!(failures.fields(), vec!["name", "email"]);

        document.set("name", "Jo").unwrap().set("email", "jo@example.com").unwrap();
        assert!(document.validate().is_ok());
    }

    #[test]
    fn test_rejects_operator_field_names() {
        let mut document = Document::new(doc! {});
        assert!(matches!(
            document.set("$set", 1).unwrap_err(),
            DocmapError::InvalidName(_)
        ));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        label: String,
    }

    #[test]
    fn test_struct_conversion() {
        let point = Point { x: 3, label: "p".to_string() };
        let document = Document::from_struct(&point).unwrap();
        assert_eq!(document.to_document(), doc! { "x": 3, "label": "p" });
        assert_eq!(document.to_struct::<Point>().unwrap(), point);
    }

    #[test]
    fn test_id_to_string() {
        let oid = ObjectId::new();
        assert_eq!(id_to_string(&Bson::ObjectId(oid)), oid.to_hex());
        assert_eq!(id_to_string(&Bson::String("abcdef".to_string())), "abcdef");
        assert_eq!(id_to_string(&Bson::Int64(42)), "number:42");
    }

    #[test]
    fn test_id_to_string_keeps_types_apart() {
        let number = id_to_string(&Bson::Int32(1));
        assert_ne!(number, id_to_string(&Bson::String("1".to_string())));
        assert_eq!(number, id_to_string(&Bson::Int64(1)));
        assert_eq!(number, id_to_string(&Bson::Double(1.0)));
        assert_eq!(id_to_string(&Bson::Double(1.5)), "number:1.5");
        assert_ne!(
            id_to_string(&Bson::Boolean(true)),
            id_to_string(&Bson::String("true".to_string()))
        );
    }
}
