//! Database handle
//!
//! Creates and drops collections and hands out [`Collection`] handles that
//! share the same engine.

use crate::collection::Collection;
use crate::engine::{CreateCollectionOptions, EngineClient};
use bson::{doc, Bson};
use docmap_common::{DocmapError, Result};
use std::fmt;
use std::sync::Arc;

/// Engine code for "collection already exists"
const NAMESPACE_EXISTS: i32 = 48;

/// Characters the engine rejects in database names
const INVALID_DATABASE_CHARS: &[char] = &['/', '\\', '.', ' ', '"', '$', '\0'];

const MAX_DATABASE_NAME_LENGTH: usize = 64;

/// One database of an engine
#[derive(Clone)]
pub struct Database {
    engine: Arc<dyn EngineClient>,
    name: String,
}

impl Database {
    pub fn new(engine: Arc<dyn EngineClient>, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(DocmapError::InvalidName(
                "Database name cannot be empty".to_string(),
            ));
        }
        if name.len() > MAX_DATABASE_NAME_LENGTH {
            return Err(DocmapError::InvalidName(format!(
                "Database name exceeds maximum length of {} characters: '{}'",
                MAX_DATABASE_NAME_LENGTH, name
            )));
        }
        if let Some(c) = name.chars().find(|c| INVALID_DATABASE_CHARS.contains(c)) {
            return Err(DocmapError::InvalidName(format!(
                "Database name cannot contain {:?}: '{}'",
                c, name
            )));
        }
        Ok(Self {
            engine,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn EngineClient> {
        &self.engine
    }

    /// Handle to a collection; the collection need not exist yet
    pub fn collection(&self, name: &str) -> Result<Collection> {
        Collection::new(Arc::clone(&self.engine), &self.name, name)
    }

    /// Create a plain collection, or return the existing one
    pub async fn create_collection(&self, name: &str) -> Result<Collection> {
        match self
            .create_collection_with_options(name, CreateCollectionOptions::default())
            .await
        {
            Err(e) if e.code() == Some(NAMESPACE_EXISTS) => self.collection(name),
            other => other,
        }
    }

    /// Create a collection with explicit options; fails if it already exists
    pub async fn create_collection_with_options(
        &self,
        name: &str,
        options: CreateCollectionOptions,
    ) -> Result<Collection> {
        let collection = self.collection(name)?;
        self.engine
            .create_collection(collection.namespace(), options)
            .await?;
        tracing::info!(
            "Created collection {} (capped: {})",
            collection.namespace(),
            options.capped
        );
        Ok(collection)
    }

    /// Create a capped collection bounded by document count and bytes
    ///
    /// Once either bound is reached, inserting evicts the oldest documents.
    pub async fn create_capped_collection(
        &self,
        name: &str,
        max_documents: u64,
        max_bytes: u64,
    ) -> Result<Collection> {
        self.create_collection_with_options(
            name,
            CreateCollectionOptions {
                capped: true,
                size: Some(max_bytes),
                max: Some(max_documents),
            },
        )
        .await
    }

    /// Names of the collections in this database
    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        let entries = self
            .engine
            .run_cursor_command(&self.name, doc! { "listCollections": 1, "nameOnly": true })
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry.get("name") {
                Some(Bson::String(name)) => Some(name.clone()),
                _ => None,
            })
            .collect())
    }

    /// Drop the database and every collection in it
    pub async fn drop(&self) -> Result<()> {
        self.engine
            .run_command(&self.name, doc! { "dropDatabase": 1 })
            .await?;
        tracing::info!("Dropped database {}", self.name);
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}
