//! MongoDB engine adapter with pool configuration and health checking

use super::{
    CreateCollectionOptions, DeleteOptions, DeleteResult, EngineClient, FindOptions,
    InsertOptions, InsertResult, Namespace, UpdateOptions, UpdateResult,
};
use async_trait::async_trait;
use bson::{doc, Document as BsonDocument};
use docmap_common::{DocmapError, Result};
use futures::TryStreamExt;
use mongodb::{
    options::{self as driver, ClientOptions, ServerApi, ServerApiVersion},
    Client, Collection,
};
use std::time::Duration;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections in the pool (default: 5)
    pub min_pool_size: Option<u32>,
    /// Maximum number of connections in the pool (default: 20)
    pub max_pool_size: Option<u32>,
    /// Maximum time a connection can remain idle before being closed (default: none)
    pub max_idle_time: Option<Duration>,
    /// Connection timeout (default: 10s)
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout (default: 30s)
    pub server_selection_timeout: Option<Duration>,
    /// Application name for server logs
    pub app_name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: Some(5),
            max_pool_size: Some(20),
            max_idle_time: None,
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            app_name: Some("docmap".to_string()),
        }
    }
}

impl PoolConfig {
    /// Copy the configured values onto driver options
    pub fn apply(&self, client_options: &mut ClientOptions) {
        if let Some(min) = self.min_pool_size {
            client_options.min_pool_size = Some(min);
        }
        if let Some(max) = self.max_pool_size {
            client_options.max_pool_size = Some(max);
        }
        if let Some(idle) = self.max_idle_time {
            client_options.max_idle_time = Some(idle);
        }
        if let Some(connect) = self.connect_timeout {
            client_options.connect_timeout = Some(connect);
        }
        if let Some(server_sel) = self.server_selection_timeout {
            client_options.server_selection_timeout = Some(server_sel);
        }
        if let Some(app) = &self.app_name {
            client_options.app_name = Some(app.clone());
        }
    }
}

/// Engine backed by a MongoDB deployment
#[derive(Debug, Clone)]
pub struct MongoEngine {
    client: Client,
    default_database: Option<String>,
}

impl MongoEngine {
    /// Connect with default pool settings
    pub async fn connect(connection_string: &str) -> Result<Self> {
        Self::with_config(connection_string, PoolConfig::default()).await
    }

    /// Connect with custom pool configuration
    pub async fn with_config(connection_string: &str, config: PoolConfig) -> Result<Self> {
        let mut client_options = ClientOptions::parse(connection_string).await?;
        config.apply(&mut client_options);

        // Set stable API version for compatibility
        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let default_database = client_options.default_database.clone();
        let client = Client::with_options(client_options)?;

        tracing::debug!(
            "Connected engine client (default database: {:?})",
            default_database
        );

        Ok(Self {
            client,
            default_database,
        })
    }

    /// Wrap an already configured driver client
    pub fn from_client(client: Client) -> Self {
        let default_database = client.default_database().map(|db| db.name().to_string());
        Self {
            client,
            default_database,
        }
    }

    /// Database named in the connection string, if any
    pub fn default_database_name(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Check if the connection is healthy by pinging the server
    pub async fn ping(&self) -> Result<bool> {
        let database = self.default_database.as_deref().unwrap_or("admin");
        match self
            .client
            .database(database)
            .run_command(doc! { "ping": 1 })
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => Err(DocmapError::Connection(format!("Ping failed: {}", e))),
        }
    }

    /// List all database names on the server
    pub async fn list_database_names(&self) -> Result<Vec<String>> {
        let names = self.client.list_database_names().await?;
        Ok(names)
    }

    fn collection(&self, namespace: &Namespace) -> Collection<BsonDocument> {
        self.client
            .database(&namespace.database)
            .collection(&namespace.collection)
    }
}

#[async_trait]
impl EngineClient for MongoEngine {
    async fn run_command(&self, database: &str, command: BsonDocument) -> Result<BsonDocument> {
        let reply = self.client.database(database).run_command(command).await?;
        Ok(reply)
    }

    async fn run_cursor_command(
        &self,
        database: &str,
        command: BsonDocument,
    ) -> Result<Vec<BsonDocument>> {
        let cursor = self
            .client
            .database(database)
            .run_cursor_command(command)
            .await?;
        let documents: Vec<BsonDocument> = cursor.try_collect().await?;
        Ok(documents)
    }

    async fn find(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        options: FindOptions,
    ) -> Result<Vec<BsonDocument>> {
        let mut find_options = driver::FindOptions::default();
        find_options.sort = options.sort;
        find_options.skip = options.skip;
        find_options.limit = options.limit;
        find_options.projection = options.projection;

        let cursor = self
            .collection(namespace)
            .find(filter)
            .with_options(find_options)
            .await?;
        let documents: Vec<BsonDocument> = cursor.try_collect().await?;
        Ok(documents)
    }

    async fn insert(
        &self,
        namespace: &Namespace,
        documents: Vec<BsonDocument>,
        options: InsertOptions,
    ) -> Result<InsertResult> {
        if documents.is_empty() {
            return Ok(InsertResult::default());
        }

        let mut insert_options = driver::InsertManyOptions::default();
        insert_options.ordered = Some(options.ordered);

        let result = self
            .collection(namespace)
            .insert_many(documents)
            .with_options(insert_options)
            .await?;

        let mut ids: Vec<_> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(InsertResult {
            inserted_ids: ids.into_iter().map(|(_, id)| id).collect(),
        })
    }

    async fn update(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        update: BsonDocument,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        let collection = self.collection(namespace);
        let is_replacement = !update.keys().any(|k| k.starts_with('$'));

        let result = if is_replacement {
            let mut replace_options = driver::ReplaceOptions::default();
            replace_options.upsert = Some(options.upsert);
            collection
                .replace_one(filter, update)
                .with_options(replace_options)
                .await?
        } else {
            let mut update_options = driver::UpdateOptions::default();
            update_options.upsert = Some(options.upsert);
            if options.multi {
                collection
                    .update_many(filter, update)
                    .with_options(update_options)
                    .await?
            } else {
                collection
                    .update_one(filter, update)
                    .with_options(update_options)
                    .await?
            }
        };

        Ok(UpdateResult {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    async fn delete(
        &self,
        namespace: &Namespace,
        filter: BsonDocument,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        let collection = self.collection(namespace);
        let result = if options.multi {
            collection.delete_many(filter).await?
        } else {
            collection.delete_one(filter).await?
        };
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn create_collection(
        &self,
        namespace: &Namespace,
        options: CreateCollectionOptions,
    ) -> Result<()> {
        let mut create_options = driver::CreateCollectionOptions::default();
        if options.capped {
            create_options.capped = Some(true);
            create_options.size = options.size;
            create_options.max = options.max;
        }

        self.client
            .database(&namespace.database)
            .create_collection(&namespace.collection)
            .with_options(create_options)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_pool_size, Some(5));
        assert_eq!(config.max_pool_size, Some(20));
        assert_eq!(config.app_name, Some("docmap".to_string()));
    }

    #[test]
    fn test_pool_config_applies_to_client_options() {
        let config = PoolConfig {
            min_pool_size: Some(1),
            max_pool_size: Some(50),
            max_idle_time: Some(Duration::from_secs(300)),
            connect_timeout: Some(Duration::from_secs(5)),
            server_selection_timeout: None,
            app_name: Some("my-app".to_string()),
        };
        let mut options = ClientOptions::default();
        config.apply(&mut options);

        assert_eq!(options.min_pool_size, Some(1));
        assert_eq!(options.max_pool_size, Some(50));
        assert_eq!(options.max_idle_time, Some(Duration::from_secs(300)));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.server_selection_timeout, None);
        assert_eq!(options.app_name, Some("my-app".to_string()));
    }
}
