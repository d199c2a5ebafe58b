pub mod memory_adapter;
pub mod mongo_adapter;
pub mod query;

pub use memory_adapter::MemoryAdapter;
pub use mongo_adapter::MongoAdapter;

use crate::error::Result;
use bson::{Bson, Document};

/// URI scheme selecting the in-process engine
pub const MEMORY_SCHEME: &str = "memory://";

/// Default number of documents returned by queries without a limit
pub const DEFAULT_LIMIT: i64 = 1000;

/// Counts as the narrowest integer type
pub fn count_value(n: u64) -> Bson {
    match i32::try_from(n) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(n as i64),
    }
}

/// A collection inside a database
#[derive(Debug, Clone, PartialEq, Eq)]
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
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Query options. Only fields that were present and non-empty are set.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOptions {
    pub sort: Option<Document>,
    pub limit: i64,
    pub skip: Option<u64>,
    pub projection: Option<Document>,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            sort: None,
            limit: DEFAULT_LIMIT,
            skip: None,
            projection: None,
        }
    }
}

/// Modification applied by update actions
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateSpec {
    /// Operator document such as `{"$set": {...}}`
    Document(Document),
    /// Aggregation pipeline update
    Pipeline(Vec<Document>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    /// `collection`, `view` or `timeseries`
    pub kind: String,
    pub options: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseInfo {
    pub name: String,
    pub empty: bool,
}

/// Connection to one cluster. Cloning shares the underlying connection.
#[derive(Clone)]
pub enum StorageEngine {
    /// MongoDB deployment reached through the official driver
    Mongo(MongoAdapter),
    /// In-process store, no persistence
    Memory(MemoryAdapter),
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageEngine::Mongo(_) => write!(f, "StorageEngine::Mongo"),
            StorageEngine::Memory(_) => write!(f, "StorageEngine::Memory"),
        }
    }
}

impl StorageEngine {
    /// Open a connection for the given URI.
    ///
    /// `memory://` URIs get a fresh in-process store, anything else is handed
    /// to the MongoDB driver and verified with a ping.
    pub async fn connect(uri: &str) -> Result<Self> {
        if uri.starts_with(MEMORY_SCHEME) {
            Ok(StorageEngine::Memory(MemoryAdapter::new()))
        } else {
            Ok(StorageEngine::Mongo(MongoAdapter::connect(uri).await?))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageEngine::Mongo(_) => "mongodb",
            StorageEngine::Memory(_) => "memory",
        }
    }

    pub async fn find(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &OperationOptions,
    ) -> Result<Vec<Document>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.find(ns, filter, options).await,
            StorageEngine::Memory(adapter) => adapter.find(ns, &filter, options),
        }
    }

    pub async fn find_one(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &OperationOptions,
    ) -> Result<Option<Document>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.find_one(ns, filter, options).await,
            StorageEngine::Memory(adapter) => adapter.find_one(ns, &filter, options),
        }
    }

    pub async fn insert_one(&self, ns: &Namespace, document: Document) -> Result<Bson> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.insert_one(ns, document).await,
            StorageEngine::Memory(adapter) => adapter.insert_one(ns, document),
        }
    }

    /// Insert documents, returning their ids in input order
    pub async fn insert_many(&self, ns: &Namespace, documents: Vec<Document>) -> Result<Vec<Bson>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.insert_many(ns, documents).await,
            StorageEngine::Memory(adapter) => adapter.insert_many(ns, documents),
        }
    }

    pub async fn update_one(
        &self,
        ns: &Namespace,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.update_one(ns, filter, update, upsert).await,
            StorageEngine::Memory(adapter) => adapter.update(ns, &filter, &update, upsert, false),
        }
    }

    pub async fn update_many(
        &self,
        ns: &Namespace,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.update_many(ns, filter, update, upsert).await,
            StorageEngine::Memory(adapter) => adapter.update(ns, &filter, &update, upsert, true),
        }
    }

    pub async fn replace_one(
        &self,
        ns: &Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        match self {
            StorageEngine::Mongo(adapter) => {
                adapter.replace_one(ns, filter, replacement, upsert).await
            }
            StorageEngine::Memory(adapter) => adapter.replace_one(ns, &filter, replacement, upsert),
        }
    }

    pub async fn delete_one(&self, ns: &Namespace, filter: Document) -> Result<DeleteOutcome> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.delete_one(ns, filter).await,
            StorageEngine::Memory(adapter) => adapter.delete(ns, &filter, false),
        }
    }

    pub async fn delete_many(&self, ns: &Namespace, filter: Document) -> Result<DeleteOutcome> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.delete_many(ns, filter).await,
            StorageEngine::Memory(adapter) => adapter.delete(ns, &filter, true),
        }
    }

    pub async fn aggregate(&self, ns: &Namespace, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.aggregate(ns, pipeline).await,
            StorageEngine::Memory(adapter) => adapter.aggregate(ns, &pipeline),
        }
    }

    pub async fn count_documents(&self, ns: &Namespace, filter: Document) -> Result<u64> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.count_documents(ns, filter).await,
            StorageEngine::Memory(adapter) => adapter.count_documents(ns, &filter),
        }
    }

    pub async fn estimated_document_count(&self, ns: &Namespace) -> Result<u64> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.estimated_document_count(ns).await,
            StorageEngine::Memory(adapter) => adapter.estimated_document_count(ns),
        }
    }

    pub async fn distinct(&self, ns: &Namespace, key: &str, filter: Document) -> Result<Vec<Bson>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.distinct(ns, key, filter).await,
            StorageEngine::Memory(adapter) => adapter.distinct(ns, key, &filter),
        }
    }

    pub async fn list_collections(&self, database: &str) -> Result<Vec<CollectionInfo>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.list_collections(database).await,
            StorageEngine::Memory(adapter) => adapter.list_collections(database),
        }
    }

    pub async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        match self {
            StorageEngine::Mongo(adapter) => adapter.list_databases().await,
            StorageEngine::Memory(adapter) => adapter.list_databases(),
        }
    }
}
