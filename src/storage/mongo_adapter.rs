use super::{
    CollectionInfo, DatabaseInfo, DeleteOutcome, Namespace, OperationOptions, UpdateOutcome,
    UpdateSpec,
};
use crate::error::Result;
use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::{
    ClientOptions, FindOneOptions, FindOptions, ReplaceOptions, UpdateModifications, UpdateOptions,
};
use mongodb::{Client, Collection};
use tracing::debug;

const APP_NAME: &str = "mongo-data-api";

/// Adapter over the MongoDB driver.
///
/// The driver keeps its own connection pool, so cloning is cheap and all
/// clones share it.
#[derive(Clone)]
pub struct MongoAdapter {
    client: Client,
}

impl MongoAdapter {
    /// Create a client and verify the deployment answers a ping
    pub async fn connect(uri: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some(APP_NAME.to_string());
        let client = Client::with_options(options)?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await?;
        debug!("Connected to MongoDB deployment");

        Ok(Self { client })
    }

    fn collection(&self, ns: &Namespace) -> Collection<Document> {
        self.client
            .database(&ns.database)
            .collection::<Document>(&ns.collection)
    }

    pub async fn find(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &OperationOptions,
    ) -> Result<Vec<Document>> {
        let mut find_options = FindOptions::default();
        find_options.sort = options.sort.clone();
        find_options.limit = Some(options.limit);
        find_options.skip = options.skip;
        find_options.projection = options.projection.clone();

        let cursor = self.collection(ns).find(filter, find_options).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn find_one(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &OperationOptions,
    ) -> Result<Option<Document>> {
        let mut find_options = FindOneOptions::default();
        find_options.sort = options.sort.clone();
        find_options.skip = options.skip;
        find_options.projection = options.projection.clone();

        Ok(self.collection(ns).find_one(filter, find_options).await?)
    }

    pub async fn insert_one(&self, ns: &Namespace, document: Document) -> Result<Bson> {
        let result = self.collection(ns).insert_one(document, None).await?;
        Ok(result.inserted_id)
    }

    pub async fn insert_many(&self, ns: &Namespace, documents: Vec<Document>) -> Result<Vec<Bson>> {
        let result = self.collection(ns).insert_many(documents, None).await?;
        let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
        ids.sort_by_key(|(index, _)| *index);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    fn update_options(upsert: bool) -> UpdateOptions {
        let mut options = UpdateOptions::default();
        if upsert {
            options.upsert = Some(true);
        }
        options
    }

    fn modifications(update: UpdateSpec) -> UpdateModifications {
        match update {
            UpdateSpec::Document(doc) => UpdateModifications::Document(doc),
            UpdateSpec::Pipeline(stages) => UpdateModifications::Pipeline(stages),
        }
    }

    pub async fn update_one(
        &self,
        ns: &Namespace,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .collection(ns)
            .update_one(filter, Self::modifications(update), Self::update_options(upsert))
            .await?;
        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    pub async fn update_many(
        &self,
        ns: &Namespace,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let result = self
            .collection(ns)
            .update_many(filter, Self::modifications(update), Self::update_options(upsert))
            .await?;
        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    pub async fn replace_one(
        &self,
        ns: &Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut options = ReplaceOptions::default();
        if upsert {
            options.upsert = Some(true);
        }
        let result = self
            .collection(ns)
            .replace_one(filter, replacement, options)
            .await?;
        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }

    pub async fn delete_one(&self, ns: &Namespace, filter: Document) -> Result<DeleteOutcome> {
        let result = self.collection(ns).delete_one(filter, None).await?;
        Ok(DeleteOutcome {
            deleted_count: result.deleted_count,
        })
    }

    pub async fn delete_many(&self, ns: &Namespace, filter: Document) -> Result<DeleteOutcome> {
        let result = self.collection(ns).delete_many(filter, None).await?;
        Ok(DeleteOutcome {
            deleted_count: result.deleted_count,
        })
    }

    pub async fn aggregate(&self, ns: &Namespace, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        let cursor = self.collection(ns).aggregate(pipeline, None).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn count_documents(&self, ns: &Namespace, filter: Document) -> Result<u64> {
        Ok(self.collection(ns).count_documents(filter, None).await?)
    }

    pub async fn estimated_document_count(&self, ns: &Namespace) -> Result<u64> {
        Ok(self.collection(ns).estimated_document_count(None).await?)
    }

    pub async fn distinct(&self, ns: &Namespace, key: &str, filter: Document) -> Result<Vec<Bson>> {
        Ok(self.collection(ns).distinct(key, filter, None).await?)
    }

    pub async fn list_collections(&self, database: &str) -> Result<Vec<CollectionInfo>> {
        let cursor = self
            .client
            .database(database)
            .list_collections(None, None)
            .await?;
        let specs: Vec<_> = cursor.try_collect().await?;

        specs
            .into_iter()
            .map(|spec| -> Result<CollectionInfo> {
                let kind = match bson::to_bson(&spec.collection_type)? {
                    Bson::String(kind) => kind,
                    other => other.to_string(),
                };
                Ok(CollectionInfo {
                    name: spec.name,
                    kind,
                    options: bson::to_document(&spec.options)?,
                })
            })
            .collect()
    }

    pub async fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let databases = self.client.list_databases(None, None).await?;
        Ok(databases
            .into_iter()
            .map(|db| DatabaseInfo {
                name: db.name,
                empty: db.empty,
            })
            .collect())
    }
}
