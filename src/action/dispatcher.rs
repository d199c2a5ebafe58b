use super::request::{ActionRequest, Operation, Payload};
use super::Action;
use crate::auth::{AuthGate, Permission};
use crate::codec;
use crate::error::{DataApiError, Result};
use crate::observability::{Metrics, SlowActionLog};
use crate::registry::ClusterRegistry;
use crate::storage::{
    count_value, CollectionInfo, DatabaseInfo, DeleteOutcome, StorageEngine, UpdateOutcome,
};
use bson::{doc, Bson, Document};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Action-specific result shape
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope {
    Documents(Vec<Document>),
    Document(Option<Document>),
    InsertedId(Bson),
    InsertedIds(Vec<Bson>),
    Updated(UpdateOutcome),
    Deleted(DeleteOutcome),
    Count(u64),
    Values(Vec<Bson>),
    Collections(Vec<CollectionInfo>),
    Databases(Vec<DatabaseInfo>),
}

impl ResultEnvelope {
    pub fn into_document(self) -> Document {
        match self {
            ResultEnvelope::Documents(docs) => doc! { "documents": docs },
            ResultEnvelope::Document(found) => doc! {
                "document": found.map_or(Bson::Null, Bson::Document),
            },
            ResultEnvelope::InsertedId(id) => doc! { "insertedId": id },
            ResultEnvelope::InsertedIds(ids) => doc! { "insertedIds": ids },
            ResultEnvelope::Updated(outcome) => {
                let mut out = doc! {
                    "matchedCount": count_value(outcome.matched_count),
                    "modifiedCount": count_value(outcome.modified_count),
                };
                if let Some(id) = outcome.upserted_id {
                    out.insert("upsertedId", id);
                }
                out
            }
            ResultEnvelope::Deleted(outcome) => doc! {
                "deletedCount": count_value(outcome.deleted_count),
            },
            ResultEnvelope::Count(n) => doc! { "count": count_value(n) },
            ResultEnvelope::Values(values) => doc! { "values": values },
            ResultEnvelope::Collections(collections) => doc! {
                "collections": collections
                    .into_iter()
                    .map(|c| doc! { "name": c.name, "type": c.kind, "options": c.options })
                    .collect::<Vec<_>>(),
            },
            ResultEnvelope::Databases(databases) => doc! {
                "databases": databases
                    .into_iter()
                    .map(|d| doc! { "name": d.name, "empty": d.empty })
                    .collect::<Vec<_>>(),
            },
        }
    }

    /// Extended JSON form sent to the client
    pub fn to_json(self) -> Value {
        codec::encode_document(&self.into_document())
    }
}

/// Runs one action per call: authenticate, authorize, parse, resolve the
/// cluster, execute exactly one database operation and encode the result.
pub struct ActionDispatcher {
    registry: Arc<ClusterRegistry>,
    auth: AuthGate,
    metrics: Arc<Metrics>,
    slow_log: Arc<SlowActionLog>,
}

impl ActionDispatcher {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        auth: AuthGate,
        metrics: Arc<Metrics>,
        slow_log: Arc<SlowActionLog>,
    ) -> Self {
        Self {
            registry,
            auth,
            metrics,
            slow_log,
        }
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn slow_log(&self) -> &SlowActionLog {
        &self.slow_log
    }

    /// Handle `action` with the given credential and payload, returning the
    /// encoded result envelope.
    ///
    /// The payload is not decoded until the credential and the action's
    /// required permission have been checked.
    pub async fn dispatch(
        &self,
        credential: Option<&str>,
        action: &str,
        payload: impl Into<Payload>,
    ) -> Result<Value> {
        let start = Instant::now();
        let mut data_source = None;
        let result = self
            .run(credential, action, payload.into(), &mut data_source)
            .await;
        let elapsed = start.elapsed();

        // Unrecognized names share one bucket
        let label = action.parse::<Action>().map_or("unknown", |a| a.name());
        self.metrics.actions.record(label, elapsed, result.is_err());
        self.slow_log.record(label, data_source.as_deref(), elapsed);

        if let Err(e) = &result {
            debug!(action = label, error = %e, "Action rejected");
        }
        result
    }

    async fn run(
        &self,
        credential: Option<&str>,
        action: &str,
        payload: Payload,
        data_source: &mut Option<String>,
    ) -> Result<Value> {
        let permissions = self.auth.check(credential)?;
        let action: Action = action.parse()?;
        let required = if action.requires_write() {
            Permission::Write
        } else {
            Permission::Read
        };
        if !permissions.contains(required) {
            return Err(DataApiError::Unauthorized);
        }

        let payload = payload.decode()?;
        let request = ActionRequest::parse(action, &payload)?;
        *data_source = Some(request.target.data_source.clone());
        let engine = self.registry.resolve(&request.target.data_source).await?;
        debug!(
            action = action.name(),
            data_source = %request.target.data_source,
            database = %request.target.database,
            access = %permissions,
            "Dispatching action"
        );

        Ok(execute(&engine, request).await?.to_json())
    }
}

/// Map a request to its single database operation
pub async fn execute(engine: &StorageEngine, request: ActionRequest) -> Result<ResultEnvelope> {
    let target = request.target;
    let envelope = match request.operation {
        Operation::Find {
            collection,
            filter,
            options,
        } => ResultEnvelope::Documents(
            engine
                .find(&target.namespace(&collection), filter, &options)
                .await?,
        ),
        Operation::FindOne {
            collection,
            filter,
            options,
        } => ResultEnvelope::Document(
            engine
                .find_one(&target.namespace(&collection), filter, &options)
                .await?,
        ),
        Operation::InsertOne {
            collection,
            document,
        } => ResultEnvelope::InsertedId(
            engine
                .insert_one(&target.namespace(&collection), document)
                .await?,
        ),
        Operation::InsertMany {
            collection,
            documents,
        } => ResultEnvelope::InsertedIds(
            engine
                .insert_many(&target.namespace(&collection), documents)
                .await?,
        ),
        Operation::UpdateOne {
            collection,
            filter,
            update,
            upsert,
        } => ResultEnvelope::Updated(
            engine
                .update_one(&target.namespace(&collection), filter, update, upsert)
                .await?,
        ),
        Operation::UpdateMany {
            collection,
            filter,
            update,
            upsert,
        } => ResultEnvelope::Updated(
            engine
                .update_many(&target.namespace(&collection), filter, update, upsert)
                .await?,
        ),
        Operation::ReplaceOne {
            collection,
            filter,
            replacement,
            upsert,
        } => ResultEnvelope::Updated(
            engine
                .replace_one(&target.namespace(&collection), filter, replacement, upsert)
                .await?,
        ),
        Operation::DeleteOne { collection, filter } => ResultEnvelope::Deleted(
            engine
                .delete_one(&target.namespace(&collection), filter)
                .await?,
        ),
        Operation::DeleteMany { collection, filter } => ResultEnvelope::Deleted(
            engine
                .delete_many(&target.namespace(&collection), filter)
                .await?,
        ),
        Operation::Aggregate {
            collection,
            pipeline,
        } => ResultEnvelope::Documents(
            engine
                .aggregate(&target.namespace(&collection), pipeline)
                .await?,
        ),
        Operation::CountDocuments { collection, filter } => ResultEnvelope::Count(
            engine
                .count_documents(&target.namespace(&collection), filter)
                .await?,
        ),
        Operation::EstimatedDocumentCount { collection } => ResultEnvelope::Count(
            engine
                .estimated_document_count(&target.namespace(&collection))
                .await?,
        ),
        Operation::Distinct {
            collection,
            key,
            filter,
        } => ResultEnvelope::Values(
            engine
                .distinct(&target.namespace(&collection), &key, filter)
                .await?,
        ),
        Operation::ListCollections => {
            ResultEnvelope::Collections(engine.list_collections(&target.database).await?)
        }
        Operation::ListDatabases => ResultEnvelope::Databases(engine.list_databases().await?),
    };
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn dispatcher() -> ActionDispatcher {
        let mut clusters = BTreeMap::new();
        clusters.insert("logs".to_string(), "memory://logs".to_string());
        ActionDispatcher::new(
            Arc::new(ClusterRegistry::new(clusters)),
            AuthGate::new(Some("ro".to_string()), Some("rw".to_string())),
            Arc::new(Metrics::new()),
            Arc::new(SlowActionLog::new(Duration::from_secs(60))),
        )
    }

    #[test]
    fn test_envelope_shapes() {
        let value = ResultEnvelope::Document(None).to_json();
        assert_eq!(value, json!({ "document": null }));

        let value = ResultEnvelope::Count(3).to_json();
        assert_eq!(value, json!({ "count": 3 }));

        let value = ResultEnvelope::Updated(UpdateOutcome {
            matched_count: 1,
            modified_count: 0,
            upserted_id: None,
        })
        .to_json();
        assert_eq!(value, json!({ "matchedCount": 1, "modifiedCount": 0 }));

        let value = ResultEnvelope::Databases(vec![DatabaseInfo {
            name: "app".to_string(),
            empty: false,
        }])
        .to_json();
        assert_eq!(value, json!({ "databases": [{ "name": "app", "empty": false }] }));
    }

    #[tokio::test]
    async fn test_read_only_key_cannot_write() {
        let dispatcher = dispatcher();
        let payload = json!({ "dataSource": "logs", "database": "app", "collection": "c", "document": {} });
        let err = dispatcher
            .dispatch(Some("ro"), "insertOne", &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, DataApiError::Unauthorized));
        assert_eq!(dispatcher.registry().connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_credential_checked_before_action_name() {
        let dispatcher = dispatcher();
        let err = dispatcher.dispatch(None, "drop", &json!({})).await.unwrap_err();
        assert!(matches!(err, DataApiError::MissingCredential));

        let err = dispatcher
            .dispatch(Some("ro"), "drop", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DataApiError::UnknownAction(_)));
        assert_eq!(dispatcher.metrics().actions.snapshot()["unknown"].errors, 2);
    }

    #[tokio::test]
    async fn test_insert_then_find() {
        let dispatcher = dispatcher();
        let base = json!({ "dataSource": "logs", "database": "app", "collection": "events" });

        let mut insert = base.clone();
        insert["document"] = json!({ "_id": 7, "level": "warn" });
        let inserted = dispatcher.dispatch(Some("rw"), "insertOne", &insert).await.unwrap();
        assert_eq!(inserted, json!({ "insertedId": 7 }));

        let found = dispatcher.dispatch(Some("ro"), "find", &base).await.unwrap();
        assert_eq!(found, json!({ "documents": [{ "_id": 7, "level": "warn" }] }));

        let mut one = base.clone();
        one["filter"] = json!({ "level": "error" });
        let found = dispatcher.dispatch(Some("ro"), "findOne", &one).await.unwrap();
        assert_eq!(found, json!({ "document": null }));

        let stats = dispatcher.metrics().actions.snapshot();
        assert_eq!(stats["insertOne"].calls, 1);
        assert_eq!(stats["find"].calls, 1);
    }

    #[tokio::test]
    async fn test_unknown_cluster_after_validation() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(Some("ro"), "find", &json!({ "dataSource": "nope", "database": "app" }))
            .await
            .unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("collection")));

        let err = dispatcher
            .dispatch(
                Some("ro"),
                "find",
                &json!({ "dataSource": "nope", "database": "app", "collection": "c" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataApiError::UnknownCluster(name) if name == "nope"));
    }
}
