//! Typed action requests.
//!
//! A payload is parsed into exactly one [`Operation`] variant carrying the
//! fields that action needs, so the dispatcher never inspects loose JSON.
//! Required fields are checked in a fixed order: `dataSource`, `database`,
//! `collection` (except for database-scoped actions), then the fields of
//! the action itself.

use super::Action;
use crate::codec;
use crate::error::{DataApiError, Result};
use crate::storage::{Namespace, OperationOptions, UpdateSpec, DEFAULT_LIMIT};
use bson::{Bson, Document};
use bytes::Bytes;
use serde_json::{json, Map, Value};

/// Cluster and database a request is addressed to
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub data_source: String,
    pub database: String,
}

impl Target {
    pub fn namespace(&self, collection: &str) -> Namespace {
        Namespace::new(self.database.clone(), collection)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Find {
        collection: String,
        filter: Document,
        options: OperationOptions,
    },
    FindOne {
        collection: String,
        filter: Document,
        options: OperationOptions,
    },
    InsertOne {
        collection: String,
        document: Document,
    },
    InsertMany {
        collection: String,
        documents: Vec<Document>,
    },
    UpdateOne {
        collection: String,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    },
    UpdateMany {
        collection: String,
        filter: Document,
        update: UpdateSpec,
        upsert: bool,
    },
    ReplaceOne {
        collection: String,
        filter: Document,
        replacement: Document,
        upsert: bool,
    },
    DeleteOne {
        collection: String,
        filter: Document,
    },
    DeleteMany {
        collection: String,
        filter: Document,
    },
    Aggregate {
        collection: String,
        pipeline: Vec<Document>,
    },
    CountDocuments {
        collection: String,
        filter: Document,
    },
    EstimatedDocumentCount {
        collection: String,
    },
    Distinct {
        collection: String,
        key: String,
        filter: Document,
    },
    ListCollections,
    ListDatabases,
}

/// One validated call
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub target: Target,
    pub operation: Operation,
}

/// Payload as received, decoded only after the caller has been authorized
#[derive(Debug, Clone)]
pub enum Payload {
    /// Already structured, e.g. built from a query string
    Value(Value),
    /// Raw JSON request body
    Body(Bytes),
}

impl Payload {
    /// Decode into a JSON value. An empty body is an empty payload.
    pub fn decode(self) -> Result<Value> {
        match self {
            Payload::Value(value) => Ok(value),
            Payload::Body(body) if body.iter().all(u8::is_ascii_whitespace) => Ok(json!({})),
            Payload::Body(body) => serde_json::from_slice(&body).map_err(|e| {
                DataApiError::InvalidPayload(format!("request body is not valid JSON: {}", e))
            }),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<&Value> for Payload {
    fn from(value: &Value) -> Self {
        Payload::Value(value.clone())
    }
}

impl From<Bytes> for Payload {
    fn from(body: Bytes) -> Self {
        Payload::Body(body)
    }
}

impl ActionRequest {
    pub fn parse(action: Action, payload: &Value) -> Result<Self> {
        let fields = payload.as_object().ok_or_else(|| {
            DataApiError::InvalidPayload("payload must be a JSON object".to_string())
        })?;

        let target = Target {
            data_source: required_str(fields, "dataSource")?,
            database: required_str(fields, "database")?,
        };
        let collection = || required_str(fields, "collection");

        let operation = match action {
            Action::Find => Operation::Find {
                collection: collection()?,
                filter: filter(fields)?,
                options: operation_options(fields)?,
            },
            Action::FindOne => Operation::FindOne {
                collection: collection()?,
                filter: filter(fields)?,
                options: operation_options(fields)?,
            },
            Action::InsertOne => Operation::InsertOne {
                collection: collection()?,
                document: required_document(fields, "document")?,
            },
            Action::InsertMany => Operation::InsertMany {
                collection: collection()?,
                documents: non_empty(document_list(fields, "documents")?, "documents")?,
            },
            Action::UpdateOne => Operation::UpdateOne {
                collection: collection()?,
                filter: filter(fields)?,
                update: update(fields)?,
                upsert: flag(fields, "upsert")?,
            },
            Action::UpdateMany => Operation::UpdateMany {
                collection: collection()?,
                filter: filter(fields)?,
                update: update(fields)?,
                upsert: flag(fields, "upsert")?,
            },
            Action::ReplaceOne => Operation::ReplaceOne {
                collection: collection()?,
                filter: filter(fields)?,
                replacement: required_document(fields, "document")?,
                upsert: flag(fields, "upsert")?,
            },
            Action::DeleteOne => Operation::DeleteOne {
                collection: collection()?,
                filter: filter(fields)?,
            },
            Action::DeleteMany => Operation::DeleteMany {
                collection: collection()?,
                filter: filter(fields)?,
            },
            Action::Aggregate => Operation::Aggregate {
                collection: collection()?,
                pipeline: match present(fields, "pipeline") {
                    Some(_) => document_list(fields, "pipeline")?,
                    None => Vec::new(),
                },
            },
            Action::CountDocuments => Operation::CountDocuments {
                collection: collection()?,
                filter: filter(fields)?,
            },
            Action::EstimatedDocumentCount => Operation::EstimatedDocumentCount {
                collection: collection()?,
            },
            Action::Distinct => Operation::Distinct {
                collection: collection()?,
                key: required_str(fields, "key")?,
                filter: filter(fields)?,
            },
            Action::ListCollections => Operation::ListCollections,
            Action::ListDatabases => Operation::ListDatabases,
        };

        Ok(Self { target, operation })
    }
}

fn present<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    fields.get(name).filter(|v| !v.is_null())
}

fn required_str(fields: &Map<String, Value>, name: &'static str) -> Result<String> {
    match present(fields, name) {
        None => Err(DataApiError::MissingField(name)),
        Some(Value::String(s)) if s.is_empty() => Err(DataApiError::MissingField(name)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(DataApiError::InvalidField(name, "expected a string".to_string())),
    }
}

fn optional_document(fields: &Map<String, Value>, name: &'static str) -> Result<Option<Document>> {
    match present(fields, name) {
        None => Ok(None),
        Some(value @ Value::Object(_)) => codec::decode_document(value).map(Some),
        Some(_) => Err(DataApiError::InvalidField(name, "expected an object".to_string())),
    }
}

fn required_document(fields: &Map<String, Value>, name: &'static str) -> Result<Document> {
    optional_document(fields, name)?.ok_or(DataApiError::MissingField(name))
}

fn filter(fields: &Map<String, Value>) -> Result<Document> {
    Ok(optional_document(fields, "filter")?.unwrap_or_default())
}

fn document_list(fields: &Map<String, Value>, name: &'static str) -> Result<Vec<Document>> {
    let items = match present(fields, name) {
        None => return Err(DataApiError::MissingField(name)),
        Some(Value::Array(items)) => items,
        // Query-string payloads turn `documents[0][a]=1` into an index-keyed object
        Some(Value::Object(map)) if map.keys().all(|k| k.parse::<usize>().is_ok()) => {
            return document_list_from_indexed(map, name)
        }
        Some(_) => {
            return Err(DataApiError::InvalidField(
                name,
                "expected an array of objects".to_string(),
            ))
        }
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(_) => codec::decode_document(item),
            _ => Err(DataApiError::InvalidField(
                name,
                "expected an array of objects".to_string(),
            )),
        })
        .collect()
}

fn non_empty(items: Vec<Document>, name: &'static str) -> Result<Vec<Document>> {
    if items.is_empty() {
        return Err(DataApiError::InvalidField(name, "must not be empty".to_string()));
    }
    Ok(items)
}

fn document_list_from_indexed(map: &Map<String, Value>, name: &'static str) -> Result<Vec<Document>> {
    let mut indexed: Vec<(usize, &Value)> = map
        .iter()
        .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, v)))
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    let items = Value::Array(indexed.into_iter().map(|(_, v)| v.clone()).collect());
    let mut single = Map::new();
    single.insert(name.to_string(), items);
    document_list(&single, name)
}

fn update(fields: &Map<String, Value>) -> Result<UpdateSpec> {
    match present(fields, "update") {
        None => Err(DataApiError::MissingField("update")),
        Some(Value::Array(_)) => Ok(UpdateSpec::Pipeline(document_list(fields, "update")?)),
        Some(value @ Value::Object(_)) => Ok(UpdateSpec::Document(codec::decode_document(value)?)),
        Some(_) => Err(DataApiError::InvalidField(
            "update",
            "expected an object or a pipeline array".to_string(),
        )),
    }
}

fn flag(fields: &Map<String, Value>, name: &'static str) -> Result<bool> {
    match present(fields, name) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s == "true" => Ok(true),
        Some(Value::String(s)) if s == "false" => Ok(false),
        Some(_) => Err(DataApiError::InvalidField(name, "expected a boolean".to_string())),
    }
}

/// Non-negative integer, accepting numeric strings from query-string payloads
fn count(fields: &Map<String, Value>, name: &'static str) -> Result<Option<u64>> {
    let invalid = || DataApiError::InvalidField(name, "expected a non-negative integer".to_string());
    match present(fields, name) {
        None => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Ok(Some(v)),
            // `10.0` from clients that only emit floats
            None => n
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| Some(f as u64))
                .ok_or_else(invalid),
        },
        Some(Value::String(s)) => s.trim().parse::<u64>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

/// Turn `"1"` / `"-1"` values (query-string payloads) into integers
fn coerce_numeric_strings(doc: Document) -> Document {
    doc.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Bson::String(s) => match s.trim().parse::<i32>() {
                    Ok(n) => Bson::Int32(n),
                    Err(_) => Bson::String(s),
                },
                other => other,
            };
            (key, value)
        })
        .collect()
}

fn non_empty_spec(fields: &Map<String, Value>, name: &'static str) -> Result<Option<Document>> {
    Ok(optional_document(fields, name)?
        .filter(|doc| !doc.is_empty())
        .map(coerce_numeric_strings))
}

/// Build query options, keeping only fields that are present and non-empty
pub fn operation_options(fields: &Map<String, Value>) -> Result<OperationOptions> {
    let limit = match count(fields, "limit")? {
        None | Some(0) => DEFAULT_LIMIT,
        Some(n) => i64::try_from(n).map_err(|_| {
            DataApiError::InvalidField("limit", "value is too large".to_string())
        })?,
    };

    Ok(OperationOptions {
        sort: non_empty_spec(fields, "sort")?,
        limit,
        skip: count(fields, "skip")?.filter(|n| *n > 0),
        projection: non_empty_spec(fields, "projection")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, DateTime};
    use serde_json::json;

    fn parse(action: Action, payload: Value) -> Result<ActionRequest> {
        ActionRequest::parse(action, &payload)
    }

    #[test]
    fn test_required_field_order() {
        let err = parse(Action::Find, json!({})).unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("dataSource")));

        let err = parse(Action::Find, json!({ "dataSource": "logs" })).unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("database")));

        let err = parse(Action::Find, json!({ "dataSource": "logs", "database": "app" })).unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("collection")));

        // Empty strings count as missing
        let err = parse(Action::Find, json!({ "dataSource": "", "database": "" })).unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("dataSource")));
    }

    #[test]
    fn test_database_scoped_skip_collection() {
        let request = parse(
            Action::ListDatabases,
            json!({ "dataSource": "logs", "database": "app" }),
        )
        .unwrap();
        assert_eq!(request.operation, Operation::ListDatabases);

        let request = parse(
            Action::ListCollections,
            json!({ "dataSource": "logs", "database": "app" }),
        )
        .unwrap();
        assert_eq!(request.target.database, "app");
    }

    #[test]
    fn test_find_options() {
        let request = parse(
            Action::Find,
            json!({
                "dataSource": "logs",
                "database": "app",
                "collection": "events",
                "filter": { "createdAt": { "$date": "2024-01-01T00:00:00Z" } },
                "sort": { "createdAt": -1 },
                "limit": 10,
                "skip": 0,
                "projection": {}
            }),
        )
        .unwrap();

        let Operation::Find { collection, filter, options } = request.operation else {
            panic!("expected find");
        };
        assert_eq!(collection, "events");
        assert_eq!(
            filter,
            doc! { "createdAt": DateTime::from_millis(1_704_067_200_000) }
        );
        assert_eq!(
            options,
            OperationOptions {
                sort: Some(doc! { "createdAt": -1 }),
                limit: 10,
                skip: None,
                projection: None,
            }
        );
    }

    #[test]
    fn test_default_limit() {
        let fields = json!({ "limit": 0 });
        let options = operation_options(fields.as_object().unwrap()).unwrap();
        assert_eq!(options.limit, 1000);

        let fields = json!({});
        assert_eq!(operation_options(fields.as_object().unwrap()).unwrap(), OperationOptions::default());
    }

    #[test]
    fn test_query_string_values_coerced() {
        let fields = json!({ "limit": "5", "skip": "2", "sort": { "n": "-1" }, "projection": { "a": "1" } });
        let options = operation_options(fields.as_object().unwrap()).unwrap();
        assert_eq!(options.limit, 5);
        assert_eq!(options.skip, Some(2));
        assert_eq!(options.sort, Some(doc! { "n": -1 }));
        assert_eq!(options.projection, Some(doc! { "a": 1 }));

        let fields = json!({ "limit": "ten" });
        assert!(matches!(
            operation_options(fields.as_object().unwrap()),
            Err(DataApiError::InvalidField("limit", _))
        ));
        let fields = json!({ "skip": -3 });
        assert!(operation_options(fields.as_object().unwrap()).is_err());

        let fields = json!({ "limit": 10.0, "skip": 2.0 });
        let options = operation_options(fields.as_object().unwrap()).unwrap();
        assert_eq!(options.limit, 10);
        assert_eq!(options.skip, Some(2));

        let fields = json!({ "limit": 2.5 });
        assert!(matches!(
            operation_options(fields.as_object().unwrap()),
            Err(DataApiError::InvalidField("limit", _))
        ));
        let fields = json!({ "skip": -1.0 });
        assert!(operation_options(fields.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_write_payloads() {
        let base = json!({ "dataSource": "d", "database": "db", "collection": "c" });
        let with = |extra: Value| {
            let mut payload = base.clone();
            for (k, v) in extra.as_object().unwrap() {
                payload[k] = v.clone();
            }
            payload
        };

        let err = parse(Action::InsertOne, base.clone()).unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("document")));

        let request = parse(Action::InsertOne, with(json!({ "document": { "a": 1 } }))).unwrap();
        assert!(matches!(request.operation, Operation::InsertOne { ref document, .. } if document == &doc! { "a": 1 }));

        let err = parse(Action::InsertMany, with(json!({ "documents": [] }))).unwrap_err();
        assert!(matches!(err, DataApiError::InvalidField("documents", _)));

        let request = parse(
            Action::UpdateMany,
            with(json!({ "update": [{ "$set": { "a": 1 } }], "upsert": "true" })),
        )
        .unwrap();
        assert!(matches!(
            request.operation,
            Operation::UpdateMany { update: UpdateSpec::Pipeline(_), upsert: true, .. }
        ));

        let err = parse(Action::UpdateOne, with(json!({ "update": 5 }))).unwrap_err();
        assert!(matches!(err, DataApiError::InvalidField("update", _)));

        let err = parse(Action::Distinct, with(json!({ "filter": { "a": 1 } }))).unwrap_err();
        assert!(matches!(err, DataApiError::MissingField("key")));

        // Missing and empty pipelines both select every document
        for payload in [base.clone(), with(json!({ "pipeline": [] }))] {
            let request = parse(Action::Aggregate, payload).unwrap();
            assert!(matches!(
                request.operation,
                Operation::Aggregate { ref pipeline, .. } if pipeline.is_empty()
            ));
        }

        let err = parse(Action::Aggregate, with(json!({ "pipeline": {"$match": {}} }))).unwrap_err();
        assert!(matches!(err, DataApiError::InvalidField("pipeline", _)));
    }

    #[test]
    fn test_indexed_documents_from_query_string() {
        let payload = json!({
            "dataSource": "d", "database": "db", "collection": "c",
            "documents": { "1": { "n": "b" }, "0": { "n": "a" } }
        });
        let request = parse(Action::InsertMany, payload).unwrap();
        let Operation::InsertMany { documents, .. } = request.operation else {
            panic!("expected insertMany");
        };
        assert_eq!(documents, vec![doc! { "n": "a" }, doc! { "n": "b" }]);
    }

    #[test]
    fn test_malformed_filter() {
        let payload = json!({
            "dataSource": "d", "database": "db", "collection": "c",
            "filter": { "when": { "$date": "yesterday" } }
        });
        assert!(matches!(
            parse(Action::Find, payload),
            Err(DataApiError::MalformedExtendedValue(_))
        ));
    }

    #[test]
    fn test_raw_body_decoding() {
        let decode = |raw: &'static [u8]| Payload::from(Bytes::from_static(raw)).decode();
        assert_eq!(decode(b"").unwrap(), json!({}));
        assert_eq!(decode(b"  \n").unwrap(), json!({}));
        assert_eq!(decode(br#"{"a":1}"#).unwrap(), json!({ "a": 1 }));
        assert!(matches!(decode(b"{not json"), Err(DataApiError::InvalidPayload(_))));

        let value = Payload::from(json!([1])).decode().unwrap();
        assert_eq!(value, json!([1]));
    }

    #[test]
    fn test_non_object_payload() {
        assert!(matches!(
            parse(Action::Find, json!([1, 2])),
            Err(DataApiError::InvalidPayload(_))
        ));
        let err = parse(Action::Find, json!({ "dataSource": 7 })).unwrap_err();
        assert!(matches!(err, DataApiError::InvalidField("dataSource", _)));
    }
}
