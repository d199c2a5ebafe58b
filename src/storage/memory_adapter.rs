use super::query::{
    apply_update, is_operator_update, lookup, matches, project, sort_documents, upsert_seed,
    values_equal,
};
use super::{
    count_value, CollectionInfo, DatabaseInfo, DeleteOutcome, Namespace, OperationOptions,
    UpdateOutcome, UpdateSpec,
};
use crate::error::{DataApiError, Result};
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Collection name to documents, in insertion order
type Collections = BTreeMap<String, Vec<Document>>;

/// In-process document store.
///
/// Databases and collections are created implicitly by the first write.
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    databases: Arc<RwLock<BTreeMap<String, Collections>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Collections>>> {
        self.databases
            .read()
            .map_err(|e| DataApiError::Backend(format!("Lock error: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Collections>>> {
        self.databases
            .write()
            .map_err(|e| DataApiError::Backend(format!("Lock error: {}", e)))
    }

    /// Matching documents, cloned, in insertion order
    fn matching(&self, ns: &Namespace, filter: &Document) -> Result<Vec<Document>> {
        let dbs = self.read()?;
        let Some(docs) = dbs.get(&ns.database).and_then(|c| c.get(&ns.collection)) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for doc in docs {
            if matches(doc, filter)? {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }

    fn with_id(document: Document) -> Document {
        if document.contains_key("_id") {
            return document;
        }
        let mut with_id = doc! { "_id": ObjectId::new() };
        with_id.extend(document);
        with_id
    }

    fn duplicate_key(ns: &Namespace, id: &Bson) -> DataApiError {
        DataApiError::Backend(format!(
            "E11000 duplicate key error collection: {} index: _id_ dup key: {{ _id: {} }}",
            ns, id
        ))
    }

    fn contains_id(docs: &[Document], id: &Bson) -> bool {
        docs.iter()
            .any(|d| d.get("_id").is_some_and(|existing| values_equal(existing, id)))
    }

    pub fn find(
        &self,
        ns: &Namespace,
        filter: &Document,
        options: &OperationOptions,
    ) -> Result<Vec<Document>> {
        let mut docs = self.matching(ns, filter)?;
        if let Some(sort) = &options.sort {
            sort_documents(&mut docs, sort)?;
        }

        let skip = options.skip.unwrap_or(0) as usize;
        // A zero limit means no limit, a negative one is treated like its magnitude
        let limit = match options.limit.unsigned_abs() {
            0 => usize::MAX,
            n => n as usize,
        };

        Ok(docs
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| match &options.projection {
                Some(projection) => project(&doc, projection),
                None => doc,
            })
            .collect())
    }

    pub fn find_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        options: &OperationOptions,
    ) -> Result<Option<Document>> {
        let single = OperationOptions {
            limit: 1,
            ..options.clone()
        };
        Ok(self.find(ns, filter, &single)?.into_iter().next())
    }

    pub fn insert_one(&self, ns: &Namespace, document: Document) -> Result<Bson> {
        Ok(self.insert_many(ns, vec![document])?.remove(0))
    }

    /// Insert all documents or none of them
    pub fn insert_many(&self, ns: &Namespace, documents: Vec<Document>) -> Result<Vec<Bson>> {
        let documents: Vec<Document> = documents.into_iter().map(Self::with_id).collect();

        let mut dbs = self.write()?;
        let docs = dbs
            .entry(ns.database.clone())
            .or_default()
            .entry(ns.collection.clone())
            .or_default();

        let mut ids: Vec<Bson> = Vec::with_capacity(documents.len());
        for document in &documents {
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            if Self::contains_id(docs, &id) || ids.iter().any(|seen| values_equal(seen, &id)) {
                return Err(Self::duplicate_key(ns, &id));
            }
            ids.push(id);
        }

        docs.extend(documents);
        Ok(ids)
    }

    pub fn update(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &UpdateSpec,
        upsert: bool,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        let UpdateSpec::Document(update) = update else {
            return Err(DataApiError::Backend(
                "pipeline updates are not supported by the memory engine".to_string(),
            ));
        };
        if !is_operator_update(update) {
            return Err(DataApiError::Backend(
                "update document requires atomic operators".to_string(),
            ));
        }

        let mut outcome = UpdateOutcome::default();
        let mut dbs = self.write()?;

        if let Some(docs) = dbs
            .get_mut(&ns.database)
            .and_then(|c| c.get_mut(&ns.collection))
        {
            for doc in docs.iter_mut() {
                if !matches(doc, filter)? {
                    continue;
                }
                outcome.matched_count += 1;

                let mut next = doc.clone();
                apply_update(&mut next, update)?;
                if next != *doc {
                    *doc = next;
                    outcome.modified_count += 1;
                }
                if !multi {
                    break;
                }
            }
        }

        if outcome.matched_count == 0 && upsert {
            let mut seed = upsert_seed(filter)?;
            apply_update(&mut seed, update)?;
            let seed = Self::with_id(seed);
            let id = seed.get("_id").cloned().unwrap_or(Bson::Null);

            let docs = dbs
                .entry(ns.database.clone())
                .or_default()
                .entry(ns.collection.clone())
                .or_default();
            if Self::contains_id(docs, &id) {
                return Err(Self::duplicate_key(ns, &id));
            }
            docs.push(seed);
            outcome.upserted_id = Some(id);
        }

        Ok(outcome)
    }

    pub fn replace_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        if is_operator_update(&replacement) {
            return Err(DataApiError::Backend(
                "replacement document must not contain atomic operators".to_string(),
            ));
        }

        let mut outcome = UpdateOutcome::default();
        let mut dbs = self.write()?;

        if let Some(docs) = dbs
            .get_mut(&ns.database)
            .and_then(|c| c.get_mut(&ns.collection))
        {
            for doc in docs.iter_mut() {
                if !matches(doc, filter)? {
                    continue;
                }
                outcome.matched_count = 1;

                let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
                if let Some(new_id) = replacement.get("_id") {
                    if !values_equal(new_id, &id) {
                        return Err(DataApiError::Backend(
                            "the (immutable) field '_id' was found to have been altered"
                                .to_string(),
                        ));
                    }
                }

                let mut next = doc! { "_id": id };
                next.extend(replacement.clone());
                if next != *doc {
                    *doc = next;
                    outcome.modified_count = 1;
                }
                break;
            }
        }

        if outcome.matched_count == 0 && upsert {
            let mut seed = replacement;
            if !seed.contains_key("_id") {
                if let Some(id) = upsert_seed(filter)?.get("_id") {
                    let mut with_filter_id = doc! { "_id": id.clone() };
                    with_filter_id.extend(seed);
                    seed = with_filter_id;
                }
            }
            let seed = Self::with_id(seed);
            let id = seed.get("_id").cloned().unwrap_or(Bson::Null);

            let docs = dbs
                .entry(ns.database.clone())
                .or_default()
                .entry(ns.collection.clone())
                .or_default();
            if Self::contains_id(docs, &id) {
                return Err(Self::duplicate_key(ns, &id));
            }
            docs.push(seed);
            outcome.upserted_id = Some(id);
        }

        Ok(outcome)
    }

    pub fn delete(&self, ns: &Namespace, filter: &Document, multi: bool) -> Result<DeleteOutcome> {
        let mut dbs = self.write()?;
        let Some(docs) = dbs
            .get_mut(&ns.database)
            .and_then(|c| c.get_mut(&ns.collection))
        else {
            return Ok(DeleteOutcome::default());
        };

        let mut doomed = Vec::new();
        for (index, doc) in docs.iter().enumerate() {
            if matches(doc, filter)? {
                doomed.push(index);
                if !multi {
                    break;
                }
            }
        }

        for index in doomed.iter().rev() {
            docs.remove(*index);
        }

        Ok(DeleteOutcome {
            deleted_count: doomed.len() as u64,
        })
    }

    pub fn aggregate(&self, ns: &Namespace, pipeline: &[Document]) -> Result<Vec<Document>> {
        let mut docs = self.matching(ns, &Document::new())?;

        for stage in pipeline {
            let Some((name, spec)) = stage.iter().next().filter(|_| stage.len() == 1) else {
                return Err(DataApiError::Backend(
                    "A pipeline stage specification object must contain exactly one field."
                        .to_string(),
                ));
            };

            match name.as_str() {
                "$match" => {
                    let filter = stage_document(name, spec)?;
                    let mut kept = Vec::with_capacity(docs.len());
                    for doc in docs {
                        if matches(&doc, filter)? {
                            kept.push(doc);
                        }
                    }
                    docs = kept;
                }
                "$sort" => sort_documents(&mut docs, stage_document(name, spec)?)?,
                "$skip" => {
                    let n = stage_count(name, spec)?;
                    docs = docs.into_iter().skip(n).collect();
                }
                "$limit" => {
                    let n = stage_count(name, spec)?;
                    docs.truncate(n);
                }
                "$project" => {
                    let projection = stage_document(name, spec)?;
                    docs = docs.iter().map(|doc| project(doc, projection)).collect();
                }
                "$count" => {
                    let Bson::String(field) = spec else {
                        return Err(DataApiError::Backend(
                            "the count field must be a string".to_string(),
                        ));
                    };
                    docs = if docs.is_empty() {
                        Vec::new()
                    } else {
                        let mut counted = Document::new();
                        counted.insert(field.clone(), count_value(docs.len() as u64));
                        vec![counted]
                    };
                }
                other => {
                    return Err(DataApiError::Backend(format!(
                        "Unrecognized pipeline stage name: '{}'",
                        other
                    )))
                }
            }
        }

        Ok(docs)
    }

    pub fn count_documents(&self, ns: &Namespace, filter: &Document) -> Result<u64> {
        Ok(self.matching(ns, filter)?.len() as u64)
    }

    pub fn estimated_document_count(&self, ns: &Namespace) -> Result<u64> {
        let dbs = self.read()?;
        Ok(dbs
            .get(&ns.database)
            .and_then(|c| c.get(&ns.collection))
            .map_or(0, |docs| docs.len() as u64))
    }

    pub fn distinct(&self, ns: &Namespace, key: &str, filter: &Document) -> Result<Vec<Bson>> {
        let mut values: Vec<Bson> = Vec::new();
        let mut remember = |value: &Bson| {
            if !values.iter().any(|seen| values_equal(seen, value)) {
                values.push(value.clone());
            }
        };

        for doc in self.matching(ns, filter)? {
            match lookup(&doc, key) {
                Some(Bson::Array(items)) => items.iter().for_each(&mut remember),
                Some(value) => remember(value),
                None => {}
            }
        }
        Ok(values)
    }

    pub fn list_collections(&self, database: &str) -> Result<Vec<CollectionInfo>> {
        let dbs = self.read()?;
        Ok(dbs
            .get(database)
            .map(|collections| {
                collections
                    .keys()
                    .map(|name| CollectionInfo {
                        name: name.clone(),
                        kind: "collection".to_string(),
                        options: Document::new(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn list_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let dbs = self.read()?;
        Ok(dbs
            .iter()
            .map(|(name, collections)| DatabaseInfo {
                name: name.clone(),
                empty: collections.values().all(Vec::is_empty),
            })
            .collect())
    }
}

fn stage_document<'a>(name: &str, spec: &'a Bson) -> Result<&'a Document> {
    match spec {
        Bson::Document(doc) => Ok(doc),
        _ => Err(DataApiError::Backend(format!(
            "the {} stage specification must be an object",
            name
        ))),
    }
}

fn stage_count(name: &str, spec: &Bson) -> Result<usize> {
    let n = match spec {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(f) if f.fract() == 0.0 => *f as i64,
        _ => -1,
    };
    usize::try_from(n).map_err(|_| {
        DataApiError::Backend(format!("invalid argument to {} stage: {}", name, spec))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("app", "events")
    }

    fn seeded() -> MemoryAdapter {
        let store = MemoryAdapter::new();
        store
            .insert_many(
                &ns(),
                vec![
                    doc! { "_id": 1, "kind": "click", "n": 3, "tags": ["a", "b"] },
                    doc! { "_id": 2, "kind": "view", "n": 1, "tags": ["b"] },
                    doc! { "_id": 3, "kind": "click", "n": 2 },
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_find_with_options() {
        let store = seeded();
        let options = OperationOptions {
            sort: Some(doc! { "n": -1 }),
            limit: 2,
            skip: Some(1),
            projection: Some(doc! { "n": 1, "_id": 0 }),
        };
        let docs = store.find(&ns(), &doc! {}, &options).unwrap();
        assert_eq!(docs, vec![doc! { "n": 2 }, doc! { "n": 1 }]);
    }

    #[test]
    fn test_find_unknown_collection_is_empty() {
        let store = seeded();
        let missing = Namespace::new("app", "nope");
        assert!(store
            .find(&missing, &doc! {}, &OperationOptions::default())
            .unwrap()
            .is_empty());
        assert_eq!(store.estimated_document_count(&missing).unwrap(), 0);
    }

    #[test]
    fn test_insert_generates_id_first() {
        let store = MemoryAdapter::new();
        let id = store.insert_one(&ns(), doc! { "a": 1 }).unwrap();
        assert!(matches!(id, Bson::ObjectId(_)));

        let found = store
            .find_one(&ns(), &doc! { "a": 1 }, &OperationOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(found.keys().next().map(String::as_str), Some("_id"));
    }

    #[test]
    fn test_duplicate_id_rejected_atomically() {
        let store = seeded();
        let result = store.insert_many(&ns(), vec![doc! { "_id": 9 }, doc! { "_id": 1 }]);
        assert!(matches!(result, Err(DataApiError::Backend(msg)) if msg.starts_with("E11000")));
        assert_eq!(store.estimated_document_count(&ns()).unwrap(), 3);
    }

    #[test]
    fn test_update_one_and_many() {
        let store = seeded();
        let update = UpdateSpec::Document(doc! { "$inc": { "n": 10 } });

        let one = store
            .update(&ns(), &doc! { "kind": "click" }, &update, false, false)
            .unwrap();
        assert_eq!(one.matched_count, 1);
        assert_eq!(one.modified_count, 1);

        let many = store
            .update(&ns(), &doc! { "kind": "click" }, &update, false, true)
            .unwrap();
        assert_eq!(many.matched_count, 2);
        assert_eq!(store.count_documents(&ns(), &doc! { "n": { "$gte": 12 } }).unwrap(), 2);
    }

    #[test]
    fn test_update_noop_counts_match_only() {
        let store = seeded();
        let update = UpdateSpec::Document(doc! { "$set": { "kind": "view" } });
        let outcome = store
            .update(&ns(), &doc! { "_id": 2 }, &update, false, false)
            .unwrap();
        assert_eq!(outcome.matched_count, 1);
        assert_eq!(outcome.modified_count, 0);
    }

    #[test]
    fn test_upsert_inserts_seed() {
        let store = seeded();
        let update = UpdateSpec::Document(doc! { "$set": { "n": 7 } });
        let outcome = store
            .update(&ns(), &doc! { "kind": "scroll" }, &update, true, false)
            .unwrap();
        assert_eq!(outcome.matched_count, 0);
        assert!(outcome.upserted_id.is_some());

        let found = store
            .find_one(&ns(), &doc! { "kind": "scroll" }, &OperationOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(found.get_i32("n").unwrap(), 7);
    }

    #[test]
    fn test_pipeline_update_unsupported() {
        let store = seeded();
        let update = UpdateSpec::Pipeline(vec![doc! { "$set": { "n": 1 } }]);
        assert!(store.update(&ns(), &doc! {}, &update, false, true).is_err());
    }

    #[test]
    fn test_replace_keeps_id() {
        let store = seeded();
        let outcome = store
            .replace_one(&ns(), &doc! { "_id": 2 }, doc! { "kind": "hover" }, false)
            .unwrap();
        assert_eq!(outcome.modified_count, 1);

        let found = store
            .find_one(&ns(), &doc! { "_id": 2 }, &OperationOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(found, doc! { "_id": 2, "kind": "hover" });

        let altered = store.replace_one(&ns(), &doc! { "_id": 2 }, doc! { "_id": 5 }, false);
        assert!(altered.is_err());
        let operators =
            store.replace_one(&ns(), &doc! { "_id": 2 }, doc! { "$set": { "a": 1 } }, false);
        assert!(operators.is_err());
    }

    #[test]
    fn test_replace_upsert_uses_filter_id() {
        let store = seeded();
        let outcome = store
            .replace_one(&ns(), &doc! { "_id": 42 }, doc! { "kind": "new" }, true)
            .unwrap();
        assert_eq!(outcome.upserted_id, Some(Bson::Int32(42)));
    }

    #[test]
    fn test_delete_one_and_many() {
        let store = seeded();
        let one = store.delete(&ns(), &doc! { "kind": "click" }, false).unwrap();
        assert_eq!(one.deleted_count, 1);
        let many = store.delete(&ns(), &doc! {}, true).unwrap();
        assert_eq!(many.deleted_count, 2);
        assert_eq!(store.estimated_document_count(&ns()).unwrap(), 0);
    }

    #[test]
    fn test_aggregate_pipeline() {
        let store = seeded();
        let pipeline = vec![
            doc! { "$match": { "kind": "click" } },
            doc! { "$sort": { "n": 1 } },
            doc! { "$project": { "n": 1 } },
        ];
        let docs = store.aggregate(&ns(), &pipeline).unwrap();
        assert_eq!(docs, vec![doc! { "_id": 3, "n": 2 }, doc! { "_id": 1, "n": 3 }]);

        let counted = store
            .aggregate(&ns(), &[doc! { "$match": { "n": { "$gt": 1 } } }, doc! { "$count": "total" }])
            .unwrap();
        assert_eq!(counted, vec![doc! { "total": 2 }]);

        let everything = store.aggregate(&ns(), &[]).unwrap();
        assert_eq!(everything.len(), store.estimated_document_count(&ns()).unwrap() as usize);

        let unknown = store.aggregate(&ns(), &[doc! { "$lookup": {} }]);
        assert!(matches!(unknown, Err(DataApiError::Backend(msg)) if msg.contains("$lookup")));
    }

    #[test]
    fn test_distinct_flattens_arrays() {
        let store = seeded();
        let tags = store.distinct(&ns(), "tags", &doc! {}).unwrap();
        assert_eq!(tags, vec![Bson::from("a"), Bson::from("b")]);

        let kinds = store.distinct(&ns(), "kind", &doc! { "n": { "$lt": 3 } }).unwrap();
        assert_eq!(kinds, vec![Bson::from("view"), Bson::from("click")]);
    }

    #[test]
    fn test_list_collections_and_databases() {
        let store = seeded();
        store
            .insert_one(&Namespace::new("app", "users"), doc! { "name": "x" })
            .unwrap();

        let names: Vec<String> = store
            .list_collections("app")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["events", "users"]);
        assert!(store.list_collections("other").unwrap().is_empty());

        let dbs = store.list_databases().unwrap();
        assert_eq!(
            dbs,
            vec![DatabaseInfo {
                name: "app".to_string(),
                empty: false
            }]
        );
    }
}
