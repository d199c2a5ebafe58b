//! Document matching, ordering, projection and update evaluation used by
//! the in-memory engine. Covers the commonly used subset of the MongoDB
//! query language; anything else is reported as a backend error.

use crate::error::{DataApiError, Result};
use bson::{Bson, Document};
use std::cmp::Ordering;

fn unsupported(what: &str, name: &str) -> DataApiError {
    DataApiError::Backend(format!("unsupported {} '{}'", what, name))
}

/// Look up a dotted path such as `a.b.c`
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// BSON comparison order between type brackets
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(f64::from(*i)),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

/// Total order over BSON values following MongoDB's bracket ordering
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    let (rank_a, rank_b) = (type_rank(a), type_rank(b));
    if rank_a != rank_b {
        return rank_a.cmp(&rank_b);
    }
    match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Symbol(x), Bson::Symbol(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::Array(x), Bson::Array(y)) => compare_seq(x.iter(), y.iter()),
        (Bson::Document(x), Bson::Document(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = compare(va, vb).then_with(|| ka.cmp(kb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn compare_seq<'a>(
    mut x: impl Iterator<Item = &'a Bson>,
    mut y: impl Iterator<Item = &'a Bson>,
) -> Ordering {
    loop {
        match (x.next(), y.next()) {
            (Some(a), Some(b)) => {
                let ord = compare(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

/// Equality within the same type bracket (numbers compare across widths)
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b) && compare(a, b) == Ordering::Equal
}

/// Equality with array membership: `{tags: "x"}` matches `tags: ["x", "y"]`
fn field_equals(field: Option<&Bson>, operand: &Bson) -> bool {
    match field {
        None => matches!(operand, Bson::Null),
        Some(value @ Bson::Array(items)) => {
            values_equal(value, operand) || items.iter().any(|item| values_equal(item, operand))
        }
        Some(value) => values_equal(value, operand),
    }
}

fn field_compares(field: Option<&Bson>, operand: &Bson, accept: fn(Ordering) -> bool) -> bool {
    let check = |value: &Bson| {
        type_rank(value) == type_rank(operand) && accept(compare(value, operand))
    };
    match field {
        None => false,
        Some(Bson::Array(items)) => items.iter().any(check),
        Some(value) => check(value),
    }
}

fn is_operator_document(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(doc) if doc.keys().next().is_some_and(|k| k.starts_with('$')) => Some(doc),
        _ => None,
    }
}

/// Whether `doc` satisfies `filter`
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(condition, key)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(condition, key)? {
                    if matches(doc, clause)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            op if op.starts_with('$') => return Err(unsupported("query operator", op)),
            path => field_matches(lookup(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(condition: &'a Bson, op: &str) -> Result<Vec<&'a Document>> {
    let Bson::Array(items) = condition else {
        return Err(DataApiError::Backend(format!("{} must be an array", op)));
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(doc) => Ok(doc),
            _ => Err(DataApiError::Backend(format!(
                "{} entries must be documents",
                op
            ))),
        })
        .collect()
}

fn field_matches(field: Option<&Bson>, condition: &Bson) -> Result<bool> {
    let Some(ops) = is_operator_document(condition) else {
        return Ok(field_equals(field, condition));
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => field_equals(field, operand),
            "$ne" => !field_equals(field, operand),
            "$gt" => field_compares(field, operand, Ordering::is_gt),
            "$gte" => field_compares(field, operand, Ordering::is_ge),
            "$lt" => field_compares(field, operand, Ordering::is_lt),
            "$lte" => field_compares(field, operand, Ordering::is_le),
            "$in" => in_list(field, operand, op)?,
            other => return Err(unsupported("query operator", other)),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(field: Option<&Bson>, operand: &Bson, op: &str) -> Result<bool> {
    match operand {
        Bson::Array(candidates) => Ok(candidates.iter().any(|c| field_equals(field, c))),
        _ => Err(DataApiError::Backend(format!("{} needs an array", op))),
    }
}

/// Sort documents in place by a `{field: 1 | -1}` specification
pub fn sort_documents(docs: &mut [Document], spec: &Document) -> Result<()> {
    let mut keys = Vec::with_capacity(spec.len());
    for (path, direction) in spec {
        let ascending = match as_f64(direction) {
            Some(d) if d > 0.0 => true,
            Some(d) if d < 0.0 => false,
            _ => {
                return Err(DataApiError::Backend(format!(
                    "invalid sort direction for '{}'",
                    path
                )))
            }
        };
        keys.push((path.as_str(), ascending));
    }

    docs.sort_by(|a, b| {
        for (path, ascending) in &keys {
            let va = lookup(a, path).unwrap_or(&Bson::Null);
            let vb = lookup(b, path).unwrap_or(&Bson::Null);
            let ord = compare(va, vb);
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null => false,
        other => as_f64(other).map_or(true, |n| n != 0.0),
    }
}

/// Apply a top-level inclusion or exclusion projection
pub fn project(doc: &Document, projection: &Document) -> Document {
    let include_id = projection.get("_id").map_or(true, truthy);
    let inclusive = projection
        .iter()
        .any(|(key, value)| key != "_id" && truthy(value));

    let mut out = Document::new();
    if inclusive {
        if include_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (key, value) in doc {
            if key != "_id" && projection.get(key).is_some_and(truthy) {
                out.insert(key.clone(), value.clone());
            }
        }
    } else {
        for (key, value) in doc {
            let excluded = if key == "_id" {
                !include_id
            } else {
                projection.contains_key(key)
            };
            if !excluded {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Set a dotted path, creating intermediate documents
fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<()> {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            Ok(())
        }
        Some((head, rest)) => {
            if !doc.contains_key(head) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                _ => Err(DataApiError::Backend(format!(
                    "cannot create field '{}' in non-document '{}'",
                    rest, head
                ))),
            }
        }
    }
}

fn add_numbers(current: &Bson, delta: &Bson) -> Result<Bson> {
    let sum = match (current, delta) {
        (Bson::Int32(a), Bson::Int32(b)) => match a.checked_add(*b) {
            Some(v) => Bson::Int32(v),
            None => Bson::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Bson::Int32(a), Bson::Int64(b)) | (Bson::Int64(b), Bson::Int32(a)) => {
            Bson::Int64(i64::from(*a).wrapping_add(*b))
        }
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(a.wrapping_add(*b)),
        _ => match (as_f64(current), as_f64(delta)) {
            (Some(a), Some(b)) => Bson::Double(a + b),
            _ => {
                return Err(DataApiError::Backend(
                    "$inc requires numeric values".to_string(),
                ))
            }
        },
    };
    Ok(sum)
}

/// Whether an update document uses operators (as opposed to a replacement)
pub fn is_operator_update(update: &Document) -> bool {
    update.keys().any(|k| k.starts_with('$'))
}

/// Apply an operator update (`$set`, `$inc`) to a document
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<()> {
    if !update.keys().all(|k| k.starts_with('$')) {
        return Err(DataApiError::Backend(
            "update document requires atomic operators".to_string(),
        ));
    }

    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(DataApiError::Backend(format!(
                "{} expects a document",
                op
            )));
        };
        for (path, value) in fields {
            if path == "_id" || path.starts_with("_id.") {
                return Err(DataApiError::Backend(
                    "Performing an update on the path '_id' would modify the immutable field '_id'"
                        .to_string(),
                ));
            }
            match op.as_str() {
                "$set" => set_path(doc, path, value.clone())?,
                "$inc" => {
                    let next = match lookup(doc, path) {
                        Some(current) => add_numbers(current, value)?,
                        None => add_numbers(&Bson::Int32(0), value)?,
                    };
                    set_path(doc, path, next)?;
                }
                other => return Err(unsupported("update operator", other)),
            }
        }
    }
    Ok(())
}

/// Seed document for an upsert: top-level equality fields of the filter
pub fn upsert_seed(filter: &Document) -> Result<Document> {
    let mut seed = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') {
            continue;
        }
        match is_operator_document(value) {
            Some(ops) => {
                if let Some(eq) = ops.get("$eq") {
                    set_path(&mut seed, key, eq.clone())?;
                }
            }
            None => set_path(&mut seed, key, value.clone())?,
        }
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, DateTime};

    #[test]
    fn test_equality_and_dotted_paths() {
        let d = doc! { "a": 1, "b": { "c": "x" }, "tags": ["red", "blue"] };
        assert!(matches(&d, &doc! { "a": 1 }).unwrap());
        assert!(matches(&d, &doc! { "a": 1.0 }).unwrap());
        assert!(matches(&d, &doc! { "b.c": "x" }).unwrap());
        assert!(matches(&d, &doc! { "tags": "blue" }).unwrap());
        assert!(matches(&d, &doc! { "missing": Bson::Null }).unwrap());
        assert!(!matches(&d, &doc! { "a": "1" }).unwrap());
        assert!(matches(&d, &doc! {}).unwrap());
    }

    #[test]
    fn test_comparison_operators() {
        let d = doc! { "n": 5, "when": DateTime::from_millis(1000) };
        assert!(matches(&d, &doc! { "n": { "$gt": 4, "$lte": 5 } }).unwrap());
        assert!(!matches(&d, &doc! { "n": { "$lt": 5 } }).unwrap());
        assert!(!matches(&d, &doc! { "n": { "$gt": "4" } }).unwrap());
        assert!(matches(&d, &doc! { "when": { "$gte": DateTime::from_millis(1000) } }).unwrap());
        assert!(matches(&d, &doc! { "n": { "$in": [1, 5] } }).unwrap());
        assert!(!matches(&d, &doc! { "n": { "$in": [1, 2] } }).unwrap());
        assert!(matches(&d, &doc! { "n": { "$ne": 6 } }).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let d = doc! { "a": 1, "b": 2 };
        assert!(matches(&d, &doc! { "$or": [{ "a": 2 }, { "b": 2 }] }).unwrap());
        assert!(!matches(&d, &doc! { "$and": [{ "a": 1 }, { "b": 3 }] }).unwrap());
        assert!(matches(&d, &doc! { "$or": 1 }).is_err());
    }

    #[test]
    fn test_unsupported_operator() {
        let d = doc! { "a": 1 };
        assert!(matches(&d, &doc! { "a": { "$where": "x" } }).is_err());
        assert!(matches(&d, &doc! { "$text": { "$search": "x" } }).is_err());
        assert!(matches(&d, &doc! { "a": { "$exists": true } }).is_err());
    }

    #[test]
    fn test_sort_mixed_directions() {
        let mut docs = vec![
            doc! { "g": 1, "n": 1 },
            doc! { "g": 2, "n": 5 },
            doc! { "g": 1, "n": 3 },
            doc! { "n": 0 },
        ];
        sort_documents(&mut docs, &doc! { "g": -1, "n": 1 }).unwrap();
        let order: Vec<i32> = docs.iter().map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(order, vec![5, 1, 3, 0]);

        assert!(sort_documents(&mut docs, &doc! { "n": "up" }).is_err());
    }

    #[test]
    fn test_projection() {
        let d = doc! { "_id": 1, "a": 1, "b": 2, "c": 3 };
        assert_eq!(project(&d, &doc! { "a": 1 }), doc! { "_id": 1, "a": 1 });
        assert_eq!(project(&d, &doc! { "a": 1, "_id": 0 }), doc! { "a": 1 });
        assert_eq!(project(&d, &doc! { "b": 0 }), doc! { "_id": 1, "a": 1, "c": 3 });
    }

    #[test]
    fn test_apply_update() {
        let mut d = doc! { "_id": 1, "n": 1 };
        apply_update(
            &mut d,
            &doc! { "$set": { "meta.seen": true }, "$inc": { "n": 2, "fresh": 1.5 } },
        )
        .unwrap();
        assert_eq!(
            d,
            doc! { "_id": 1, "n": 3, "meta": { "seen": true }, "fresh": 1.5 }
        );

        assert!(apply_update(&mut d, &doc! { "n": 4 }).is_err());
        assert!(apply_update(&mut d, &doc! { "$set": { "_id": 2 } }).is_err());
        assert!(apply_update(&mut d, &doc! { "$push": { "n": 1 } }).is_err());
        assert!(apply_update(&mut d, &doc! { "$unset": { "n": "" } }).is_err());
    }

    #[test]
    fn test_upsert_seed() {
        let seed = upsert_seed(&doc! { "k": "a", "n": { "$eq": 3 }, "m": { "$gt": 1 }, "$or": [] })
            .unwrap();
        assert_eq!(seed, doc! { "k": "a", "n": 3 });
    }
}
