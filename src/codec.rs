//! Extended JSON codec.
//!
//! Converts between BSON values and a JSON-safe representation in which
//! every type JSON cannot carry becomes a single-key object naming the type,
//! e.g. `{"$date": "2024-01-01T00:00:00.000Z"}` or `{"$oid": "..."}`.
//!
//! Numbers follow these rules:
//! - `Int32` is a plain JSON integer, and plain integers in `i32` range decode to `Int32`
//! - `Int64` is a plain integer when it is outside `i32` range but still exactly
//!   representable as a double, otherwise `{"$numberLong": "..."}`
//! - finite `Double` is a plain JSON float, non-finite uses `{"$numberDouble": ...}`
//!
//! so that `decode(encode(v)) == v` for every BSON value and
//! `encode(decode(j)) == j` for every plain JSON value.
//!
//! Objects whose single key is not a known tag (query operators such as
//! `{"$gt": 1}` or `{"$set": {...}}`) pass through as documents.

use crate::error::{DataApiError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bson::{Bson, DateTime, Document};
use chrono::{Datelike, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map, Number, Value};

/// Largest integer a JSON consumer using doubles can hold exactly
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Encode a BSON value as extended JSON
pub fn encode(value: &Bson) -> Value {
    match value {
        Bson::Double(f) => encode_double(*f),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Array(items) => Value::Array(items.iter().map(encode).collect()),
        Bson::Document(doc) => encode_document(doc),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Null => Value::Null,
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => encode_int64(*i),
        Bson::DateTime(dt) => encode_datetime(*dt),
        Bson::ObjectId(oid) => json!({ "$oid": oid.to_hex() }),
        Bson::Binary(bin) => json!({
            "$binary": {
                "base64": STANDARD.encode(&bin.bytes),
                "subType": format!("{:02x}", u8::from(bin.subtype)),
            }
        }),
        Bson::RegularExpression(re) => json!({
            "$regularExpression": { "pattern": re.pattern, "options": re.options }
        }),
        Bson::Timestamp(ts) => json!({ "$timestamp": { "t": ts.time, "i": ts.increment } }),
        Bson::JavaScriptCode(code) => json!({ "$code": code }),
        Bson::JavaScriptCodeWithScope(c) => json!({
            "$code": c.code,
            "$scope": encode_document(&c.scope),
        }),
        Bson::Symbol(s) => json!({ "$symbol": s }),
        Bson::Undefined => json!({ "$undefined": true }),
        Bson::MinKey => json!({ "$minKey": 1 }),
        Bson::MaxKey => json!({ "$maxKey": 1 }),
        // Decimal128 and DbPointer have no public accessors worth duplicating
        other => other.clone().into_canonical_extjson(),
    }
}

/// Encode a document as an extended JSON object
pub fn encode_document(doc: &Document) -> Value {
    Value::Object(
        doc.iter()
            .map(|(key, value)| (key.clone(), encode(value)))
            .collect(),
    )
}

fn encode_double(f: f64) -> Value {
    match Number::from_f64(f) {
        Some(n) => Value::Number(n),
        None => {
            let tag = if f.is_nan() {
                "NaN"
            } else if f.is_sign_positive() {
                "Infinity"
            } else {
                "-Infinity"
            };
            json!({ "$numberDouble": tag })
        }
    }
}

fn encode_int64(i: i64) -> Value {
    let plain = i32::try_from(i).is_err() && (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i);
    if plain {
        Value::from(i)
    } else {
        json!({ "$numberLong": i.to_string() })
    }
}

fn encode_datetime(dt: DateTime) -> Value {
    let millis = dt.timestamp_millis();
    match Utc.timestamp_millis_opt(millis).single() {
        Some(ts) if (1970..=9999).contains(&ts.year()) => {
            json!({ "$date": ts.to_rfc3339_opts(SecondsFormat::Millis, true) })
        }
        _ => json!({ "$date": { "$numberLong": millis.to_string() } }),
    }
}

/// Decode an extended JSON value into BSON
pub fn decode(value: &Value) -> Result<Bson> {
    match value {
        Value::Null => Ok(Bson::Null),
        Value::Bool(b) => Ok(Bson::Boolean(*b)),
        Value::Number(n) => Ok(decode_number(n)),
        Value::String(s) => Ok(Bson::String(s.clone())),
        Value::Array(items) => items
            .iter()
            .map(decode)
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
        Value::Object(map) => match decode_tagged(map)? {
            Some(tagged) => Ok(tagged),
            None => decode_map(map).map(Bson::Document),
        },
    }
}

/// Decode an extended JSON value that must be a document
pub fn decode_document(value: &Value) -> Result<Document> {
    match decode(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(DataApiError::MalformedExtendedValue(format!(
            "expected a document, found {:?}",
            other.element_type()
        ))),
    }
}

fn decode_map(map: &Map<String, Value>) -> Result<Document> {
    let mut doc = Document::new();
    for (key, value) in map {
        doc.insert(key.clone(), decode(value)?);
    }
    Ok(doc)
}

fn decode_number(n: &Number) -> Bson {
    match n.as_i64() {
        Some(i) => match i32::try_from(i) {
            Ok(small) => Bson::Int32(small),
            Err(_) => Bson::Int64(i),
        },
        // u64 above i64::MAX or a float
        None => Bson::Double(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn malformed(tag: &str, detail: impl std::fmt::Display) -> DataApiError {
    DataApiError::MalformedExtendedValue(format!("{}: {}", tag, detail))
}

/// Single-key objects decoded as typed values
const TAGS: &[&str] = &[
    "$oid",
    "$date",
    "$numberInt",
    "$numberLong",
    "$numberDouble",
    "$numberDecimal",
    "$numberDecimalBytes",
    "$binary",
    "$uuid",
    "$regularExpression",
    "$timestamp",
    "$code",
    "$symbol",
    "$dbPointer",
    "$minKey",
    "$maxKey",
    "$undefined",
];

/// Two-key legacy forms. `{"$regex", "$options"}` is left alone since it is
/// also the query operator spelling.
const TAG_PAIRS: &[(&str, &str)] = &[("$binary", "$type"), ("$code", "$scope")];

fn tag_of(map: &Map<String, Value>) -> Option<&str> {
    match map.len() {
        1 => map
            .keys()
            .next()
            .map(String::as_str)
            .filter(|key| TAGS.contains(key)),
        2 => TAG_PAIRS
            .iter()
            .find(|(first, second)| map.contains_key(*first) && map.contains_key(*second))
            .map(|(first, _)| *first),
        _ => None,
    }
}

/// Recognize a tagged object. `Ok(None)` means the object is a plain document.
fn decode_tagged(map: &Map<String, Value>) -> Result<Option<Bson>> {
    let Some(tag) = tag_of(map) else {
        return Ok(None);
    };
    let tagged = match (map.get("$binary"), map.get("$type")) {
        // Legacy binary, rewritten to the canonical nested form
        (Some(data @ Value::String(_)), Some(subtype)) => {
            json!({ "$binary": { "base64": data, "subType": subtype } })
        }
        _ => Value::Object(map.clone()),
    };
    Bson::try_from(tagged)
        .map(Some)
        .map_err(|e| malformed(tag, e))
}
