//! Nested query-string payloads.
//!
//! Non-POST requests carry their payload in the query string using bracket
//! notation: `filter[level]=warn` becomes `{"filter": {"level": "warn"}}`,
//! `tags[]=a&tags[]=b` and `tags[0]=a&tags[1]=b` become arrays, and a key
//! repeated without brackets collects its values into an array. All leaf
//! values are strings.

use serde_json::{Map, Value};

/// Build a JSON payload from decoded key/value pairs
pub fn parse_pairs(pairs: &[(String, String)]) -> Value {
    let mut root = Map::new();
    for (key, value) in pairs {
        let path = split_key(key);
        insert(&mut root, &path, value.clone());
    }
    arrays_from_indexed(Value::Object(root))
}

fn split_key(key: &str) -> Vec<String> {
    match key.find('[') {
        Some(open) if open > 0 && key.ends_with(']') => {
            let mut segments = vec![key[..open].to_string()];
            segments.extend(
                key[open + 1..key.len() - 1]
                    .split("][")
                    .map(str::to_string),
            );
            segments
        }
        _ => vec![key.to_string()],
    }
}

fn insert(node: &mut Map<String, Value>, path: &[String], value: String) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    // `[]` appends
    let key = if head.is_empty() {
        node.len().to_string()
    } else {
        head.clone()
    };

    if rest.is_empty() {
        match node.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing @ Value::String(_)) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, Value::String(value)]);
            }
            _ => {
                node.insert(key, Value::String(value));
            }
        }
        return;
    }

    let child = node
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        insert(map, rest, value);
    }
}

/// Objects whose keys are all indices become arrays ordered by index
fn arrays_from_indexed(value: Value) -> Value {
    let Value::Object(map) = value else {
        return value;
    };

    let indexed = !map.is_empty() && map.keys().all(|k| k.parse::<usize>().is_ok());
    if indexed {
        let mut items: Vec<(usize, Value)> = map
            .into_iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|i| (i, arrays_from_indexed(v))))
            .collect();
        items.sort_by_key(|(i, _)| *i);
        Value::Array(items.into_iter().map(|(_, v)| v).collect())
    } else {
        Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, arrays_from_indexed(v)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_flat_and_nested() {
        let value = parse_pairs(&pairs(&[
            ("dataSource", "logs"),
            ("filter[level]", "warn"),
            ("filter[meta][host]", "a1"),
            ("limit", "10"),
        ]));
        assert_eq!(
            value,
            json!({
                "dataSource": "logs",
                "filter": { "level": "warn", "meta": { "host": "a1" } },
                "limit": "10"
            })
        );
    }

    #[test]
    fn test_arrays() {
        let value = parse_pairs(&pairs(&[("tags[]", "a"), ("tags[]", "b")]));
        assert_eq!(value, json!({ "tags": ["a", "b"] }));

        let value = parse_pairs(&pairs(&[
            ("documents[1][n]", "second"),
            ("documents[0][n]", "first"),
        ]));
        assert_eq!(value, json!({ "documents": [{ "n": "first" }, { "n": "second" }] }));

        let value = parse_pairs(&pairs(&[("k", "1"), ("k", "2"), ("k", "3")]));
        assert_eq!(value, json!({ "k": ["1", "2", "3"] }));
    }

    #[test]
    fn test_operator_keys() {
        let value = parse_pairs(&pairs(&[("filter[n][$gt]", "5")]));
        assert_eq!(value, json!({ "filter": { "n": { "$gt": "5" } } }));
    }

    #[test]
    fn test_empty() {
        assert_eq!(parse_pairs(&[]), json!({}));
        // Unbalanced brackets are taken literally
        let value = parse_pairs(&pairs(&[("a[b", "1")]));
        assert_eq!(value, json!({ "a[b": "1" }));
    }
}
