//! Nested and compound document key helpers.
//!
//! Backend documents use dotted field paths where a single path segment
//! may itself contain dots (`a.b` can be the literal key `"a.b"` or the
//! key `"b"` under `"a"`). Lookups resolve the longest matching prefix
//! first.

use serde_json::Value;

/// Look up a possibly-dotted key in a document.
///
/// The whole key is tried as a literal field first; otherwise the key is
/// split at each dot from right to left, so the longest literal prefix
/// that exists in the document wins.
pub fn lookup_es_key<'a>(doc: &'a Value, key: &str) -> Option<&'a Value> {
    let obj = doc.as_object()?;
    if let Some(found) = obj.get(key) {
        return Some(found);
    }
    for (idx, _) in key.match_indices('.').rev() {
        let (head, tail) = (&key[..idx], &key[idx + 1..]);
        if let Some(child) = obj.get(head) {
            if let Some(found) = lookup_es_key(child, tail) {
                return Some(found);
            }
        }
    }
    None
}

/// Set a possibly-dotted key in a document, using the same longest-prefix
/// resolution as [`lookup_es_key`].
///
/// An existing field is overwritten in place. A missing single-segment
/// key is inserted at the top level; a missing nested path is not
/// created and `false` is returned.
pub fn set_es_key(doc: &mut Value, key: &str, value: Value) -> bool {
    let Some(obj) = doc.as_object_mut() else {
        return false;
    };
    if obj.contains_key(key) {
        obj.insert(key.to_string(), value);
        return true;
    }
    for (idx, _) in key.match_indices('.').rev() {
        let (head, tail) = (key[..idx].to_string(), key[idx + 1..].to_string());
        if let Some(child) = obj.get_mut(&head) {
            if set_es_key(child, &tail, value.clone()) {
                return true;
            }
        }
    }
    if !key.contains('.') {
        obj.insert(key.to_string(), value);
        return true;
    }
    false
}

/// Render a field value for use inside a compound key.
///
/// Strings are used verbatim; everything else falls back to its JSON
/// rendering (`null` for missing fields).
pub fn key_fragment(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

/// Derive a compound key by joining the named field values with `", "`.
pub fn compound_key_value(doc: &Value, keys: &[String]) -> String {
    keys.iter()
        .map(|k| key_fragment(lookup_es_key(doc, k)))
        .collect::<Vec<_>>()
        .join(", ")
}
