//! Field-level document patches with dotted paths and explicit deletes.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    Set(Value),
    /// Remove the addressed field. Stores never drop unmentioned keys, so a
    /// removal has to be written explicitly.
    Delete,
}

/// Ordered set of field writes. Keys may be dotted (`dayStatus.mon`) to address
/// nested map entries without rewriting the whole map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    fields: BTreeMap<String, PatchValue>,
}

impl DocumentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), PatchValue::Set(value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.fields.insert(key.into(), PatchValue::Delete);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&PatchValue> {
        self.fields.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PatchValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn extend(&mut self, other: DocumentPatch) {
        self.fields.extend(other.fields);
    }
}

impl IntoIterator for DocumentPatch {
    type Item = (String, PatchValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, PatchValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl FromIterator<(String, PatchValue)> for DocumentPatch {
    fn from_iter<I: IntoIterator<Item = (String, PatchValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn write_path(map: &mut Map<String, Value>, segments: &[&str], value: &PatchValue) {
    match segments {
        [] => {}
        [leaf] => match value {
            PatchValue::Set(v) => {
                map.insert((*leaf).to_string(), v.clone());
            }
            PatchValue::Delete => {
                map.remove(*leaf);
            }
        },
        [head, rest @ ..] => match value {
            PatchValue::Set(_) => {
                let child = map
                    .entry((*head).to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                write_path(ensure_object(child), rest, value);
            }
            PatchValue::Delete => {
                if let Some(Value::Object(child)) = map.get_mut(*head) {
                    write_path(child, rest, value);
                }
            }
        },
    }
}

/// Applies `patch` to `doc` in place.
pub fn apply_patch(doc: &mut Value, patch: &DocumentPatch) {
    let root = ensure_object(doc);
    for (key, value) in patch.iter() {
        let segments: Vec<&str> = key.split('.').collect();
        write_path(root, &segments, value);
    }
}

/// Deep merge used by `set(.., merge)`: nested objects merge, everything else replaces.
pub fn merge_into(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, source_value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && source_value.is_object() => {
                        merge_into(existing, source_value);
                    }
                    _ => {
                        target_map.insert(key.clone(), source_value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_set_creates_nested_maps() {
        let mut doc = json!({ "a": 1 });
        let patch = DocumentPatch::new().with("dayStatus.mon", "done");
        apply_patch(&mut doc, &patch);
        assert_eq!(doc, json!({ "a": 1, "dayStatus": { "mon": "done" } }));
    }

    #[test]
    fn delete_removes_only_the_addressed_key() {
        let mut doc = json!({ "dayStatus": { "mon": "done", "tue": "rest" } });
        let mut patch = DocumentPatch::new();
        patch.delete("dayStatus.mon");
        patch.delete("missing.key");
        apply_patch(&mut doc, &patch);
        assert_eq!(doc, json!({ "dayStatus": { "tue": "rest" } }));
    }

    #[test]
    fn merge_keeps_unmentioned_nested_fields() {
        let mut doc = json!({ "routineSync": { "enabled": true, "mode": "auto" }, "x": [1] });
        merge_into(&mut doc, &json!({ "routineSync": { "enabled": false }, "x": [2] }));
        assert_eq!(
            doc,
            json!({ "routineSync": { "enabled": false, "mode": "auto" }, "x": [2] })
        );
    }
}
