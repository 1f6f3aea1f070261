//! JSON merge patches (RFC 7386)

use serde::Serialize;
use serde_json::{Map, Value};

/// A JSON merge patch.
///
/// Only the fields present in the patch are touched; `null` removes a field.
#[derive(Clone, Debug, PartialEq)]
pub struct MergePatch(Value);

impl MergePatch {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Minimal patch turning `before` into `after`.
    pub fn diff<T: Serialize>(before: &T, after: &T) -> Result<Self, serde_json::Error> {
        let before = serde_json::to_value(before)?;
        let after = serde_json::to_value(after)?;
        Ok(Self(diff_values(&before, &after).unwrap_or_else(|| Value::Object(Map::new()))))
    }

    /// Whether applying this patch changes nothing.
    pub fn is_empty(&self) -> bool {
        matches!(&self.0, Value::Object(map) if map.is_empty())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Apply this patch to `target` in place.
    pub fn apply(&self, target: &mut Value) {
        merge(target, &self.0);
    }

    /// The part of this patch touching `field` only, e.g. `status`.
    pub fn only(&self, field: &str) -> Self {
        let mut map = Map::new();
        if let Some(v) = self.0.get(field) {
            map.insert(field.to_string(), v.clone());
        }
        Self(Value::Object(map))
    }

    /// This patch with `field` removed.
    pub fn without(&self, field: &str) -> Self {
        let mut value = self.0.clone();
        if let Value::Object(map) = &mut value {
            map.remove(field);
        }
        Self(value)
    }
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn diff_values(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut out = Map::new();
            for (key, value) in a {
                match b.get(key) {
                    Some(old) => {
                        if let Some(d) = diff_values(old, value) {
                            out.insert(key.clone(), d);
                        }
                    }
                    None => {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in b.keys() {
                if !a.contains_key(key) {
                    out.insert(key.clone(), Value::Null);
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}
