/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Typed record model (§3, §9). Replaces the "loose dynamic record" idiom
//! of the original with one shape shared by both remotes: a typed id, a
//! typed modification time, and a `fields` bag the registry is the single
//! place that gives meaning to.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Which remote a record/event/write belongs to. Used everywhere in place
/// of a stringly "system" tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Source,
    Datastore,
}

impl Side {
    /// The opposite remote — used by the tracker's ordering rule (§4.5 ii):
    /// a write issued because Y changed is recorded against X's side.
    pub fn other(self) -> Side {
        match self {
            Side::Source => Side::Datastore,
            Side::Datastore => Side::Source,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Datastore => write!(f, "datastore"),
        }
    }
}

/// An opaque id on one particular remote. `Source` and `Datastore` ids are
/// never interchangeable, which is why each gets its own newtype rather
/// than passing bare `String`s around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RemoteId(pub String);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RemoteId {
    fn from(s: String) -> Self {
        RemoteId(s)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        RemoteId(s.to_string())
    }
}

/// A module/table name, e.g. "Leads" on the source side, bound to a table
/// on the datastore side via the metadata catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Module(pub String);

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Module {
    fn from(s: &str) -> Self {
        Module(s.to_string())
    }
}

/// A single field value, normalized for cross-remote comparison (§4.6).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// An array of `{name}` objects, e.g. multi-select lookups — joined as
    /// "name, name" when normalized.
    NameList(Vec<String>),
    Json(serde_json::Value),
}

impl FieldValue {
    /// Build a `FieldValue` from a raw JSON value the way the registry
    /// would see it coming off either remote's API.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::Number(n) => FieldValue::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => FieldValue::Text(s),
            serde_json::Value::Array(items) => {
                let names: Option<Vec<String>> = items
                    .iter()
                    .map(|item| {
                        item.as_object()
                            .and_then(|obj| obj.get("name"))
                            .and_then(|n| n.as_str())
                            .map(|s| s.to_string())
                    })
                    .collect();
                match names {
                    Some(names) => FieldValue::NameList(names),
                    None => FieldValue::Json(serde_json::Value::Array(items)),
                }
            }
            other @ serde_json::Value::Object(_) => FieldValue::Json(other),
        }
    }

    /// Canonicalize for comparison: trim strings, stringify numbers/bools,
    /// join name-lists, and fall through to a canonical JSON round-trip for
    /// anything else (§4.6 "Value normalization").
    pub fn normalize(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            FieldValue::Text(s) => s.trim().to_string(),
            FieldValue::NameList(names) => names
                .iter()
                .map(|n| n.trim())
                .collect::<Vec<_>>()
                .join(", "),
            FieldValue::Json(v) => canonical_json(v),
        }
    }
}

/// Serialize a JSON value with object keys sorted, so two structurally
/// identical values always produce the same string regardless of the
/// order fields happened to be emitted in by either remote's API.
fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted = serde_json::Map::new();
                for (k, v) in entries {
                    sorted.insert(k.clone(), sort(v));
                }
                serde_json::Value::Object(sorted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

/// One record from either remote, already translated into the shared
/// shape: a typed id, a resolved modification time, and the field bag the
/// planner/executor operate on.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub id: RemoteId,
    /// The counterpart id on the other remote, if known (the `sourceId`
    /// column on a datastore row, or `None` on the source side — §3).
    pub counterpart: Option<RemoteId>,
    pub modified_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub fields: BTreeMap<String, FieldValue>,
    /// The untranslated payload, kept around for diagnostics and for
    /// fields the registry doesn't yet know about.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Record {
    /// Resolve `modified_at` the way §3 specifies: `Modified_Time`,
    /// `Last_Activity_Time`, `Created_Time`, then wall-clock fallback.
    pub fn resolve_modified_at(
        modified_time: Option<DateTime<Utc>>,
        last_activity_time: Option<DateTime<Utc>>,
        created_time: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        modified_time
            .or(last_activity_time)
            .or(created_time)
            .unwrap_or_else(Utc::now)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_side_flips() {
        assert_eq!(Side::Source.other(), Side::Datastore);
        assert_eq!(Side::Datastore.other(), Side::Source);
    }

    #[test]
    fn normalize_trims_and_stringifies() {
        assert_eq!(FieldValue::Text("  A  ".into()).normalize(), "A");
        assert_eq!(FieldValue::Number(5.0).normalize(), "5");
        assert_eq!(FieldValue::Bool(true).normalize(), "true");
        assert_eq!(
            FieldValue::NameList(vec!["Hot".into(), " Cold ".into()]).normalize(),
            "Hot, Cold"
        );
    }

    #[test]
    fn normalize_json_is_key_order_independent() {
        let a = FieldValue::Json(serde_json::json!({"b": 1, "a": 2}));
        let b = FieldValue::Json(serde_json::json!({"a": 2, "b": 1}));
        assert_eq!(a.normalize(), b.normalize());
    }

    #[test]
    fn from_json_detects_name_lists() {
        let v = serde_json::json!([{"name": "Hot"}, {"name": "Cold"}]);
        assert_eq!(
            FieldValue::from_json(v),
            FieldValue::NameList(vec!["Hot".into(), "Cold".into()])
        );
    }

    #[test]
    fn resolve_modified_at_prefers_modified_time() {
        let m: DateTime<Utc> = "2024-01-02T00:00:00Z".parse().unwrap();
        let l: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(Record::resolve_modified_at(Some(m), Some(l), None), m);
        assert_eq!(Record::resolve_modified_at(None, Some(l), None), l);
    }
}
