/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sync planner (C6, §4.6). Grounded on
//! `sync15::sync_multiple::do_sync_multiple`'s per-store loop structure,
//! generalized from "syncing stores" to "classifying record pairs"; pure
//! and synchronous like everything in `sync15`.

use crate::model::{Record, Side};
use crate::registry::ModuleMapping;
use chrono::Duration as ChronoDuration;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Source-side system fields unconditionally excluded from comparison and
/// sync (§4.6 "Ignored fields").
pub const IGNORED_SOURCE_FIELDS: &[&str] = &[
    "Modified_Time",
    "Created_Time",
    "Last_Activity_Time",
    "Modified_By",
    "Created_By",
    "Owner",
    "Tag",
    "Layout",
    "$approval",
    "$approval_state",
    "$converted",
    "$conversion_status",
];

/// Datastore-side system fields unconditionally excluded.
pub const IGNORED_DATASTORE_FIELDS: &[&str] = &["Record ID", "Last Modified Time", "Created Time"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Disposition {
    NewInDatastore,
    NewInSource,
    SourceNewer,
    DatastoreNewer,
    NoSync,
    Conflicts,
}

#[derive(Debug, Clone)]
pub struct Inventory {
    pub side: Side,
    pub entries: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub coalescing_window: Duration,
    pub ignored_source_fields: HashSet<String>,
    pub ignored_datastore_fields: HashSet<String>,
    pub full_inventory: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            coalescing_window: Duration::from_secs(30),
            ignored_source_fields: IGNORED_SOURCE_FIELDS.iter().map(|s| s.to_string()).collect(),
            ignored_datastore_fields: IGNORED_DATASTORE_FIELDS.iter().map(|s| s.to_string()).collect(),
            full_inventory: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanItem {
    pub disposition: Disposition,
    pub source: Option<Record>,
    pub datastore: Option<Record>,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub items: Vec<PlanItem>,
}

/// Field-by-field comparison over the module's mappable fields, excluding
/// ignored system fields, the id fields, and any field missing on the
/// datastore side. No short-circuit by default — every field is compared
/// so the result is stable regardless of iteration order (§9 Open
/// Question); the `short-circuit-compare` feature restores the original's
/// early-exit-on-first-difference behavior for anyone who wants to measure
/// the trade-off.
pub fn values_equal(source: &Record, datastore: &Record, mapping: &ModuleMapping, config: &PlannerConfig) -> bool {
    let mappable = mapping.fields.values().filter(|entry| {
        !config.ignored_source_fields.contains(&entry.source_name)
            && entry.source_name != mapping.source_id_field
    });

    #[cfg(feature = "short-circuit-compare")]
    {
        for entry in mappable {
            if !field_matches(source, datastore, mapping, config, entry) {
                return false;
            }
        }
        true
    }

    #[cfg(not(feature = "short-circuit-compare"))]
    {
        let mut all_equal = true;
        for entry in mappable {
            if !field_matches(source, datastore, mapping, config, entry) {
                all_equal = false;
            }
        }
        all_equal
    }
}

fn field_matches(
    source: &Record,
    datastore: &Record,
    mapping: &ModuleMapping,
    config: &PlannerConfig,
    entry: &crate::registry::MappingEntry,
) -> bool {
    let datastore_name = match mapping.resolve(&entry.datastore_field) {
        Some(n) => n,
        None => return true, // unresolvable mapping: not a comparable difference
    };
    if config.ignored_datastore_fields.contains(&datastore_name) {
        return true;
    }
    let source_value = source.field(&entry.source_name);
    let datastore_value = datastore.field(&datastore_name);
    match (source_value, datastore_value) {
        (Some(_), None) => true, // missing datastore side: excluded from comparison
        (None, None) => true,
        (None, Some(_)) => true,
        (Some(s), Some(d)) => s.normalize() == d.normalize(),
    }
}

/// Runs the 4-step classification algorithm of §4.6 over both inventories.
/// Pure and deterministic: the same inputs always produce the same `Plan`
/// (P2).
pub fn plan(source: &Inventory, datastore: &Inventory, mapping: &ModuleMapping, config: &PlannerConfig) -> Plan {
    let source_by_id: HashMap<_, _> = source.entries.iter().map(|r| (r.id.clone(), r)).collect();
    let datastore_by_source_id: HashMap<_, _> = datastore
        .entries
        .iter()
        .filter_map(|r| r.counterpart.as_ref().map(|c| (c.clone(), r)))
        .collect();

    let mut items = Vec::new();

    // Step 2: every source entry.
    for s in &source.entries {
        match datastore_by_source_id.get(&s.id) {
            None => items.push(PlanItem {
                disposition: Disposition::NewInDatastore,
                source: Some(s.clone()),
                datastore: None,
            }),
            Some(d) => {
                let delta = s.modified_at - d.modified_at;
                let abs_delta = if delta < ChronoDuration::zero() { -delta } else { delta };
                let window = ChronoDuration::from_std(config.coalescing_window).unwrap_or_default();
                if abs_delta <= window {
                    items.push(PlanItem {
                        disposition: Disposition::NoSync,
                        source: Some(s.clone()),
                        datastore: Some((*d).clone()),
                    });
                } else if values_equal(s, d, mapping, config) {
                    items.push(PlanItem {
                        disposition: Disposition::NoSync,
                        source: Some(s.clone()),
                        datastore: Some((*d).clone()),
                    });
                } else if delta > ChronoDuration::zero() {
                    items.push(PlanItem {
                        disposition: Disposition::SourceNewer,
                        source: Some(s.clone()),
                        datastore: Some((*d).clone()),
                    });
                } else {
                    items.push(PlanItem {
                        disposition: Disposition::DatastoreNewer,
                        source: Some(s.clone()),
                        datastore: Some((*d).clone()),
                    });
                }
            }
        }
    }

    // Step 3: datastore entries with no sourceId.
    for d in &datastore.entries {
        if d.counterpart.is_none() {
            items.push(PlanItem {
                disposition: Disposition::NewInSource,
                source: None,
                datastore: Some(d.clone()),
            });
        }
    }

    // Step 4: datastore entries whose sourceId has no source counterpart
    // (full-inventory mode only).
    if config.full_inventory {
        for d in &datastore.entries {
            if let Some(source_id) = &d.counterpart {
                if !source_by_id.contains_key(source_id) {
                    items.push(PlanItem {
                        disposition: Disposition::Conflicts,
                        source: None,
                        datastore: Some(d.clone()),
                    });
                }
            }
        }
    }

    Plan { items }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldValue, RemoteId};
    use crate::registry::{DatastoreFieldRef, MappingEntry};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn mapping() -> ModuleMapping {
        let mut fields = BTreeMap::new();
        fields.insert(
            "Phone".to_string(),
            MappingEntry {
                canonical_key: "Phone".into(),
                source_name: "Phone".into(),
                datastore_field: DatastoreFieldRef::Name("Phone".into()),
                ui_name: "Phone".into(),
                field_type: "text".into(),
            },
        );
        ModuleMapping {
            fields,
            source_id_field: "id".into(),
            datastore_id_field: Some("sourceId".into()),
            metadata_field_id_to_name: BTreeMap::new(),
            loaded_at: Utc::now(),
        }
    }

    fn record(id: &str, counterpart: Option<&str>, modified_at: chrono::DateTime<Utc>, phone: &str) -> Record {
        let mut fields = BTreeMap::new();
        fields.insert("Phone".to_string(), FieldValue::Text(phone.to_string()));
        Record {
            id: RemoteId::from(id),
            counterpart: counterpart.map(RemoteId::from),
            modified_at,
            created_at: None,
            fields,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn fresh_link_creation() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![record("s1", None, now, "555-0100")],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].disposition, Disposition::NewInDatastore);
    }

    #[test]
    fn conflict_source_wins_by_recency() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![record("s1", None, now, "A")],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("s1"), now - ChronoDuration::minutes(5), "B")],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].disposition, Disposition::SourceNewer);
    }

    #[test]
    fn no_sync_by_coalescing_window() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![record("s1", None, now, "A")],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("s1"), now - ChronoDuration::seconds(10), "B")],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert_eq!(result.items[0].disposition, Disposition::NoSync);
    }

    #[test]
    fn no_sync_by_value_equality() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![record("s1", None, now, "555-0100")],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("s1"), now - ChronoDuration::minutes(10), "555-0100")],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert_eq!(result.items[0].disposition, Disposition::NoSync);
    }

    #[test]
    fn boundary_delta_exactly_window_is_no_sync() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![record("s1", None, now, "A")],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("s1"), now - ChronoDuration::seconds(30), "B")],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert_eq!(result.items[0].disposition, Disposition::NoSync);
    }

    #[test]
    fn orphan_in_datastore_is_conflicts_in_full_inventory_mode() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("sX"), now, "A")],
        };
        let mut config = PlannerConfig::default();
        config.full_inventory = true;
        let result = plan(&source, &datastore, &mapping(), &config);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].disposition, Disposition::Conflicts);
    }

    #[test]
    fn orphan_in_datastore_is_ignored_without_full_inventory() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("sX"), now, "A")],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert!(result.items.is_empty());
    }

    #[test]
    fn new_in_source_for_unlinked_datastore_row() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", None, now, "A")],
        };
        let result = plan(&source, &datastore, &mapping(), &PlannerConfig::default());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].disposition, Disposition::NewInSource);
    }

    #[test]
    fn plan_is_idempotent() {
        let now = Utc::now();
        let source = Inventory {
            side: Side::Source,
            entries: vec![record("s1", None, now, "A")],
        };
        let datastore = Inventory {
            side: Side::Datastore,
            entries: vec![record("d1", Some("s1"), now - ChronoDuration::minutes(5), "B")],
        };
        let config = PlannerConfig::default();
        let first = plan(&source, &datastore, &mapping(), &config);
        let second = plan(&source, &datastore, &mapping(), &config);
        assert_eq!(first.items.len(), second.items.len());
        assert_eq!(first.items[0].disposition, second.items[0].disposition);
    }
}
