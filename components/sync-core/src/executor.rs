/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The sync executor (C7, §4.7). Grounded on `sync15::sync_multiple`'s
//! bucketed, per-store execution order, with bounded fan-out inside a
//! bucket implemented via `std::thread::scope` rather than an async runtime
//! — the core stays synchronous end to end, matching the teacher's own
//! `reqwest::blocking` transport.

use crate::error::Error;
use crate::model::{Module, Record, RemoteId, Side};
use crate::planner::{Disposition, Plan, PlanItem};
use crate::registry::ModuleMapping;
use crate::remote_client::{ItemResult, MergeOn, RemoteClient};
use crate::tracker::Tracker;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Planned,
    InFlight,
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub new_in_datastore: usize,
    pub new_in_source: usize,
    pub source_newer: usize,
    pub datastore_newer: usize,
    pub no_sync: usize,
    pub marked_deleted: usize,
    pub deleted_source_orphans: usize,
    pub failed: usize,
    pub missing_required_fields: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub dry_run: bool,
    pub full_inventory: bool,
    pub orphan_age_threshold: Duration,
    pub deleted_marker_field: String,
    pub deleted_marker_value: serde_json::Value,
    pub required_source_fields: HashSet<String>,
    pub concurrency: usize,
    pub batch_size: usize,
    pub batch_pause: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            full_inventory: false,
            orphan_age_threshold: Duration::from_secs(24 * 3600),
            deleted_marker_field: "Status".into(),
            deleted_marker_value: serde_json::Value::String("Deleted".into()),
            required_source_fields: HashSet::new(),
            concurrency: 4,
            batch_size: 10,
            batch_pause: Duration::from_millis(100),
        }
    }
}

pub struct Executor {
    source: Arc<dyn RemoteClient>,
    datastore: Arc<dyn RemoteClient>,
    tracker: Arc<Tracker>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        source: Arc<dyn RemoteClient>,
        datastore: Arc<dyn RemoteClient>,
        tracker: Arc<Tracker>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            source,
            datastore,
            tracker,
            config,
        }
    }

    /// Execute every bucket in plan order, returning the run's statistics.
    /// In dry-run mode every mutating call is skipped but items are still
    /// classified and counted (§4.7 "Dry-run", P3).
    pub fn execute(&self, module: &Module, plan: &Plan, mapping: &ModuleMapping) -> Statistics {
        let mut stats = Statistics::default();

        let new_in_datastore: Vec<PlanItem> = plan
            .items
            .iter()
            .filter(|i| i.disposition == Disposition::NewInDatastore)
            .cloned()
            .collect();
        let new_in_source: Vec<PlanItem> = plan
            .items
            .iter()
            .filter(|i| i.disposition == Disposition::NewInSource)
            .cloned()
            .collect();
        let source_newer: Vec<PlanItem> = plan
            .items
            .iter()
            .filter(|i| i.disposition == Disposition::SourceNewer)
            .cloned()
            .collect();
        let datastore_newer: Vec<PlanItem> = plan
            .items
            .iter()
            .filter(|i| i.disposition == Disposition::DatastoreNewer)
            .cloned()
            .collect();
        let orphans: Vec<PlanItem> = plan
            .items
            .iter()
            .filter(|i| i.disposition == Disposition::Conflicts)
            .cloned()
            .collect();

        stats.no_sync = plan
            .items
            .iter()
            .filter(|i| i.disposition == Disposition::NoSync)
            .count();

        self.run_creates_datastore(module, &new_in_datastore, mapping, &mut stats);
        self.run_creates_source(module, &new_in_source, mapping, &mut stats);
        self.run_updates(module, Side::Datastore, &source_newer, mapping, &mut stats);
        self.run_updates(module, Side::Source, &datastore_newer, mapping, &mut stats);
        if self.config.full_inventory {
            self.run_deletion_pass(module, &orphans, &mut stats);
        }

        stats
    }

    fn is_orphan_source_row(&self, item: &PlanItem) -> bool {
        let Some(source) = &item.source else { return false };
        if !self.config.full_inventory {
            return false;
        }
        let created = source.created_at.unwrap_or(source.modified_at);
        let age = Utc::now() - created;
        age > chrono::Duration::from_std(self.config.orphan_age_threshold).unwrap_or_default()
    }

    fn run_creates_datastore(
        &self,
        module: &Module,
        items: &[PlanItem],
        mapping: &ModuleMapping,
        stats: &mut Statistics,
    ) {
        let (orphans, fresh): (Vec<_>, Vec<_>) =
            items.iter().partition(|i| self.is_orphan_source_row(i));

        for item in &orphans {
            let source = item.source.as_ref().expect("source present for create-datastore item");
            if self.config.dry_run {
                stats.deleted_source_orphans += 1;
                continue;
            }
            match self.source.delete(module, &source.id) {
                Ok(()) => stats.deleted_source_orphans += 1,
                Err(_) => stats.failed += 1,
            }
        }

        for chunk in fresh.chunks(self.config.batch_size) {
            if self.config.dry_run {
                stats.new_in_datastore += chunk.len();
                continue;
            }
            let records: Vec<Record> = chunk
                .iter()
                .map(|item| {
                    let source = item.source.as_ref().expect("source present for create-datastore item");
                    build_datastore_record(source, mapping)
                })
                .collect();
            match self.datastore.upsert(module, &records, MergeOn::SourceId) {
                Ok(results) => {
                    for result in results {
                        match result {
                            ItemResult::Ok(_) => stats.new_in_datastore += 1,
                            ItemResult::Failed { .. } => stats.failed += 1,
                        }
                    }
                }
                Err(_) => stats.failed += chunk.len(),
            }
            std::thread::sleep(self.config.batch_pause);
        }
    }

    fn run_creates_source(
        &self,
        module: &Module,
        items: &[PlanItem],
        mapping: &ModuleMapping,
        stats: &mut Statistics,
    ) {
        for chunk in items.chunks(self.config.batch_size) {
            let mut records = Vec::new();
            for item in chunk {
                let datastore = item.datastore.as_ref().expect("datastore present for create-source item");
                let missing: Vec<String> = self
                    .config
                    .required_source_fields
                    .iter()
                    .filter(|f| datastore.field(f).is_none())
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    stats.missing_required_fields += 1;
                    continue;
                }
                records.push(build_source_record(datastore, mapping));
            }
            if records.is_empty() {
                continue;
            }
            if self.config.dry_run {
                stats.new_in_source += records.len();
                continue;
            }
            match self.source.upsert(module, &records, MergeOn::NativeId) {
                Ok(results) => {
                    for result in results {
                        match result {
                            ItemResult::Ok(_) => stats.new_in_source += 1,
                            ItemResult::Failed { .. } => stats.failed += 1,
                        }
                    }
                }
                Err(_) => stats.failed += records.len(),
            }
            std::thread::sleep(self.config.batch_pause);
        }
    }

    /// Push the winning side's differing field values onto `target`,
    /// recording a tracker entry for each field *before* issuing the write
    /// so the reciprocal webhook is suppressed (§3 invariant ii, P4).
    fn run_updates(
        &self,
        module: &Module,
        target: Side,
        items: &[PlanItem],
        mapping: &ModuleMapping,
        stats: &mut Statistics,
    ) {
        for chunk in items.chunks(self.config.batch_size) {
            let records: Vec<(RemoteId, Record)> = chunk
                .iter()
                .map(|item| {
                    let (winner, loser, target_id) = match target {
                        Side::Datastore => (
                            item.source.as_ref().expect("source present"),
                            item.datastore.as_ref().expect("datastore present"),
                            item.datastore.as_ref().expect("datastore present").id.clone(),
                        ),
                        Side::Source => (
                            item.datastore.as_ref().expect("datastore present"),
                            item.source.as_ref().expect("source present"),
                            item.source.as_ref().expect("source present").id.clone(),
                        ),
                    };
                    let fields = differing_fields(winner, loser, mapping, target);
                    for (field, value) in &fields {
                        self.tracker.remember_write(target, &target_id, field, value);
                    }
                    let mut record_fields = BTreeMap::new();
                    for (field, value) in fields {
                        record_fields.insert(field, serde_json::to_value(&value).unwrap_or(serde_json::Value::Null));
                    }
                    (
                        target_id.clone(),
                        Record {
                            id: target_id,
                            counterpart: None,
                            modified_at: winner.modified_at,
                            created_at: None,
                            fields: record_fields
                                .iter()
                                .map(|(k, v)| (k.clone(), crate::model::FieldValue::from_json(v.clone())))
                                .collect(),
                            raw: serde_json::Value::Object(record_fields.into_iter().collect()),
                        },
                    )
                })
                .collect();

            if self.config.dry_run {
                increment_update_stat(stats, target, records.len());
                continue;
            }

            let client: &dyn RemoteClient = match target {
                Side::Datastore => self.datastore.as_ref(),
                Side::Source => self.source.as_ref(),
            };
            // Bounded fan-out within the batch (§5: "bounded concurrency,
            // default 4, for per-item network I/O within a bucket").
            for fanout in records.chunks(self.config.concurrency.max(1)) {
                let outcomes: Vec<bool> = std::thread::scope(|scope| {
                    let handles: Vec<_> = fanout
                        .iter()
                        .map(|(id, record)| {
                            scope.spawn(move || {
                                let fields: BTreeMap<String, serde_json::Value> = record
                                    .fields
                                    .iter()
                                    .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null)))
                                    .collect();
                                client.update(module, id, &fields).is_ok()
                            })
                        })
                        .collect();
                    handles.into_iter().map(|h| h.join().unwrap_or(false)).collect()
                });
                for ok in outcomes {
                    if ok {
                        increment_update_stat(stats, target, 1);
                    } else {
                        stats.failed += 1;
                    }
                }
            }
            std::thread::sleep(self.config.batch_pause);
        }
    }

    fn run_deletion_pass(&self, module: &Module, orphans: &[PlanItem], stats: &mut Statistics) {
        for item in orphans {
            let datastore = item.datastore.as_ref().expect("datastore present for orphan item");
            if self.config.dry_run {
                stats.marked_deleted += 1;
                continue;
            }
            let mut fields = BTreeMap::new();
            fields.insert(self.config.deleted_marker_field.clone(), self.config.deleted_marker_value.clone());
            match self.datastore.update(module, &datastore.id, &fields) {
                Ok(()) => stats.marked_deleted += 1,
                Err(_) => stats.failed += 1,
            }
        }
    }
}

fn increment_update_stat(stats: &mut Statistics, target: Side, n: usize) {
    match target {
        Side::Datastore => stats.source_newer += n,
        Side::Source => stats.datastore_newer += n,
    }
}

/// Fields where `winner` and `loser` differ under normalization, keyed by
/// the field name appropriate for the side being written to.
fn differing_fields(
    winner: &Record,
    loser: &Record,
    mapping: &ModuleMapping,
    target: Side,
) -> Vec<(String, crate::model::FieldValue)> {
    mapping
        .fields
        .values()
        .filter_map(|entry| {
            let (winner_key, target_key) = match target {
                Side::Datastore => (entry.source_name.clone(), mapping.resolve(&entry.datastore_field)?),
                Side::Source => (mapping.resolve(&entry.datastore_field)?, entry.source_name.clone()),
            };
            let winner_value = winner.field(&winner_key)?;
            let loser_value = loser.field(&target_key);
            let differs = match loser_value {
                Some(l) => l.normalize() != winner_value.normalize(),
                None => true,
            };
            differs.then(|| (target_key, winner_value.clone()))
        })
        .collect()
}

fn build_datastore_record(source: &Record, mapping: &ModuleMapping) -> Record {
    let mut fields = BTreeMap::new();
    for entry in mapping.fields.values() {
        if let (Some(name), Some(value)) = (mapping.resolve(&entry.datastore_field), source.field(&entry.source_name)) {
            fields.insert(name, value.clone());
        }
    }
    // The binding key (§3): every datastore row must carry the source id
    // under `source_id_field`, or the merge-on-sourceId upsert has nothing
    // to key against and the row is created unbound.
    fields.insert(mapping.source_id_field.clone(), crate::model::FieldValue::Text(source.id.0.clone()));
    Record {
        id: RemoteId(String::new()),
        counterpart: Some(source.id.clone()),
        modified_at: source.modified_at,
        created_at: source.created_at,
        fields,
        raw: serde_json::Value::Null,
    }
}

fn build_source_record(datastore: &Record, mapping: &ModuleMapping) -> Record {
    let mut fields = BTreeMap::new();
    for entry in mapping.fields.values() {
        if let Some(name) = mapping.resolve(&entry.datastore_field) {
            if let Some(value) = datastore.field(&name) {
                fields.insert(entry.source_name.clone(), value.clone());
            }
        }
    }
    Record {
        id: RemoteId(String::new()),
        counterpart: datastore.counterpart.clone(),
        modified_at: datastore.modified_at,
        created_at: datastore.created_at,
        fields,
        raw: serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use crate::planner::PlannerConfig;
    use crate::registry::{DatastoreFieldRef, MappingEntry};
    use crate::remote_client::{Cursor, FieldMeta, ModuleMetadata, Page};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeRemote {
        upserts: Mutex<Vec<Vec<Record>>>,
        updates: Mutex<Vec<(RemoteId, BTreeMap<String, serde_json::Value>)>>,
        deletes: Mutex<Vec<RemoteId>>,
    }

    impl RemoteClient for FakeRemote {
        fn list_modified_since(&self, _: &Module, _: chrono::DateTime<Utc>, _: Option<Cursor>) -> Result<Page<Record>, Error> {
            unimplemented!()
        }
        fn list_all(&self, _: &Module, _: Option<Cursor>) -> Result<Page<Record>, Error> {
            unimplemented!()
        }
        fn get(&self, _: &Module, _: &RemoteId) -> Result<Record, Error> {
            unimplemented!()
        }
        fn get_many(&self, _: &Module, _: &[RemoteId]) -> Result<Vec<Record>, Error> {
            unimplemented!()
        }
        fn upsert(&self, _: &Module, records: &[Record], _: MergeOn) -> Result<Vec<ItemResult>, Error> {
            self.upserts.lock().push(records.to_vec());
            Ok(records.iter().map(|_| ItemResult::Ok(RemoteId::from("new-1"))).collect())
        }
        fn update(&self, _: &Module, id: &RemoteId, fields: &BTreeMap<String, serde_json::Value>) -> Result<(), Error> {
            self.updates.lock().push((id.clone(), fields.clone()));
            Ok(())
        }
        fn delete(&self, _: &Module, id: &RemoteId) -> Result<(), Error> {
            self.deletes.lock().push(id.clone());
            Ok(())
        }
        fn list_metadata(&self, _: &Module) -> Result<ModuleMetadata, Error> {
            Ok(ModuleMetadata {
                fields: vec![FieldMeta { id: "f1".into(), name: "Phone".into(), field_type: "text".into() }],
                table_id: "t".into(),
                table_name: "Leads".into(),
            })
        }
        fn merge_key(&self) -> MergeOn {
            MergeOn::SourceId
        }
        fn max_batch_size(&self) -> usize {
            10
        }
    }

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
            created_at: Some(modified_at),
            fields,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn create_datastore_bucket_copies_fields_and_stamps_counterpart() {
        let source = Arc::new(FakeRemote::default());
        let datastore = Arc::new(FakeRemote::default());
        let tracker = Arc::new(Tracker::default());
        let executor = Executor::new(source.clone(), datastore.clone(), tracker, ExecutorConfig::default());
        let module = Module::from("Leads");
        let now = Utc::now();
        let item = PlanItem {
            disposition: Disposition::NewInDatastore,
            source: Some(record("s1", None, now, "555-0100")),
            datastore: None,
        };
        let plan = Plan { items: vec![item] };
        let stats = executor.execute(&module, &plan, &mapping());
        assert_eq!(stats.new_in_datastore, 1);
        let upserted = datastore.upserts.lock();
        assert_eq!(upserted[0][0].counterpart, Some(RemoteId::from("s1")));
        // The binding key must ride along in `fields` too, since that's what
        // an actual client serializes onto the wire — `counterpart` alone
        // never reaches the remote.
        assert_eq!(upserted[0][0].fields.get("id"), Some(&FieldValue::Text("s1".to_string())));
    }

    #[test]
    fn dry_run_never_calls_mutating_client_methods() {
        let source = Arc::new(FakeRemote::default());
        let datastore = Arc::new(FakeRemote::default());
        let tracker = Arc::new(Tracker::default());
        let mut config = ExecutorConfig::default();
        config.dry_run = true;
        let executor = Executor::new(source.clone(), datastore.clone(), tracker, config);
        let module = Module::from("Leads");
        let now = Utc::now();
        let item = PlanItem {
            disposition: Disposition::NewInDatastore,
            source: Some(record("s1", None, now, "555-0100")),
            datastore: None,
        };
        let plan = Plan { items: vec![item] };
        let stats = executor.execute(&module, &plan, &mapping());
        assert_eq!(stats.new_in_datastore, 1);
        assert!(datastore.upserts.lock().is_empty());
    }

    #[test]
    fn source_newer_update_records_tracker_entry_before_write() {
        let source = Arc::new(FakeRemote::default());
        let datastore = Arc::new(FakeRemote::default());
        let tracker = Arc::new(Tracker::default());
        let executor = Executor::new(source, datastore.clone(), tracker.clone(), ExecutorConfig::default());
        let module = Module::from("Leads");
        let now = Utc::now();
        let item = PlanItem {
            disposition: Disposition::SourceNewer,
            source: Some(record("s1", None, now, "555-0200")),
            datastore: Some(record("d1", Some("s1"), now - chrono::Duration::minutes(5), "555-0100")),
        };
        let plan = Plan { items: vec![item] };
        let stats = executor.execute(&module, &plan, &mapping());
        assert_eq!(stats.source_newer, 1);
        assert!(tracker.should_skip_field(
            Side::Datastore,
            &RemoteId::from("d1"),
            "Phone",
            &FieldValue::Text("555-0200".into())
        ));
    }

    #[test]
    fn conflicts_bucket_only_runs_under_full_inventory() {
        let source = Arc::new(FakeRemote::default());
        let datastore = Arc::new(FakeRemote::default());
        let tracker = Arc::new(Tracker::default());
        let mut config = ExecutorConfig::default();
        config.full_inventory = true;
        let executor = Executor::new(source, datastore.clone(), tracker, config);
        let module = Module::from("Leads");
        let now = Utc::now();
        let item = PlanItem {
            disposition: Disposition::Conflicts,
            source: None,
            datastore: Some(record("d1", Some("sX"), now, "A")),
        };
        let plan = Plan { items: vec![item] };
        let stats = executor.execute(&module, &plan, &mapping());
        assert_eq!(stats.marked_deleted, 1);
        assert_eq!(datastore.updates.lock().len(), 1);
    }

    #[test]
    fn missing_required_fields_counted_not_sent() {
        let source = Arc::new(FakeRemote::default());
        let datastore = Arc::new(FakeRemote::default());
        let tracker = Arc::new(Tracker::default());
        let mut config = ExecutorConfig::default();
        config.required_source_fields.insert("Email".into());
        let executor = Executor::new(source.clone(), datastore, tracker, config);
        let module = Module::from("Leads");
        let now = Utc::now();
        let item = PlanItem {
            disposition: Disposition::NewInSource,
            source: None,
            datastore: Some(record("d1", None, now, "A")),
        };
        let plan = Plan { items: vec![item] };
        let stats = executor.execute(&module, &plan, &mapping());
        assert_eq!(stats.missing_required_fields, 1);
        assert_eq!(stats.new_in_source, 0);
    }
}
