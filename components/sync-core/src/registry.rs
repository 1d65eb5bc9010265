/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The field-mapping registry (C4, §4.4). Grounded on `sync15::state`'s
//! "single-flight load, atomically published snapshot" shape, plus
//! `arc-swap`/`dashmap` as used in `TopGunBuild-topgun`'s server crate for
//! a wait-free-read/single-flight-write map (the teacher has no
//! hot-swappable map of this kind on its own).

use crate::error::Error;
use crate::model::Module;
use crate::remote_client::{ModuleMetadata, RemoteClient};
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// Where a datastore field is addressed from a mapping entry — by name once
/// resolved, or by id until the metadata catalog has been consulted.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DatastoreFieldRef {
    Name(String),
    Id(String),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MappingEntry {
    pub canonical_key: String,
    pub source_name: String,
    pub datastore_field: DatastoreFieldRef,
    pub ui_name: String,
    pub field_type: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModuleMapping {
    pub fields: BTreeMap<String, MappingEntry>,
    pub source_id_field: String,
    pub datastore_id_field: Option<String>,
    pub metadata_field_id_to_name: BTreeMap<String, String>,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

impl ModuleMapping {
    /// Turn an `Id` ref into a `Name` using the cached metadata catalog;
    /// `Name` refs pass through unchanged.
    pub fn resolve(&self, field: &DatastoreFieldRef) -> Option<String> {
        match field {
            DatastoreFieldRef::Name(n) => Some(n.clone()),
            DatastoreFieldRef::Id(id) => self.metadata_field_id_to_name.get(id).cloned(),
        }
    }
}

/// A pluggable strategy for deciding which source field a datastore field
/// configuration entry links to. `ExactKeyPolicy` is the default; the
/// opt-in `CaseInsensitiveUiNamePolicy` reproduces the original
/// first-match-wins heuristic with a used-field guard (§9).
pub trait LinkingPolicy: Send + Sync {
    /// Given the raw `(sourceName, datastoreField, uiName, fieldType)`
    /// candidates fetched from the datastore's fields table, pick the
    /// canonical key each links under. Candidates already linked by an
    /// earlier pass are not re-offered.
    fn link(&self, candidates: &[RawFieldCandidate]) -> BTreeMap<String, MappingEntry>;
}

#[derive(Debug, Clone)]
pub struct RawFieldCandidate {
    pub source_name: String,
    pub datastore_field: DatastoreFieldRef,
    pub ui_name: String,
    pub field_type: String,
}

/// Links on an exact match between the configured canonical key and the
/// candidate's source field name. No heuristics, no fallback.
pub struct ExactKeyPolicy;

impl LinkingPolicy for ExactKeyPolicy {
    fn link(&self, candidates: &[RawFieldCandidate]) -> BTreeMap<String, MappingEntry> {
        candidates
            .iter()
            .map(|c| {
                (
                    c.source_name.clone(),
                    MappingEntry {
                        canonical_key: c.source_name.clone(),
                        source_name: c.source_name.clone(),
                        datastore_field: c.datastore_field.clone(),
                        ui_name: c.ui_name.clone(),
                        field_type: c.field_type.clone(),
                    },
                )
            })
            .collect()
    }
}

/// Reproduces the original's `findMatchingZohoField`: case-insensitive
/// match against the UI name, first match wins, and a used-field guard so
/// no source field is linked twice.
pub struct CaseInsensitiveUiNamePolicy;

impl LinkingPolicy for CaseInsensitiveUiNamePolicy {
    fn link(&self, candidates: &[RawFieldCandidate]) -> BTreeMap<String, MappingEntry> {
        let mut used = std::collections::HashSet::new();
        let mut out = BTreeMap::new();
        for c in candidates {
            let key = c.ui_name.to_lowercase();
            if used.contains(&key) {
                continue;
            }
            used.insert(key);
            out.insert(
                c.source_name.clone(),
                MappingEntry {
                    canonical_key: c.source_name.clone(),
                    source_name: c.source_name.clone(),
                    datastore_field: c.datastore_field.clone(),
                    ui_name: c.ui_name.clone(),
                    field_type: c.field_type.clone(),
                },
            );
        }
        out
    }
}

struct ModuleState {
    snapshot: ArcSwapOption<ModuleMapping>,
    load_lock: AsyncMutex<()>,
    ready: Notify,
}

impl ModuleState {
    fn new() -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
            load_lock: AsyncMutex::new(()),
            ready: Notify::new(),
        }
    }
}

/// The per-process registry of field mappings, one `ModuleMapping` per
/// module, each independently loaded, refreshed, and destroyed.
pub struct Registry {
    modules: DashMap<Module, Arc<ModuleState>>,
    source_id_field: String,
    refresh_interval: Duration,
    policy: Box<dyn LinkingPolicy>,
}

impl Registry {
    pub fn new(source_id_field: impl Into<String>, refresh_interval: Duration) -> Self {
        Self {
            modules: DashMap::new(),
            source_id_field: source_id_field.into(),
            refresh_interval,
            policy: Box::new(ExactKeyPolicy),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn LinkingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    fn state_for(&self, module: &Module) -> Arc<ModuleState> {
        self.modules
            .entry(module.clone())
            .or_insert_with(|| Arc::new(ModuleState::new()))
            .clone()
    }

    /// Wait-free read of the current snapshot, if any.
    pub fn get(&self, module: &Module) -> Option<Arc<ModuleMapping>> {
        self.modules.get(module).and_then(|s| s.snapshot.load_full())
    }

    /// Single-flight load-and-publish. Concurrent callers for the same
    /// module collapse onto the holder of `load_lock`; everyone else just
    /// reads back whatever snapshot lands.
    pub async fn initialize(
        &self,
        module: &Module,
        client: &dyn RemoteClient,
    ) -> Result<Arc<ModuleMapping>, Error> {
        let state = self.state_for(module);
        let _guard = state.load_lock.lock().await;
        if let Some(existing) = state.snapshot.load_full() {
            // Someone else's concurrent initialize already published while
            // we waited on the lock.
            return Ok(existing);
        }
        let mapping = self.fetch(module, client).await?;
        let mapping = Arc::new(mapping);
        state.snapshot.store(Some(mapping.clone()));
        state.ready.notify_waiters();
        Ok(mapping)
    }

    /// Block until the first successful load or `deadline`, per the
    /// bootstrap rule: a registry that never loads is module-fatal, not a
    /// silent partial mapping.
    pub async fn ensure_initialized(
        &self,
        module: &Module,
        client: &dyn RemoteClient,
        deadline: Duration,
    ) -> Result<Arc<ModuleMapping>, Error> {
        if let Some(existing) = self.get(module) {
            return Ok(existing);
        }
        let state = self.state_for(module);
        let wait = state.ready.notified();
        tokio::select! {
            result = self.initialize(module, client) => result,
            _ = tokio::time::sleep(deadline) => {
                drop(wait);
                self.get(module).ok_or_else(|| Error::RegistryEmpty(module.0.clone()))
            }
        }
    }

    async fn fetch(&self, module: &Module, client: &dyn RemoteClient) -> Result<ModuleMapping, Error> {
        let metadata: ModuleMetadata = client.list_metadata(module)?;
        let metadata_field_id_to_name: BTreeMap<String, String> = metadata
            .fields
            .iter()
            .map(|f| (f.id.clone(), f.name.clone()))
            .collect();
        let candidates: Vec<RawFieldCandidate> = metadata
            .fields
            .iter()
            .map(|f| RawFieldCandidate {
                source_name: f.name.clone(),
                datastore_field: DatastoreFieldRef::Id(f.id.clone()),
                ui_name: f.name.clone(),
                field_type: f.field_type.clone(),
            })
            .collect();
        let fields = self.policy.link(&candidates);
        if fields.is_empty() {
            return Err(Error::RegistryEmpty(module.0.clone()));
        }
        Ok(ModuleMapping {
            fields,
            source_id_field: self.source_id_field.clone(),
            datastore_id_field: Some("sourceId".into()),
            metadata_field_id_to_name,
            loaded_at: chrono::Utc::now(),
        })
    }

    /// Spawn the per-module background refresher. Refresh failures are
    /// logged and swallowed — the previous snapshot stays published.
    pub fn spawn_refresher(self: &Arc<Self>, module: Module, client: Arc<dyn RemoteClient>) {
        let registry = self.clone();
        let interval = self.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                let state = registry.state_for(&module);
                let _guard = state.load_lock.lock().await;
                match registry.fetch(&module, client.as_ref()).await {
                    Ok(mapping) => {
                        state.snapshot.store(Some(Arc::new(mapping)));
                        state.ready.notify_waiters();
                    }
                    Err(e) => {
                        tracing::warn!(module = %module.0, error = %e, "registry refresh failed, keeping prior mapping");
                    }
                }
            }
        });
    }

    pub fn destroy(&self, module: &Module) {
        self.modules.remove(module);
    }

    pub fn destroy_all(&self) {
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Module, Record, RemoteId};
    use crate::remote_client::{Cursor, FieldMeta, ItemResult, MergeOn, Page};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeClient {
        calls: AtomicU32,
        fields: Vec<FieldMeta>,
    }

    impl RemoteClient for FakeClient {
        fn list_modified_since(
            &self,
            _: &Module,
            _: chrono::DateTime<chrono::Utc>,
            _: Option<Cursor>,
        ) -> Result<Page<Record>, Error> {
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
        fn upsert(&self, _: &Module, _: &[Record], _: MergeOn) -> Result<Vec<ItemResult>, Error> {
            unimplemented!()
        }
        fn update(
            &self,
            _: &Module,
            _: &RemoteId,
            _: &BTreeMap<String, serde_json::Value>,
        ) -> Result<(), Error> {
            unimplemented!()
        }
        fn delete(&self, _: &Module, _: &RemoteId) -> Result<(), Error> {
            unimplemented!()
        }
        fn list_metadata(&self, _: &Module) -> Result<ModuleMetadata, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModuleMetadata {
                fields: self.fields.clone(),
                table_id: "tbl1".into(),
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

    fn fake(fields: Vec<FieldMeta>) -> FakeClient {
        FakeClient {
            calls: AtomicU32::new(0),
            fields,
        }
    }

    #[tokio::test]
    async fn get_before_initialize_is_none() {
        let registry = Registry::new("sourceId", Duration::from_secs(300));
        assert!(registry.get(&Module::from("Leads")).is_none());
    }

    #[tokio::test]
    async fn initialize_publishes_a_snapshot() {
        let registry = Registry::new("sourceId", Duration::from_secs(300));
        let client = fake(vec![FieldMeta {
            id: "fld1".into(),
            name: "Email".into(),
            field_type: "text".into(),
        }]);
        let module = Module::from("Leads");
        let mapping = registry.initialize(&module, &client).await.unwrap();
        assert!(mapping.fields.contains_key("Email"));
        assert!(registry.get(&module).is_some());
    }

    #[tokio::test]
    async fn empty_field_list_is_registry_empty() {
        let registry = Registry::new("sourceId", Duration::from_secs(300));
        let client = fake(vec![]);
        let err = registry
            .initialize(&Module::from("Leads"), &client)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RegistryEmpty(_)));
    }

    #[test]
    fn case_insensitive_policy_guards_against_double_linking() {
        let candidates = vec![
            RawFieldCandidate {
                source_name: "Email".into(),
                datastore_field: DatastoreFieldRef::Id("f1".into()),
                ui_name: "Email Address".into(),
                field_type: "text".into(),
            },
            RawFieldCandidate {
                source_name: "Email2".into(),
                datastore_field: DatastoreFieldRef::Id("f2".into()),
                ui_name: "EMAIL ADDRESS".into(),
                field_type: "text".into(),
            },
        ];
        let linked = CaseInsensitiveUiNamePolicy.link(&candidates);
        assert_eq!(linked.len(), 1);
        assert!(linked.contains_key("Email"));
    }
}
