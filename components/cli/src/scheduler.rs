/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The scheduler (C9, §4.9): a bulk driver running full-inventory plan and
//! execute on a fixed interval, and a poll driver running "modified since
//! last tick" plan and execute at a higher frequency. Both cooperate with
//! `interrupt_support::InterruptScope` for the cancel-between-ticks model
//! of §5.

use interrupt_support::{InterruptScope, Interruptee};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_core::error::Error;
use sync_core::executor::{Executor, Statistics};
use sync_core::model::Module;
use sync_core::planner::{plan, Inventory, PlannerConfig};
use sync_core::registry::Registry;
use sync_core::remote_client::RemoteClient;

/// One remote pair's full inventory for a module, fetched page by page
/// until the client reports no further cursor.
fn fetch_full_inventory(client: &dyn RemoteClient, module: &Module) -> Result<Vec<sync_core::model::Record>, Error> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = client.list_all(module, cursor)?;
        out.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(out)
}

fn fetch_modified_since(
    client: &dyn RemoteClient,
    module: &Module,
    since: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<sync_core::model::Record>, Error> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = client.list_modified_since(module, since, cursor)?;
        out.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(out)
}

/// Runs one module's plan+execute cycle and returns its statistics. Shared
/// by both drivers; they differ only in how they build the two
/// inventories.
pub fn run_module_cycle(
    module: &Module,
    source_inventory: Vec<sync_core::model::Record>,
    datastore_inventory: Vec<sync_core::model::Record>,
    registry: &Registry,
    executor: &Executor,
    planner_config: &PlannerConfig,
) -> Result<Statistics, Error> {
    error_support::report_breadcrumb(
        format!("plan+execute cycle for module {}", module.0),
        "scheduler".into(),
        line!(),
        column!(),
    );
    let mapping = registry
        .get(module)
        .ok_or_else(|| Error::RegistryEmpty(module.0.clone()))?;
    let source_inv = Inventory {
        side: sync_core::model::Side::Source,
        entries: source_inventory,
    };
    let datastore_inv = Inventory {
        side: sync_core::model::Side::Datastore,
        entries: datastore_inventory,
    };
    let result = plan(&source_inv, &datastore_inv, &mapping, planner_config);
    Ok(executor.execute(module, &result, &mapping))
}

/// For each configured module, runs full-inventory plan+execute on a fixed
/// tick. Runs never overlap — a tick that fires while the previous run is
/// still in flight is skipped (§4.9).
pub struct BulkDriver {
    pub modules: Vec<Module>,
    pub interval: Duration,
    running: AtomicBool,
}

impl BulkDriver {
    pub fn new(modules: Vec<Module>, interval: Duration) -> Self {
        Self {
            modules,
            interval,
            running: AtomicBool::new(false),
        }
    }

    /// Runs every configured module's cycle sequentially, once. Returns
    /// per-module statistics, carrying on past per-module failures (§7
    /// "the scheduler catches per-module errors and continues"). Each
    /// module looks up its own `Executor` so modules with different
    /// `required_source_fields`/marker config stay independent.
    pub fn run_once(
        &self,
        registry: &Registry,
        source: &dyn RemoteClient,
        datastore: &dyn RemoteClient,
        executors: &HashMap<String, Executor>,
        planner_config: &PlannerConfig,
    ) -> HashMap<String, Result<Statistics, Error>> {
        let mut results = HashMap::new();
        for module in &self.modules {
            let outcome = (|| {
                let executor = executors
                    .get(&module.0)
                    .ok_or_else(|| Error::ConfigInvalid(format!("no executor configured for module {}", module.0)))?;
                let source_inventory = fetch_full_inventory(source, module)?;
                let datastore_inventory = fetch_full_inventory(datastore, module)?;
                run_module_cycle(
                    module,
                    source_inventory,
                    datastore_inventory,
                    registry,
                    executor,
                    planner_config,
                )
            })();
            if let Err(e) = &outcome {
                tracing::error!(module = %module.0, error = %e, "bulk cycle failed for module");
            }
            results.insert(module.0.clone(), outcome);
        }
        results
    }

    /// Drives ticks until `scope` is interrupted. A tick is skipped
    /// entirely (not queued) if the previous one hadn't finished.
    pub async fn run(
        self: Arc<Self>,
        scope: InterruptScope,
        registry: Arc<Registry>,
        source: Arc<dyn RemoteClient>,
        datastore: Arc<dyn RemoteClient>,
        executors: Arc<HashMap<String, Executor>>,
        planner_config: PlannerConfig,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if scope.was_interrupted() {
                break;
            }
            if self.running.swap(true, Ordering::SeqCst) {
                tracing::warn!("skipping bulk tick: previous run still in flight");
                continue;
            }
            let driver = self.clone();
            let registry = registry.clone();
            let source = source.clone();
            let datastore = datastore.clone();
            let executors = executors.clone();
            let planner_config = planner_config.clone();
            let _ = tokio::task::spawn_blocking(move || {
                driver.run_once(&registry, source.as_ref(), datastore.as_ref(), &executors, &planner_config);
                driver.running.store(false, Ordering::SeqCst);
            })
            .await;
        }
    }
}

/// Queries "modified since last tick" on both sides at a higher frequency
/// than the bulk driver, debouncing recently-engine-written records via the
/// record-scoped tracker.
pub struct PollDriver {
    pub modules: Vec<Module>,
    pub interval: Duration,
    last_tick: parking_lot::Mutex<HashMap<String, chrono::DateTime<chrono::Utc>>>,
}

impl PollDriver {
    pub fn new(modules: Vec<Module>, interval: Duration) -> Self {
        Self {
            modules,
            interval,
            last_tick: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn run_once(
        &self,
        registry: &Registry,
        source: &dyn RemoteClient,
        datastore: &dyn RemoteClient,
        executors: &HashMap<String, Executor>,
        planner_config: &PlannerConfig,
    ) -> HashMap<String, Result<Statistics, Error>> {
        let now = chrono::Utc::now();
        let mut results = HashMap::new();
        for module in &self.modules {
            let since = {
                let mut ticks = self.last_tick.lock();
                *ticks.entry(module.0.clone()).or_insert(now)
            };
            let outcome = (|| {
                let executor = executors
                    .get(&module.0)
                    .ok_or_else(|| Error::ConfigInvalid(format!("no executor configured for module {}", module.0)))?;
                let source_inventory = fetch_modified_since(source, module, since)?;
                let datastore_inventory = fetch_modified_since(datastore, module, since)?;
                run_module_cycle(
                    module,
                    source_inventory,
                    datastore_inventory,
                    registry,
                    executor,
                    planner_config,
                )
            })();
            self.last_tick.lock().insert(module.0.clone(), now);
            results.insert(module.0.clone(), outcome);
        }
        results
    }
}
