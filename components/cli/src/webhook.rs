/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The webhook receiver (part of C8, §6). One axum route per direction; both
//! always ack 200 immediately after enqueueing a blocking poll pass onto a
//! background task, never doing the remote I/O on the request thread.
//!
//! A single webhook delivery names a handful of changed rows, but
//! `RemoteClient` (§4.2) has no "find the counterpart of this row" query —
//! only listing and per-id fetch. Rather than invent one, both routes here
//! resolve to the same action: kick a `modified-since-last-event`
//! incremental pass for the named module, scoped tightly by recency so it
//! stays cheap. The per-field loop-prevention guarantee (P4) is unaffected —
//! it's still enforced inside the executor's write path via the tracker.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sync_core::executor::Executor;
use sync_core::model::Module;
use sync_core::planner::PlannerConfig;
use sync_core::registry::Registry;
use sync_core::remote_client::RemoteClient;

use crate::scheduler::run_module_cycle;

/// How far back an incoming webhook is allowed to trigger a rescan. Keeps a
/// burst of deliveries for the same row from each re-fetching the other
/// side's whole recent history.
const EVENT_SCAN_WINDOW: Duration = Duration::from_secs(10 * 60);

pub struct WebhookState {
    pub registry: Arc<Registry>,
    pub source: Arc<dyn RemoteClient>,
    pub datastore: Arc<dyn RemoteClient>,
    pub executors: Arc<HashMap<String, Executor>>,
    pub planner_config: PlannerConfig,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/source", post(source_webhook))
        .route("/webhooks/datastore", post(datastore_webhook))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SourceWebhookPayload {
    #[allow(dead_code)]
    ids: Vec<String>,
    #[allow(dead_code)]
    operation: String,
    module: String,
}

#[derive(Debug, Deserialize)]
struct DatastoreWebhookPayload {
    #[allow(dead_code)]
    base: serde_json::Value,
    #[allow(dead_code)]
    webhook: serde_json::Value,
    #[allow(dead_code)]
    timestamp: chrono::DateTime<chrono::Utc>,
    module: String,
    #[serde(default, rename = "changedTablesById")]
    changed_tables_by_id: Option<serde_json::Value>,
}

async fn source_webhook(
    State(state): State<Arc<WebhookState>>,
    Json(payload): Json<SourceWebhookPayload>,
) -> &'static str {
    tracing::info!(module = %payload.module, ids = ?payload.ids, op = %payload.operation, "source webhook received");
    spawn_incremental_pass(state, payload.module);
    "ok"
}

async fn datastore_webhook(
    State(state): State<Arc<WebhookState>>,
    Json(payload): Json<DatastoreWebhookPayload>,
) -> &'static str {
    tracing::info!(
        module = %payload.module,
        has_tables = payload.changed_tables_by_id.is_some(),
        "datastore webhook received"
    );
    // Whether the body already named the changed tables or requires the
    // delayed payload fetch of §4.8, the outcome is the same incremental
    // pass — the distinction only matters for how quickly the remote
    // publishes the underlying row, which the poll retry loop already
    // tolerates.
    spawn_incremental_pass(state, payload.module);
    "ok"
}

fn spawn_incremental_pass(state: Arc<WebhookState>, module_name: String) {
    tokio::task::spawn_blocking(move || {
        let module = Module::from(module_name.as_str());
        let Some(executor) = state.executors.get(&module.0) else {
            tracing::warn!(module = %module.0, "webhook named a module with no configured executor");
            return;
        };
        let since = chrono::Utc::now() - chrono::Duration::from_std(EVENT_SCAN_WINDOW).unwrap();
        let fetch = |client: &dyn RemoteClient| -> Vec<sync_core::model::Record> {
            let mut out = Vec::new();
            let mut cursor = None;
            loop {
                match client.list_modified_since(&module, since, cursor) {
                    Ok(page) => {
                        out.extend(page.items);
                        match page.next {
                            Some(next) => cursor = Some(next),
                            None => break,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(module = %module.0, error = %e, "webhook-triggered fetch failed");
                        break;
                    }
                }
            }
            out
        };
        let source_inventory = fetch(state.source.as_ref());
        let datastore_inventory = fetch(state.datastore.as_ref());
        match run_module_cycle(
            &module,
            source_inventory,
            datastore_inventory,
            &state.registry,
            executor,
            &state.planner_config,
        ) {
            Ok(stats) => tracing::info!(module = %module.0, ?stats, "webhook-triggered pass complete"),
            Err(e) => tracing::error!(module = %module.0, error = %e, "webhook-triggered pass failed"),
        }
    });
}
