/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Wires one `AppConfig` into the concrete clients, registry, tracker, and
//! executor the subcommands drive. Grounded on the teacher's
//! `build_service()` helper in `remote-settings-cli`, generalized to two
//! remotes instead of one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sync_core::config::{AppConfig, LinkingPolicyKind, ModuleConfig};
use sync_core::crm_client::CrmClient;
use sync_core::datastore_client::DatastoreClient;
use sync_core::error::Error;
use sync_core::executor::{Executor, ExecutorConfig};
use sync_core::planner::PlannerConfig;
use sync_core::rate_limit::RateLimiter;
use sync_core::registry::{CaseInsensitiveUiNamePolicy, ExactKeyPolicy, Registry};
use sync_core::remote_client::{HttpClientContext, RemoteClient};
use sync_core::token::{MemoryTokenStore, TokenManager};
use sync_core::tracker::Tracker;

use crate::oauth::{HttpTokenRefresher, JsonFileTokenStore};

pub struct App {
    pub config: AppConfig,
    pub source: Arc<dyn RemoteClient>,
    pub datastore: Arc<dyn RemoteClient>,
    pub registry: Arc<Registry>,
    pub tracker: Arc<Tracker>,
}

impl App {
    pub fn build(config: AppConfig, state_dir: std::path::PathBuf) -> Result<Self, Error> {
        let source_limiter = Arc::new(RateLimiter::new(Duration::from_millis(75)));
        let datastore_limiter = Arc::new(RateLimiter::new(Duration::from_millis(200)));

        let source = Arc::new(CrmClient::new(build_http_context(
            &config.source,
            &state_dir,
            "source",
            source_limiter,
        )?));
        let datastore = Arc::new(DatastoreClient::new(build_http_context(
            &config.datastore,
            &state_dir,
            "datastore",
            datastore_limiter,
        )?));

        let registry = Arc::new(build_registry(&config));
        let tracker = Arc::new(Tracker::new(
            Duration::from_secs(config.timing.field_cooldown_secs),
            Duration::from_secs(config.timing.record_cooldown_secs),
        ));

        Ok(Self {
            config,
            source,
            datastore,
            registry,
            tracker,
        })
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            coalescing_window: Duration::from_secs(self.config.timing.coalescing_window_secs),
            ..PlannerConfig::default()
        }
    }

    pub fn executor_for(&self, module_config: &ModuleConfig, dry_run: bool, full_inventory: bool) -> Executor {
        let mut required: HashSet<String> = HashSet::new();
        required.extend(module_config.required_source_fields.iter().cloned());
        let mut config = ExecutorConfig {
            dry_run,
            full_inventory,
            required_source_fields: required,
            ..ExecutorConfig::default()
        };
        if let Some(field) = &self.config.deleted_marker_field {
            config.deleted_marker_field = field.clone();
        }
        if let Some(value) = &self.config.deleted_marker_value {
            config.deleted_marker_value = value.clone();
        }
        config.orphan_age_threshold = Duration::from_secs(self.config.timing.orphan_age_threshold_hours * 3600);
        Executor::new(self.source.clone(), self.datastore.clone(), self.tracker.clone(), config)
    }
}

fn build_registry(config: &AppConfig) -> Registry {
    let refresh = Duration::from_secs(config.timing.registry_refresh_secs);
    let uses_case_insensitive = config
        .modules
        .values()
        .any(|m| matches!(m.linking_policy, LinkingPolicyKind::CaseInsensitiveUiName));
    let registry = Registry::new("sourceId", refresh);
    if uses_case_insensitive {
        registry.with_policy(Box::new(CaseInsensitiveUiNamePolicy))
    } else {
        registry.with_policy(Box::new(ExactKeyPolicy))
    }
}

fn build_http_context(
    remote: &sync_core::config::RemoteConfig,
    state_dir: &std::path::Path,
    name: &str,
    rate_limiter: Arc<RateLimiter>,
) -> Result<HttpClientContext, Error> {
    let base_url = url::Url::parse(&remote.base_url).map_err(|e| Error::ConfigInvalid(format!("{name}.base_url: {e}")))?;
    let token_url = base_url
        .join("oauth/token")
        .map_err(|e| Error::ConfigInvalid(format!("{name}: {e}")))?;
    let tokens = Arc::new(TokenManager::new(
        name,
        remote.to_credentials(),
        Box::new(HttpTokenRefresher::new(token_url)),
        if remote.access_token.is_empty() {
            Box::new(JsonFileTokenStore::new(state_dir.to_path_buf()))
        } else {
            Box::new(MemoryTokenStore)
        },
    ));
    HttpClientContext::new(base_url, remote.timeout(), tokens, rate_limiter)
}
