/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The two JSON configuration documents of §6 (credentials + endpoints per
//! remote), with environment-variable overrides for secrets
//! (`SOURCE_CLIENT_ID`, `DATASTORE_API_TOKEN`, ...). Grounded on the
//! teacher's config-by-struct-plus-env convention seen across its
//! `*-client` crates, simplified here since the core has no FFI surface to
//! generate bindings for.

use crate::error::Error;
use crate::token::OAuthCredentials;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn to_credentials(&self) -> OAuthCredentials {
        OAuthCredentials {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at.unwrap_or_else(chrono::Utc::now),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    /// Overlay environment-variable secrets named after `prefix` (e.g.
    /// `SOURCE_CLIENT_ID`, `DATASTORE_API_TOKEN`) onto a config document
    /// loaded from disk — env vars win.
    fn apply_env_overrides(&mut self, prefix: &str) {
        if let Ok(v) = std::env::var(format!("{prefix}_CLIENT_ID")) {
            self.client_id = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_CLIENT_SECRET")) {
            self.client_secret = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_REFRESH_TOKEN")) {
            self.refresh_token = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_API_TOKEN")) {
            self.access_token = v;
        }
        if let Ok(v) = std::env::var(format!("{prefix}_BASE_URL")) {
            self.base_url = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub source_module: String,
    pub datastore_table: String,
    #[serde(default)]
    pub required_source_fields: Vec<String>,
    #[serde(default)]
    pub linking_policy: LinkingPolicyKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum LinkingPolicyKind {
    #[default]
    ExactKey,
    CaseInsensitiveUiName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_coalescing_secs")]
    pub coalescing_window_secs: u64,
    #[serde(default = "default_field_cooldown_secs")]
    pub field_cooldown_secs: u64,
    #[serde(default = "default_record_cooldown_secs")]
    pub record_cooldown_secs: u64,
    #[serde(default = "default_orphan_age_hours")]
    pub orphan_age_threshold_hours: u64,
    #[serde(default = "default_registry_refresh_secs")]
    pub registry_refresh_secs: u64,
}

fn default_coalescing_secs() -> u64 {
    30
}
fn default_field_cooldown_secs() -> u64 {
    10
}
fn default_record_cooldown_secs() -> u64 {
    120
}
fn default_orphan_age_hours() -> u64 {
    24
}
fn default_registry_refresh_secs() -> u64 {
    300
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            coalescing_window_secs: default_coalescing_secs(),
            field_cooldown_secs: default_field_cooldown_secs(),
            record_cooldown_secs: default_record_cooldown_secs(),
            orphan_age_threshold_hours: default_orphan_age_hours(),
            registry_refresh_secs: default_registry_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub source: RemoteConfig,
    pub datastore: RemoteConfig,
    pub modules: HashMap<String, ModuleConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub deleted_marker_field: Option<String>,
    #[serde(default)]
    pub deleted_marker_value: Option<serde_json::Value>,
}

impl AppConfig {
    /// Load the two config documents — `source_path` and `datastore_path`
    /// may point at the same file when both remotes are configured
    /// together, per §6.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigMissing(format!("{}: {e}", path.display())))?;
        let mut config: AppConfig = serde_json::from_str(&text)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.source.apply_env_overrides("SOURCE");
        config.datastore.apply_env_overrides("DATASTORE");
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.source.base_url.is_empty() {
            return Err(Error::ConfigInvalid("source.base_url is empty".into()));
        }
        if self.datastore.base_url.is_empty() {
            return Err(Error::ConfigInvalid("datastore.base_url is empty".into()));
        }
        if self.modules.is_empty() {
            return Err(Error::ConfigInvalid("no modules configured".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "source": {"base_url": "https://www.zohoapis.com/crm/v2", "client_id": "c1", "client_secret": "s1", "refresh_token": "r1"},
            "datastore": {"base_url": "https://api.airtable.com/v0/appXXX", "client_id": "c2", "client_secret": "s2", "refresh_token": "r2"},
            "modules": {"Leads": {"source_module": "Leads", "datastore_table": "Leads"}}
        }"#
    }

    #[test]
    fn loads_and_validates_minimal_config() {
        let dir = std::env::temp_dir().join(format!("sync-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("config.json");
        std::fs::write(&file, sample()).unwrap();
        let config = AppConfig::load(&file).unwrap();
        assert_eq!(config.modules.len(), 1);
        assert_eq!(config.timing.coalescing_window_secs, 30);
        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn missing_file_is_config_missing() {
        let err = AppConfig::load("/nonexistent/path/config.json").unwrap_err();
        assert!(matches!(err, Error::ConfigMissing(_)));
    }

    #[test]
    fn env_override_wins_over_file_value() {
        std::env::set_var("SOURCE_CLIENT_ID", "env-client-id");
        let dir = std::env::temp_dir().join(format!("sync-core-test-env-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("config.json");
        std::fs::write(&file, sample()).unwrap();
        let config = AppConfig::load(&file).unwrap();
        assert_eq!(config.source.client_id, "env-client-id");
        std::env::remove_var("SOURCE_CLIENT_ID");
        std::fs::remove_file(&file).unwrap();
    }
}
