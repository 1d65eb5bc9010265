/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The concrete `TokenRefresher`/`TokenStore` the CLI wires into
//! `sync_core::token::TokenManager` — an HTTP OAuth refresh round trip and a
//! durable on-disk copy of the refreshed credentials, so a restarted process
//! doesn't have to re-run the OAuth dance.

use std::path::PathBuf;
use std::time::Duration;
use sync_core::error::Error;
use sync_core::token::{OAuthCredentials, TokenRefresher, TokenStore};

pub struct HttpTokenRefresher {
    token_url: url::Url,
    http: reqwest::blocking::Client,
}

impl HttpTokenRefresher {
    pub fn new(token_url: url::Url) -> Self {
        Self {
            token_url,
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("building the oauth http client"),
        }
    }
}

#[derive(serde::Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenRefresher for HttpTokenRefresher {
    fn refresh(&self, creds: &OAuthCredentials) -> Result<OAuthCredentials, Error> {
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &creds.refresh_token),
                ("client_id", &creds.client_id),
                ("client_secret", &creds.client_secret),
            ])
            .send()
            .map_err(|e| Error::Transient {
                remote: self.token_url.to_string(),
                source: anyhow::anyhow!(e),
            })?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                remote: self.token_url.to_string(),
                retry_after: response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs),
            });
        }
        if !response.status().is_success() {
            return Err(Error::AuthDenied {
                remote: self.token_url.to_string(),
                reason: format!("token endpoint returned {}", response.status()),
            });
        }
        let body: RefreshResponse = response
            .json()
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        Ok(OAuthCredentials {
            access_token: body.access_token,
            refresh_token: creds.refresh_token.clone(),
            expires_at: chrono::Utc::now()
                + chrono::Duration::seconds(body.expires_in.unwrap_or(3600)),
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
        })
    }
}

/// Persists refreshed tokens to a small JSON file next to the main config,
/// one file per remote, so `authorize()`'s "persist before returning"
/// contract (§4.1) survives a process restart.
pub struct JsonFileTokenStore {
    dir: PathBuf,
}

impl JsonFileTokenStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, remote: &str) -> PathBuf {
        self.dir.join(format!("{remote}.tokens.json"))
    }
}

impl TokenStore for JsonFileTokenStore {
    fn save(&self, remote: &str, creds: &OAuthCredentials) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        let text = serde_json::to_string_pretty(creds).map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        std::fs::write(self.path_for(remote), text).map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        Ok(())
    }
}
