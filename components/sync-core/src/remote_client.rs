/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The remote client abstraction (C2, §4.2/§6). One trait, two concrete
//! `reqwest::blocking`-backed implementations — grounded on
//! `Sync15StorageClient`'s shape (a thin typed wrapper that goes through a
//! rate gate and a token provider before every call and classifies the
//! response into the project's own error kinds).

use crate::error::Error;
use crate::model::{Module, Record, RemoteId};
use crate::rate_limit::RateLimiter;
use crate::retry::{retry, RetryPolicy};
use crate::token::TokenManager;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An opaque, monotone pagination cursor (§6: "monotone pagination with an
/// opaque cursor").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Cursor(pub String);

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<Cursor>,
}

/// Metadata about one module's fields, as reported by the datastore's
/// "fields" table (consumed by the registry, C4).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct FieldMeta {
    pub id: String,
    pub name: String,
    pub field_type: String,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ModuleMetadata {
    pub fields: Vec<FieldMeta>,
    pub table_id: String,
    pub table_name: String,
}

/// Result of one record inside a batch upsert — partial-batch failures
/// (§7 `partial-batch`) are reported per-record, not as an all-or-nothing
/// batch result.
#[derive(Debug, Clone)]
pub enum ItemResult {
    Ok(RemoteId),
    Failed { id: Option<RemoteId>, reason: String },
}

/// The key used to merge an upsert batch (§6: "batch upsert honoring a
/// merge-on key").
#[derive(Debug, Clone, Copy)]
pub enum MergeOn {
    SourceId,
    NativeId,
}

/// The abstract operations the core depends on (§4.2). Implemented once
/// per remote by `CrmClient`/`DatastoreClient`, and by an in-memory fake in
/// tests.
pub trait RemoteClient: Send + Sync {
    fn list_modified_since(
        &self,
        module: &Module,
        since: DateTime<Utc>,
        cursor: Option<Cursor>,
    ) -> Result<Page<Record>, Error>;

    fn list_all(&self, module: &Module, cursor: Option<Cursor>) -> Result<Page<Record>, Error>;

    fn get(&self, module: &Module, id: &RemoteId) -> Result<Record, Error>;

    fn get_many(&self, module: &Module, ids: &[RemoteId]) -> Result<Vec<Record>, Error>;

    fn upsert(
        &self,
        module: &Module,
        records: &[Record],
        merge_on: MergeOn,
    ) -> Result<Vec<ItemResult>, Error>;

    fn update(
        &self,
        module: &Module,
        id: &RemoteId,
        fields: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), Error>;

    fn delete(&self, module: &Module, id: &RemoteId) -> Result<(), Error>;

    fn list_metadata(&self, module: &Module) -> Result<ModuleMetadata, Error>;

    /// The merge key this remote's batch upsert is keyed on (§6).
    fn merge_key(&self) -> MergeOn;

    /// Maximum batch size for `upsert`/`get_many` (≤10 datastore, default
    /// 100 source per §4.2).
    fn max_batch_size(&self) -> usize;
}

/// Adaptive ID-list batch size for "filter by OR over many IDs" queries
/// against the datastore (§4.2). Client-observable state only — the
/// planner/executor never see it.
pub struct AdaptiveBatch {
    size: AtomicUsize,
    consecutive_successes: AtomicUsize,
    floor: usize,
    ceiling: usize,
}

impl AdaptiveBatch {
    pub fn new() -> Self {
        Self {
            size: AtomicUsize::new(5),
            consecutive_successes: AtomicUsize::new(0),
            floor: 1,
            ceiling: 10,
        }
    }

    pub fn current(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Halve (floor 1) on a 413/414/url-too-long response, and retry the
    /// same range at the smaller size.
    pub fn on_url_too_long(&self) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let mut cur = self.size.load(Ordering::Relaxed);
        cur = (cur / 2).max(self.floor);
        self.size.store(cur, Ordering::Relaxed);
    }

    /// Grow by 1 (bounded at 10) after enough consecutive successful
    /// batches.
    pub fn on_success(&self) {
        let successes = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if successes >= 3 {
            self.consecutive_successes.store(0, Ordering::Relaxed);
            let cur = self.size.load(Ordering::Relaxed);
            if cur < self.ceiling {
                self.size.store(cur + 1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for AdaptiveBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared plumbing both concrete HTTP clients go through: rate gate, token
/// manager, retry policy, and a request timeout (§5: 30s source / 60s
/// datastore).
pub struct HttpClientContext {
    pub base_url: url::Url,
    pub http: reqwest::blocking::Client,
    pub tokens: Arc<TokenManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub retry_policy: RetryPolicy,
}

impl HttpClientContext {
    pub fn new(
        base_url: url::Url,
        timeout: Duration,
        tokens: Arc<TokenManager>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        Ok(Self {
            base_url,
            http,
            tokens,
            rate_limiter,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Run `call` under the rate gate with a fresh bearer token, forcing
    /// exactly one token refresh-and-retry on a 401 (§4.1), and the
    /// crate-wide retry policy for transient failures.
    pub fn send<T>(
        &self,
        remote: &str,
        mut call: impl FnMut(&str) -> Result<T, Error>,
    ) -> Result<T, Error> {
        retry(&self.retry_policy, || {
            self.rate_limiter.acquire();
            let token = self.tokens.authorize()?;
            tracing::debug!(remote, token = %error_support::redact::redact_secret(&token), "authorized request");
            match call(&token) {
                Ok(v) => {
                    self.rate_limiter.on_success();
                    Ok(v)
                }
                Err(Error::Validation(msg)) if msg == "unauthorized" => {
                    let token = self.tokens.force_refresh()?;
                    tracing::debug!(remote, token = %error_support::redact::redact_secret(&token), "authorized request after forced refresh");
                    let result = call(&token);
                    if result.is_ok() {
                        self.rate_limiter.on_success();
                    }
                    result.map_err(|_| Error::AuthExpired {
                        remote: remote.to_string(),
                        reason: "token rejected after forced refresh".into(),
                    })
                }
                Err(Error::RateLimited { retry_after, remote: r }) => {
                    self.rate_limiter.on_rate_limited();
                    Err(Error::RateLimited {
                        retry_after,
                        remote: r,
                    })
                }
                Err(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_batch_starts_at_five_and_bounds() {
        let batch = AdaptiveBatch::new();
        assert_eq!(batch.current(), 5);
        batch.on_url_too_long();
        assert_eq!(batch.current(), 2);
        batch.on_url_too_long();
        assert_eq!(batch.current(), 1);
        batch.on_url_too_long();
        assert_eq!(batch.current(), 1); // floor
    }

    #[test]
    fn adaptive_batch_grows_after_three_successes_bounded_at_ten() {
        let batch = AdaptiveBatch::new();
        for _ in 0..3 {
            batch.on_success();
        }
        assert_eq!(batch.current(), 6);
        for _ in 0..200 {
            batch.on_success();
        }
        assert_eq!(batch.current(), 10);
    }
}
