/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The CRM-side remote client, grounded on `Sync15StorageClient`'s header
//! construction and response classification.

use crate::error::Error;
use crate::model::{Module, Record, RemoteId};
use crate::remote_client::{
    Cursor, FieldMeta, HttpClientContext, ItemResult, MergeOn, ModuleMetadata, Page, RemoteClient,
};
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct CrmClient {
    ctx: HttpClientContext,
}

impl CrmClient {
    pub fn new(ctx: HttpClientContext) -> Self {
        Self { ctx }
    }

    fn classify_status(&self, status: reqwest::StatusCode, retry_after: Option<Duration>) -> Error {
        match status.as_u16() {
            401 => Error::Validation("unauthorized".into()),
            404 => Error::NotFound,
            413 | 414 => Error::UrlTooLong {
                remote: "source".into(),
            },
            429 => Error::RateLimited {
                remote: "source".into(),
                retry_after,
            },
            500..=599 => Error::Transient {
                remote: "source".into(),
                source: anyhow::anyhow!("http {status}"),
            },
            _ => Error::Validation(format!("unexpected status {status}")),
        }
    }

    fn parse_record(&self, raw: serde_json::Value) -> Record {
        let id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .into();
        let modified = parse_time(raw.get("Modified_Time"));
        let activity = parse_time(raw.get("Last_Activity_Time"));
        let created = parse_time(raw.get("Created_Time"));
        let modified_at = Record::resolve_modified_at(modified, activity, created);
        let mut fields = std::collections::BTreeMap::new();
        if let Some(obj) = raw.as_object() {
            for (k, v) in obj {
                fields.insert(k.clone(), crate::model::FieldValue::from_json(v.clone()));
            }
        }
        Record {
            id,
            counterpart: None,
            modified_at,
            created_at: created,
            fields,
            raw,
        }
    }
}

fn parse_time(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl RemoteClient for CrmClient {
    fn list_modified_since(
        &self,
        module: &Module,
        since: DateTime<Utc>,
        cursor: Option<Cursor>,
    ) -> Result<Page<Record>, Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("crm/v2/{}", module.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("source", |token| {
            let mut req = self.ctx.http.get(url.clone()).header(AUTHORIZATION, format!("Bearer {token}"));
            req = req.query(&[("modified_since", since.to_rfc3339())]);
            if let Some(c) = &cursor {
                req = req.query(&[("page_token", &c.0)]);
            }
            let resp = req.send().map_err(|e| Error::Transient {
                remote: "source".into(),
                source: anyhow::anyhow!(e),
            })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            let body: ListResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            Ok(Page {
                items: body.data.into_iter().map(|r| self.parse_record(r)).collect(),
                next: body.next_page_token.map(Cursor),
            })
        })
    }

    fn list_all(&self, module: &Module, cursor: Option<Cursor>) -> Result<Page<Record>, Error> {
        // Same endpoint shape without a `modified_since` filter, sorted
        // newest-first by the server per §4.2.
        self.list_modified_since(module, DateTime::<Utc>::MIN_UTC, cursor)
    }

    fn get(&self, module: &Module, id: &RemoteId) -> Result<Record, Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("crm/v2/{}/{}", module.0, id.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("source", |token| {
            let resp = self
                .ctx
                .http
                .get(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "source".into(),
                    source: anyhow::anyhow!(e),
                })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            let body: serde_json::Value = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            Ok(self.parse_record(body))
        })
    }

    fn get_many(&self, module: &Module, ids: &[RemoteId]) -> Result<Vec<Record>, Error> {
        // §4.2: batch ≤ remote limit, default 100 for source.
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_batch_size()) {
            let url = self
                .ctx
                .base_url
                .join(&format!("crm/v2/{}", module.0))
                .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            let ids_csv = chunk.iter().map(|i| i.0.as_str()).collect::<Vec<_>>().join(",");
            let page = self.ctx.send("source", |token| {
                let resp = self
                    .ctx
                    .http
                    .get(url.clone())
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .query(&[("ids", &ids_csv)])
                    .send()
                    .map_err(|e| Error::Transient {
                        remote: "source".into(),
                        source: anyhow::anyhow!(e),
                    })?;
                if !resp.status().is_success() {
                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    return Err(self.classify_status(resp.status(), retry_after));
                }
                let body: ListResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
                Ok(body.data)
            })?;
            out.extend(page.into_iter().map(|r| self.parse_record(r)));
        }
        Ok(out)
    }

    fn upsert(
        &self,
        module: &Module,
        records: &[Record],
        _merge_on: MergeOn,
    ) -> Result<Vec<ItemResult>, Error> {
        // The source side upserts one record per call (§4.2: "per-record
        // for source").
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let url = self
                .ctx
                .base_url
                .join(&format!("crm/v2/{}", module.0))
                .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            let body: BTreeMap<_, _> = record
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null)))
                .collect();
            let outcome = self.ctx.send("source", |token| {
                let resp = self
                    .ctx
                    .http
                    .post(url.clone())
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .json(&body)
                    .send()
                    .map_err(|e| Error::Transient {
                        remote: "source".into(),
                        source: anyhow::anyhow!(e),
                    })?;
                if !resp.status().is_success() {
                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    return Err(self.classify_status(resp.status(), retry_after));
                }
                let body: serde_json::Value = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
                Ok(body.get("id").and_then(|v| v.as_str()).map(RemoteId::from))
            });
            match outcome {
                Ok(Some(id)) => results.push(ItemResult::Ok(id)),
                Ok(None) => results.push(ItemResult::Failed {
                    id: Some(record.id.clone()),
                    reason: "no id returned".into(),
                }),
                Err(e) => results.push(ItemResult::Failed {
                    id: Some(record.id.clone()),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(results)
    }

    fn update(
        &self,
        module: &Module,
        id: &RemoteId,
        fields: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("crm/v2/{}/{}", module.0, id.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("source", |token| {
            let resp = self
                .ctx
                .http
                .put(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .json(fields)
                .send()
                .map_err(|e| Error::Transient {
                    remote: "source".into(),
                    source: anyhow::anyhow!(e),
                })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            Ok(())
        })
    }

    fn delete(&self, module: &Module, id: &RemoteId) -> Result<(), Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("crm/v2/{}/{}", module.0, id.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("source", |token| {
            let resp = self
                .ctx
                .http
                .delete(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "source".into(),
                    source: anyhow::anyhow!(e),
                })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            Ok(())
        })
    }

    fn list_metadata(&self, module: &Module) -> Result<ModuleMetadata, Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("crm/v2/settings/fields?module={}", module.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("source", |token| {
            let resp = self
                .ctx
                .http
                .get(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "source".into(),
                    source: anyhow::anyhow!(e),
                })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            let body: MetadataResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            Ok(ModuleMetadata {
                fields: body.fields,
                table_id: module.0.clone(),
                table_name: module.0.clone(),
            })
        })
    }

    fn merge_key(&self) -> MergeOn {
        MergeOn::NativeId
    }

    fn max_batch_size(&self) -> usize {
        100
    }
}

#[derive(serde::Deserialize)]
struct ListResponse {
    data: Vec<serde_json::Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(serde::Deserialize)]
struct MetadataResponse {
    fields: Vec<FieldMeta>,
}

fn parse_retry_after(header: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    header
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}
