/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The datastore-side remote client. Differs from `CrmClient` in batching
//! shape: the datastore supports a true batch upsert (≤10 records/call,
//! §4.2) and an adaptive "filter by OR over IDs" query for `get_many`
//! instead of the source's simple `ids=` query param.

use crate::error::Error;
use crate::model::{Module, Record, RemoteId};
use crate::remote_client::{
    AdaptiveBatch, Cursor, FieldMeta, HttpClientContext, ItemResult, MergeOn, ModuleMetadata, Page,
    RemoteClient,
};
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use std::collections::BTreeMap;
use std::time::Duration;

pub struct DatastoreClient {
    ctx: HttpClientContext,
    batch: AdaptiveBatch,
}

impl DatastoreClient {
    pub fn new(ctx: HttpClientContext) -> Self {
        Self {
            ctx,
            batch: AdaptiveBatch::new(),
        }
    }

    fn classify_status(&self, status: reqwest::StatusCode, retry_after: Option<Duration>) -> Error {
        match status.as_u16() {
            401 => Error::Validation("unauthorized".into()),
            404 => Error::NotFound,
            413 | 422 => Error::UrlTooLong {
                remote: "datastore".into(),
            },
            429 => Error::RateLimited {
                remote: "datastore".into(),
                retry_after,
            },
            500..=599 => Error::Transient {
                remote: "datastore".into(),
                source: anyhow::anyhow!("http {status}"),
            },
            _ => Error::Validation(format!("unexpected status {status}")),
        }
    }

    fn parse_record(&self, row: DatastoreRow) -> Record {
        let mut fields = BTreeMap::new();
        if let Some(obj) = row.fields.as_object() {
            for (k, v) in obj {
                fields.insert(k.clone(), crate::model::FieldValue::from_json(v.clone()));
            }
        }
        let counterpart = row
            .fields
            .get("sourceId")
            .and_then(|v| v.as_str())
            .map(RemoteId::from);
        Record {
            id: RemoteId(row.id),
            counterpart,
            modified_at: row.last_modified_time.unwrap_or_else(Utc::now),
            created_at: row.created_time,
            fields,
            raw: row.fields,
        }
    }

    /// Build the `OR(RECORD_ID() = ..., ...)`-style formula the datastore's
    /// list endpoint accepts for an ID-list lookup, in batches sized by
    /// `self.batch`, retrying a batch at half size on a too-long response
    /// (§4.2).
    fn fetch_by_ids(&self, module: &Module, ids: &[RemoteId]) -> Result<Vec<Record>, Error> {
        let mut out = Vec::with_capacity(ids.len());
        let mut remaining = ids;
        while !remaining.is_empty() {
            let size = self.batch.current().min(remaining.len());
            let (chunk, rest) = remaining.split_at(size);
            let formula = chunk
                .iter()
                .map(|id| format!("RECORD_ID()='{}'", id.0))
                .collect::<Vec<_>>()
                .join(",");
            let url = self
                .ctx
                .base_url
                .join(&format!("v0/{}", module.0))
                .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            let result = self.ctx.send("datastore", |token| {
                let resp = self
                    .ctx
                    .http
                    .get(url.clone())
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .query(&[("filterByFormula", format!("OR({formula})"))])
                    .send()
                    .map_err(|e| Error::Transient {
                        remote: "datastore".into(),
                        source: anyhow::anyhow!(e),
                    })?;
                if !resp.status().is_success() {
                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    return Err(self.classify_status(resp.status(), retry_after));
                }
                let body: ListResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
                Ok(body.records)
            });
            match result {
                Ok(rows) => {
                    self.batch.on_success();
                    out.extend(rows.into_iter().map(|r| self.parse_record(r)));
                    remaining = rest;
                }
                Err(Error::UrlTooLong { .. }) => {
                    self.batch.on_url_too_long();
                    // retry the same range at the smaller size.
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

impl RemoteClient for DatastoreClient {
    fn list_modified_since(
        &self,
        module: &Module,
        since: DateTime<Utc>,
        cursor: Option<Cursor>,
    ) -> Result<Page<Record>, Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("v0/{}", module.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        let formula = format!("IS_AFTER(LAST_MODIFIED_TIME(), '{}')", since.to_rfc3339());
        self.ctx.send("datastore", |token| {
            let mut req = self
                .ctx
                .http
                .get(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .query(&[("filterByFormula", &formula)]);
            if let Some(c) = &cursor {
                req = req.query(&[("offset", &c.0)]);
            }
            let resp = req.send().map_err(|e| Error::Transient {
                remote: "datastore".into(),
                source: anyhow::anyhow!(e),
            })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            let body: ListResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            Ok(Page {
                items: body.records.into_iter().map(|r| self.parse_record(r)).collect(),
                next: body.offset.map(Cursor),
            })
        })
    }

    fn list_all(&self, module: &Module, cursor: Option<Cursor>) -> Result<Page<Record>, Error> {
        self.list_modified_since(module, DateTime::<Utc>::from_timestamp(0, 0).unwrap(), cursor)
    }

    fn get(&self, module: &Module, id: &RemoteId) -> Result<Record, Error> {
        let url = self
            .ctx
            .base_url
            .join(&format!("v0/{}/{}", module.0, id.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("datastore", |token| {
            let resp = self
                .ctx
                .http
                .get(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "datastore".into(),
                    source: anyhow::anyhow!(e),
                })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            let row: DatastoreRow = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            Ok(self.parse_record(row))
        })
    }

    fn get_many(&self, module: &Module, ids: &[RemoteId]) -> Result<Vec<Record>, Error> {
        self.fetch_by_ids(module, ids)
    }

    fn upsert(
        &self,
        module: &Module,
        records: &[Record],
        merge_on: MergeOn,
    ) -> Result<Vec<ItemResult>, Error> {
        let merge_field = match merge_on {
            MergeOn::SourceId => "sourceId",
            MergeOn::NativeId => "id",
        };
        let url = self
            .ctx
            .base_url
            .join(&format!("v0/{}", module.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        let mut results = Vec::with_capacity(records.len());
        for chunk in records.chunks(self.max_batch_size()) {
            let payload: Vec<_> = chunk
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "fields": r.fields.iter().map(|(k, v)| {
                            (k.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null))
                        }).collect::<BTreeMap<_, _>>(),
                    })
                })
                .collect();
            let outcome = self.ctx.send("datastore", |token| {
                let resp = self
                    .ctx
                    .http
                    .patch(url.clone())
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .query(&[("performUpsert[fieldsToMergeOn][]", merge_field)])
                    .json(&serde_json::json!({ "records": payload }))
                    .send()
                    .map_err(|e| Error::Transient {
                        remote: "datastore".into(),
                        source: anyhow::anyhow!(e),
                    })?;
                if !resp.status().is_success() {
                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    return Err(self.classify_status(resp.status(), retry_after));
                }
                let body: ListResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
                Ok(body.records)
            });
            match outcome {
                Ok(rows) => {
                    results.extend(rows.into_iter().map(|r| ItemResult::Ok(RemoteId(r.id))));
                }
                Err(Error::UrlTooLong { .. }) => {
                    for record in chunk {
                        results.push(ItemResult::Failed {
                            id: Some(record.id.clone()),
                            reason: "batch payload too large".into(),
                        });
                    }
                }
                Err(e) => {
                    for record in chunk {
                        results.push(ItemResult::Failed {
                            id: Some(record.id.clone()),
                            reason: e.to_string(),
                        });
                    }
                }
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
            .join(&format!("v0/{}/{}", module.0, id.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("datastore", |token| {
            let resp = self
                .ctx
                .http
                .patch(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .json(&serde_json::json!({ "fields": fields }))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "datastore".into(),
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
            .join(&format!("v0/{}/{}", module.0, id.0))
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("datastore", |token| {
            let resp = self
                .ctx
                .http
                .delete(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "datastore".into(),
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
            .join("meta/bases/tables")
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.ctx.send("datastore", |token| {
            let resp = self
                .ctx
                .http
                .get(url.clone())
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .map_err(|e| Error::Transient {
                    remote: "datastore".into(),
                    source: anyhow::anyhow!(e),
                })?;
            if !resp.status().is_success() {
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                return Err(self.classify_status(resp.status(), retry_after));
            }
            let body: TablesResponse = resp.json().map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            let table = body
                .tables
                .into_iter()
                .find(|t| t.name == module.0)
                .ok_or(Error::NotFound)?;
            Ok(ModuleMetadata {
                fields: table.fields,
                table_id: table.id,
                table_name: table.name,
            })
        })
    }

    fn merge_key(&self) -> MergeOn {
        MergeOn::SourceId
    }

    fn max_batch_size(&self) -> usize {
        10
    }
}

#[derive(serde::Deserialize)]
struct DatastoreRow {
    id: String,
    fields: serde_json::Value,
    #[serde(rename = "createdTime")]
    created_time: Option<DateTime<Utc>>,
    #[serde(rename = "lastModifiedTime")]
    last_modified_time: Option<DateTime<Utc>>,
}

#[derive(serde::Deserialize)]
struct ListResponse {
    records: Vec<DatastoreRow>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(serde::Deserialize)]
struct TablesResponse {
    tables: Vec<TableMeta>,
}

#[derive(serde::Deserialize)]
struct TableMeta {
    id: String,
    name: String,
    fields: Vec<FieldMeta>,
}

fn parse_retry_after(header: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    header
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}
