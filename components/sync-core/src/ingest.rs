/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Event ingest (C8, §4.8). Grounded on §9's instruction to replace the
//! original's two incompatible webhook payload shapes with one
//! `InboundEvent` sum type that reduces to a flat list of changed fields
//! before anything downstream sees it.

use crate::error::Error;
use crate::model::{FieldValue, Module, RemoteId, Side};
use crate::remote_client::Cursor;
use crate::tracker::Tracker;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChangedField {
    pub row_id: RemoteId,
    pub field: String,
    pub value: FieldValue,
}

/// One inbound webhook delivery, already classified into one of the two
/// shapes the original code handled with separate ad-hoc paths (§9).
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// The webhook body itself carries the changed rows and fields.
    DirectChange {
        module: Module,
        side: Side,
        changes: Vec<ChangedField>,
    },
    /// The webhook body is just a pointer; the actual change has to be
    /// pulled from the remote's payload-history endpoint, which may lag.
    Handle {
        module: Module,
        side: Side,
        base_id: String,
        webhook_id: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub ts: DateTime<Utc>,
    pub changes: Vec<ChangedField>,
}

/// Queried for `Handle`-style events to recover the actual changed fields.
pub trait PayloadHistorySource: Send + Sync {
    fn fetch_recent_payloads(
        &self,
        module: &Module,
        base_id: &str,
        cursor: Option<Cursor>,
    ) -> Result<(Vec<Payload>, Option<Cursor>), Error>;
}

const MAX_PAYLOADS: usize = 50;
const INITIAL_WAIT: Duration = Duration::from_secs(2);
const RETRY_GAP: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 3;
const NEAR_WINDOW: Duration = Duration::from_secs(30);
const FAR_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Resolve an `InboundEvent` to the flat list of changed fields it
/// represents. `DirectChange` passes through untouched; `Handle` runs the
/// delayed payload fetch protocol of §4.8, sleeping via `sleep` so tests can
/// supply a no-op.
pub fn resolve(
    event: &InboundEvent,
    source: &dyn PayloadHistorySource,
    sleep: impl Fn(Duration),
) -> Vec<ChangedField> {
    match event {
        InboundEvent::DirectChange { changes, .. } => changes.clone(),
        InboundEvent::Handle {
            module,
            base_id,
            webhook_id: _,
            timestamp,
            ..
        } => {
            sleep(INITIAL_WAIT);
            for attempt in 0..=MAX_RETRIES {
                let payloads = fetch_up_to(source, module, base_id, MAX_PAYLOADS);
                if payloads.iter().any(|p| p.ts >= *timestamp) {
                    return select_candidate(&payloads, *timestamp)
                        .map(|p| p.changes.clone())
                        .unwrap_or_default();
                }
                if attempt < MAX_RETRIES {
                    sleep(RETRY_GAP);
                }
            }
            Vec::new()
        }
    }
}

fn fetch_up_to(
    source: &dyn PayloadHistorySource,
    module: &Module,
    base_id: &str,
    limit: usize,
) -> Vec<Payload> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let (page, next) = match source.fetch_recent_payloads(module, base_id, cursor) {
            Ok(r) => r,
            Err(_) => break,
        };
        out.extend(page);
        if out.len() >= limit || next.is_none() {
            break;
        }
        cursor = next;
    }
    out.truncate(limit);
    out
}

/// Three-tier candidate selection relative to the webhook's own timestamp
/// (§4.8): prefer the oldest payload within `[0, 30s]` after the webhook,
/// then the nearest within `±5min`, then simply the most recent payload.
fn select_candidate(payloads: &[Payload], webhook_ts: DateTime<Utc>) -> Option<&Payload> {
    if payloads.is_empty() {
        return None;
    }
    let near_window = chrono::Duration::from_std(NEAR_WINDOW).unwrap();
    let far_window = chrono::Duration::from_std(FAR_WINDOW).unwrap();

    let mut in_near: Vec<&Payload> = payloads
        .iter()
        .filter(|p| {
            let delta = p.ts - webhook_ts;
            delta >= chrono::Duration::zero() && delta <= near_window
        })
        .collect();
    if !in_near.is_empty() {
        in_near.sort_by_key(|p| p.ts);
        return in_near.into_iter().next();
    }

    let mut in_far: Vec<&Payload> = payloads
        .iter()
        .filter(|p| (p.ts - webhook_ts).abs() <= far_window)
        .collect();
    if !in_far.is_empty() {
        in_far.sort_by_key(|p| (p.ts - webhook_ts).abs());
        return in_far.into_iter().next();
    }

    payloads.iter().max_by_key(|p| p.ts)
}

/// Drop changes the engine's own recent writes already account for (§3
/// invariant ii, P4), returning only genuinely external changes.
pub fn filter_suppressed(side: Side, changes: Vec<ChangedField>, tracker: &Tracker) -> Vec<ChangedField> {
    changes
        .into_iter()
        .filter(|c| !tracker.should_skip_field(side, &c.row_id, &c.field, &c.value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeHistory {
        pages: Mutex<Vec<Vec<Payload>>>,
        calls: AtomicUsize,
    }

    impl PayloadHistorySource for FakeHistory {
        fn fetch_recent_payloads(
            &self,
            _: &Module,
            _: &str,
            _: Option<Cursor>,
        ) -> Result<(Vec<Payload>, Option<Cursor>), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap();
            Ok((pages.pop().unwrap_or_default(), None))
        }
    }

    fn change(field: &str, value: &str) -> ChangedField {
        ChangedField {
            row_id: RemoteId::from("row-1"),
            field: field.to_string(),
            value: FieldValue::Text(value.to_string()),
        }
    }

    #[test]
    fn direct_change_passes_through_without_fetching() {
        let history = FakeHistory {
            pages: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        };
        let event = InboundEvent::DirectChange {
            module: Module::from("Leads"),
            side: Side::Source,
            changes: vec![change("Phone", "555-0100")],
        };
        let changes = resolve(&event, &history, |_| {});
        assert_eq!(changes.len(), 1);
        assert_eq!(history.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handle_event_selects_payload_nearest_within_near_window() {
        let webhook_ts = Utc::now();
        let history = FakeHistory {
            pages: Mutex::new(vec![vec![
                Payload { ts: webhook_ts + chrono::Duration::seconds(40), changes: vec![change("Phone", "late")] },
                Payload { ts: webhook_ts + chrono::Duration::seconds(5), changes: vec![change("Phone", "on-time")] },
            ]]),
            calls: AtomicUsize::new(0),
        };
        let event = InboundEvent::Handle {
            module: Module::from("Leads"),
            side: Side::Datastore,
            base_id: "app1".into(),
            webhook_id: "wh1".into(),
            timestamp: webhook_ts,
        };
        let changes = resolve(&event, &history, |_| {});
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "Phone");
        if let FieldValue::Text(v) = &changes[0].value {
            assert_eq!(v, "on-time");
        } else {
            panic!("expected text value");
        }
    }

    #[test]
    fn handle_event_retries_until_payload_appears() {
        let webhook_ts = Utc::now();
        let history = FakeHistory {
            // popped in reverse order: first call gets an empty/stale page,
            // second call gets the real payload.
            pages: Mutex::new(vec![
                vec![Payload { ts: webhook_ts, changes: vec![change("Phone", "final")] }],
                vec![],
            ]),
            calls: AtomicUsize::new(0),
        };
        let event = InboundEvent::Handle {
            module: Module::from("Leads"),
            side: Side::Datastore,
            base_id: "app1".into(),
            webhook_id: "wh1".into(),
            timestamp: webhook_ts,
        };
        let changes = resolve(&event, &history, |_| {});
        assert_eq!(changes.len(), 1);
        assert_eq!(history.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handle_event_gives_up_silently_after_retries() {
        let webhook_ts = Utc::now();
        let history = FakeHistory {
            pages: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        };
        let event = InboundEvent::Handle {
            module: Module::from("Leads"),
            side: Side::Datastore,
            base_id: "app1".into(),
            webhook_id: "wh1".into(),
            timestamp: webhook_ts,
        };
        let changes = resolve(&event, &history, |_| {});
        assert!(changes.is_empty());
        assert_eq!(history.calls.load(Ordering::SeqCst), (MAX_RETRIES + 1) as usize);
    }

    #[test]
    fn webhook_loop_suppression() {
        let tracker = Tracker::default();
        let id = RemoteId::from("row-1");
        tracker.remember_write(Side::Datastore, &id, "Phone", &FieldValue::Text("A".into()));
        let changes = vec![change("Phone", "A")];
        let filtered = filter_suppressed(Side::Datastore, changes, &tracker);
        assert!(filtered.is_empty());
    }
}
