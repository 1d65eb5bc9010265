/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The loop-prevention tracker (C5, §4.5). Grounded on the teacher's
//! pattern of a lock-guarded map with opportunistic cleanup, as seen in
//! `support/error/reporting.rs`'s breadcrumb counter and `sync15::client`'s
//! backoff state — generalized here to a `DashMap` since entries are keyed
//! independently per `(side, id, field)` rather than behind one global lock.

use crate::model::{FieldValue, RemoteId, Side};
use dashmap::DashMap;
use std::time::{Duration, Instant};

type FieldKey = (Side, RemoteId, String);
type RecordKey = (Side, RemoteId);

/// Suppresses reciprocal webhooks the executor's own writes would otherwise
/// trigger. Two independent cooldown levels: fine-grained per field, coarse
/// per whole record (used by the poll path).
pub struct Tracker {
    field_seen: DashMap<FieldKey, (Instant, FieldValue)>,
    record_seen: DashMap<RecordKey, Instant>,
    field_cooldown: Duration,
    record_cooldown: Duration,
}

impl Tracker {
    pub fn new(field_cooldown: Duration, record_cooldown: Duration) -> Self {
        Self {
            field_seen: DashMap::new(),
            record_seen: DashMap::new(),
            field_cooldown,
            record_cooldown,
        }
    }

    /// True iff a write to this exact `(side, id, field)` carrying an
    /// equal-by-normalization value was recorded within the cooldown —
    /// meaning the caller should treat this as an echo of its own write,
    /// not a genuine external change.
    pub fn should_skip_field(
        &self,
        side: Side,
        id: &RemoteId,
        field: &str,
        value: &FieldValue,
    ) -> bool {
        self.sweep_fields();
        let key = (side, id.clone(), field.to_string());
        let now = Instant::now();
        let skip = self
            .field_seen
            .get(&key)
            .map(|entry| {
                let (seen_at, stored) = entry.value();
                now.duration_since(*seen_at) < self.field_cooldown
                    && stored.normalize() == value.normalize()
            })
            .unwrap_or(false);
        if !skip {
            self.field_seen.insert(key, (now, value.clone()));
        }
        skip
    }

    /// Unconditionally records a field-scoped entry — called by the
    /// executor *before* writing to the opposite side so its own reciprocal
    /// webhook is suppressed (§3 invariant ii, P4).
    pub fn remember_write(&self, side: Side, id: &RemoteId, field: &str, value: &FieldValue) {
        self.sweep_fields();
        self.field_seen
            .insert((side, id.clone(), field.to_string()), (Instant::now(), value.clone()));
    }

    /// Record-scoped check+set used by the poll driver to avoid re-queuing
    /// a record the engine itself just synced.
    pub fn debounce_record(&self, side: Side, id: &RemoteId) -> bool {
        self.sweep_records();
        let key = (side, id.clone());
        let now = Instant::now();
        let debounced = self
            .record_seen
            .get(&key)
            .map(|seen_at| now.duration_since(*seen_at) < self.record_cooldown)
            .unwrap_or(false);
        if !debounced {
            self.record_seen.insert(key, now);
        }
        debounced
    }

    fn sweep_fields(&self) {
        let cutoff = self.field_cooldown * 2;
        let now = Instant::now();
        self.field_seen
            .retain(|_, (seen_at, _)| now.duration_since(*seen_at) < cutoff);
    }

    fn sweep_records(&self) {
        let cutoff = self.record_cooldown * 2;
        let now = Instant::now();
        self.record_seen.retain(|_, seen_at| now.duration_since(*seen_at) < cutoff);
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_is_never_skipped() {
        let tracker = Tracker::default();
        let id = RemoteId::from("lead-1");
        assert!(!tracker.should_skip_field(Side::Source, &id, "Email", &FieldValue::Text("a@b.com".into())));
    }

    #[test]
    fn equal_value_within_cooldown_is_skipped() {
        let tracker = Tracker::default();
        let id = RemoteId::from("lead-1");
        let value = FieldValue::Text("a@b.com".into());
        tracker.remember_write(Side::Datastore, &id, "Email", &value);
        assert!(tracker.should_skip_field(Side::Datastore, &id, "Email", &value));
    }

    #[test]
    fn differing_value_is_not_skipped() {
        let tracker = Tracker::default();
        let id = RemoteId::from("lead-1");
        tracker.remember_write(Side::Datastore, &id, "Email", &FieldValue::Text("a@b.com".into()));
        assert!(!tracker.should_skip_field(
            Side::Datastore,
            &id,
            "Email",
            &FieldValue::Text("c@d.com".into())
        ));
    }

    #[test]
    fn normalization_makes_5_and_number_5_equal() {
        let tracker = Tracker::default();
        let id = RemoteId::from("lead-1");
        tracker.remember_write(Side::Source, &id, "Score", &FieldValue::Number(5.0));
        assert!(tracker.should_skip_field(Side::Source, &id, "Score", &FieldValue::Text("5".into())));
    }

    #[test]
    fn record_debounce_is_independent_of_field_tracking() {
        let tracker = Tracker::default();
        let id = RemoteId::from("lead-1");
        assert!(!tracker.debounce_record(Side::Source, &id));
        assert!(tracker.debounce_record(Side::Source, &id));
        assert!(!tracker.debounce_record(Side::Datastore, &id));
    }
}
