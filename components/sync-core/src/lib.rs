/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The Reconciliation Core: field-mapping registry, sync planner, sync
//! executor, loop-prevention tracker, event ingest, remote clients, token
//! manager, and rate-limit gate behind one crate so the `cli` binary can
//! wire them together without knowing their internals.

pub mod config;
pub mod crm_client;
pub mod datastore_client;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod model;
pub mod planner;
pub mod rate_limit;
pub mod registry;
pub mod remote_client;
pub mod retry;
pub mod token;
pub mod tracker;

pub use error::{Error, Result};
