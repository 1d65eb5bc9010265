/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Shared error-handling and error-reporting conventions used by every
//! crate in this workspace: a way to describe how an internal error should
//! be logged/reported on its way to becoming a public error, a pluggable
//! application-level error reporter, and a couple of redaction helpers so
//! secrets never land in a log line.

mod handling;
mod reporting;
pub mod redact;

pub use handling::{convert_log_report_error, ErrorHandling, ErrorReporting, GetErrorHandling};
pub use reporting::{
    report_breadcrumb, report_error_to_app, set_application_error_reporter,
    unset_application_error_reporter, ApplicationErrorReporter, ArcReporterAdapter,
    TestErrorReporter,
};
