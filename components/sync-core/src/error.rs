/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The error taxonomy of §7: each variant maps to one of the documented
//! kinds and carries enough context to decide whether it's fatal, transient,
//! or just an expected planner/executor outcome.

use error_support::{ErrorHandling, GetErrorHandling};
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration is missing: {0}")]
    ConfigMissing(String),

    #[error("configuration is invalid: {0}")]
    ConfigInvalid(String),

    #[error("authorization for {remote} has expired and could not be refreshed: {reason}")]
    AuthExpired { remote: String, reason: String },

    #[error("authorization for {remote} was denied: {reason}")]
    AuthDenied { remote: String, reason: String },

    #[error("rate limited by {remote}, retry after {retry_after:?}")]
    RateLimited {
        remote: String,
        retry_after: Option<Duration>,
    },

    #[error("request URL/formula too long for {remote}")]
    UrlTooLong { remote: String },

    #[error("record not found")]
    NotFound,

    #[error("remote rejected payload: {0}")]
    Validation(String),

    #[error("{failed} of {total} records failed in batch")]
    PartialBatch { failed: usize, total: usize },

    #[error("transient network error talking to {remote}: {source}")]
    Transient {
        remote: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("field-mapping registry for module {0} could not be loaded")]
    RegistryEmpty(String),

    #[error("missing required source fields: {0:?}")]
    MissingRequiredFields(Vec<String>),

    #[error("the operation was interrupted")]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("server requested backoff until {0:?}")]
    Backoff(SystemTime),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the handful of kinds §7 says terminate the whole process
    /// rather than just the current module/item.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, Error::ConfigMissing(_) | Error::ConfigInvalid(_))
    }

    /// True for errors that should abort just the current module's run
    /// (the registry bootstrap rule, and unrecoverable auth for one remote).
    pub fn is_module_fatal(&self) -> bool {
        matches!(
            self,
            Error::RegistryEmpty(_) | Error::AuthExpired { .. } | Error::AuthDenied { .. }
        )
    }
}

impl GetErrorHandling for Error {
    type ExternalError = Error;

    fn get_error_handling(&self) -> ErrorHandling<Self::ExternalError> {
        match self {
            Error::ConfigMissing(_) | Error::ConfigInvalid(_) => {
                ErrorHandling::report(self.to_string_err(), tracing::Level::ERROR, "config".into())
            }
            Error::AuthExpired { .. } | Error::AuthDenied { .. } => ErrorHandling::report(
                self.to_string_err(),
                tracing::Level::ERROR,
                "auth".into(),
            ),
            Error::RegistryEmpty(_) => ErrorHandling::report(
                self.to_string_err(),
                tracing::Level::ERROR,
                "registry".into(),
            ),
            Error::NotFound | Error::Backoff(_) | Error::RateLimited { .. } => {
                ErrorHandling::passthrough(self.to_string_err())
            }
            _ => ErrorHandling::log(self.to_string_err(), tracing::Level::WARN),
        }
    }
}

// `GetErrorHandling` wants to hand back an owned `Error`, but most variants
// aren't `Clone` (anyhow::Error isn't). Re-derive a fresh value carrying the
// same message instead of cloning.
impl Error {
    fn to_string_err(&self) -> Error {
        Error::Other(anyhow::anyhow!(self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_process_fatal() {
        assert!(Error::ConfigMissing("source.json".into()).is_process_fatal());
        assert!(!Error::NotFound.is_process_fatal());
    }

    #[test]
    fn registry_and_auth_errors_are_module_fatal() {
        assert!(Error::RegistryEmpty("Leads".into()).is_module_fatal());
        assert!(Error::AuthExpired {
            remote: "source".into(),
            reason: "no refresh token".into()
        }
        .is_module_fatal());
        assert!(!Error::Validation("bad field".into()).is_module_fatal());
    }
}
