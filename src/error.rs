//! Error types shared by the rule engine and its collaborators

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while loading rules, routing requests or issuing certificates
#[derive(Debug, Error)]
pub enum Error {
    /// The rule source could not be stat'ed or read
    #[error("rule source {path} unavailable: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The rule source was read but its content is malformed
    #[error("malformed rule source {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// No installed rule matches the request host
    #[error("no rule matches host {0:?}")]
    NotFound(String),

    /// Certificate issuance declined for a host no rule covers
    #[error("unrecognized host {0:?}")]
    PolicyDenied(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("certificate error: {0}")]
    Certificate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
