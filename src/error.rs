//! Error type shared by every fallible operation of the library.
use std::io;

use thiserror::Error;

/// Errors surfaced to callers of the library.
///
/// Per-endpoint failures (refused connections, timeouts, broken streams)
/// never show up here: the searcher logs them and reports the endpoint as
/// not matched.
#[derive(Debug, Error)]
pub enum Error {
    /// A search rule failed to compile.
    #[error("invalid search rule: {0}")]
    InvalidRule(#[from] regex::Error),

    /// `process` was called without any search rule.
    #[error("no search rules configured")]
    NoRules,

    /// An address range could not be parsed.
    #[error("invalid address range '{0}'")]
    InvalidRange(String),

    /// A port or port range could not be parsed.
    #[error("{0}")]
    InvalidPort(String),

    /// An endpoint could not be built for a target.
    #[error("could not build endpoint for {target}: {reason}")]
    Endpoint {
        /// The `ip:port` the endpoint was built for.
        target: String,
        /// Why construction failed.
        reason: String,
    },

    /// A host search request failed at the transport level.
    #[error("host search request failed: {0}")]
    Query(#[from] reqwest::Error),

    /// A host search request returned a non-success status.
    #[error("host search returned {status}: {body}")]
    QueryStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned by the service.
        body: String,
    },

    /// The configuration file is not valid TOML for our options.
    #[error("invalid configuration file: {0}")]
    Config(#[from] toml::de::Error),

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shorthand used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
