//! Unified error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::schema::Namespace;

/// The error type returned by sluice's fallible setup and serving operations.
///
/// Per-request failures (validation, business errors, faults) are never
/// `Error`s: the dispatcher classifies them into [`Response`](crate::Response)
/// values. This type surfaces what can go wrong before or around serving:
/// endpoint registration, configuration, binding and accepting connections.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A request field was declared in more than one namespace (or twice in
    /// the same one).
    #[error("field `{field}` is declared in both {first} and {second}")]
    DuplicateField {
        field: String,
        first: Namespace,
        second: Namespace,
    },

    /// An endpoint needs a capability that neither the application nor its
    /// middleware layer supplies.
    #[error("endpoint `{endpoint}` requires `{capability}`, which nothing provides")]
    MissingCapability {
        endpoint: String,
        capability: &'static str,
    },

    /// A JSON Schema document failed to compile.
    #[error("invalid JSON schema: {reason}")]
    InvalidSchema { reason: String },

    #[error("invalid route `{path}`: {reason}")]
    InvalidRoute { path: String, reason: String },
}
