//! Crate-wide error type.
//!
//! Every failure carries a [`Severity`]. Critical errors mean the owning
//! service should stop; minor errors are logged and the service carries on.
//! Broker plumbing always reports critical errors, wrapped once with a short
//! context label such as `"Queue binding error"`. Wrapping an error that is
//! already critical returns it unchanged.

use std::error::Error as StdError;

use thiserror::Error;

use crate::broker::transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Minor,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{context}: {source}")]
    Critical {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A wiring mistake detected while the service is being assembled.
    #[error("{0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration source error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("setting `{key}` could not be decoded: {reason}")]
    SettingParse { key: String, reason: String },

    /// The remote handler failed internally (HTTP 500 on the direct transport).
    #[error("remote handler fault ({status}): {message}")]
    HandlerFault { status: u16, message: String },

    /// The remote side answered with `isSuccess: false`.
    #[error("call rejected: {0}")]
    Rejected(serde_json::Value),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Wraps `err` as a critical error labelled with `context`.
    ///
    /// An error that is already critical passes through untouched.
    pub fn critical(context: impl Into<String>, err: impl Into<Error>) -> Error {
        match err.into() {
            e @ Error::Critical { .. } => e,
            other => Error::Critical {
                context: context.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Error::Critical { .. } | Error::Configuration(_) => Severity::Critical,
            _ => Severity::Minor,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity() == Severity::Critical
    }

    /// Context label of a critical error.
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Critical { context, .. } => Some(context),
            _ => None,
        }
    }
}

pub trait ResultExt<T> {
    /// Maps the error side through [`Error::critical`].
    fn critical(self, context: &str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn critical(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::critical(context, e))
    }
}
