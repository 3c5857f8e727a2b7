//! Crate-wide error type.
//!
//! One thiserror-derived enum per taxonomy kind from the error handling design:
//! decode, validation, upstream transport, upstream protocol, configuration,
//! and refresh-worker errors, plus a catch-all IO variant for transport plumbing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("validation failure: {0}")]
    Validation(String),

    #[error("upstream transport error on {tag}: {source}")]
    Upstream {
        tag: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("upstream {tag} returned rcode {rcode}")]
    UpstreamProtocol { tag: String, rcode: u8 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("refresh error for {name}/{qtype}: {source}")]
    Refresh {
        name: String,
        qtype: u16,
        #[source]
        source: Box<AppError>,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AppError {
    pub fn decode(msg: impl Into<String>) -> Self {
        AppError::Decode(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AppError::Config(msg.into())
    }

    pub fn upstream(tag: impl Into<String>, source: AppError) -> Self {
        AppError::Upstream {
            tag: tag.into(),
            source: Box::new(source),
        }
    }

    /// True for errors that must never populate the cache (decode, validation,
    /// upstream transport/protocol errors are all "never cached" per the error
    /// handling design; refresh/config errors don't reach this call site).
    pub fn is_cacheable_failure(&self) -> bool {
        false
    }
}
