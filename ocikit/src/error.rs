use thiserror::Error;

use crate::transport::TransportError;

/// Error type shared by the whole library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid reference {0:?}: {1}")]
    InvalidReference(String, String),

    #[error("invalid digest {0:?}: {1}")]
    InvalidDigest(String, String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("value is not yet computed, consume the stream first")]
    NotComputed,

    #[error("stream was already consumed")]
    StreamConsumed,

    #[error("image is not based on the given base: {0}")]
    NotBased(String),

    #[error("rebase is incompatible: {0}")]
    RebaseIncompatible(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("{0} already exists and overwrite was refused")]
    AlreadyExists(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// True when the error means "the thing does not exist", either as a
    /// local NotFound or as a registry 404 / `*_UNKNOWN` response. Callers
    /// that probe for existence branch on this.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Transport(t) => t.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
