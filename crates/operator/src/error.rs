use thiserror::Error;

use crate::store::ObjectKey;

#[derive(Error, Debug)]
pub enum Error {
    /// Optimistic write lost a race, or the object appeared/vanished between read and write.
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict { kind: String, key: ObjectKey, message: String },

    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store refused the object as invalid.
    #[error("{kind} {key} rejected: {message}")]
    Rejected { kind: String, key: ObjectKey, message: String },

    #[error("{kind} {key} is already controlled by {owner}")]
    AlreadyOwned { kind: String, key: ObjectKey, owner: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Transient failures that a later attempt can clear without anyone changing the cluster.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::StoreUnavailable(_))
    }

    pub fn invariant(msg: impl Into<String>) -> Self { Self::Invariant(msg.into()) }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Rejected { .. } => "rejected",
            Self::AlreadyOwned { .. } => "already_owned",
            Self::Invariant(_) => "invariant",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Classify a kube client error for a write (or read) against `kind`/`key`.
    pub fn from_kube(kind: &str, key: &ObjectKey, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 || ae.code == 404 => {
                Self::Conflict { kind: kind.to_string(), key: key.clone(), message: ae.message }
            }
            kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
                Self::Rejected { kind: kind.to_string(), key: key.clone(), message: ae.message }
            }
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
