use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    /// Malformed request body; the only variant surfaced as an HTTP error.
    #[error("Unable to decode JSON payload: {message}")]
    Decode { message: String },

    #[error("{message}")]
    Conflict { message: String },

    #[error("{message}")]
    NotFound { message: String },

    #[error("unable to allocate IP for {endpoint_id}: {reason}")]
    AllocationFailed {
        endpoint_id: String,
        reason: PeerFailure,
    },

    #[error("unable to look up IP for {endpoint_id}: {reason}")]
    LookupFailed {
        endpoint_id: String,
        reason: PeerFailure,
    },

    #[error("unable to release IP for {endpoint_id}: {reason}")]
    ReleaseFailed {
        endpoint_id: String,
        reason: PeerFailure,
    },

    #[error("unable to register {fqdn} with nameserver: {reason}")]
    RegistrationFailed { fqdn: String, reason: PeerFailure },

    #[error("unable to deregister {id} with nameserver: {reason}")]
    DeregistrationFailed { id: String, reason: PeerFailure },

    #[error("device \"{name}\" not present")]
    DeviceNotFound { name: String },

    #[error("device \"{name}\" is of unsupported type {kind}")]
    UnsupportedDeviceType { name: String, kind: String },

    #[error("{message}: {source:#}")]
    AttachmentFailed {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// Why a call to a remote peer failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerFailure {
    #[error("peer returned status {0}")]
    Status(u16),

    #[error("peer unreachable: {0}")]
    Transport(String),

    #[error("peer returned malformed body {0:?}")]
    Malformed(String),
}

impl PeerFailure {
    pub fn transport(err: &reqwest::Error) -> Self {
        PeerFailure::Transport(err.to_string())
    }
}

impl PluginError {
    pub fn decode(message: impl ToString) -> Self {
        PluginError::Decode {
            message: message.to_string(),
        }
    }

    pub fn conflict(message: impl ToString) -> Self {
        PluginError::Conflict {
            message: message.to_string(),
        }
    }

    pub fn not_found(message: impl ToString) -> Self {
        PluginError::NotFound {
            message: message.to_string(),
        }
    }

    pub fn attachment(message: &str, source: anyhow::Error) -> Self {
        PluginError::AttachmentFailed {
            message: message.to_string(),
            source,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PluginError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PluginError::NotFound { .. })
    }
}

impl IntoResponse for PluginError {
    fn into_response(self) -> Response {
        match self {
            PluginError::Decode { .. } => {
                error!("{} {}", StatusCode::BAD_REQUEST.as_u16(), self);
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            // The engine expects lifecycle failures inside the protocol envelope.
            other => {
                error!("[Driver]: {}", other);
                Json(json!({ "Err": other.to_string() })).into_response()
            }
        }
    }
}
