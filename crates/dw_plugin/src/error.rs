use serde_json::json;
use thiserror::Error;

use crate::jsonrpc::{RpcError, codes};

/// Errors a capability implementation can return.
///
/// The first seven variants are the domain set and travel over the wire with
/// a fixed code. `Timeout` and `Unavailable` only ever originate in the host
/// when a subprocess stops answering; they encode as `Internal`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("read-only: {0}")]
    ReadOnly(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A timeout occurred.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    /// The plugin process is gone or was never started.
    #[error("plugin unavailable: {0}")]
    Unavailable(String),
}

impl PluginError {
    pub fn code(&self) -> i64 {
        match self {
            PluginError::NotFound(_) => codes::NOT_FOUND,
            PluginError::AlreadyExists(_) => codes::ALREADY_EXISTS,
            PluginError::InvalidArgument(_) => codes::INVALID_PARAMS,
            PluginError::PermissionDenied(_) => codes::PERMISSION_DENIED,
            PluginError::ReadOnly(_) => codes::READ_ONLY,
            PluginError::NotImplemented(_) => codes::NOT_IMPLEMENTED,
            PluginError::Internal(_) | PluginError::Timeout(_) | PluginError::Unavailable(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Human part of the error, without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            PluginError::NotFound(m)
            | PluginError::AlreadyExists(m)
            | PluginError::InvalidArgument(m)
            | PluginError::PermissionDenied(m)
            | PluginError::ReadOnly(m)
            | PluginError::NotImplemented(m)
            | PluginError::Internal(m)
            | PluginError::Unavailable(m) => m.clone(),
            PluginError::Timeout(ms) => format!("timed out after {ms} ms"),
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code(),
            message: self.message(),
            data: Some(json!({ "kind": self.kind() })),
        }
    }

    /// Translate an in-band error back into the domain set, so callers never
    /// have to care whether a plugin lives in this process or another one.
    pub fn from_rpc(err: RpcError) -> Self {
        let RpcError { code, message, .. } = err;
        match code {
            codes::NOT_FOUND => PluginError::NotFound(message),
            codes::ALREADY_EXISTS => PluginError::AlreadyExists(message),
            codes::PERMISSION_DENIED => PluginError::PermissionDenied(message),
            codes::READ_ONLY => PluginError::ReadOnly(message),
            codes::NOT_IMPLEMENTED | codes::METHOD_NOT_FOUND => PluginError::NotImplemented(message),
            codes::INVALID_PARAMS | codes::INVALID_REQUEST => PluginError::InvalidArgument(message),
            _ => PluginError::Internal(message),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PluginError::NotFound(_) => "not_found",
            PluginError::AlreadyExists(_) => "already_exists",
            PluginError::InvalidArgument(_) => "invalid_argument",
            PluginError::PermissionDenied(_) => "permission_denied",
            PluginError::ReadOnly(_) => "read_only",
            PluginError::NotImplemented(_) => "not_implemented",
            PluginError::Internal(_) => "internal",
            PluginError::Timeout(_) => "timeout",
            PluginError::Unavailable(_) => "unavailable",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PluginError::NotFound(_))
    }
}

impl From<RpcError> for PluginError {
    fn from(err: RpcError) -> Self {
        PluginError::from_rpc(err)
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> PluginError {
        PluginError::Internal(format!("json: {err}"))
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(err: anyhow::Error) -> PluginError {
        PluginError::Internal(err.to_string())
    }
}

pub type PluginResult<T> = Result<T, PluginError>;
