//! Typed RPC method registry: schema-validated dispatch with attenuated,
//! dependency-injected hooks.

mod frame;
mod hooks;
mod registry;

pub use frame::{RpcErrorFrame, RpcRequest, RpcResponse, handle_request};
pub use hooks::Hooks;
pub use registry::{Handler, HandlerFuture, MethodRegistry, MethodSpec};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("method '{method}' not found")]
    MethodNotFound { method: String },
    #[error("method '{method}' already registered")]
    DuplicateMethod { method: String },
    #[error("invalid params for '{method}': {detail}")]
    InvalidParams { method: String, detail: String },
    #[error("invalid result from '{method}': {detail}")]
    InvalidResult { method: String, detail: String },
    #[error("invalid schema for '{method}': {detail}")]
    InvalidSchema { method: String, detail: String },
    #[error("hook '{hook}' was not granted")]
    HookMissing { hook: String },
    #[error("hook '{hook}' has a different type than requested")]
    HookType { hook: String },
    #[error("method failed: {0}")]
    Method(String),
}

impl RpcError {
    /// Stable code for wire framing.
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            RpcError::DuplicateMethod { .. } => "DUPLICATE_METHOD",
            RpcError::InvalidParams { .. } => "INVALID_PARAMS",
            RpcError::InvalidResult { .. } => "INVALID_RESULT",
            RpcError::InvalidSchema { .. } => "INVALID_SCHEMA",
            RpcError::HookMissing { .. } | RpcError::HookType { .. } => "HOOK_ERROR",
            RpcError::Method(_) => "METHOD_ERROR",
        }
    }
}
