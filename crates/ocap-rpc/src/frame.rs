use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::MethodRegistry;
use crate::RpcError;

/// JSON-RPC-style request framing for registry calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorFrame {
    pub code: String,
    pub message: String,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Option<Value>) -> Self {
        RpcResponse {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: u64, err: &RpcError) -> Self {
        RpcResponse {
            id,
            result: None,
            error: Some(RpcErrorFrame {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Run one framed request through the registry.
pub async fn handle_request(registry: &MethodRegistry, request: RpcRequest) -> RpcResponse {
    match registry.execute(&request.method, request.params).await {
        Ok(result) => RpcResponse::ok(request.id, result),
        Err(err) => {
            log::warn!("rpc '{}' failed: {err}", request.method);
            RpcResponse::error(request.id, &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Hooks;
    use crate::registry::MethodSpec;

    #[tokio::test]
    async fn frames_success_and_failure() {
        let mut registry = MethodRegistry::new(Hooks::new());
        registry
            .register(
                MethodSpec::new("ping", serde_json::json!({ "type": "null" }))
                    .returning(serde_json::json!({ "type": "string" })),
                Box::new(|_, _| Box::pin(async { Ok(serde_json::json!("pong")) })),
            )
            .unwrap();

        let ok = handle_request(
            &registry,
            RpcRequest {
                id: 1,
                method: "ping".into(),
                params: Value::Null,
            },
        )
        .await;
        assert_eq!(ok.result, Some(serde_json::json!("pong")));
        assert!(ok.error.is_none());

        let missing = handle_request(
            &registry,
            RpcRequest {
                id: 2,
                method: "pong".into(),
                params: Value::Null,
            },
        )
        .await;
        assert_eq!(missing.error.unwrap().code, "METHOD_NOT_FOUND");
        assert!(missing.result.is_none());
    }
}
