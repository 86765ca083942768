use std::collections::HashMap;

use futures::future::BoxFuture;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::RpcError;
use crate::hooks::Hooks;

pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;
pub type Handler = Box<dyn Fn(Hooks, Value) -> HandlerFuture + Send + Sync>;

/// Declaration of one callable method: schemas plus the hooks it may use.
pub struct MethodSpec {
    pub name: String,
    pub params: Value,
    /// Absent for notifications: the call completes but yields no value.
    pub result: Option<Value>,
    pub hooks: Vec<String>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        MethodSpec {
            name: name.into(),
            params,
            result: None,
            hooks: Vec::new(),
        }
    }

    pub fn returning(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn using_hooks(mut self, hooks: &[&str]) -> Self {
        self.hooks = hooks.iter().map(|h| h.to_string()).collect();
        self
    }
}

struct Method {
    params: JSONSchema,
    result: Option<JSONSchema>,
    hooks: Vec<String>,
    handler: Handler,
}

fn compile(name: &str, schema: Value) -> Result<JSONSchema, RpcError> {
    // Leak the schema to give it 'static lifetime for the jsonschema API;
    // method specs live for the registry's lifetime anyway.
    let leaked: &'static Value = Box::leak(Box::new(schema));
    JSONSchema::compile(leaked).map_err(|err| RpcError::InvalidSchema {
        method: name.to_string(),
        detail: err.to_string(),
    })
}

fn validation_detail(schema: &JSONSchema, instance: &Value) -> Option<String> {
    match schema.validate(instance) {
        Ok(()) => None,
        Err(errors) => Some(
            errors
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        ),
    }
}

/// Typed method dispatch with parameter/result validation and
/// dependency-injected hooks.
pub struct MethodRegistry {
    methods: HashMap<String, Method>,
    hooks: Hooks,
}

impl MethodRegistry {
    pub fn new(hooks: Hooks) -> Self {
        MethodRegistry {
            methods: HashMap::new(),
            hooks,
        }
    }

    pub fn register(&mut self, spec: MethodSpec, handler: Handler) -> Result<(), RpcError> {
        if self.methods.contains_key(&spec.name) {
            return Err(RpcError::DuplicateMethod { method: spec.name });
        }
        let params = compile(&spec.name, spec.params)?;
        let result = match spec.result {
            Some(schema) => Some(compile(&spec.name, schema)?),
            None => None,
        };
        self.methods.insert(
            spec.name,
            Method {
                params,
                result,
                hooks: spec.hooks,
                handler,
            },
        );
        Ok(())
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Dispatch `name` with `params`. Notifications (no result schema)
    /// resolve to `None` once the implementation completes.
    pub async fn execute(&self, name: &str, params: Value) -> Result<Option<Value>, RpcError> {
        let method = self.methods.get(name).ok_or_else(|| RpcError::MethodNotFound {
            method: name.to_string(),
        })?;
        if let Some(detail) = validation_detail(&method.params, &params) {
            return Err(RpcError::InvalidParams {
                method: name.to_string(),
                detail,
            });
        }
        let attenuated = self.hooks.subset(&method.hooks);
        let value = (method.handler)(attenuated, params).await?;
        match &method.result {
            None => Ok(None),
            Some(schema) => {
                if let Some(detail) = validation_detail(schema, &value) {
                    return Err(RpcError::InvalidResult {
                        method: name.to_string(),
                        detail,
                    });
                }
                Ok(Some(value))
            }
        }
    }
}
