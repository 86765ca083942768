//! The externally callable kernel API: a method table a host registers over
//! its control channel. Implementations reach the kernel only through the
//! granted hook.

use std::sync::Arc;

use ocap_rpc::{Hooks, MethodRegistry, MethodSpec, RpcError};
use ocap_types::{CapData, KRef, KernelCapData, VatConfig, VatId};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::kernel::Kernel;

/// Hook name under which the kernel is granted to method implementations.
pub const KERNEL_HOOK: &str = "kernel";

pub type SharedKernel = Arc<Mutex<Kernel>>;

fn method_err(err: impl std::fmt::Display) -> RpcError {
    RpcError::Method(err.to_string())
}

fn string_field(params: &Value, name: &str) -> Result<String, RpcError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcError::Method(format!("missing field '{name}'")))
}

fn ref_field<T>(params: &Value, name: &str) -> Result<T, RpcError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    string_field(params, name)?
        .parse()
        .map_err(|err| RpcError::Method(format!("bad '{name}': {err}")))
}

fn vat_id_params() -> Value {
    json!({
        "type": "object",
        "required": ["vatId"],
        "properties": { "vatId": { "type": "string", "pattern": "^v[0-9]+$" } },
    })
}

fn key_params(required: &[&str]) -> Value {
    json!({
        "type": "object",
        "required": required,
        "properties": {
            "key": { "type": "string" },
            "value": { "type": "string" },
        },
    })
}

/// Build the method table over a shared kernel: vat lifecycle, message
/// entry, the crank loop, and the kernel KV surface. Methods without a
/// result schema are notifications.
pub fn kernel_methods(kernel: SharedKernel) -> Result<MethodRegistry, RpcError> {
    let hooks = Hooks::new().with(KERNEL_HOOK, kernel);
    let mut registry = MethodRegistry::new(hooks);

    registry.register(
        MethodSpec::new(
            "launchVat",
            json!({
                "type": "object",
                "properties": {
                    "sourceSpec": { "type": "string" },
                    "bundleSpec": { "type": "string" },
                    "bundleName": { "type": "string" },
                    "parameters": {},
                    "creationOptions": {},
                },
            }),
        )
        .returning(json!({ "type": "string", "pattern": "^v[0-9]+$" }))
        .using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let config: VatConfig = serde_json::from_value(params).map_err(method_err)?;
                let vat_id = kernel
                    .lock()
                    .await
                    .launch_vat(config)
                    .await
                    .map_err(method_err)?;
                Ok(json!(vat_id.to_string()))
            })
        }),
    )?;

    registry.register(
        MethodSpec::new("terminateVat", vat_id_params()).using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let vat_id: VatId = ref_field(&params, "vatId")?;
                kernel
                    .lock()
                    .await
                    .terminate_vat(vat_id)
                    .await
                    .map_err(method_err)?;
                Ok(Value::Null)
            })
        }),
    )?;

    registry.register(
        MethodSpec::new("restartVat", vat_id_params()).using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let vat_id: VatId = ref_field(&params, "vatId")?;
                kernel
                    .lock()
                    .await
                    .restart_vat(vat_id)
                    .await
                    .map_err(method_err)?;
                Ok(Value::Null)
            })
        }),
    )?;

    registry.register(
        MethodSpec::new(
            "sendMessage",
            json!({
                "type": "object",
                "required": ["target", "method"],
                "properties": {
                    "target": { "type": "string" },
                    "method": { "type": "string" },
                    "params": { "type": "object" },
                },
            }),
        )
        .returning(json!({ "type": "string", "pattern": "^kp[0-9]+$" }))
        .using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let target: KRef = ref_field(&params, "target")?;
                let method = string_field(&params, "method")?;
                let args: KernelCapData = match params.get("params") {
                    Some(value) => serde_json::from_value(value.clone()).map_err(method_err)?,
                    None => CapData::new("[]", vec![]),
                };
                let result = kernel
                    .lock()
                    .await
                    .send_message(target, method, args)
                    .map_err(method_err)?;
                Ok(json!(result.to_string()))
            })
        }),
    )?;

    registry.register(
        MethodSpec::new("run", json!({ "type": "null" }))
            .returning(json!({ "type": "integer" }))
            .using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, _| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let cranks = kernel.lock().await.run().await.map_err(method_err)?;
                Ok(json!(cranks))
            })
        }),
    )?;

    registry.register(
        MethodSpec::new("kvGet", key_params(&["key"]))
            .returning(json!({ "type": ["string", "null"] }))
            .using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let key = string_field(&params, "key")?;
                let value = kernel.lock().await.kv_get(&key).map_err(method_err)?;
                Ok(json!(value))
            })
        }),
    )?;

    registry.register(
        MethodSpec::new("kvSet", key_params(&["key", "value"])).using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let key = string_field(&params, "key")?;
                let value = string_field(&params, "value")?;
                kernel.lock().await.kv_set(&key, &value).map_err(method_err)?;
                Ok(Value::Null)
            })
        }),
    )?;

    registry.register(
        MethodSpec::new("kvDelete", key_params(&["key"])).using_hooks(&[KERNEL_HOOK]),
        Box::new(|hooks, params| {
            Box::pin(async move {
                let kernel = hooks.get::<Mutex<Kernel>>(KERNEL_HOOK)?;
                let key = string_field(&params, "key")?;
                kernel.lock().await.kv_delete(&key).map_err(method_err)?;
                Ok(Value::Null)
            })
        }),
    )?;

    Ok(registry)
}
