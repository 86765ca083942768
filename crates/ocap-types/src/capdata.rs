use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::refs::{ERef, KRef};

/// A capability-bearing serialized payload: a serialized body plus the
/// ordered list of references its slots point at.
///
/// The slot type is `KRef` while the payload is inside the kernel and `ERef`
/// once it has been translated into an endpoint's namespace; translation maps
/// slots and leaves the body untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<R> {
    pub body: String,
    pub slots: Vec<R>,
}

impl<R> CapData<R> {
    pub fn new(body: impl Into<String>, slots: Vec<R>) -> Self {
        CapData {
            body: body.into(),
            slots,
        }
    }

    /// A payload with no capability slots, body given as a JSON value.
    pub fn from_value(value: &serde_json::Value) -> Self {
        CapData {
            body: value.to_string(),
            slots: Vec::new(),
        }
    }

    /// A payload whose body is a single slot marker referring to `slot`.
    pub fn from_slot(slot: R) -> Self {
        CapData {
            body: "{\"@qclass\":\"slot\",\"index\":0}".to_string(),
            slots: vec![slot],
        }
    }

    /// Rewrite every slot through `f`, keeping the body intact.
    pub fn map_slots<S, E>(self, f: impl FnMut(R) -> Result<S, E>) -> Result<CapData<S>, E> {
        let slots = self.slots.into_iter().map(f).collect::<Result<_, _>>()?;
        Ok(CapData {
            body: self.body,
            slots,
        })
    }

    /// The sole slot, when the body is a single slot marker.
    pub fn single_slot(&self) -> Option<&R> {
        if self.slots.len() == 1 && self.body.contains("\"@qclass\":\"slot\"") {
            self.slots.first()
        } else {
            None
        }
    }
}

pub type KernelCapData = CapData<KRef>;
pub type VatCapData = CapData<ERef>;

/// One queued delivery in kernel-reference terms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub target: KRef,
    pub method: String,
    pub params: KernelCapData,
    /// Pending result awaiting this call's outcome; absent for
    /// fire-and-forget sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KRef>,
}

/// The same delivery after translation into one endpoint's namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatMessage {
    pub target: ERef,
    pub method: String,
    pub params: VatCapData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ERef>,
}

/// Decode a CapData body into a typed value.
pub fn decode_body<T: DeserializeOwned, R>(data: &CapData<R>) -> Result<T, serde_json::Error> {
    serde_json::from_str(&data.body)
}
