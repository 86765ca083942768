use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capdata::{VatCapData, VatMessage};
use crate::marshal::MarshaledError;
use crate::refs::{ERef, VatId};

/// One settled pending result, in endpoint-local terms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatResolution {
    pub eref: ERef,
    pub rejected: bool,
    pub value: VatCapData,
}

/// What the kernel delivers into a vat over its channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    /// Initialization delivery issued once after launch.
    StartVat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameters: Option<Value>,
    },
    Message { message: VatMessage },
    Notify { resolutions: Vec<VatResolution> },
    DropExports { erefs: Vec<ERef> },
    RetireExports { erefs: Vec<ERef> },
    RetireImports { erefs: Vec<ERef> },
}

/// What a vat asks of the kernel while processing a delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send { message: VatMessage },
    Subscribe { eref: ERef },
    Resolve { resolutions: Vec<VatResolution> },
    DropImports { erefs: Vec<ERef> },
    RetireImports { erefs: Vec<ERef> },
    RetireExports { erefs: Vec<ERef> },
    AbandonExports { erefs: Vec<ERef> },
}

/// The syscalls one delivery synchronously produced, in order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyscallBatch {
    pub syscalls: Vec<VatSyscall>,
}

impl SyscallBatch {
    pub fn empty() -> Self {
        SyscallBatch::default()
    }
}

/// Commands the kernel issues to the vat worker service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    Launch { vat_id: VatId },
    Terminate { vat_id: VatId },
    TerminateAll,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    #[serde(flatten)]
    pub command: WorkerCommand,
}

/// Failure payload of a worker reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailure {
    pub vat_id: VatId,
    pub error: MarshaledError,
}

/// Reply envelope echoing the request id. Failures carry a `WorkerFailure`
/// payload; anything else is command-specific result data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    pub payload: Value,
}

impl WorkerReply {
    pub fn ok(id: u64, payload: Value) -> Self {
        WorkerReply { id, payload }
    }

    pub fn failure(id: u64, failure: &WorkerFailure) -> Self {
        WorkerReply {
            id,
            payload: serde_json::to_value(failure).unwrap_or(Value::Null),
        }
    }

    pub fn as_failure(&self) -> Option<WorkerFailure> {
        let error = self.payload.get("error")?;
        if !crate::marshal::is_marshaled_error(error) {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}
