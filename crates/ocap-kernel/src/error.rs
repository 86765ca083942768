use ocap_store::KvError;
use ocap_transport::TransportError;
use ocap_types::{EndpointId, KRef, MarshaledError, VatId, codes};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("vat {vat_id} already exists")]
    VatAlreadyExists { vat_id: VatId },
    #[error("vat {vat_id} not found")]
    VatNotFound { vat_id: VatId },
    #[error("vat {vat_id} was deleted")]
    VatDeleted { vat_id: VatId },
    #[error("vat {vat_id} already has a connection")]
    VatConnectionExists { vat_id: VatId },
    #[error("vat {vat_id} has no connection")]
    VatConnectionNotFound { vat_id: VatId },
    #[error("vat {vat_id} terminated")]
    VatTerminated { vat_id: VatId },
    #[error("stream read failed for {endpoint}: {detail}")]
    StreamRead { endpoint: EndpointId, detail: String },
    #[error("unmarshal validation failed: {0}")]
    Unmarshal(String),
    #[error("protocol violation by {endpoint}: {detail}")]
    ProtocolViolation { endpoint: EndpointId, detail: String },
    #[error("promise {kref} not found")]
    PromiseNotFound { kref: KRef },
    #[error("promise {kref} already resolved")]
    PromiseAlreadyResolved { kref: KRef },
    #[error("{endpoint} is not the decider for {kref}")]
    NotDecider { endpoint: EndpointId, kref: KRef },
    #[error("resolution of {kref} forms a cycle")]
    PromiseCycle { kref: KRef },
    #[error("object {kref} not found")]
    ObjectNotFound { kref: KRef },
    #[error("worker for vat {vat_id} already exists")]
    WorkerExists { vat_id: VatId },
    #[error("worker for vat {vat_id} does not exist")]
    WorkerMissing { vat_id: VatId },
    #[error("store error: {0}")]
    Store(#[from] KvError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("remote error: {message}")]
    Remote {
        message: String,
        code: Option<String>,
    },
}

impl KernelError {
    /// Stable cross-boundary code, when this error has one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            KernelError::VatAlreadyExists { .. } => Some(codes::VAT_ALREADY_EXISTS),
            KernelError::VatNotFound { .. } => Some(codes::VAT_NOT_FOUND),
            KernelError::VatDeleted { .. } => Some(codes::VAT_DELETED),
            KernelError::VatConnectionExists { .. } => Some(codes::VAT_CONNECTION_EXISTS),
            KernelError::VatConnectionNotFound { .. } => Some(codes::VAT_CONNECTION_NOT_FOUND),
            KernelError::VatTerminated { .. } => Some(codes::VAT_TERMINATED),
            KernelError::StreamRead { .. } => Some(codes::STREAM_READ_ERROR),
            KernelError::Unmarshal(_) => Some(codes::UNMARSHAL_FAILED),
            _ => None,
        }
    }

    fn vat_id(&self) -> Option<VatId> {
        match self {
            KernelError::VatAlreadyExists { vat_id }
            | KernelError::VatNotFound { vat_id }
            | KernelError::VatDeleted { vat_id }
            | KernelError::VatConnectionExists { vat_id }
            | KernelError::VatConnectionNotFound { vat_id }
            | KernelError::VatTerminated { vat_id } => Some(*vat_id),
            KernelError::StreamRead { endpoint, .. } => endpoint.as_vat(),
            _ => None,
        }
    }

    /// Wire form for crossing the kernel↔worker boundary.
    pub fn to_marshaled(&self) -> MarshaledError {
        let mut marshaled = MarshaledError::new(self.to_string());
        if let Some(code) = self.code() {
            marshaled = marshaled.with_code(code);
        }
        if let Some(vat_id) = self.vat_id() {
            marshaled =
                marshaled.with_data(serde_json::json!({ "vatId": vat_id.to_string() }));
        }
        marshaled
    }

    /// Reconstruct the typed error when the code is recognized and the data
    /// suffices; otherwise a generic remote error.
    pub fn from_marshaled(marshaled: &MarshaledError) -> KernelError {
        let vat_id = marshaled
            .data
            .as_ref()
            .and_then(|data| data.get("vatId"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<VatId>().ok());
        match (marshaled.code.as_deref(), vat_id) {
            (Some(codes::VAT_ALREADY_EXISTS), Some(vat_id)) => {
                KernelError::VatAlreadyExists { vat_id }
            }
            (Some(codes::VAT_NOT_FOUND), Some(vat_id)) => KernelError::VatNotFound { vat_id },
            (Some(codes::VAT_DELETED), Some(vat_id)) => KernelError::VatDeleted { vat_id },
            (Some(codes::VAT_CONNECTION_EXISTS), Some(vat_id)) => {
                KernelError::VatConnectionExists { vat_id }
            }
            (Some(codes::VAT_CONNECTION_NOT_FOUND), Some(vat_id)) => {
                KernelError::VatConnectionNotFound { vat_id }
            }
            (Some(codes::VAT_TERMINATED), Some(vat_id)) => KernelError::VatTerminated { vat_id },
            (Some(codes::STREAM_READ_ERROR), Some(vat_id)) => KernelError::StreamRead {
                endpoint: vat_id.into(),
                detail: marshaled.message.clone(),
            },
            (Some(codes::UNMARSHAL_FAILED), _) => {
                KernelError::Unmarshal(marshaled.message.clone())
            }
            (code, _) => KernelError::Remote {
                message: marshaled.message.clone(),
                code: code.map(str::to_string),
            },
        }
    }
}
