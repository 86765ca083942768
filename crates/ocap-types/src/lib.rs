//! Wire-visible types shared across the kernel, transport, and workers:
//! reference grammar, capability payloads, vat protocol, error marshaling.

pub mod capdata;
pub mod config;
pub mod marshal;
pub mod refs;
pub mod wire;

pub use capdata::{CapData, KernelCapData, Message, VatCapData, VatMessage, decode_body};
pub use config::{ConfigError, VatConfig, VatSource};
pub use marshal::{MarshalError, MarshaledError, codes, is_marshaled_error};
pub use refs::{
    ERef, EndpointId, EndpointKind, KRef, RefDirection, RefError, RefKind, RemoteId, VatId,
};
pub use wire::{
    SyscallBatch, VatDelivery, VatResolution, VatSyscall, WorkerCommand, WorkerFailure,
    WorkerReply, WorkerRequest,
};
