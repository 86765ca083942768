use std::sync::Arc;

use async_trait::async_trait;
use ocap_transport::{DuplexEnd, MessageResolver, Multiplexer, MuxChannel, TransportError};
use ocap_types::{MarshaledError, VatId, WorkerCommand, WorkerReply, WorkerRequest};
use serde_json::Value;

use crate::error::KernelError;

/// Kernel-side end of one vat's dedicated channel. The kernel writes
/// deliveries and reads the syscall batch each delivery produced.
pub enum VatChannel {
    Direct(DuplexEnd<Value>),
    Mux(MuxChannel),
}

impl VatChannel {
    pub fn write(&self, value: Value) -> Result<(), TransportError> {
        match self {
            VatChannel::Direct(end) => end.write(value),
            VatChannel::Mux(channel) => channel.write(value),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Value, TransportError>> {
        match self {
            VatChannel::Direct(end) => end.next().await,
            VatChannel::Mux(channel) => channel.next().await.map(Ok),
        }
    }
}

/// Capability the lifecycle manager depends on for obtaining and disposing
/// of vat workers. The kernel does not own worker processes; it asks.
#[async_trait]
pub trait WorkerService: Send + Sync {
    /// Start a worker for `vat_id`, yielding the kernel end of its channel.
    async fn launch(&self, vat_id: VatId) -> Result<VatChannel, KernelError>;
    async fn terminate(&self, vat_id: VatId) -> Result<(), KernelError>;
    async fn terminate_all(&self) -> Result<(), KernelError>;
}

const COMMAND_LABEL: &str = "commands";

/// Worker service speaking the worker protocol over one multiplexed
/// duplex channel to an external worker host.
///
/// Commands and replies travel on the `commands` sub-channel, correlated by
/// id; each successful launch transfers ownership of a fresh sub-channel
/// labeled with the vat id.
pub struct MuxWorkerService {
    mux: Multiplexer,
    commands: ocap_transport::MuxSender,
    resolver: Arc<MessageResolver>,
}

impl MuxWorkerService {
    pub fn new(mux: Multiplexer) -> Result<Self, KernelError> {
        let mut command_channel = mux.channel(COMMAND_LABEL)?;
        let commands = command_channel.sender();
        let resolver = Arc::new(MessageResolver::new());
        let replies = resolver.clone();
        tokio::spawn(async move {
            while let Some(value) = command_channel.next().await {
                match serde_json::from_value::<WorkerReply>(value) {
                    Ok(reply) => replies.handle_response(reply.id, reply.payload),
                    Err(err) => log::warn!("undecodable worker reply: {err}"),
                }
            }
            replies.terminate_all(TransportError::Closed);
        });
        Ok(MuxWorkerService {
            mux,
            commands,
            resolver,
        })
    }

    async fn request(&self, command: WorkerCommand) -> Result<Value, KernelError> {
        let commands = self.commands.clone();
        let payload = self
            .resolver
            .create_message(move |id| {
                let request = WorkerRequest { id, command };
                match serde_json::to_value(&request) {
                    Ok(value) => {
                        if let Err(err) = commands.write(value) {
                            log::warn!("worker command write failed: {err}");
                        }
                    }
                    Err(err) => log::warn!("worker command encode failed: {err}"),
                }
            })
            .await?;
        if let Some(error) = payload.get("error") {
            if ocap_types::is_marshaled_error(error) {
                let marshaled = MarshaledError::from_value(error)
                    .map_err(|err| KernelError::Unmarshal(err.to_string()))?;
                return Err(KernelError::from_marshaled(&marshaled));
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl WorkerService for MuxWorkerService {
    async fn launch(&self, vat_id: VatId) -> Result<VatChannel, KernelError> {
        self.request(WorkerCommand::Launch { vat_id }).await?;
        let channel = self
            .mux
            .channel(vat_id.to_string())
            .map_err(|_| KernelError::VatConnectionExists { vat_id })?;
        Ok(VatChannel::Mux(channel))
    }

    async fn terminate(&self, vat_id: VatId) -> Result<(), KernelError> {
        self.request(WorkerCommand::Terminate { vat_id }).await?;
        self.mux.close_channel(&vat_id.to_string());
        Ok(())
    }

    async fn terminate_all(&self) -> Result<(), KernelError> {
        self.request(WorkerCommand::TerminateAll).await?;
        Ok(())
    }
}
