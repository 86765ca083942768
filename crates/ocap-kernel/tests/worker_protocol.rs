mod common;

use std::sync::Arc;

use common::{config, mem_store};
use ocap_kernel::{Kernel, KernelError, MuxWorkerService, VatStatus};
use ocap_transport::{Envelope, Multiplexer, duplex_pair};
use ocap_types::{
    SyscallBatch, VatId, WorkerCommand, WorkerFailure, WorkerReply, WorkerRequest,
};

const COMMAND_LABEL: &str = "commands";

/// Minimal far-end worker host: acknowledges every command (optionally
/// failing launches) and answers every vat delivery with an empty syscall
/// batch.
fn spawn_host(
    far: ocap_transport::DuplexEnd<Envelope>,
    fail_launch_with: Option<KernelError>,
) {
    let (writer, mut reader) = far.split();
    tokio::spawn(async move {
        while let Some(Ok(envelope)) = reader.next().await {
            if envelope.label == COMMAND_LABEL {
                let request: WorkerRequest =
                    serde_json::from_value(envelope.content).unwrap();
                let reply = match (&request.command, &fail_launch_with) {
                    (WorkerCommand::Launch { vat_id }, Some(err)) => WorkerReply::failure(
                        request.id,
                        &WorkerFailure {
                            vat_id: *vat_id,
                            error: err.to_marshaled(),
                        },
                    ),
                    _ => WorkerReply::ok(request.id, serde_json::json!({})),
                };
                writer
                    .write(Envelope {
                        label: COMMAND_LABEL.into(),
                        content: serde_json::to_value(&reply).unwrap(),
                    })
                    .unwrap();
            } else {
                // A kernel delivery on some vat's sub-channel.
                writer
                    .write(Envelope {
                        label: envelope.label,
                        content: serde_json::to_value(&SyscallBatch::empty()).unwrap(),
                    })
                    .unwrap();
            }
        }
    });
}

#[tokio::test]
async fn launch_and_terminate_ride_the_command_channel() {
    let (near, far) = duplex_pair::<Envelope>();
    spawn_host(far, None);
    let service = Arc::new(MuxWorkerService::new(Multiplexer::new(near)).unwrap());
    let mut kernel = Kernel::new(mem_store(), service).unwrap();

    let vat_id = kernel.launch_vat(config()).await.unwrap();
    assert_eq!(vat_id, VatId::new(0));
    assert_eq!(kernel.vat_status(vat_id), Some(VatStatus::Running));

    kernel.terminate_vat(vat_id).await.unwrap();
    assert_eq!(kernel.vat_status(vat_id), Some(VatStatus::Deleted));
}

#[tokio::test]
async fn a_failed_launch_reply_surfaces_as_the_typed_error() {
    let (near, far) = duplex_pair::<Envelope>();
    spawn_host(
        far,
        Some(KernelError::VatAlreadyExists {
            vat_id: VatId::new(0),
        }),
    );
    let service = Arc::new(MuxWorkerService::new(Multiplexer::new(near)).unwrap());
    let mut kernel = Kernel::new(mem_store(), service).unwrap();

    assert!(matches!(
        kernel.launch_vat(config()).await,
        Err(KernelError::VatAlreadyExists { .. })
    ));
    // The failed launch left no record behind.
    assert_eq!(kernel.vat_status(VatId::new(0)), None);
}

#[tokio::test]
async fn a_closed_host_rejects_pending_commands() {
    let (near, far) = duplex_pair::<Envelope>();
    let service = Arc::new(MuxWorkerService::new(Multiplexer::new(near)).unwrap());
    let mut kernel = Kernel::new(mem_store(), service).unwrap();

    // End the host side without ever answering.
    drop(far);
    assert!(kernel.launch_vat(config()).await.is_err());
}
