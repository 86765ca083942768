mod common;

use std::sync::{Arc, Mutex};

use common::{ScriptedWorkers, config, delivery_log, new_kernel};
use ocap_kernel::VatStatus;
use ocap_types::{
    CapData, ERef, KRef, SyscallBatch, VatDelivery, VatId, VatResolution, VatSyscall,
};

fn no_args() -> CapData<KRef> {
    CapData::new("[]", vec![])
}

/// Exporter vat: on "finish" it fulfills the stashed result with a brand-new
/// export (`vo+1`).
fn exporter_script(
    pending: Arc<Mutex<Option<ERef>>>,
    log: common::DeliveryLog,
) -> impl FnMut(VatDelivery) -> SyscallBatch + Send {
    move |delivery| {
        log.lock().unwrap().push(delivery.clone());
        match &delivery {
            VatDelivery::Message { message } if message.method == "task" => {
                *pending.lock().unwrap() = message.result;
                SyscallBatch::empty()
            }
            VatDelivery::Message { message } if message.method == "finish" => {
                let eref = pending.lock().unwrap().take().unwrap();
                SyscallBatch {
                    syscalls: vec![VatSyscall::Resolve {
                        resolutions: vec![VatResolution {
                            eref,
                            rejected: false,
                            value: CapData::from_slot("vo+1".parse().unwrap()),
                        }],
                    }],
                }
            }
            _ => SyscallBatch::empty(),
        }
    }
}

#[tokio::test]
async fn dropped_and_retired_imports_collect_the_export() {
    let workers = ScriptedWorkers::new();
    let exporter_log = delivery_log();
    let pending = Arc::new(Mutex::new(None::<ERef>));
    workers.script(
        VatId::new(0),
        exporter_script(pending, exporter_log.clone()),
    );
    {
        // Importer: subscribe when handed a promise, then drop and retire
        // whatever a notification carries.
        workers.script(VatId::new(1), move |delivery| match &delivery {
            VatDelivery::Message { message } if !message.params.slots.is_empty() => {
                SyscallBatch {
                    syscalls: vec![VatSyscall::Subscribe {
                        eref: message.params.slots[0],
                    }],
                }
            }
            VatDelivery::Notify { resolutions } => {
                let slot = resolutions[0].value.slots[0];
                SyscallBatch {
                    syscalls: vec![
                        VatSyscall::DropImports { erefs: vec![slot] },
                        VatSyscall::RetireImports { erefs: vec![slot] },
                    ],
                }
            }
            _ => SyscallBatch::empty(),
        });
    }
    let mut kernel = new_kernel(workers);
    let exporter = kernel.launch_vat(config()).await.unwrap();
    let importer = kernel.launch_vat(config()).await.unwrap();
    let exporter_root = kernel.vat_root(exporter).unwrap();
    let importer_root = kernel.vat_root(importer).unwrap();

    let kp = kernel.send_message(exporter_root, "task", no_args()).unwrap();
    kernel
        .send_only(importer_root, "watch", CapData::from_slot(kp))
        .unwrap();
    kernel.send_only(exporter_root, "finish", no_args()).unwrap();
    kernel.run().await.unwrap();

    // The fresh export was imported (counts 1/1), dropped, retired, swept,
    // and its owner told to release it.
    let exported = *kernel.promise(kp).unwrap().value().unwrap().slots.first().unwrap();
    assert_eq!(kernel.object_counts(exported), None);
    let retire = exporter_log
        .lock()
        .unwrap()
        .iter()
        .find_map(|delivery| match delivery {
            VatDelivery::RetireExports { erefs } => Some(erefs.clone()),
            _ => None,
        });
    assert_eq!(retire, Some(vec!["vo+1".parse().unwrap()]));

    // Roots are pinned and never collected.
    assert!(kernel.object_counts(exporter_root).is_some());
}

#[tokio::test]
async fn double_drop_terminates_the_offender_only() {
    let workers = ScriptedWorkers::new();
    let exporter_log = delivery_log();
    let pending = Arc::new(Mutex::new(None::<ERef>));
    workers.script(
        VatId::new(0),
        exporter_script(pending, exporter_log.clone()),
    );
    {
        workers.script(VatId::new(1), move |delivery| match &delivery {
            VatDelivery::Message { message } if !message.params.slots.is_empty() => {
                SyscallBatch {
                    syscalls: vec![VatSyscall::Subscribe {
                        eref: message.params.slots[0],
                    }],
                }
            }
            VatDelivery::Notify { resolutions } => {
                let slot = resolutions[0].value.slots[0];
                SyscallBatch {
                    syscalls: vec![
                        VatSyscall::DropImports { erefs: vec![slot] },
                        VatSyscall::DropImports { erefs: vec![slot] },
                    ],
                }
            }
            _ => SyscallBatch::empty(),
        });
    }
    let mut kernel = new_kernel(workers);
    let exporter = kernel.launch_vat(config()).await.unwrap();
    let importer = kernel.launch_vat(config()).await.unwrap();
    let exporter_root = kernel.vat_root(exporter).unwrap();
    let importer_root = kernel.vat_root(importer).unwrap();

    let kp = kernel.send_message(exporter_root, "task", no_args()).unwrap();
    kernel
        .send_only(importer_root, "watch", CapData::from_slot(kp))
        .unwrap();
    kernel.send_only(exporter_root, "finish", no_args()).unwrap();
    kernel.run().await.unwrap();

    assert_eq!(kernel.vat_status(importer), Some(VatStatus::Deleted));
    assert_eq!(kernel.vat_status(exporter), Some(VatStatus::Running));
}

#[tokio::test]
async fn termination_releases_the_dead_vats_imports() {
    let workers = ScriptedWorkers::new();
    let exporter_log = delivery_log();
    let pending = Arc::new(Mutex::new(None::<ERef>));
    workers.script(
        VatId::new(0),
        exporter_script(pending, exporter_log.clone()),
    );
    {
        // Importer holds the reference and never lets go voluntarily.
        workers.script(VatId::new(1), move |delivery| match &delivery {
            VatDelivery::Message { message } if !message.params.slots.is_empty() => {
                SyscallBatch {
                    syscalls: vec![VatSyscall::Subscribe {
                        eref: message.params.slots[0],
                    }],
                }
            }
            _ => SyscallBatch::empty(),
        });
    }
    let mut kernel = new_kernel(workers);
    let exporter = kernel.launch_vat(config()).await.unwrap();
    let importer = kernel.launch_vat(config()).await.unwrap();
    let exporter_root = kernel.vat_root(exporter).unwrap();
    let importer_root = kernel.vat_root(importer).unwrap();

    let kp = kernel.send_message(exporter_root, "task", no_args()).unwrap();
    kernel
        .send_only(importer_root, "watch", CapData::from_slot(kp))
        .unwrap();
    kernel.send_only(exporter_root, "finish", no_args()).unwrap();
    kernel.run().await.unwrap();

    let exported = *kernel.promise(kp).unwrap().value().unwrap().slots.first().unwrap();
    assert_eq!(kernel.object_counts(exported), Some((1, 1)));

    // Terminating the importer releases its counts; the sweep then retires
    // the now-unreferenced export.
    kernel.terminate_vat(importer).await.unwrap();
    kernel.run().await.unwrap();
    assert_eq!(kernel.object_counts(exported), None);
    let retired = exporter_log
        .lock()
        .unwrap()
        .iter()
        .any(|d| matches!(d, VatDelivery::RetireExports { .. }));
    assert!(retired);
}
