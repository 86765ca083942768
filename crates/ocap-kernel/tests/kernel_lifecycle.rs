mod common;

use common::{
    ScriptedWorkers, config, delivery_log, mem_store, new_kernel, recording_script,
};
use ocap_kernel::{Kernel, KernelError, VatStatus};
use ocap_store::Kv;
use ocap_types::{CapData, KRef, VatDelivery, VatId};

#[tokio::test]
async fn launch_assigns_sequential_ids_and_roots() {
    let workers = ScriptedWorkers::new();
    let log = delivery_log();
    workers.script(VatId::new(0), recording_script(log.clone()));
    let mut kernel = new_kernel(workers);

    let first = kernel.launch_vat(config()).await.unwrap();
    let second = kernel.launch_vat(config()).await.unwrap();
    assert_eq!(first, VatId::new(0));
    assert_eq!(second, VatId::new(1));
    assert_eq!(kernel.vat_status(first), Some(VatStatus::Running));

    let roots = (kernel.vat_root(first).unwrap(), kernel.vat_root(second).unwrap());
    assert_ne!(roots.0, roots.1);

    // Exactly one initialization delivery.
    let deliveries = log.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(matches!(deliveries[0], VatDelivery::StartVat { .. }));
}

#[tokio::test]
async fn duplicate_launch_is_rejected_even_after_termination() {
    let workers = ScriptedWorkers::new();
    let mut kernel = new_kernel(workers);
    let vat_id = VatId::new(0);

    kernel.launch_vat_with_id(vat_id, config()).await.unwrap();
    assert!(matches!(
        kernel.launch_vat_with_id(vat_id, config()).await,
        Err(KernelError::VatAlreadyExists { .. })
    ));

    kernel.terminate_vat(vat_id).await.unwrap();
    // Ids are never reused.
    assert!(matches!(
        kernel.launch_vat_with_id(vat_id, config()).await,
        Err(KernelError::VatAlreadyExists { .. })
    ));
}

#[tokio::test]
async fn second_termination_reports_deleted_not_missing() {
    let workers = ScriptedWorkers::new();
    let mut kernel = new_kernel(workers);
    let vat_id = kernel.launch_vat(config()).await.unwrap();

    kernel.terminate_vat(vat_id).await.unwrap();
    assert_eq!(kernel.vat_status(vat_id), Some(VatStatus::Deleted));
    assert!(matches!(
        kernel.terminate_vat(vat_id).await,
        Err(KernelError::VatDeleted { .. })
    ));
    assert!(matches!(
        kernel.terminate_vat(VatId::new(9)).await,
        Err(KernelError::VatNotFound { .. })
    ));
}

#[tokio::test]
async fn termination_force_rejects_promises_the_vat_decided() {
    let workers = ScriptedWorkers::new();
    let mut kernel = new_kernel(workers);
    let vat_id = kernel.launch_vat(config()).await.unwrap();
    let root = kernel.vat_root(vat_id).unwrap();

    // Delivering the message hands the vat deciding authority for `result`.
    let result = kernel
        .send_message(root, "begin", CapData::new("[]", vec![]))
        .unwrap();
    kernel.run().await.unwrap();
    assert!(kernel.promise(result).unwrap().value().is_none());

    kernel.terminate_vat(vat_id).await.unwrap();
    let promise = kernel.promise(result).unwrap();
    assert!(promise.is_rejected());
    assert!(promise.value().unwrap().body.contains("VAT_TERMINATED"));
}

#[tokio::test]
async fn terminate_all_reports_individual_failures() {
    let workers = ScriptedWorkers::new();
    workers.fail_termination_of(VatId::new(1));
    let mut kernel = new_kernel(workers.clone());
    for _ in 0..3 {
        kernel.launch_vat(config()).await.unwrap();
    }

    let failures = kernel.terminate_all_vats().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, VatId::new(1));

    // The failure did not leave its vat behind.
    for n in 0..3 {
        assert_eq!(kernel.vat_status(VatId::new(n)), Some(VatStatus::Deleted));
    }
    assert_eq!(workers.terminated().len(), 3);
}

#[tokio::test]
async fn a_failed_launch_leaves_no_record_or_config_behind() {
    let workers = ScriptedWorkers::new();
    workers.fail_launch_of(VatId::new(0));
    let mut kernel = new_kernel(workers);

    assert!(matches!(
        kernel.launch_vat(config()).await,
        Err(KernelError::WorkerMissing { .. })
    ));
    assert_eq!(kernel.vat_status(VatId::new(0)), None);
    assert_eq!(kernel.kv_get("vat.v0").unwrap(), None);
}

#[tokio::test]
async fn restart_preserves_id_root_and_namespace() {
    let workers = ScriptedWorkers::new();
    let mut kernel = new_kernel(workers);
    let vat_id = kernel.launch_vat(config()).await.unwrap();
    let root = kernel.vat_root(vat_id).unwrap();
    kernel.vat_kv(vat_id).set("cursor", "7").unwrap();

    kernel.restart_vat(vat_id).await.unwrap();
    assert_eq!(kernel.vat_status(vat_id), Some(VatStatus::Running));
    assert_eq!(kernel.vat_root(vat_id).unwrap(), root);
    assert_eq!(kernel.vat_kv(vat_id).get("cursor").unwrap().as_deref(), Some("7"));

    // The preserved table still routes messages to the same root.
    let result = kernel
        .send_message(root, "still-there", CapData::new("[]", vec![]))
        .unwrap();
    kernel.run().await.unwrap();
    assert!(kernel.promise(result).is_some());
}

#[tokio::test]
async fn termination_truncates_the_vat_namespace_only() {
    let workers = ScriptedWorkers::new();
    let store = mem_store();
    let mut kernel = Kernel::new(store.clone(), workers).unwrap();
    let vat_id = kernel.launch_vat(config()).await.unwrap();

    kernel.vat_kv(vat_id).set("cursor", "42").unwrap();
    kernel.kv_set("epoch", "7").unwrap();
    assert_eq!(store.get("v0.cursor").unwrap().as_deref(), Some("42"));

    kernel.terminate_vat(vat_id).await.unwrap();
    assert_eq!(kernel.vat_kv(vat_id).get("cursor").unwrap(), None);
    assert_eq!(kernel.kv_get("epoch").unwrap().as_deref(), Some("7"));
}

#[tokio::test]
async fn counters_survive_a_kernel_restart() {
    let workers = ScriptedWorkers::new();
    let store = mem_store();
    {
        let mut kernel = Kernel::new(store.clone(), workers.clone()).unwrap();
        kernel.launch_vat(config()).await.unwrap();
        kernel.launch_vat(config()).await.unwrap();
    }

    let mut kernel = Kernel::new(store.clone(), workers).unwrap();
    let vat_id = kernel.launch_vat(config()).await.unwrap();
    assert_eq!(vat_id, VatId::new(2));
    // Object allocation continued past the earlier roots too.
    assert_eq!(kernel.vat_root(vat_id).unwrap(), KRef::object(2));
    assert_eq!(kernel.kv_get("nextVatId").unwrap().as_deref(), Some("3"));
}
