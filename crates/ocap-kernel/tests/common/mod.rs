//! Scripted vat workers for kernel integration tests: each vat is a task
//! reading deliveries off a direct duplex channel and answering each one
//! with a canned syscall batch.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ocap_kernel::{Kernel, KernelError, VatChannel, WorkerService};
use ocap_store::{DynKv, MemKv};
use ocap_transport::duplex_pair;
use ocap_types::{SyscallBatch, VatConfig, VatDelivery, VatId};
use serde_json::Value;

pub type Script = Box<dyn FnMut(VatDelivery) -> SyscallBatch + Send>;
pub type DeliveryLog = Arc<Mutex<Vec<VatDelivery>>>;

#[derive(Default)]
pub struct ScriptedWorkers {
    scripts: Mutex<HashMap<VatId, Script>>,
    failing_launches: Mutex<HashSet<VatId>>,
    failing_terminations: Mutex<HashSet<VatId>>,
    terminated: Mutex<Vec<VatId>>,
}

impl ScriptedWorkers {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedWorkers::default())
    }

    /// Register the behavior the next launch of `vat_id` will run.
    pub fn script(
        &self,
        vat_id: VatId,
        script: impl FnMut(VatDelivery) -> SyscallBatch + Send + 'static,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .insert(vat_id, Box::new(script));
    }

    pub fn fail_launch_of(&self, vat_id: VatId) {
        self.failing_launches.lock().unwrap().insert(vat_id);
    }

    pub fn fail_termination_of(&self, vat_id: VatId) {
        self.failing_terminations.lock().unwrap().insert(vat_id);
    }

    pub fn terminated(&self) -> Vec<VatId> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerService for ScriptedWorkers {
    async fn launch(&self, vat_id: VatId) -> Result<VatChannel, KernelError> {
        if self.failing_launches.lock().unwrap().contains(&vat_id) {
            return Err(KernelError::WorkerMissing { vat_id });
        }
        let mut script = self
            .scripts
            .lock()
            .unwrap()
            .remove(&vat_id)
            .unwrap_or_else(|| Box::new(|_| SyscallBatch::empty()));
        let (near, far) = duplex_pair::<Value>();
        let (writer, mut reader) = far.split();
        tokio::spawn(async move {
            while let Some(Ok(value)) = reader.next().await {
                let delivery: VatDelivery = serde_json::from_value(value).unwrap();
                let batch = script(delivery);
                if writer.write(serde_json::to_value(&batch).unwrap()).is_err() {
                    break;
                }
            }
        });
        Ok(VatChannel::Direct(near))
    }

    async fn terminate(&self, vat_id: VatId) -> Result<(), KernelError> {
        self.terminated.lock().unwrap().push(vat_id);
        if self.failing_terminations.lock().unwrap().contains(&vat_id) {
            return Err(KernelError::WorkerMissing { vat_id });
        }
        Ok(())
    }

    async fn terminate_all(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

pub fn mem_store() -> DynKv {
    Arc::new(MemKv::new())
}

pub fn new_kernel(workers: Arc<ScriptedWorkers>) -> Kernel {
    Kernel::new(mem_store(), workers).unwrap()
}

pub fn config() -> VatConfig {
    VatConfig::from_source_spec("bootstrap.js")
}

/// A script that does nothing but record every delivery it sees.
pub fn recording_script(log: DeliveryLog) -> impl FnMut(VatDelivery) -> SyscallBatch + Send {
    move |delivery| {
        log.lock().unwrap().push(delivery);
        SyscallBatch::empty()
    }
}

pub fn delivery_log() -> DeliveryLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Methods of the messages a log captured, in delivery order.
pub fn logged_methods(log: &DeliveryLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|delivery| match delivery {
            VatDelivery::Message { message } => Some(message.method.clone()),
            _ => None,
        })
        .collect()
}
