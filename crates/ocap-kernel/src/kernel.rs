use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use ocap_store::{DynKv, Kv, PrefixedKv};
use ocap_types::{
    CapData, ERef, EndpointId, KRef, KernelCapData, Message, RefDirection, RefKind, RemoteId,
    SyscallBatch, VatConfig, VatDelivery, VatId, VatMessage, VatResolution, VatSyscall,
};

use crate::clist::Clist;
use crate::error::KernelError;
use crate::gc::{GcError, ObjectTable};
use crate::lifecycle::{VatRegistry, VatStatus};
use crate::promise::{KernelPromise, PromiseState, PromiseTable, Resolution, Subscribed};
use crate::queue::{RunItem, RunQueue};
use crate::worker::WorkerService;

const NEXT_VAT_ID_KEY: &str = "nextVatId";
const NEXT_OBJECT_ID_KEY: &str = "nextObjectId";
const NEXT_PROMISE_ID_KEY: &str = "nextPromiseId";
const NEXT_REMOTE_ID_KEY: &str = "nextRemoteId";

/// The kernel: reference tables, pending results, GC counts, the run queue,
/// and the vat lifecycle, drained one crank at a time.
///
/// All state lives on this struct and is mutated only by the crank currently
/// executing; vats run concurrently behind their channels, the kernel itself
/// is strictly sequential.
pub struct Kernel {
    store: DynKv,
    kernel_kv: PrefixedKv,
    workers: Arc<dyn WorkerService>,
    vats: VatRegistry,
    clists: HashMap<EndpointId, Clist>,
    objects: ObjectTable,
    promises: PromiseTable,
    run_queue: RunQueue,
    next_object_id: u64,
    next_promise_id: u64,
    next_remote_id: u64,
    cranks: u64,
}

impl Kernel {
    pub fn new(store: DynKv, workers: Arc<dyn WorkerService>) -> Result<Self, KernelError> {
        let kernel_kv = PrefixedKv::new(store.clone(), "k.");
        let next_vat_id = load_counter(&kernel_kv, NEXT_VAT_ID_KEY)?;
        let next_object_id = load_counter(&kernel_kv, NEXT_OBJECT_ID_KEY)?;
        let next_promise_id = load_counter(&kernel_kv, NEXT_PROMISE_ID_KEY)?;
        let next_remote_id = load_counter(&kernel_kv, NEXT_REMOTE_ID_KEY)?;
        Ok(Kernel {
            store,
            kernel_kv,
            workers,
            vats: VatRegistry::new(next_vat_id),
            clists: HashMap::new(),
            objects: ObjectTable::new(),
            promises: PromiseTable::new(),
            run_queue: RunQueue::default(),
            next_object_id,
            next_promise_id,
            next_remote_id,
            cranks: 0,
        })
    }

    // ---- vat lifecycle ----------------------------------------------------

    /// Launch a vat under a freshly allocated id.
    pub async fn launch_vat(&mut self, config: VatConfig) -> Result<VatId, KernelError> {
        let vat_id = self.vats.allocate_id();
        self.launch_vat_with_id(vat_id, config).await?;
        Ok(vat_id)
    }

    /// Launch a vat under a caller-chosen id. Fails with
    /// `VatAlreadyExists` if the id is in use, live or dead.
    pub async fn launch_vat_with_id(
        &mut self,
        vat_id: VatId,
        config: VatConfig,
    ) -> Result<(), KernelError> {
        self.vats.insert_launching(vat_id, config.clone())?;
        self.persist_vat_counter()?;
        self.kernel_kv.set(
            &format!("vat.{vat_id}"),
            &serde_json::to_string(&config)
                .map_err(|err| KernelError::Unmarshal(err.to_string()))?,
        )?;
        self.clists
            .insert(vat_id.into(), Clist::new(vat_id.into()));

        let channel = match self.workers.launch(vat_id).await {
            Ok(channel) => channel,
            Err(err) => {
                self.clists.remove(&EndpointId::from(vat_id));
                self.vats.remove(vat_id);
                if let Err(kv_err) = self.kernel_kv.delete(&format!("vat.{vat_id}")) {
                    log::warn!("launch rollback of {vat_id} left its config behind: {kv_err}");
                }
                return Err(err);
            }
        };
        self.vats.attach_channel(vat_id, channel)?;

        // The vat's root object: its first export, pinned by the kernel.
        let root = self.alloc_object()?;
        self.objects.insert_pinned(root, vat_id.into());
        let root_eref = ERef::new(
            ocap_types::EndpointKind::Vat,
            RefKind::Object,
            RefDirection::Export,
            0,
        );
        self.clist_mut(vat_id.into())?
            .export_to_kernel(root_eref, |_| root)
            .map_err(|err| violation(vat_id.into(), err))?;
        {
            let record = self.vats.get_mut(vat_id)?;
            record.root = Some(root);
            record.status = VatStatus::Running;
        }

        let parameters = config.parameters.clone();
        if let Err(err) = self
            .deliver_and_apply(vat_id, VatDelivery::StartVat { parameters })
            .await
        {
            self.contain_vat_failure(vat_id, err).await;
            return Err(KernelError::VatTerminated { vat_id });
        }
        Ok(())
    }

    /// Root object of a running vat.
    pub fn vat_root(&self, vat_id: VatId) -> Result<KRef, KernelError> {
        self.vats
            .get(vat_id)?
            .root
            .ok_or(KernelError::VatConnectionNotFound { vat_id })
    }

    pub fn vat_status(&self, vat_id: VatId) -> Option<VatStatus> {
        self.vats.status(vat_id)
    }

    /// Tear down and relaunch a vat's worker, preserving its id, its
    /// reference table, and its durable KV namespace.
    pub async fn restart_vat(&mut self, vat_id: VatId) -> Result<(), KernelError> {
        {
            let record = self.vats.get_mut(vat_id)?;
            record.status = VatStatus::Restarting;
            record.channel = None;
        }
        self.workers.terminate(vat_id).await?;
        match self.workers.launch(vat_id).await {
            Ok(channel) => {
                self.vats.attach_channel(vat_id, channel)?;
            }
            Err(err) => {
                // Relaunch failed: queued deliveries for this vat fail when
                // their cranks run.
                self.contain_vat_failure(vat_id, err).await;
                return Err(KernelError::VatTerminated { vat_id });
            }
        }
        let parameters = self.vats.get(vat_id)?.config.parameters.clone();
        self.vats.get_mut(vat_id)?.status = VatStatus::Running;
        if let Err(err) = self
            .deliver_and_apply(vat_id, VatDelivery::StartVat { parameters })
            .await
        {
            self.contain_vat_failure(vat_id, err).await;
            return Err(KernelError::VatTerminated { vat_id });
        }
        Ok(())
    }

    /// Stop a vat's worker, force-reject everything it was going to decide,
    /// and discard its reference table. The kernel side always completes;
    /// a worker-service failure is reported after cleanup.
    pub async fn terminate_vat(&mut self, vat_id: VatId) -> Result<(), KernelError> {
        self.vats.get(vat_id)?;
        self.vats.get_mut(vat_id)?.status = VatStatus::Terminating;
        let worker_result = self.workers.terminate(vat_id).await;

        let termination = KernelError::VatTerminated { vat_id };
        let error_value = error_capdata(&termination);
        for kref in self.promises.decided_by(vat_id.into()) {
            match self
                .promises
                .resolve(kref, None, true, error_value.clone())
            {
                Ok(resolution) => self.handle_resolution(resolution),
                Err(err) => log::warn!("force-resolve of {kref} failed: {err}"),
            }
        }
        self.promises.unsubscribe_everywhere(vat_id.into());

        if let Some(clist) = self.clists.remove(&EndpointId::from(vat_id)) {
            for (eref, kref) in clist.entries() {
                if kref.kind() != RefKind::Object {
                    continue;
                }
                match self.objects.get(kref) {
                    Some(object) if object.owner == EndpointId::from(vat_id) => {
                        // Owner is gone: the export is abandoned. Importers
                        // discover this when their sends bounce.
                        let _ = self.objects.remove(kref);
                    }
                    Some(_) => {
                        if clist.is_reachable(eref) {
                            if let Err(err) = self.objects.decrement_reachable(kref) {
                                log::warn!("termination refcount error on {kref}: {err}");
                            }
                        }
                        if let Err(err) = self.objects.decrement_recognizable(kref) {
                            log::warn!("termination refcount error on {kref}: {err}");
                        }
                    }
                    None => {}
                }
            }
        }

        self.vats.mark_deleted(vat_id);
        self.kernel_kv.delete(&format!("vat.{vat_id}"))?;
        self.kernel_kv
            .set(&format!("vat.{vat_id}.deleted"), "true")?;
        PrefixedKv::new(self.store.clone(), format!("{vat_id}.")).truncate()?;

        worker_result
    }

    /// Best-effort parallel termination of every live vat. Individual
    /// failures are collected and reported; the rest still terminate.
    pub async fn terminate_all_vats(&mut self) -> Vec<(VatId, KernelError)> {
        let mut failures = Vec::new();
        for vat_id in self.vats.live_ids() {
            if let Err(err) = self.terminate_vat(vat_id).await {
                log::warn!("terminating {vat_id} failed: {err}");
                failures.push((vat_id, err));
            }
        }
        if let Err(err) = self.workers.terminate_all().await {
            log::warn!("worker terminate-all failed: {err}");
        }
        failures
    }

    /// Register a remote kernel peer, creating its reference table.
    pub fn add_remote(&mut self) -> Result<RemoteId, KernelError> {
        let remote_id = RemoteId::new(self.next_remote_id);
        self.next_remote_id += 1;
        self.kernel_kv
            .set(NEXT_REMOTE_ID_KEY, &self.next_remote_id.to_string())?;
        self.clists
            .insert(remote_id.into(), Clist::new(remote_id.into()));
        Ok(remote_id)
    }

    // ---- message entry points ---------------------------------------------

    /// Queue a message for `target`, allocating a pending result for its
    /// outcome. The kernel holds deciding authority until delivery.
    pub fn send_message(
        &mut self,
        target: KRef,
        method: impl Into<String>,
        params: KernelCapData,
    ) -> Result<KRef, KernelError> {
        self.check_target(target)?;
        let result = self.alloc_promise()?;
        self.promises.insert(result, None);
        self.run_queue.push_message(Message {
            target,
            method: method.into(),
            params,
            result: Some(result),
        });
        Ok(result)
    }

    /// Fire-and-forget send: no pending result is allocated.
    pub fn send_only(
        &mut self,
        target: KRef,
        method: impl Into<String>,
        params: KernelCapData,
    ) -> Result<(), KernelError> {
        self.check_target(target)?;
        self.run_queue.push_message(Message {
            target,
            method: method.into(),
            params,
            result: None,
        });
        Ok(())
    }

    fn check_target(&self, target: KRef) -> Result<(), KernelError> {
        match target.kind() {
            RefKind::Object => {
                self.objects
                    .get(target)
                    .map(|_| ())
                    .ok_or(KernelError::ObjectNotFound { kref: target })
            }
            RefKind::Promise => {
                if self.promises.contains(target) {
                    Ok(())
                } else {
                    Err(KernelError::PromiseNotFound { kref: target })
                }
            }
        }
    }

    pub fn promise(&self, kref: KRef) -> Option<&KernelPromise> {
        self.promises.get(kref)
    }

    pub fn object_counts(&self, kref: KRef) -> Option<(u64, u64)> {
        self.objects
            .get(kref)
            .map(|o| (o.reachable, o.recognizable))
    }

    // ---- crank loop -------------------------------------------------------

    /// Execute one crank: pop one run item, deliver it, apply the syscalls
    /// it produced, then sweep the maybe-free set. Returns false when the
    /// queue was empty.
    pub async fn step(&mut self) -> Result<bool, KernelError> {
        let item = match self.run_queue.pop() {
            Some(item) => item,
            None => {
                // An empty queue is not yet quiescence: sweeping may queue
                // retirement work.
                self.collect_garbage();
                match self.run_queue.pop() {
                    Some(item) => item,
                    None => return Ok(false),
                }
            }
        };
        self.cranks += 1;
        let crank_result = match item {
            RunItem::Deliver(message) => self.deliver_message(message).await,
            RunItem::Notify { vat_id, kref } => self.deliver_notify(vat_id, kref).await,
            RunItem::RetireExports { vat_id, krefs } => {
                self.deliver_retire_exports(vat_id, krefs).await
            }
        };
        if let Err(err) = crank_result {
            if is_fatal(&err) {
                return Err(err);
            }
            // Contained: the offending vat is gone, the scheduler lives on.
            log::warn!("crank {} failed: {err}", self.cranks);
        }
        self.collect_garbage();
        Ok(true)
    }

    /// Drain the run queue to quiescence: no deliveries pending and no
    /// collectable garbage left.
    pub async fn run(&mut self) -> Result<u64, KernelError> {
        let start = self.cranks;
        while self.step().await? {}
        Ok(self.cranks - start)
    }

    pub fn crank_count(&self) -> u64 {
        self.cranks
    }

    pub fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }

    // ---- kernel kv surface ------------------------------------------------

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, KernelError> {
        Ok(self.kernel_kv.get(key)?)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), KernelError> {
        Ok(self.kernel_kv.set(key, value)?)
    }

    pub fn kv_delete(&self, key: &str) -> Result<(), KernelError> {
        Ok(self.kernel_kv.delete(key)?)
    }

    pub fn kv_get_next_key(&self, key: &str) -> Result<Option<String>, KernelError> {
        Ok(self.kernel_kv.get_next_key(key)?)
    }

    /// A vat's namespaced view of the durable store.
    pub fn vat_kv(&self, vat_id: VatId) -> PrefixedKv {
        PrefixedKv::new(self.store.clone(), format!("{vat_id}."))
    }

    // ---- delivery ---------------------------------------------------------

    async fn deliver_message(&mut self, mut message: Message) -> Result<(), KernelError> {
        let mut seen = std::collections::HashSet::new();
        loop {
            if message.target.kind() == RefKind::Object {
                return self.deliver_to_object(message).await;
            }
            let Some(promise) = self.promises.get(message.target) else {
                let err = KernelError::PromiseNotFound {
                    kref: message.target,
                };
                log::warn!("dropping message to unknown target: {err}");
                self.reject_result(message.result, error_capdata(&err));
                return Ok(());
            };
            match promise.state() {
                PromiseState::Unresolved => {
                    let target = message.target;
                    return self.promises.enqueue_message(target, message);
                }
                PromiseState::Rejected => {
                    let value = promise.value().cloned().unwrap_or_else(|| {
                        CapData::new("null", vec![])
                    });
                    self.reject_result(message.result, value);
                    return Ok(());
                }
                PromiseState::Fulfilled => {
                    let value = promise.value().cloned().unwrap_or_else(|| {
                        CapData::new("null", vec![])
                    });
                    match value.single_slot() {
                        Some(next) => {
                            if !seen.insert(message.target) {
                                let err = KernelError::PromiseCycle {
                                    kref: message.target,
                                };
                                self.reject_result(message.result, error_capdata(&err));
                                return Ok(());
                            }
                            message.target = *next;
                        }
                        None => {
                            let err = KernelError::Unmarshal(
                                "message sent to non-callable resolution".to_string(),
                            );
                            self.reject_result(message.result, error_capdata(&err));
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn deliver_to_object(&mut self, message: Message) -> Result<(), KernelError> {
        let owner = match self.objects.owner(message.target) {
            Ok(owner) => owner,
            Err(err) => {
                log::warn!("dropping message to unknown object: {err}");
                self.reject_result(
                    message.result,
                    error_capdata(&KernelError::ObjectNotFound {
                        kref: message.target,
                    }),
                );
                return Ok(());
            }
        };
        let Some(vat_id) = owner.as_vat() else {
            log::warn!("no delivery route to remote owner {owner}");
            self.reject_result(
                message.result,
                error_capdata(&KernelError::StreamRead {
                    endpoint: owner,
                    detail: "no route to remote endpoint".to_string(),
                }),
            );
            return Ok(());
        };
        if self.vats.status(vat_id) != Some(VatStatus::Running) {
            self.reject_result(
                message.result,
                error_capdata(&KernelError::VatTerminated { vat_id }),
            );
            return Ok(());
        }

        // Deciding authority travels with the message.
        if let Some(result) = message.result {
            self.promises.set_decider(result, Some(vat_id.into()))?;
        }
        let vat_message = match self.message_to_vat(vat_id, &message) {
            Ok(vat_message) => vat_message,
            Err(err) => {
                self.contain_vat_failure(vat_id, err).await;
                self.reject_result(
                    message.result,
                    error_capdata(&KernelError::VatTerminated { vat_id }),
                );
                return Ok(());
            }
        };
        if let Err(err) = self
            .deliver_and_apply(
                vat_id,
                VatDelivery::Message {
                    message: vat_message,
                },
            )
            .await
        {
            if is_fatal(&err) {
                return Err(err);
            }
            self.contain_vat_failure(vat_id, err).await;
        }
        Ok(())
    }

    async fn deliver_notify(&mut self, vat_id: VatId, kref: KRef) -> Result<(), KernelError> {
        if self.vats.status(vat_id) != Some(VatStatus::Running) {
            log::debug!("skipping notify of {kref} to non-running {vat_id}");
            return Ok(());
        }
        let Some(promise) = self.promises.get(kref) else {
            log::warn!("notify of unknown promise {kref}");
            return Ok(());
        };
        let (rejected, value) = match promise.value() {
            Some(value) => (promise.is_rejected(), value.clone()),
            None => {
                log::warn!("notify of unresolved promise {kref}");
                return Ok(());
            }
        };
        let resolution = match self.resolution_to_vat(vat_id, kref, rejected, value) {
            Ok(resolution) => resolution,
            Err(err) => {
                self.contain_vat_failure(vat_id, err).await;
                return Ok(());
            }
        };
        if let Err(err) = self
            .deliver_and_apply(
                vat_id,
                VatDelivery::Notify {
                    resolutions: vec![resolution],
                },
            )
            .await
        {
            if is_fatal(&err) {
                return Err(err);
            }
            self.contain_vat_failure(vat_id, err).await;
            return Ok(());
        }
        // Both sides are done with this promise entry.
        if let Ok(clist) = self.clist_mut(vat_id.into()) {
            let _ = clist.remove_kref(kref);
        }
        Ok(())
    }

    async fn deliver_retire_exports(
        &mut self,
        vat_id: VatId,
        krefs: Vec<KRef>,
    ) -> Result<(), KernelError> {
        if self.vats.status(vat_id) != Some(VatStatus::Running) {
            return Ok(());
        }
        let mut erefs = Vec::new();
        if let Ok(clist) = self.clist_mut(vat_id.into()) {
            for kref in krefs {
                if let Ok(eref) = clist.remove_kref(kref) {
                    erefs.push(eref);
                }
            }
        }
        if erefs.is_empty() {
            return Ok(());
        }
        if let Err(err) = self
            .deliver_and_apply(vat_id, VatDelivery::RetireExports { erefs })
            .await
        {
            if is_fatal(&err) {
                return Err(err);
            }
            self.contain_vat_failure(vat_id, err).await;
        }
        Ok(())
    }

    /// Write one delivery to the vat's channel and apply the syscall batch
    /// it synchronously produced.
    async fn deliver_and_apply(
        &mut self,
        vat_id: VatId,
        delivery: VatDelivery,
    ) -> Result<(), KernelError> {
        let value = serde_json::to_value(&delivery)
            .map_err(|err| KernelError::Unmarshal(err.to_string()))?;
        let batch: SyscallBatch = {
            let record = self.vats.get_mut(vat_id)?;
            let channel = record
                .channel
                .as_mut()
                .ok_or(KernelError::VatConnectionNotFound { vat_id })?;
            channel.write(value).map_err(|err| KernelError::StreamRead {
                endpoint: vat_id.into(),
                detail: err.to_string(),
            })?;
            match channel.next().await {
                Some(Ok(reply)) => serde_json::from_value(reply)
                    .map_err(|err| KernelError::Unmarshal(err.to_string()))?,
                Some(Err(err)) => {
                    return Err(KernelError::StreamRead {
                        endpoint: vat_id.into(),
                        detail: err.to_string(),
                    });
                }
                None => {
                    return Err(KernelError::StreamRead {
                        endpoint: vat_id.into(),
                        detail: "channel ended during delivery".to_string(),
                    });
                }
            }
        };
        for syscall in batch.syscalls {
            self.apply_syscall(vat_id, syscall)?;
        }
        Ok(())
    }

    /// A vat misbehaved or its transport died: log, terminate it, move on.
    async fn contain_vat_failure(&mut self, vat_id: VatId, err: KernelError) {
        log::warn!("terminating {vat_id}: {err}");
        if let Err(term_err) = self.terminate_vat(vat_id).await {
            log::warn!("cleanup termination of {vat_id} failed: {term_err}");
        }
    }

    // ---- syscall application ----------------------------------------------

    fn apply_syscall(&mut self, vat_id: VatId, syscall: VatSyscall) -> Result<(), KernelError> {
        let endpoint = EndpointId::from(vat_id);
        match syscall {
            VatSyscall::Send { message } => {
                let kernel_message = self.message_from_vat(vat_id, message)?;
                self.run_queue.push_message(kernel_message);
                Ok(())
            }
            VatSyscall::Subscribe { eref } => {
                if eref.kind() != RefKind::Promise {
                    return Err(violation(endpoint, "subscribe to non-promise"));
                }
                let kref = self.eref_to_kref_allocating(endpoint, eref)?;
                if self.promises.subscribe(kref, endpoint)? == Subscribed::AlreadySettled {
                    self.run_queue.push(RunItem::Notify { vat_id, kref });
                }
                Ok(())
            }
            VatSyscall::Resolve { resolutions } => {
                for resolution in resolutions {
                    self.apply_resolve(vat_id, resolution)?;
                }
                Ok(())
            }
            VatSyscall::DropImports { erefs } => {
                for eref in erefs {
                    self.apply_drop_import(endpoint, eref)?;
                }
                Ok(())
            }
            VatSyscall::RetireImports { erefs } => {
                for eref in erefs {
                    self.apply_retire_import(endpoint, eref)?;
                }
                Ok(())
            }
            VatSyscall::RetireExports { erefs } => {
                for eref in erefs {
                    self.apply_retire_export(endpoint, eref, false)?;
                }
                Ok(())
            }
            VatSyscall::AbandonExports { erefs } => {
                for eref in erefs {
                    self.apply_retire_export(endpoint, eref, true)?;
                }
                Ok(())
            }
        }
    }

    fn apply_resolve(
        &mut self,
        vat_id: VatId,
        resolution: VatResolution,
    ) -> Result<(), KernelError> {
        let endpoint = EndpointId::from(vat_id);
        if resolution.eref.kind() != RefKind::Promise {
            return Err(violation(endpoint, "resolve of non-promise"));
        }
        let kref = self
            .clist(endpoint)?
            .lookup_eref(resolution.eref)
            .map_err(|err| violation(endpoint, err))?;
        let value = self.capdata_from_vat(endpoint, resolution.value)?;
        let outcome = self
            .promises
            .resolve(kref, Some(endpoint), resolution.rejected, value)?;
        self.handle_resolution(outcome);
        Ok(())
    }

    fn apply_drop_import(&mut self, endpoint: EndpointId, eref: ERef) -> Result<(), KernelError> {
        if eref.kind() != RefKind::Object || eref.direction() != RefDirection::Import {
            return Err(violation(endpoint, "dropImports of a non-imported-object"));
        }
        let clist = self.clist_mut(endpoint)?;
        let kref = clist
            .lookup_eref(eref)
            .map_err(|err| violation(endpoint, err))?;
        if !clist.is_reachable(eref) {
            return Err(violation(endpoint, format!("double drop of {eref}")));
        }
        clist.clear_reachable(eref);
        match self.objects.decrement_reachable(kref) {
            Ok(()) => Ok(()),
            Err(GcError::UnknownObject { .. }) => {
                // Owner abandoned it already; nothing left to count.
                log::debug!("drop of abandoned object {kref}");
                Ok(())
            }
            Err(err) => Err(violation(endpoint, err)),
        }
    }

    fn apply_retire_import(&mut self, endpoint: EndpointId, eref: ERef) -> Result<(), KernelError> {
        if eref.kind() != RefKind::Object || eref.direction() != RefDirection::Import {
            return Err(violation(endpoint, "retireImports of a non-imported-object"));
        }
        let clist = self.clist_mut(endpoint)?;
        if clist
            .lookup_eref(eref)
            .is_ok_and(|_| clist.is_reachable(eref))
        {
            return Err(violation(endpoint, format!("retire before drop of {eref}")));
        }
        let kref = clist
            .remove_eref(eref)
            .map_err(|err| violation(endpoint, err))?;
        match self.objects.decrement_recognizable(kref) {
            Ok(()) => Ok(()),
            Err(GcError::UnknownObject { .. }) => {
                log::debug!("retire of abandoned object {kref}");
                Ok(())
            }
            Err(err) => Err(violation(endpoint, err)),
        }
    }

    fn apply_retire_export(
        &mut self,
        endpoint: EndpointId,
        eref: ERef,
        abandon: bool,
    ) -> Result<(), KernelError> {
        if eref.kind() != RefKind::Object || eref.direction() != RefDirection::Export {
            return Err(violation(endpoint, "retireExports of a non-exported-object"));
        }
        let kref = self
            .clist_mut(endpoint)?
            .remove_eref(eref)
            .map_err(|err| violation(endpoint, err))?;
        match self.objects.get(kref) {
            None => return Err(violation(endpoint, GcError::UnknownObject { kref })),
            Some(object) if object.owner != endpoint => {
                return Err(violation(endpoint, format!("{eref} is not its export")));
            }
            Some(object) => {
                if !abandon && (object.reachable > 0 || object.recognizable > 0) {
                    return Err(violation(
                        endpoint,
                        format!("retire of still-referenced {kref}"),
                    ));
                }
            }
        }
        let _ = self.objects.remove(kref);
        Ok(())
    }

    /// Act on a settled promise: re-submit its queued messages in order and
    /// queue one notify per subscriber. A fulfillment whose sole slot leads
    /// to a still-pending result chains instead: subscribers move over and
    /// hear about the chained promise when it settles.
    fn handle_resolution(&mut self, resolution: Resolution) {
        for message in resolution.queued {
            self.run_queue.push_message(message);
        }
        if resolution.subscribers.is_empty() {
            return;
        }
        if !resolution.rejected {
            if let Some(chained) = self.chained_unresolved(resolution.kref, &resolution.value) {
                for subscriber in resolution.subscribers {
                    if let Err(err) = self.promises.subscribe(chained, subscriber) {
                        log::warn!("forwarding subscriber to {chained} failed: {err}");
                    }
                }
                return;
            }
        }
        for subscriber in resolution.subscribers {
            match subscriber.as_vat() {
                Some(vat_id) => self.run_queue.push(RunItem::Notify {
                    vat_id,
                    kref: resolution.kref,
                }),
                None => log::debug!("skipping notify to remote subscriber {subscriber}"),
            }
        }
    }

    /// The unresolved promise a fulfillment value chains to, if its sole
    /// slot leads to one. Settled links are followed; a link that loops back
    /// through `origin` or repeats means there is nothing left to wait on.
    fn chained_unresolved(&self, origin: KRef, value: &KernelCapData) -> Option<KRef> {
        let mut seen = std::collections::HashSet::from([origin]);
        let mut next = *value.single_slot()?;
        loop {
            if next.kind() != RefKind::Promise || !seen.insert(next) {
                return None;
            }
            let promise = self.promises.get(next)?;
            match promise.state() {
                PromiseState::Unresolved => return Some(next),
                _ => next = *promise.value()?.single_slot()?,
            }
        }
    }

    /// Reject a pending result with `value`, if there is one and it is still
    /// unresolved.
    fn reject_result(&mut self, result: Option<KRef>, value: KernelCapData) {
        let Some(kref) = result else { return };
        match self.promises.resolve(kref, None, true, value) {
            Ok(resolution) => self.handle_resolution(resolution),
            Err(err) => log::debug!("result {kref} not rejectable: {err}"),
        }
    }

    // ---- garbage collection -----------------------------------------------

    /// Sweep the maybe-free set: objects whose counts are still both zero
    /// are removed and their owner, if live, is told to release resources.
    pub fn collect_garbage(&mut self) {
        let free = self.objects.take_free();
        if free.is_empty() {
            return;
        }
        let mut per_owner: HashMap<VatId, Vec<KRef>> = HashMap::new();
        for kref in free {
            let Ok(owner) = self.objects.owner(kref) else {
                continue;
            };
            let _ = self.objects.remove(kref);
            match owner.as_vat() {
                Some(vat_id) if self.vats.status(vat_id) == Some(VatStatus::Running) => {
                    per_owner.entry(vat_id).or_default().push(kref);
                }
                _ => {
                    // Dead or remote owner: just drop the table entry.
                    if let Some(clist) = self.clists.get_mut(&owner) {
                        let _ = clist.remove_kref(kref);
                    }
                }
            }
        }
        let mut owners: Vec<_> = per_owner.into_iter().collect();
        owners.sort_by_key(|(vat_id, _)| *vat_id);
        for (vat_id, krefs) in owners {
            self.run_queue.push(RunItem::RetireExports { vat_id, krefs });
        }
    }

    // ---- translation ------------------------------------------------------

    fn clist(&self, endpoint: EndpointId) -> Result<&Clist, KernelError> {
        self.clists
            .get(&endpoint)
            .ok_or(KernelError::ProtocolViolation {
                endpoint,
                detail: "no reference table for endpoint".to_string(),
            })
    }

    fn clist_mut(&mut self, endpoint: EndpointId) -> Result<&mut Clist, KernelError> {
        self.clists
            .get_mut(&endpoint)
            .ok_or(KernelError::ProtocolViolation {
                endpoint,
                detail: "no reference table for endpoint".to_string(),
            })
    }

    /// Kernel→vat: translate a message into the vat's namespace, importing
    /// slots as needed.
    fn message_to_vat(
        &mut self,
        vat_id: VatId,
        message: &Message,
    ) -> Result<VatMessage, KernelError> {
        let endpoint = EndpointId::from(vat_id);
        let target = self
            .clist(endpoint)?
            .lookup_kref(message.target)
            .map_err(|err| violation(endpoint, err))?;
        let params = self.capdata_to_vat(endpoint, message.params.clone())?;
        let result = match message.result {
            Some(kref) => Some(self.import_kref(endpoint, kref)?),
            None => None,
        };
        Ok(VatMessage {
            target,
            method: message.method.clone(),
            params,
            result,
        })
    }

    fn resolution_to_vat(
        &mut self,
        vat_id: VatId,
        kref: KRef,
        rejected: bool,
        value: KernelCapData,
    ) -> Result<VatResolution, KernelError> {
        let endpoint = EndpointId::from(vat_id);
        let eref = self.import_kref(endpoint, kref)?;
        let value = self.capdata_to_vat(endpoint, value)?;
        Ok(VatResolution {
            eref,
            rejected,
            value,
        })
    }

    fn capdata_to_vat(
        &mut self,
        endpoint: EndpointId,
        data: KernelCapData,
    ) -> Result<CapData<ERef>, KernelError> {
        data.map_slots(|kref| self.import_kref(endpoint, kref))
    }

    fn import_kref(&mut self, endpoint: EndpointId, kref: KRef) -> Result<ERef, KernelError> {
        let imported = self.clist_mut(endpoint)?.import_from_kernel(kref);
        if imported.newly_allocated && kref.kind() == RefKind::Object {
            if let Err(err) = self.objects.increment(kref) {
                log::warn!("importing dead object {kref} into {endpoint}: {err}");
            }
        }
        Ok(imported.eref)
    }

    /// Vat→kernel: translate a syscall message, allocating kernel refs for
    /// newly exported slots.
    fn message_from_vat(
        &mut self,
        vat_id: VatId,
        message: VatMessage,
    ) -> Result<Message, KernelError> {
        let endpoint = EndpointId::from(vat_id);
        let target = self.eref_to_kref_allocating(endpoint, message.target)?;
        let params = self.capdata_from_vat(endpoint, message.params)?;
        let result = match message.result {
            Some(eref) => {
                if eref.kind() != RefKind::Promise {
                    return Err(violation(endpoint, "result slot must be a promise"));
                }
                let kref = self.eref_to_kref_allocating(endpoint, eref)?;
                // The sender hands deciding authority back to the kernel
                // until the message reaches its target.
                self.promises.set_decider(kref, None)?;
                Some(kref)
            }
            None => None,
        };
        Ok(Message {
            target,
            method: message.method,
            params,
            result,
        })
    }

    fn capdata_from_vat(
        &mut self,
        endpoint: EndpointId,
        data: CapData<ERef>,
    ) -> Result<KernelCapData, KernelError> {
        let CapData { body, slots } = data;
        let slots = slots
            .into_iter()
            .map(|eref| self.eref_to_kref_allocating(endpoint, eref))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CapData { body, slots })
    }

    /// Resolve an eref an endpoint used in a syscall. Existing entries
    /// translate; fresh export-direction refs allocate a kernel ref and
    /// register the object or promise.
    fn eref_to_kref_allocating(
        &mut self,
        endpoint: EndpointId,
        eref: ERef,
    ) -> Result<KRef, KernelError> {
        if let Ok(kref) = self.clist(endpoint)?.lookup_eref(eref) {
            return Ok(kref);
        }
        if eref.direction() != RefDirection::Export {
            return Err(violation(endpoint, format!("unknown import {eref}")));
        }
        let kref = match eref.kind() {
            RefKind::Object => self.alloc_object()?,
            RefKind::Promise => self.alloc_promise()?,
        };
        self.clist_mut(endpoint)?
            .export_to_kernel(eref, |_| kref)
            .map_err(|err| violation(endpoint, err))?;
        match kref.kind() {
            RefKind::Object => self.objects.insert(kref, endpoint),
            RefKind::Promise => self.promises.insert(kref, Some(endpoint)),
        }
        Ok(kref)
    }

    // ---- id allocation ----------------------------------------------------

    fn alloc_object(&mut self) -> Result<KRef, KernelError> {
        let kref = KRef::object(self.next_object_id);
        self.next_object_id += 1;
        self.kernel_kv
            .set(NEXT_OBJECT_ID_KEY, &self.next_object_id.to_string())?;
        Ok(kref)
    }

    fn alloc_promise(&mut self) -> Result<KRef, KernelError> {
        let kref = KRef::promise(self.next_promise_id);
        self.next_promise_id += 1;
        self.kernel_kv
            .set(NEXT_PROMISE_ID_KEY, &self.next_promise_id.to_string())?;
        Ok(kref)
    }

    fn persist_vat_counter(&mut self) -> Result<(), KernelError> {
        self.kernel_kv
            .set(NEXT_VAT_ID_KEY, &self.vats.next_vat_id().to_string())?;
        Ok(())
    }
}

fn load_counter(kv: &PrefixedKv, key: &str) -> Result<u64, KernelError> {
    match kv.get(key)? {
        Some(text) => text
            .parse()
            .map_err(|_| KernelError::Unmarshal(format!("corrupt counter '{key}'"))),
        None => Ok(0),
    }
}

fn is_fatal(err: &KernelError) -> bool {
    matches!(err, KernelError::Store(_))
}

fn violation(endpoint: EndpointId, detail: impl Display) -> KernelError {
    KernelError::ProtocolViolation {
        endpoint,
        detail: detail.to_string(),
    }
}

fn error_capdata(err: &KernelError) -> KernelCapData {
    let body = serde_json::to_string(&err.to_marshaled())
        .unwrap_or_else(|_| format!("{{\"sentinel\":true,\"message\":\"{err}\"}}"));
    CapData::new(body, vec![])
}
