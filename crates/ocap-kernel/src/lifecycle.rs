use std::collections::HashMap;

use ocap_types::{KRef, VatConfig, VatId};

use crate::error::KernelError;
use crate::worker::VatChannel;

/// Lifecycle states of a vat the kernel knows about. `Absent` is the lack
/// of a record; `Deleted` records are kept so a second terminate can be
/// distinguished from a vat that never existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VatStatus {
    Launching,
    Running,
    Restarting,
    Terminating,
    Deleted,
}

pub struct VatRecord {
    pub config: VatConfig,
    pub status: VatStatus,
    pub channel: Option<VatChannel>,
    /// The vat's root object, pinned by the kernel for its lifetime.
    pub root: Option<KRef>,
}

/// Registry of vat records plus the monotonically increasing id allocator.
#[derive(Default)]
pub struct VatRegistry {
    vats: HashMap<VatId, VatRecord>,
    next_vat_id: u64,
}

impl VatRegistry {
    pub fn new(next_vat_id: u64) -> Self {
        VatRegistry {
            vats: HashMap::new(),
            next_vat_id,
        }
    }

    pub fn allocate_id(&mut self) -> VatId {
        let id = VatId::new(self.next_vat_id);
        self.next_vat_id += 1;
        id
    }

    pub fn next_vat_id(&self) -> u64 {
        self.next_vat_id
    }

    /// Reserve `vat_id` for a launch. Ids are never reused, so a deleted
    /// record blocks relaunch the same way a live one does.
    pub fn insert_launching(&mut self, vat_id: VatId, config: VatConfig) -> Result<(), KernelError> {
        if self.vats.contains_key(&vat_id) {
            return Err(KernelError::VatAlreadyExists { vat_id });
        }
        if vat_id.index() >= self.next_vat_id {
            self.next_vat_id = vat_id.index() + 1;
        }
        self.vats.insert(
            vat_id,
            VatRecord {
                config,
                status: VatStatus::Launching,
                channel: None,
                root: None,
            },
        );
        Ok(())
    }

    pub fn get(&self, vat_id: VatId) -> Result<&VatRecord, KernelError> {
        match self.vats.get(&vat_id) {
            None => Err(KernelError::VatNotFound { vat_id }),
            Some(record) if record.status == VatStatus::Deleted => {
                Err(KernelError::VatDeleted { vat_id })
            }
            Some(record) => Ok(record),
        }
    }

    pub fn get_mut(&mut self, vat_id: VatId) -> Result<&mut VatRecord, KernelError> {
        match self.vats.get_mut(&vat_id) {
            None => Err(KernelError::VatNotFound { vat_id }),
            Some(record) if record.status == VatStatus::Deleted => {
                Err(KernelError::VatDeleted { vat_id })
            }
            Some(record) => Ok(record),
        }
    }

    pub fn status(&self, vat_id: VatId) -> Option<VatStatus> {
        self.vats.get(&vat_id).map(|r| r.status)
    }

    pub fn attach_channel(
        &mut self,
        vat_id: VatId,
        channel: VatChannel,
    ) -> Result<(), KernelError> {
        let record = self.get_mut(vat_id)?;
        if record.channel.is_some() {
            return Err(KernelError::VatConnectionExists { vat_id });
        }
        record.channel = Some(channel);
        Ok(())
    }

    pub fn take_channel(&mut self, vat_id: VatId) -> Result<VatChannel, KernelError> {
        let record = self.get_mut(vat_id)?;
        record
            .channel
            .take()
            .ok_or(KernelError::VatConnectionNotFound { vat_id })
    }

    /// Forget a record entirely, freeing its id. Only for rolling back a
    /// launch that never produced a running vat.
    pub fn remove(&mut self, vat_id: VatId) {
        self.vats.remove(&vat_id);
    }

    /// Drop the worker channel and tombstone the record.
    pub fn mark_deleted(&mut self, vat_id: VatId) {
        if let Some(record) = self.vats.get_mut(&vat_id) {
            record.channel = None;
            record.root = None;
            record.status = VatStatus::Deleted;
        }
    }

    pub fn live_ids(&self) -> Vec<VatId> {
        let mut ids: Vec<VatId> = self
            .vats
            .iter()
            .filter(|(_, r)| r.status != VatStatus::Deleted)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}
