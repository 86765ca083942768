use std::collections::{BTreeSet, HashMap};

use ocap_types::{EndpointId, KRef};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GcError {
    #[error("object {kref} is unknown")]
    UnknownObject { kref: KRef },
    #[error("reference count underflow on {kref} ({which})")]
    Underflow { kref: KRef, which: &'static str },
}

/// Lifetime bookkeeping for one kernel object.
///
/// `reachable` counts holders of an active, sendable reference;
/// `recognizable` additionally counts holders that can still compare the
/// object's identity. `recognizable >= reachable` always.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelObject {
    pub owner: EndpointId,
    pub reachable: u64,
    pub recognizable: u64,
}

/// Table of live kernel objects plus the set whose counts may have reached
/// zero. The counts are the sole source of truth for retirement; nothing is
/// freed until a sweep re-checks them.
#[derive(Default)]
pub struct ObjectTable {
    objects: HashMap<KRef, KernelObject>,
    maybe_free: BTreeSet<KRef>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly exported object with no importers yet.
    pub fn insert(&mut self, kref: KRef, owner: EndpointId) {
        self.objects.insert(
            kref,
            KernelObject {
                owner,
                reachable: 0,
                recognizable: 0,
            },
        );
    }

    /// Register an object the kernel itself pins (e.g. a vat root), so it
    /// survives until the vat goes away.
    pub fn insert_pinned(&mut self, kref: KRef, owner: EndpointId) {
        self.objects.insert(
            kref,
            KernelObject {
                owner,
                reachable: 1,
                recognizable: 1,
            },
        );
    }

    pub fn get(&self, kref: KRef) -> Option<&KernelObject> {
        self.objects.get(&kref)
    }

    pub fn owner(&self, kref: KRef) -> Result<EndpointId, GcError> {
        self.objects
            .get(&kref)
            .map(|o| o.owner)
            .ok_or(GcError::UnknownObject { kref })
    }

    /// A new importer holds the object: both counts go up.
    pub fn increment(&mut self, kref: KRef) -> Result<(), GcError> {
        let object = self
            .objects
            .get_mut(&kref)
            .ok_or(GcError::UnknownObject { kref })?;
        object.reachable += 1;
        object.recognizable += 1;
        self.maybe_free.remove(&kref);
        Ok(())
    }

    /// An importer dropped its active handle but may still recognize the
    /// object. Underflow is a protocol error, never a clamp.
    pub fn decrement_reachable(&mut self, kref: KRef) -> Result<(), GcError> {
        let object = self
            .objects
            .get_mut(&kref)
            .ok_or(GcError::UnknownObject { kref })?;
        if object.reachable == 0 {
            return Err(GcError::Underflow {
                kref,
                which: "reachable",
            });
        }
        object.reachable -= 1;
        if object.reachable == 0 && object.recognizable == 0 {
            self.maybe_free.insert(kref);
        }
        Ok(())
    }

    /// An importer fully forgot the object.
    pub fn decrement_recognizable(&mut self, kref: KRef) -> Result<(), GcError> {
        let object = self
            .objects
            .get_mut(&kref)
            .ok_or(GcError::UnknownObject { kref })?;
        if object.recognizable == 0 {
            return Err(GcError::Underflow {
                kref,
                which: "recognizable",
            });
        }
        if object.recognizable == object.reachable {
            // A recognizable-only drop cannot outpace reachable drops.
            return Err(GcError::Underflow {
                kref,
                which: "recognizable",
            });
        }
        object.recognizable -= 1;
        if object.reachable == 0 && object.recognizable == 0 {
            self.maybe_free.insert(kref);
        }
        Ok(())
    }

    /// Both counts at once, for an importer that drops and forgets together
    /// (e.g. during vat termination).
    pub fn release(&mut self, kref: KRef) -> Result<(), GcError> {
        self.decrement_reachable(kref)?;
        let object = self
            .objects
            .get_mut(&kref)
            .ok_or(GcError::UnknownObject { kref })?;
        if object.recognizable == 0 {
            return Err(GcError::Underflow {
                kref,
                which: "recognizable",
            });
        }
        object.recognizable -= 1;
        if object.reachable == 0 && object.recognizable == 0 {
            self.maybe_free.insert(kref);
        }
        Ok(())
    }

    /// Remove the record entirely (owner retired or abandoned it).
    pub fn remove(&mut self, kref: KRef) -> Result<KernelObject, GcError> {
        self.maybe_free.remove(&kref);
        self.objects
            .remove(&kref)
            .ok_or(GcError::UnknownObject { kref })
    }

    /// Drain the maybe-free set, keeping only objects whose counts are still
    /// both zero. Candidates that were re-imported since being queued fall
    /// out here.
    pub fn take_free(&mut self) -> Vec<KRef> {
        let candidates = std::mem::take(&mut self.maybe_free);
        candidates
            .into_iter()
            .filter(|kref| {
                self.objects
                    .get(kref)
                    .is_some_and(|o| o.reachable == 0 && o.recognizable == 0)
            })
            .collect()
    }

    pub fn has_pending_free(&self) -> bool {
        !self.maybe_free.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn krefs_owned_by(&self, owner: EndpointId) -> Vec<KRef> {
        self.objects
            .iter()
            .filter(|(_, o)| o.owner == owner)
            .map(|(kref, _)| *kref)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_types::VatId;

    fn owner() -> EndpointId {
        VatId::new(0).into()
    }

    #[test]
    fn counts_keep_recognizable_at_least_reachable() {
        let mut table = ObjectTable::new();
        let kref = KRef::object(1);
        table.insert(kref, owner());
        table.increment(kref).unwrap();
        table.increment(kref).unwrap();
        let object = table.get(kref).unwrap();
        assert_eq!((object.reachable, object.recognizable), (2, 2));

        table.decrement_reachable(kref).unwrap();
        let object = table.get(kref).unwrap();
        assert!(object.recognizable >= object.reachable);

        // Forgetting before dropping would invert the invariant.
        table.decrement_recognizable(kref).unwrap();
        assert!(matches!(
            table.decrement_recognizable(kref),
            Err(GcError::Underflow { .. })
        ));
    }

    #[test]
    fn underflow_is_an_error_not_a_clamp() {
        let mut table = ObjectTable::new();
        let kref = KRef::object(1);
        table.insert(kref, owner());
        assert!(matches!(
            table.decrement_reachable(kref),
            Err(GcError::Underflow { .. })
        ));
    }

    #[test]
    fn zero_counts_queue_for_collection_once_rechecked() {
        let mut table = ObjectTable::new();
        let kref = KRef::object(1);
        table.insert(kref, owner());
        table.increment(kref).unwrap();
        table.release(kref).unwrap();
        assert!(table.has_pending_free());
        assert_eq!(table.take_free(), vec![kref]);
        assert!(!table.has_pending_free());
    }

    #[test]
    fn reimport_rescues_a_candidate() {
        let mut table = ObjectTable::new();
        let kref = KRef::object(1);
        table.insert(kref, owner());
        table.increment(kref).unwrap();
        table.release(kref).unwrap();
        table.increment(kref).unwrap();
        assert_eq!(table.take_free(), Vec::<KRef>::new());
    }
}
