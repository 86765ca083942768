use std::collections::{HashMap, HashSet};

use ocap_types::{ERef, EndpointId, KRef, RefDirection, RefKind};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClistError {
    #[error("eref {eref} is not an export")]
    NotAnExport { eref: ERef },
    #[error("eref {eref} has wrong scope for this endpoint")]
    WrongScope { eref: ERef },
    #[error("eref {eref} is unknown to this endpoint")]
    UnknownERef { eref: ERef },
    #[error("kref {kref} is unknown to this endpoint")]
    UnknownKRef { kref: KRef },
    #[error("kind mismatch between {eref} and {kref}")]
    KindMismatch { eref: ERef, kref: KRef },
}

/// Per-endpoint bidirectional translation table between kernel-global and
/// endpoint-local references.
///
/// The two maps are kept mutually invertible: every insertion writes both
/// directions, every removal erases both. A pair exists in at most one
/// direction at a time.
pub struct Clist {
    endpoint: EndpointId,
    eref_to_kref: HashMap<ERef, KRef>,
    kref_to_eref: HashMap<KRef, ERef>,
    /// Entries whose holder still counts toward the object's reachable
    /// count. Cleared by dropImports; retire requires it cleared first.
    reachable: HashSet<ERef>,
    next_object_import: u64,
    next_promise_import: u64,
}

/// Outcome of an import: whether a fresh entry was allocated, which is what
/// reference-count bookkeeping keys off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imported {
    pub eref: ERef,
    pub newly_allocated: bool,
}

impl Clist {
    pub fn new(endpoint: EndpointId) -> Self {
        Clist {
            endpoint,
            eref_to_kref: HashMap::new(),
            kref_to_eref: HashMap::new(),
            reachable: HashSet::new(),
            next_object_import: 0,
            next_promise_import: 0,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Translate an endpoint-allocated export into a kernel reference,
    /// allocating one via `alloc` on first sight. Idempotent per eref.
    pub fn export_to_kernel(
        &mut self,
        eref: ERef,
        alloc: impl FnOnce(RefKind) -> KRef,
    ) -> Result<(KRef, bool), ClistError> {
        if eref.scope() != self.endpoint.kind() {
            return Err(ClistError::WrongScope { eref });
        }
        if eref.direction() != RefDirection::Export {
            return Err(ClistError::NotAnExport { eref });
        }
        if let Some(kref) = self.eref_to_kref.get(&eref) {
            return Ok((*kref, false));
        }
        let kref = alloc(eref.kind());
        debug_assert_eq!(kref.kind(), eref.kind());
        self.insert(eref, kref);
        Ok((kref, true))
    }

    /// Translate a kernel reference into this endpoint's namespace,
    /// allocating an import-direction eref on first sight. Idempotent per
    /// kref.
    pub fn import_from_kernel(&mut self, kref: KRef) -> Imported {
        if let Some(eref) = self.kref_to_eref.get(&kref) {
            return Imported {
                eref: *eref,
                newly_allocated: false,
            };
        }
        let counter = match kref.kind() {
            RefKind::Object => &mut self.next_object_import,
            RefKind::Promise => &mut self.next_promise_import,
        };
        let index = *counter;
        *counter += 1;
        let eref = ERef::new(
            self.endpoint.kind(),
            kref.kind(),
            RefDirection::Import,
            index,
        );
        self.insert(eref, kref);
        Imported {
            eref,
            newly_allocated: true,
        }
    }

    /// Resolve an eref the endpoint used in a syscall. Exports may be new
    /// (caller allocates a kref); imports must already be mapped.
    pub fn lookup_eref(&self, eref: ERef) -> Result<KRef, ClistError> {
        self.eref_to_kref
            .get(&eref)
            .copied()
            .ok_or(ClistError::UnknownERef { eref })
    }

    pub fn lookup_kref(&self, kref: KRef) -> Result<ERef, ClistError> {
        self.kref_to_eref
            .get(&kref)
            .copied()
            .ok_or(ClistError::UnknownKRef { kref })
    }

    pub fn contains_kref(&self, kref: KRef) -> bool {
        self.kref_to_eref.contains_key(&kref)
    }

    pub fn is_reachable(&self, eref: ERef) -> bool {
        self.reachable.contains(&eref)
    }

    /// Mark an entry dropped-but-not-forgotten; its holder no longer counts
    /// toward the reachable count.
    pub fn clear_reachable(&mut self, eref: ERef) {
        self.reachable.remove(&eref);
    }

    /// Remove the pair for `kref`. Removal of a nonexistent mapping is a
    /// protocol violation by the endpoint, reported loudly.
    pub fn remove_kref(&mut self, kref: KRef) -> Result<ERef, ClistError> {
        let eref = self
            .kref_to_eref
            .remove(&kref)
            .ok_or(ClistError::UnknownKRef { kref })?;
        self.eref_to_kref.remove(&eref);
        self.reachable.remove(&eref);
        Ok(eref)
    }

    pub fn remove_eref(&mut self, eref: ERef) -> Result<KRef, ClistError> {
        let kref = self
            .eref_to_kref
            .remove(&eref)
            .ok_or(ClistError::UnknownERef { eref })?;
        self.kref_to_eref.remove(&kref);
        self.reachable.remove(&eref);
        Ok(kref)
    }

    pub fn entries(&self) -> impl Iterator<Item = (ERef, KRef)> + '_ {
        self.eref_to_kref.iter().map(|(e, k)| (*e, *k))
    }

    pub fn len(&self) -> usize {
        self.eref_to_kref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eref_to_kref.is_empty()
    }

    fn insert(&mut self, eref: ERef, kref: KRef) {
        self.eref_to_kref.insert(eref, kref);
        self.kref_to_eref.insert(kref, eref);
        self.reachable.insert(eref);
    }
}
