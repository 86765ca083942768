use std::collections::{BTreeSet, HashMap, VecDeque};

use ocap_types::{EndpointId, KRef, KernelCapData, Message};

use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

/// One kernel-tracked pending result.
///
/// State transitions are one-way: `Unresolved` to `Fulfilled` or `Rejected`,
/// never back. The decider is cleared on resolution; the message queue is
/// non-empty only while unresolved.
pub struct KernelPromise {
    state: PromiseState,
    decider: Option<EndpointId>,
    subscribers: BTreeSet<EndpointId>,
    message_queue: VecDeque<Message>,
    value: Option<KernelCapData>,
}

impl KernelPromise {
    pub fn state(&self) -> PromiseState {
        self.state
    }

    /// The endpoint currently authorized to resolve this promise. `None`
    /// while the kernel itself holds deciding authority (the message that
    /// carries the result has not yet reached a vat) and always `None` once
    /// resolved.
    pub fn decider(&self) -> Option<EndpointId> {
        self.decider
    }

    pub fn value(&self) -> Option<&KernelCapData> {
        self.value.as_ref()
    }

    pub fn is_rejected(&self) -> bool {
        self.state == PromiseState::Rejected
    }

    pub fn queue_len(&self) -> usize {
        self.message_queue.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = EndpointId> + '_ {
        self.subscribers.iter().copied()
    }
}

/// Effects of a resolution, for the scheduler to act on: queued messages to
/// re-submit and subscribers to notify exactly once each.
pub struct Resolution {
    pub kref: KRef,
    pub rejected: bool,
    pub value: KernelCapData,
    pub queued: Vec<Message>,
    pub subscribers: Vec<EndpointId>,
}

/// Whether a subscription took effect or the promise had already settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscribed {
    Pending,
    AlreadySettled,
}

#[derive(Default)]
pub struct PromiseTable {
    promises: HashMap<KRef, KernelPromise>,
}

impl PromiseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kref: KRef, decider: Option<EndpointId>) {
        self.promises.insert(
            kref,
            KernelPromise {
                state: PromiseState::Unresolved,
                decider,
                subscribers: BTreeSet::new(),
                message_queue: VecDeque::new(),
                value: None,
            },
        );
    }

    pub fn get(&self, kref: KRef) -> Option<&KernelPromise> {
        self.promises.get(&kref)
    }

    pub fn contains(&self, kref: KRef) -> bool {
        self.promises.contains_key(&kref)
    }

    fn get_mut(&mut self, kref: KRef) -> Result<&mut KernelPromise, KernelError> {
        self.promises
            .get_mut(&kref)
            .ok_or(KernelError::PromiseNotFound { kref })
    }

    /// Hand deciding authority to `decider`, as the message carrying the
    /// result is delivered to it.
    pub fn set_decider(
        &mut self,
        kref: KRef,
        decider: Option<EndpointId>,
    ) -> Result<(), KernelError> {
        let promise = self.get_mut(kref)?;
        if promise.state != PromiseState::Unresolved {
            return Err(KernelError::PromiseAlreadyResolved { kref });
        }
        promise.decider = decider;
        Ok(())
    }

    pub fn subscribe(&mut self, kref: KRef, endpoint: EndpointId) -> Result<Subscribed, KernelError> {
        let promise = self.get_mut(kref)?;
        if promise.state != PromiseState::Unresolved {
            return Ok(Subscribed::AlreadySettled);
        }
        promise.subscribers.insert(endpoint);
        Ok(Subscribed::Pending)
    }

    /// Queue a message against an unresolved promise, to be re-submitted in
    /// order on resolution.
    pub fn enqueue_message(&mut self, kref: KRef, message: Message) -> Result<(), KernelError> {
        let promise = self.get_mut(kref)?;
        if promise.state != PromiseState::Unresolved {
            return Err(KernelError::PromiseAlreadyResolved { kref });
        }
        promise.message_queue.push_back(message);
        Ok(())
    }

    /// Settle the promise. When `resolver` is given it must match the
    /// current decider; the kernel passes `None` to force-resolve (vat
    /// termination).
    ///
    /// Resolving to a payload whose sole slot is the promise itself would
    /// chain the promise into its own queue; that is rejected as a cycle.
    pub fn resolve(
        &mut self,
        kref: KRef,
        resolver: Option<EndpointId>,
        rejected: bool,
        value: KernelCapData,
    ) -> Result<Resolution, KernelError> {
        let promise = self.get_mut(kref)?;
        if promise.state != PromiseState::Unresolved {
            return Err(KernelError::PromiseAlreadyResolved { kref });
        }
        if let Some(endpoint) = resolver {
            if promise.decider != Some(endpoint) {
                return Err(KernelError::NotDecider { endpoint, kref });
            }
        }
        if !rejected && value.single_slot() == Some(&kref) {
            return Err(KernelError::PromiseCycle { kref });
        }
        promise.state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        promise.decider = None;
        promise.value = Some(value.clone());
        let queued = promise.message_queue.drain(..).collect();
        let subscribers = std::mem::take(&mut promise.subscribers)
            .into_iter()
            .collect();
        Ok(Resolution {
            kref,
            rejected,
            value,
            queued,
            subscribers,
        })
    }

    /// Promises a given endpoint currently decides, for termination sweeps.
    pub fn decided_by(&self, endpoint: EndpointId) -> Vec<KRef> {
        self.promises
            .iter()
            .filter(|(_, p)| p.state == PromiseState::Unresolved && p.decider == Some(endpoint))
            .map(|(kref, _)| *kref)
            .collect()
    }

    /// Drop an endpoint from every subscriber set (it can no longer be
    /// notified).
    pub fn unsubscribe_everywhere(&mut self, endpoint: EndpointId) {
        for promise in self.promises.values_mut() {
            promise.subscribers.remove(&endpoint);
        }
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_types::{CapData, VatId};

    fn v(n: u64) -> EndpointId {
        VatId::new(n).into()
    }

    fn message(target: KRef, method: &str) -> Message {
        Message {
            target,
            method: method.into(),
            params: CapData::new("[]", vec![]),
            result: None,
        }
    }

    #[test]
    fn resolution_is_one_way() {
        let mut table = PromiseTable::new();
        let kp = KRef::promise(1);
        table.insert(kp, Some(v(0)));
        table
            .resolve(kp, Some(v(0)), false, CapData::new("\"done\"", vec![]))
            .unwrap();
        assert_eq!(table.get(kp).unwrap().state(), PromiseState::Fulfilled);
        assert!(matches!(
            table.resolve(kp, Some(v(0)), true, CapData::new("null", vec![])),
            Err(KernelError::PromiseAlreadyResolved { .. })
        ));
    }

    #[test]
    fn only_the_decider_may_resolve() {
        let mut table = PromiseTable::new();
        let kp = KRef::promise(1);
        table.insert(kp, Some(v(0)));
        assert!(matches!(
            table.resolve(kp, Some(v(1)), false, CapData::new("null", vec![])),
            Err(KernelError::NotDecider { .. })
        ));
    }

    #[test]
    fn queued_messages_drain_in_order_exactly_once() {
        let mut table = PromiseTable::new();
        let kp = KRef::promise(1);
        table.insert(kp, Some(v(0)));
        for name in ["first", "second", "third"] {
            table.enqueue_message(kp, message(kp, name)).unwrap();
        }
        let resolution = table
            .resolve(kp, Some(v(0)), false, CapData::new("null", vec![]))
            .unwrap();
        let methods: Vec<_> = resolution.queued.iter().map(|m| m.method.clone()).collect();
        assert_eq!(methods, vec!["first", "second", "third"]);
        assert_eq!(table.get(kp).unwrap().queue_len(), 0);
        assert!(matches!(
            table.enqueue_message(kp, message(kp, "late")),
            Err(KernelError::PromiseAlreadyResolved { .. })
        ));
    }

    #[test]
    fn subscribers_are_taken_once() {
        let mut table = PromiseTable::new();
        let kp = KRef::promise(1);
        table.insert(kp, Some(v(0)));
        table.subscribe(kp, v(1)).unwrap();
        table.subscribe(kp, v(2)).unwrap();
        table.subscribe(kp, v(1)).unwrap();
        let resolution = table
            .resolve(kp, Some(v(0)), false, CapData::new("null", vec![]))
            .unwrap();
        assert_eq!(resolution.subscribers, vec![v(1), v(2)]);
        assert_eq!(table.get(kp).unwrap().subscribers().count(), 0);
    }

    #[test]
    fn subscribe_after_settlement_reports_settled() {
        let mut table = PromiseTable::new();
        let kp = KRef::promise(1);
        table.insert(kp, Some(v(0)));
        table
            .resolve(kp, Some(v(0)), true, CapData::new("\"bad\"", vec![]))
            .unwrap();
        assert_eq!(table.subscribe(kp, v(1)).unwrap(), Subscribed::AlreadySettled);
    }

    #[test]
    fn unknown_promise_is_reported() {
        let mut table = PromiseTable::new();
        assert!(matches!(
            table.subscribe(KRef::promise(9), v(0)),
            Err(KernelError::PromiseNotFound { .. })
        ));
    }

    #[test]
    fn self_referential_resolution_is_a_cycle() {
        let mut table = PromiseTable::new();
        let kp = KRef::promise(1);
        table.insert(kp, Some(v(0)));
        assert!(matches!(
            table.resolve(kp, Some(v(0)), false, CapData::from_slot(kp)),
            Err(KernelError::PromiseCycle { .. })
        ));
    }
}
