use std::collections::VecDeque;

use ocap_types::{KRef, Message, VatId};

/// One unit of work for the crank loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RunItem {
    /// Deliver a queued message to its target's owner.
    Deliver(Message),
    /// Tell a subscriber that a pending result settled.
    Notify { vat_id: VatId, kref: KRef },
    /// Tell an owner its fully-dropped exports may release local resources.
    RetireExports { vat_id: VatId, krefs: Vec<KRef> },
}

/// Strict FIFO run queue. Crank boundaries are the only points at which its
/// order may be observed to change.
#[derive(Default)]
pub struct RunQueue {
    items: VecDeque<RunItem>,
}

impl RunQueue {
    pub fn push(&mut self, item: RunItem) {
        self.items.push_back(item);
    }

    pub fn push_message(&mut self, message: Message) {
        self.items.push_back(RunItem::Deliver(message));
    }

    pub fn pop(&mut self) -> Option<RunItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_types::CapData;

    #[test]
    fn fifo_order() {
        let mut queue = RunQueue::default();
        for n in 0..3u64 {
            queue.push_message(Message {
                target: KRef::object(n),
                method: "m".into(),
                params: CapData::new("[]", vec![]),
                result: None,
            });
        }
        let mut targets = Vec::new();
        while let Some(RunItem::Deliver(message)) = queue.pop() {
            targets.push(message.target);
        }
        assert_eq!(
            targets,
            vec![KRef::object(0), KRef::object(1), KRef::object(2)]
        );
        assert!(queue.is_empty());
    }
}
