//! Slot-keyed priority queues over the process store.
//!
//! Two logical queues order processes for update-pass traversal: one keyed
//! by procstate slot, one keyed by adj slot. Each queue is an array of
//! doubly-linked lists whose nodes are embedded in the process records, so
//! linking, unlinking and slot moves are O(1) and allocation-free.
//!
//! Within a slot the list is kept ordered by the numerical attribute, with
//! stable FIFO order among equal values: `offer` scans from the tail for
//! the last node whose attribute is `<=` the incoming one. Slot
//! populations are small, so the scan is short in practice. `poll` removes
//! the head of the first populated slot; a cached cursor avoids rescanning
//! empty slots.

use triage_common::adj::adj_slot;
use triage_common::state::PROC_STATE_SLOT_COUNT;
use triage_common::ADJ_SLOT_COUNT;

use crate::record::ProcessId;
use crate::store::ProcessStore;

/// Which attribute a queue is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    ProcState,
    Adj,
}

impl QueueKind {
    #[inline]
    fn link_index(self) -> usize {
        match self {
            QueueKind::ProcState => 0,
            QueueKind::Adj => 1,
        }
    }

    fn slot_count(self) -> usize {
        match self {
            QueueKind::ProcState => PROC_STATE_SLOT_COUNT,
            QueueKind::Adj => ADJ_SLOT_COUNT,
        }
    }

    /// The ordering key: procstate index or raw adj, widened for comparison.
    #[inline]
    fn key(self, store: &ProcessStore, id: ProcessId) -> Option<i32> {
        let record = store.get(id)?;
        Some(match self {
            QueueKind::ProcState => record.cur_raw_proc_state.index() as i32,
            QueueKind::Adj => i32::from(record.cur_raw_adj),
        })
    }

    #[inline]
    fn slot_of_key(self, key: i32) -> usize {
        match self {
            QueueKind::ProcState => key as usize,
            QueueKind::Adj => adj_slot(key as i16),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    head: Option<ProcessId>,
    tail: Option<ProcessId>,
}

/// One priority queue. All operations take the store to reach the embedded
/// link nodes; the queue itself holds only slot heads and tails.
#[derive(Debug)]
pub struct PriorityIndex {
    kind: QueueKind,
    slots: Vec<Slot>,
    /// Lowest slot that may be populated; maintained as a lower bound.
    first_populated: usize,
    len: usize,
}

impl PriorityIndex {
    pub fn new(kind: QueueKind) -> Self {
        PriorityIndex {
            kind,
            slots: vec![Slot::default(); kind.slot_count()],
            first_populated: kind.slot_count(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the process is currently linked into this queue.
    pub fn contains(&self, store: &ProcessStore, id: ProcessId) -> bool {
        store
            .get(id)
            .map(|r| r.queue_links[self.kind.link_index()].slot.is_some())
            .unwrap_or(false)
    }

    /// Insert ordered by attribute, after any equal values (stable FIFO).
    /// A process already linked is moved to its new position.
    pub fn offer(&mut self, store: &mut ProcessStore, id: ProcessId) {
        let Some(key) = self.kind.key(store, id) else {
            return;
        };
        if self.contains(store, id) {
            self.unlink(store, id);
        }
        let slot = self.kind.slot_of_key(key);

        // Scan from the tail for the insertion point.
        let mut after = self.slots[slot].tail;
        while let Some(candidate) = after {
            let candidate_key = self
                .kind
                .key(store, candidate)
                .expect("linked process must resolve");
            if candidate_key <= key {
                break;
            }
            after = store.get(candidate).expect("linked process must resolve").queue_links
                [self.kind.link_index()]
            .prev;
        }
        self.link_after(store, id, slot, after);
    }

    /// Append at the tail of the given process's slot, ignoring order.
    /// Used when the caller already knows the value is a maximum.
    pub fn append(&mut self, store: &mut ProcessStore, id: ProcessId) {
        let Some(key) = self.kind.key(store, id) else {
            return;
        };
        if self.contains(store, id) {
            self.unlink(store, id);
        }
        let slot = self.kind.slot_of_key(key);
        let tail = self.slots[slot].tail;
        self.link_after(store, id, slot, tail);
    }

    fn link_after(
        &mut self,
        store: &mut ProcessStore,
        id: ProcessId,
        slot: usize,
        after: Option<ProcessId>,
    ) {
        let li = self.kind.link_index();
        let next = match after {
            Some(prev_id) => {
                let prev_rec = store.get_mut(prev_id).expect("linked process must resolve");
                let next = prev_rec.queue_links[li].next;
                prev_rec.queue_links[li].next = Some(id);
                next
            }
            None => {
                let head = self.slots[slot].head;
                self.slots[slot].head = Some(id);
                head
            }
        };
        match next {
            Some(next_id) => {
                store.get_mut(next_id).expect("linked process must resolve").queue_links[li]
                    .prev = Some(id);
            }
            None => self.slots[slot].tail = Some(id),
        }
        let link = &mut store.get_mut(id).expect("offered process must resolve").queue_links[li];
        link.prev = after;
        link.next = next;
        link.slot = Some(slot as u16);

        self.len += 1;
        if slot < self.first_populated {
            self.first_populated = slot;
        }
    }

    /// Unlink in O(1). No-op if not linked.
    pub fn unlink(&mut self, store: &mut ProcessStore, id: ProcessId) {
        let li = self.kind.link_index();
        let (prev, next, slot) = {
            let Some(record) = store.get_mut(id) else {
                return;
            };
            let link = &mut record.queue_links[li];
            let Some(slot) = link.slot else {
                return;
            };
            let (prev, next) = (link.prev, link.next);
            *link = Default::default();
            (prev, next, slot as usize)
        };
        match prev {
            Some(p) => {
                store.get_mut(p).expect("linked process must resolve").queue_links[li].next = next;
            }
            None => self.slots[slot].head = next,
        }
        match next {
            Some(n) => {
                store.get_mut(n).expect("linked process must resolve").queue_links[li].prev = prev;
            }
            None => self.slots[slot].tail = prev,
        }
        self.len -= 1;
    }

    /// Remove and return the head of the first populated slot.
    pub fn poll(&mut self, store: &mut ProcessStore) -> Option<ProcessId> {
        if self.len == 0 {
            self.first_populated = self.slots.len();
            return None;
        }
        while self.first_populated < self.slots.len() {
            if let Some(head) = self.slots[self.first_populated].head {
                self.unlink(store, head);
                return Some(head);
            }
            self.first_populated += 1;
        }
        None
    }

    /// Unlink every node. O(population + slots).
    pub fn reset(&mut self, store: &mut ProcessStore) {
        let li = self.kind.link_index();
        for slot in 0..self.slots.len() {
            let mut cursor = self.slots[slot].head;
            while let Some(id) = cursor {
                let record = store.get_mut(id).expect("linked process must resolve");
                cursor = record.queue_links[li].next;
                record.queue_links[li] = Default::default();
            }
            self.slots[slot] = Slot::default();
        }
        self.len = 0;
        self.first_populated = self.slots.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::adj::{CACHED_APP_MIN_ADJ, FOREGROUND_APP_ADJ, SERVICE_ADJ, VISIBLE_APP_ADJ};
    use triage_common::ProcState;

    fn store_with_adjs(adjs: &[i16]) -> (ProcessStore, Vec<ProcessId>) {
        let mut store = ProcessStore::new();
        let ids: Vec<_> = adjs
            .iter()
            .enumerate()
            .map(|(i, &adj)| {
                let id = store.insert(100 + i as i32, 10_000, 0, &format!("p{}", i));
                store.get_mut(id).unwrap().cur_raw_adj = adj;
                id
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn test_poll_orders_by_slot() {
        let (mut store, ids) = store_with_adjs(&[SERVICE_ADJ, FOREGROUND_APP_ADJ, CACHED_APP_MIN_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        for &id in &ids {
            q.offer(&mut store, id);
        }
        assert_eq!(q.poll(&mut store), Some(ids[1]));
        assert_eq!(q.poll(&mut store), Some(ids[0]));
        assert_eq!(q.poll(&mut store), Some(ids[2]));
        assert_eq!(q.poll(&mut store), None);
    }

    #[test]
    fn test_fifo_within_equal_values() {
        let (mut store, ids) = store_with_adjs(&[SERVICE_ADJ, SERVICE_ADJ, SERVICE_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        for &id in &ids {
            q.offer(&mut store, id);
        }
        assert_eq!(q.poll(&mut store), Some(ids[0]));
        assert_eq!(q.poll(&mut store), Some(ids[1]));
        assert_eq!(q.poll(&mut store), Some(ids[2]));
    }

    #[test]
    fn test_ordered_within_slot() {
        // Same slot (visible tier), distinct values: order by value, not
        // by insertion.
        let (mut store, ids) = store_with_adjs(&[VISIBLE_APP_ADJ + 5, VISIBLE_APP_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        q.offer(&mut store, ids[0]);
        q.offer(&mut store, ids[1]);
        assert_eq!(q.poll(&mut store), Some(ids[1]));
        assert_eq!(q.poll(&mut store), Some(ids[0]));
    }

    #[test]
    fn test_reoffer_moves_to_new_slot() {
        let (mut store, ids) = store_with_adjs(&[SERVICE_ADJ, CACHED_APP_MIN_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        q.offer(&mut store, ids[0]);
        q.offer(&mut store, ids[1]);
        assert_eq!(q.len(), 2);

        // Promote ids[1] and re-offer: it must come out first now.
        store.get_mut(ids[1]).unwrap().cur_raw_adj = FOREGROUND_APP_ADJ;
        q.offer(&mut store, ids[1]);
        assert_eq!(q.len(), 2);
        assert_eq!(q.poll(&mut store), Some(ids[1]));
        assert_eq!(q.poll(&mut store), Some(ids[0]));
    }

    #[test]
    fn test_append_skips_ordering_scan() {
        // Two equal-slot values inserted out of order: append keeps raw
        // insertion order, unlike offer.
        let (mut store, ids) = store_with_adjs(&[VISIBLE_APP_ADJ + 5, VISIBLE_APP_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        q.append(&mut store, ids[0]);
        q.append(&mut store, ids[1]);
        assert_eq!(q.poll(&mut store), Some(ids[0]));
        assert_eq!(q.poll(&mut store), Some(ids[1]));
    }

    #[test]
    fn test_unlink_middle() {
        let (mut store, ids) = store_with_adjs(&[SERVICE_ADJ, SERVICE_ADJ, SERVICE_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        for &id in &ids {
            q.offer(&mut store, id);
        }
        q.unlink(&mut store, ids[1]);
        assert_eq!(q.len(), 2);
        assert_eq!(q.poll(&mut store), Some(ids[0]));
        assert_eq!(q.poll(&mut store), Some(ids[2]));
    }

    #[test]
    fn test_reset_unlinks_everything() {
        let (mut store, ids) = store_with_adjs(&[SERVICE_ADJ, FOREGROUND_APP_ADJ]);
        let mut q = PriorityIndex::new(QueueKind::Adj);
        for &id in &ids {
            q.offer(&mut store, id);
        }
        q.reset(&mut store);
        assert!(q.is_empty());
        assert!(!q.contains(&store, ids[0]));
        assert_eq!(q.poll(&mut store), None);
    }

    #[test]
    fn test_proc_state_queue_uses_state_slots() {
        let mut store = ProcessStore::new();
        let a = store.insert(1, 10_000, 0, "a");
        let b = store.insert(2, 10_000, 0, "b");
        store.get_mut(a).unwrap().cur_raw_proc_state = ProcState::CachedEmpty;
        store.get_mut(b).unwrap().cur_raw_proc_state = ProcState::Top;

        let mut q = PriorityIndex::new(QueueKind::ProcState);
        q.offer(&mut store, a);
        q.offer(&mut store, b);
        assert_eq!(q.poll(&mut store), Some(b));
        assert_eq!(q.poll(&mut store), Some(a));
    }

    #[test]
    fn test_queues_do_not_interfere() {
        let (mut store, ids) = store_with_adjs(&[SERVICE_ADJ]);
        store.get_mut(ids[0]).unwrap().cur_raw_proc_state = ProcState::Service;
        let mut ps = PriorityIndex::new(QueueKind::ProcState);
        let mut adj = PriorityIndex::new(QueueKind::Adj);
        ps.offer(&mut store, ids[0]);
        adj.offer(&mut store, ids[0]);
        assert!(ps.contains(&store, ids[0]));
        assert!(adj.contains(&store, ids[0]));
        ps.unlink(&mut store, ids[0]);
        assert!(!ps.contains(&store, ids[0]));
        assert!(adj.contains(&store, ids[0]));
    }
}
