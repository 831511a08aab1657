//! Per-uid aggregation of process attributes.
//!
//! Each uid record carries the most important procstate, the lowest adj
//! and the union of capabilities across that uid's processes. External
//! observers consume the change flags computed after every update pass.

use rustc_hash::FxHashMap;

use triage_common::adj::UNKNOWN_ADJ;
use triage_common::{Capability, ProcState, Uid, UidChangeFlags};

use crate::store::ProcessStore;

/// Aggregate attributes for one uid.
#[derive(Debug, Clone)]
pub struct UidRecord {
    pub uid: Uid,
    pub num_procs: usize,
    pub proc_state: ProcState,
    pub min_adj: i16,
    pub capability: Capability,
    /// Some process of this uid is doing user-noticeable work.
    pub active: bool,
    /// Every process of this uid is in the cached tier.
    pub cached: bool,
}

impl UidRecord {
    fn new(uid: Uid) -> Self {
        UidRecord {
            uid,
            num_procs: 0,
            proc_state: ProcState::Unknown,
            min_adj: UNKNOWN_ADJ,
            capability: Capability::empty(),
            active: false,
            cached: false,
        }
    }
}

/// All uid records, rebuilt incrementally after each update pass.
#[derive(Debug, Default)]
pub struct UidTable {
    records: FxHashMap<Uid, UidRecord>,
}

impl UidTable {
    pub fn new() -> Self {
        UidTable::default()
    }

    pub fn get(&self, uid: Uid) -> Option<&UidRecord> {
        self.records.get(&uid)
    }

    /// Recompute every uid aggregate from committed process attributes and
    /// return the change flags to report, one entry per changed uid.
    pub fn recompute(&mut self, store: &ProcessStore) -> Vec<(Uid, UidChangeFlags)> {
        let mut fresh: FxHashMap<Uid, UidRecord> = FxHashMap::default();
        for id in store.ids() {
            let proc = store.get(id).expect("iterated id resolves");
            let record = fresh
                .entry(proc.uid)
                .or_insert_with(|| UidRecord::new(proc.uid));
            record.num_procs += 1;
            record.proc_state = record.proc_state.min(proc.set_proc_state);
            record.min_adj = record.min_adj.min(proc.set_adj);
            record.capability |= proc.set_capability;
            record.active |= proc.set_proc_state.is_active();
        }
        for record in fresh.values_mut() {
            record.cached = record.proc_state.is_cached();
        }

        let mut changes = Vec::new();
        for (uid, record) in &fresh {
            let mut flags = UidChangeFlags::empty();
            match self.records.get(uid) {
                Some(old) => {
                    if record.active && !old.active {
                        flags |= UidChangeFlags::ACTIVE;
                    } else if !record.active && old.active {
                        flags |= UidChangeFlags::IDLE;
                    }
                    if record.cached && !old.cached {
                        flags |= UidChangeFlags::CACHED;
                    } else if !record.cached && old.cached {
                        flags |= UidChangeFlags::UNCACHED;
                    }
                    if record.capability != old.capability {
                        flags |= UidChangeFlags::CAPABILITY;
                    }
                    if record.proc_state != old.proc_state {
                        flags |= UidChangeFlags::PROCSTATE;
                    }
                    if record.min_adj != old.min_adj {
                        flags |= UidChangeFlags::PROCADJ;
                    }
                }
                None => {
                    // First sighting reports the full initial state.
                    flags |= UidChangeFlags::PROCSTATE | UidChangeFlags::PROCADJ;
                    flags |= if record.active {
                        UidChangeFlags::ACTIVE
                    } else {
                        UidChangeFlags::IDLE
                    };
                    if record.cached {
                        flags |= UidChangeFlags::CACHED;
                    }
                    if !record.capability.is_empty() {
                        flags |= UidChangeFlags::CAPABILITY;
                    }
                }
            }
            if !flags.is_empty() {
                changes.push((*uid, flags));
            }
        }
        changes.sort_by_key(|&(uid, _)| uid);
        self.records = fresh;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_common::adj::{CACHED_APP_MIN_ADJ, FOREGROUND_APP_ADJ};

    fn store_two_procs_one_uid() -> ProcessStore {
        let mut store = ProcessStore::new();
        let a = store.insert(1, 10_000, 0, "a");
        let b = store.insert(2, 10_000, 0, "b");
        {
            let rec = store.get_mut(a).unwrap();
            rec.set_proc_state = ProcState::Top;
            rec.set_adj = FOREGROUND_APP_ADJ;
            rec.set_capability = Capability::BFSL;
        }
        {
            let rec = store.get_mut(b).unwrap();
            rec.set_proc_state = ProcState::CachedEmpty;
            rec.set_adj = CACHED_APP_MIN_ADJ;
        }
        store
    }

    #[test]
    fn test_aggregates_take_extremes() {
        let store = store_two_procs_one_uid();
        let mut table = UidTable::new();
        table.recompute(&store);
        let rec = table.get(10_000).unwrap();
        assert_eq!(rec.num_procs, 2);
        assert_eq!(rec.proc_state, ProcState::Top);
        assert_eq!(rec.min_adj, FOREGROUND_APP_ADJ);
        assert!(rec.capability.contains(Capability::BFSL));
        assert!(rec.active);
        assert!(!rec.cached);
    }

    #[test]
    fn test_first_sighting_reports_state() {
        let store = store_two_procs_one_uid();
        let mut table = UidTable::new();
        let changes = table.recompute(&store);
        assert_eq!(changes.len(), 1);
        let (uid, flags) = changes[0];
        assert_eq!(uid, 10_000);
        assert!(flags.contains(UidChangeFlags::ACTIVE));
        assert!(flags.contains(UidChangeFlags::PROCSTATE));
    }

    #[test]
    fn test_no_change_no_flags() {
        let store = store_two_procs_one_uid();
        let mut table = UidTable::new();
        table.recompute(&store);
        let changes = table.recompute(&store);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_transition_to_cached_and_idle() {
        let mut store = store_two_procs_one_uid();
        let mut table = UidTable::new();
        table.recompute(&store);

        let a = store.by_pid(1).unwrap();
        {
            let rec = store.get_mut(a).unwrap();
            rec.set_proc_state = ProcState::CachedEmpty;
            rec.set_adj = CACHED_APP_MIN_ADJ + 10;
            rec.set_capability = Capability::empty();
        }
        let changes = table.recompute(&store);
        assert_eq!(changes.len(), 1);
        let (_, flags) = changes[0];
        assert!(flags.contains(UidChangeFlags::IDLE));
        assert!(flags.contains(UidChangeFlags::CACHED));
        assert!(flags.contains(UidChangeFlags::CAPABILITY));
        assert!(flags.contains(UidChangeFlags::PROCSTATE));
        assert!(flags.contains(UidChangeFlags::PROCADJ));
    }

    #[test]
    fn test_dead_uid_dropped() {
        let mut store = store_two_procs_one_uid();
        let mut table = UidTable::new();
        table.recompute(&store);
        let a = store.by_pid(1).unwrap();
        let b = store.by_pid(2).unwrap();
        store.remove(a);
        store.remove(b);
        table.recompute(&store);
        assert!(table.get(10_000).is_none());
    }
}
