//! Follow-up scheduling.
//!
//! Several rules hold only for a window (grace periods, provider retain,
//! service inactivity) and need re-evaluation when the window closes. Each
//! computation records at most one follow-up uptime per process; here the
//! global minimum is tracked so a single delayed wakeup covers everything.

use crate::record::ProcessId;
use crate::store::ProcessStore;

/// Tracker for the earliest pending follow-up across all processes.
#[derive(Debug, Default)]
pub(crate) struct FollowUps {
    next_uptime: Option<u64>,
}

impl FollowUps {
    pub fn new() -> Self {
        FollowUps::default()
    }

    /// The uptime at which the next follow-up update is due, if any.
    pub fn next_uptime(&self) -> Option<u64> {
        self.next_uptime
    }

    /// Recompute the minimum after a pass rewrote per-process times.
    pub fn rebuild(&mut self, store: &ProcessStore) {
        self.next_uptime = store
            .ids()
            .filter_map(|id| store.get(id).and_then(|p| p.followup_update_uptime))
            .min();
    }

    /// Collect processes whose follow-up time has elapsed and clear their
    /// markers; they are about to be re-evaluated.
    pub fn collect_due(store: &mut ProcessStore, now: u64) -> Vec<ProcessId> {
        let due: Vec<ProcessId> = store
            .ids()
            .filter(|&id| {
                store
                    .get(id)
                    .and_then(|p| p.followup_update_uptime)
                    .is_some_and(|t| t <= now)
            })
            .collect();
        for &id in &due {
            if let Some(proc) = store.get_mut(id) {
                proc.followup_update_uptime = None;
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuild_tracks_minimum() {
        let mut store = ProcessStore::new();
        let a = store.insert(1, 10_000, 0, "a");
        let b = store.insert(2, 10_000, 0, "b");
        store.get_mut(a).unwrap().followup_update_uptime = Some(500);
        store.get_mut(b).unwrap().followup_update_uptime = Some(200);

        let mut fu = FollowUps::new();
        fu.rebuild(&store);
        assert_eq!(fu.next_uptime(), Some(200));
    }

    #[test]
    fn test_rebuild_empty() {
        let store = ProcessStore::new();
        let mut fu = FollowUps::new();
        fu.rebuild(&store);
        assert_eq!(fu.next_uptime(), None);
    }

    #[test]
    fn test_collect_due_clears_markers() {
        let mut store = ProcessStore::new();
        let a = store.insert(1, 10_000, 0, "a");
        let b = store.insert(2, 10_000, 0, "b");
        store.get_mut(a).unwrap().followup_update_uptime = Some(100);
        store.get_mut(b).unwrap().followup_update_uptime = Some(900);

        let due = FollowUps::collect_due(&mut store, 500);
        assert_eq!(due, vec![a]);
        assert_eq!(store.get(a).unwrap().followup_update_uptime, None);
        assert_eq!(store.get(b).unwrap().followup_update_uptime, Some(900));
    }
}
