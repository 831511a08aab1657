//! The adjuster's guarded state: everything living under the service lock.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use triage_common::{ProcState, Uid, Wakefulness};

use crate::config::AdjusterConfig;
use crate::followup::FollowUps;
use crate::index::{PriorityIndex, QueueKind};
use crate::observer::PlatformCompat;
use crate::record::ProcessId;
use crate::store::ProcessStore;
use crate::uid::UidTable;

/// Device-wide inputs consumed by every computation.
#[derive(Debug)]
pub(crate) struct GlobalState {
    pub top: Option<ProcessId>,
    pub wakefulness: Wakefulness,
    pub is_unlocking: bool,
    pub notification_shade_expanded: bool,
    pub temp_allowlist: FxHashSet<Uid>,
    /// Active backup target per user.
    pub backup_targets: FxHashMap<u32, ProcessId>,
}

impl GlobalState {
    fn new() -> Self {
        GlobalState {
            top: None,
            wakefulness: Wakefulness::Awake,
            is_unlocking: false,
            notification_shade_expanded: false,
            temp_allowlist: FxHashSet::default(),
            backup_targets: FxHashMap::default(),
        }
    }

    /// The procstate the top process gets: TOP while awake, TOP_SLEEPING
    /// otherwise.
    pub fn top_proc_state(&self) -> ProcState {
        if self.wakefulness.is_awake() {
            ProcState::Top
        } else {
            ProcState::TopSleeping
        }
    }
}

/// All adjuster state protected by the service lock.
pub(crate) struct AdjusterCore {
    pub store: ProcessStore,
    pub ps_queue: PriorityIndex,
    pub adj_queue: PriorityIndex,
    pub uids: UidTable,
    pub global: GlobalState,
    pub config: AdjusterConfig,
    pub compat: Arc<dyn PlatformCompat>,
    /// Pending partial-update targets, FIFO with de-duplication.
    pub pending: Vec<ProcessId>,
    pub pending_set: FxHashSet<ProcessId>,
    pub followups: FollowUps,
    /// Update-pass sequence number; strictly monotonic.
    pub seq: u64,
    /// Set when an invariant check failed; the next trigger runs a full
    /// pass regardless of what was requested.
    pub force_full_next: bool,
}

impl AdjusterCore {
    pub fn new(config: AdjusterConfig, compat: Arc<dyn PlatformCompat>) -> Self {
        AdjusterCore {
            store: ProcessStore::new(),
            ps_queue: PriorityIndex::new(QueueKind::ProcState),
            adj_queue: PriorityIndex::new(QueueKind::Adj),
            uids: UidTable::new(),
            global: GlobalState::new(),
            config,
            compat,
            pending: Vec::new(),
            pending_set: FxHashSet::default(),
            followups: FollowUps::new(),
            seq: 0,
            force_full_next: false,
        }
    }

    /// Queue a process for the next partial pass.
    pub fn enqueue_target(&mut self, id: ProcessId) {
        if self.store.contains(id) && self.pending_set.insert(id) {
            self.pending.push(id);
        }
    }

    pub fn take_pending(&mut self) -> Vec<ProcessId> {
        self.pending_set.clear();
        std::mem::take(&mut self.pending)
    }

    /// Remove a dead process from every structure it is linked into.
    pub fn remove_process(&mut self, id: ProcessId) {
        self.ps_queue.unlink(&mut self.store, id);
        self.adj_queue.unlink(&mut self.store, id);
        self.pending.retain(|&p| p != id);
        self.pending_set.remove(&id);
        if self.global.top == Some(id) {
            self.global.top = None;
        }
        self.global.backup_targets.retain(|_, &mut p| p != id);
        self.store.remove(id);
        self.followups.rebuild(&self.store);
    }
}
