//! Per-process record and the component records hanging off it.
//!
//! One [`ProcessRecord`] exists per live process, owned exclusively by the
//! process store and identified by a stable [`ProcessId`]. Bindings between
//! processes never hold references; they hold ids that traversal resolves
//! against the store, skipping stale ones. This keeps the binding graph --
//! which forms arbitrary cycles -- free of ownership cycles.

use std::fmt;

use rustc_hash::FxHashSet;

use triage_common::adj::{FOREGROUND_APP_ADJ, PERSISTENT_SERVICE_ADJ, UNKNOWN_ADJ};
use triage_common::{
    ActivityFlags, BindFlags, Capability, CpuTimePropagation, CpuTimeReason, FgsTypeMask,
    FreezeVeto, Pid, ProcState, SchedGroup, Uid,
};

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Stable store key for a live process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

/// Stable key for a service hosted by some process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub u64);

/// Stable key for a content provider published by some process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(pub u64);

/// Stable key for one service binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Stable key for one provider binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProvConnId(pub u64);

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Priority-index link node
// ---------------------------------------------------------------------------

/// Embedded doubly-linked-list node, one per priority queue.
///
/// Living inside the record keeps slot moves allocation-free and O(1).
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QueueLink {
    pub prev: Option<ProcessId>,
    pub next: Option<ProcessId>,
    /// Slot currently occupied, `None` when unlinked.
    pub slot: Option<u16>,
}

/// Number of priority queues a process is linked into.
pub(crate) const QUEUE_COUNT: usize = 2;

// ---------------------------------------------------------------------------
// Component records
// ---------------------------------------------------------------------------

/// A service hosted by a process.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub id: ServiceId,
    /// The service was explicitly started and has not been stopped.
    pub is_start_requested: bool,
    /// Uptime of the last start/bind interaction, drives the
    /// started-service inactivity window.
    pub last_activity_ms: u64,
    /// Keeps the started-service floor alive past the inactivity window.
    pub keep_warming: bool,
    /// Incoming bindings from client processes.
    pub connections: Vec<ConnId>,
}

/// A content provider published by a process.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: ProviderId,
    /// Handles held by unmanaged (external) clients pin the host.
    pub has_external_handles: bool,
    /// Incoming bindings from client processes.
    pub connections: Vec<ProvConnId>,
}

/// One service binding: client pulls the host up to (at most) its own
/// importance, moderated by the bind flags.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnId,
    pub client: ProcessId,
    pub host: ProcessId,
    pub service: ServiceId,
    pub flags: BindFlags,
    pub cpu_time_propagation: CpuTimePropagation,
    /// The binding was made on behalf of an activity.
    pub has_activity: bool,
    /// That activity is currently visible.
    pub activity_visible: bool,
    /// For sdk-sandbox hosts, the process whose importance actually flows
    /// across this binding instead of the nominal client's.
    pub attributed_client: Option<ProcessId>,
    /// Host procstate last observed through this binding, consumed by the
    /// bound-service binder-call counter collaborator.
    pub tracked_proc_state: Option<ProcState>,
}

impl ConnectionRecord {
    /// Record the host procstate this binding last propagated to.
    pub fn track_proc_state(&mut self, state: ProcState) {
        self.tracked_proc_state = Some(state);
    }
}

/// One provider binding. A strict subset of the service rules applies.
#[derive(Debug, Clone)]
pub struct ProviderConnection {
    pub id: ProvConnId,
    pub client: ProcessId,
    pub host: ProcessId,
    pub provider: ProviderId,
}

// ---------------------------------------------------------------------------
// ProcessRecord
// ---------------------------------------------------------------------------

/// Everything the adjuster knows about one live process.
///
/// Intrinsic facts are written by the state controller; computed attributes
/// are written only by update passes; committed (`set_*`) attributes track
/// the last values collaborators were told about.
#[derive(Debug)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub pid: Pid,
    pub uid: Uid,
    pub user_id: u32,
    pub process_name: String,
    pub package_names: FxHashSet<String>,

    // -- intrinsic facts ---------------------------------------------------
    /// Upper bound on `cur_adj`. At or below the foreground boundary the
    /// process is privileged and its attributes are pinned.
    pub max_adj: i16,
    pub activity_flags: ActivityFlags,
    /// Task layer offset added to the visible-app adj.
    pub visible_app_layer: i16,
    /// Uptime at which the process last stopped being perceptible.
    pub perceptible_stop_uptime: Option<u64>,
    pub has_overlay_ui: bool,
    pub has_top_ui: bool,
    pub has_shown_ui: bool,
    pub has_recent_tasks: bool,
    pub is_running_remote_anim: bool,
    pub has_active_instrumentation: bool,
    pub is_backup_target: bool,
    pub is_heavy_weight: bool,
    pub is_home: bool,
    pub is_previous: bool,
    /// Uptime at which `is_previous` was set; the previous floor decays.
    pub previous_since: u64,
    pub is_receiving_broadcast: bool,
    pub broadcast_sched_group: SchedGroup,
    pub is_pending_finish_attach: bool,
    pub is_killed: bool,
    pub is_sdk_sandbox: bool,
    pub is_isolated: bool,
    /// For isolated processes, the process that spawned them.
    pub isolated_owner: Option<ProcessId>,
    pub forcing_to_important: bool,
    /// Expedited work is pending for this process.
    pub has_expedited_work: bool,
    /// Services currently executing lifecycle callbacks in this process.
    pub executing_service_count: u32,
    pub exec_services_fg: bool,
    /// Distributed-ladder grouping; 0 means ungrouped.
    pub connection_group: u32,
    pub freeze_exempt: bool,
    pub last_top_time: u64,
    /// Uptime of the last provider access on behalf of a client.
    pub last_provider_time: Option<u64>,
    /// Process-level foreground-service summary.
    pub has_foreground_services: bool,
    pub fgs_types: FgsTypeMask,
    pub fgs_has_none_type: bool,
    /// Present while the process hosts only a short foreground service;
    /// holds the procstate demotion deadline.
    pub short_fgs_deadline: Option<u64>,

    // -- hosted components and outgoing bindings ---------------------------
    pub services: Vec<ServiceRecord>,
    pub providers: Vec<ProviderRecord>,
    /// Outgoing service bindings (this process is the client, or the
    /// attributed client for sandbox bindings).
    pub service_bindings: Vec<ConnId>,
    /// Outgoing provider bindings.
    pub provider_bindings: Vec<ProvConnId>,

    // -- computed attributes (update passes only) --------------------------
    pub cur_adj: i16,
    pub cur_raw_adj: i16,
    pub cur_proc_state: ProcState,
    pub cur_raw_proc_state: ProcState,
    pub cur_sched_group: SchedGroup,
    pub cur_capability: Capability,
    pub cur_cpu_time_reasons: CpuTimeReason,
    pub should_not_freeze: bool,
    pub should_not_freeze_reason: FreezeVeto,
    /// Diagnostic label naming the rule that produced the final adj.
    pub adj_type: &'static str,
    /// Set during a pass when a binding treats this process like it hosts
    /// an activity, upgrading its cached procstate.
    pub treated_like_activity: bool,
    /// Set during a pass when an activity-carrying binding targets this
    /// process while it is cached.
    pub cached_activity_client: bool,

    // -- committed attributes ----------------------------------------------
    pub set_adj: i16,
    pub set_proc_state: ProcState,
    pub set_sched_group: SchedGroup,
    pub set_capability: Capability,
    /// Last freezer decision delivered for this process.
    pub frozen: bool,

    // -- pass bookkeeping --------------------------------------------------
    pub adj_seq: u64,
    pub completed_adj_seq: u64,
    pub reachable: bool,
    /// Times this process was re-queued after completing within one pass.
    pub revisit_count: u32,
    pub followup_update_uptime: Option<u64>,
    /// Uptime of the last committed procstate transition.
    pub last_state_time: u64,
    /// Uptime at which the committed procstate entered the cached tier.
    pub cached_since: Option<u64>,

    pub(crate) queue_links: [QueueLink; QUEUE_COUNT],
}

impl ProcessRecord {
    pub fn new(id: ProcessId, pid: Pid, uid: Uid, user_id: u32, name: impl Into<String>) -> Self {
        ProcessRecord {
            id,
            pid,
            uid,
            user_id,
            process_name: name.into(),
            package_names: FxHashSet::default(),
            max_adj: UNKNOWN_ADJ,
            activity_flags: ActivityFlags::empty(),
            visible_app_layer: 0,
            perceptible_stop_uptime: None,
            has_overlay_ui: false,
            has_top_ui: false,
            has_shown_ui: false,
            has_recent_tasks: false,
            is_running_remote_anim: false,
            has_active_instrumentation: false,
            is_backup_target: false,
            is_heavy_weight: false,
            is_home: false,
            is_previous: false,
            previous_since: 0,
            is_receiving_broadcast: false,
            broadcast_sched_group: SchedGroup::Background,
            is_pending_finish_attach: false,
            is_killed: false,
            is_sdk_sandbox: false,
            is_isolated: false,
            isolated_owner: None,
            forcing_to_important: false,
            has_expedited_work: false,
            executing_service_count: 0,
            exec_services_fg: false,
            connection_group: 0,
            freeze_exempt: false,
            last_top_time: 0,
            last_provider_time: None,
            has_foreground_services: false,
            fgs_types: FgsTypeMask::empty(),
            fgs_has_none_type: false,
            short_fgs_deadline: None,
            services: Vec::new(),
            providers: Vec::new(),
            service_bindings: Vec::new(),
            provider_bindings: Vec::new(),
            cur_adj: UNKNOWN_ADJ,
            cur_raw_adj: UNKNOWN_ADJ,
            cur_proc_state: ProcState::Unknown,
            cur_raw_proc_state: ProcState::Unknown,
            cur_sched_group: SchedGroup::Background,
            cur_capability: Capability::empty(),
            cur_cpu_time_reasons: CpuTimeReason::empty(),
            should_not_freeze: false,
            should_not_freeze_reason: FreezeVeto::empty(),
            adj_type: "none",
            treated_like_activity: false,
            cached_activity_client: false,
            set_adj: UNKNOWN_ADJ,
            set_proc_state: ProcState::Unknown,
            set_sched_group: SchedGroup::Background,
            set_capability: Capability::empty(),
            frozen: false,
            adj_seq: 0,
            completed_adj_seq: 0,
            reachable: false,
            revisit_count: 0,
            followup_update_uptime: None,
            last_state_time: 0,
            cached_since: None,
            queue_links: [QueueLink::default(); QUEUE_COUNT],
        }
    }

    /// Privileged processes whose attributes are pinned by `max_adj`.
    #[inline]
    pub fn has_fixed_adj(&self) -> bool {
        self.max_adj <= FOREGROUND_APP_ADJ
    }

    /// Persistent-range system processes. Propagation never changes their
    /// attributes, so reachability collection ignores edges into them.
    #[inline]
    pub fn is_persistent_system(&self) -> bool {
        self.max_adj <= PERSISTENT_SERVICE_ADJ
    }

    #[inline]
    pub fn has_activities(&self) -> bool {
        self.activity_flags.contains(ActivityFlags::HAS_ACTIVITIES)
    }

    /// Any started service keeps the process out of the cached tier for a
    /// while; keep-warming services do so indefinitely.
    pub fn has_started_services(&self) -> bool {
        self.services.iter().any(|s| s.is_start_requested)
    }

    /// Latest interaction time across started services, and whether any of
    /// them is marked keep-warming.
    pub fn started_service_activity(&self) -> Option<(u64, bool)> {
        let mut latest = None;
        let mut warm = false;
        for svc in self.services.iter().filter(|s| s.is_start_requested) {
            warm |= svc.keep_warming;
            latest = Some(latest.map_or(svc.last_activity_ms, |v: u64| v.max(svc.last_activity_ms)));
        }
        latest.map(|t| (t, warm))
    }

    pub fn find_service_mut(&mut self, id: ServiceId) -> Option<&mut ServiceRecord> {
        self.services.iter_mut().find(|s| s.id == id)
    }

    pub fn find_provider_mut(&mut self, id: ProviderId) -> Option<&mut ProviderRecord> {
        self.providers.iter_mut().find(|p| p.id == id)
    }

    /// Clear the per-pass computed state before the attribute computer runs.
    pub(crate) fn reset_computed(&mut self, seq: u64) {
        self.adj_seq = seq;
        self.revisit_count = 0;
        self.cur_raw_adj = UNKNOWN_ADJ;
        self.cur_adj = UNKNOWN_ADJ;
        self.cur_raw_proc_state = ProcState::CachedEmpty;
        self.cur_proc_state = ProcState::CachedEmpty;
        self.cur_sched_group = SchedGroup::Background;
        self.cur_capability = Capability::empty();
        self.cur_cpu_time_reasons = CpuTimeReason::empty();
        self.should_not_freeze = false;
        self.should_not_freeze_reason = FreezeVeto::empty();
        self.treated_like_activity = false;
        self.cached_activity_client = false;
        self.followup_update_uptime = None;
        self.adj_type = "cch-empty";
    }

    /// Record a follow-up re-evaluation time, keeping the earliest.
    pub(crate) fn schedule_followup(&mut self, uptime: u64) {
        self.followup_update_uptime = Some(match self.followup_update_uptime {
            Some(cur) => cur.min(uptime),
            None => uptime,
        });
    }
}
