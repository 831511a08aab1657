//! Connection propagation: how a client's importance flows to the process
//! hosting a service or provider it is bound to.
//!
//! The propagator evaluates one binding at a time against an immutable
//! snapshot of the client. In apply mode it mutates the host and records
//! the propagated procstate on the connection; in dry-run mode it only
//! answers whether the binding *would* promote the host in any dimension.
//! Dry-run bails out with a plain early return, never control-flow tricks.
//!
//! Every rule is monotone in the important direction, so re-evaluating a
//! binding is idempotent -- the property the cycle handling in the update
//! driver relies on.

use triage_common::adj::{
    CACHED_APP_MIN_ADJ, FOREGROUND_APP_ADJ, PERCEPTIBLE_APP_ADJ, PERCEPTIBLE_LOW_APP_ADJ,
    PERCEPTIBLE_MEDIUM_APP_ADJ, PERSISTENT_SERVICE_ADJ, SERVICE_ADJ, VISIBLE_APP_ADJ,
};
use triage_common::{
    BindFlags, Capability, CpuTimePropagation, CpuTimeReason, FreezeVeto, ProcState, SchedGroup,
    Uid, FIRST_APPLICATION_UID,
};

use crate::compute::ComputeContext;
use crate::record::{ConnectionRecord, ProcessId, ProcessRecord};

/// Immutable snapshot of the client side of a binding.
///
/// Taken before the host is borrowed mutably; holding a copy instead of a
/// reference keeps the cyclic binding graph out of the borrow checker's
/// way, mirroring the id-not-reference ownership rule of the store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientView {
    pub id: ProcessId,
    pub adj: i16,
    pub proc_state: ProcState,
    pub sched_group: SchedGroup,
    pub capability: Capability,
    pub uid: Uid,
}

impl ClientView {
    pub fn snapshot(proc: &ProcessRecord) -> Self {
        ClientView {
            id: proc.id,
            adj: proc.cur_raw_adj,
            proc_state: proc.cur_raw_proc_state,
            sched_group: proc.cur_sched_group,
            capability: proc.cur_capability,
            uid: proc.uid,
        }
    }

    #[inline]
    fn is_cached(&self) -> bool {
        self.proc_state.is_cached()
    }

    #[inline]
    fn is_system(&self) -> bool {
        self.uid < FIRST_APPLICATION_UID
    }
}

/// Candidate host attributes accumulated while evaluating one binding.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    adj: i16,
    state: ProcState,
    group: SchedGroup,
    caps_add: Capability,
    reasons_add: CpuTimeReason,
    veto_add: FreezeVeto,
    treated_like_activity: bool,
    cached_activity_client: bool,
}

impl Outcome {
    fn from_host(host: &ProcessRecord) -> Self {
        Outcome {
            adj: host.cur_raw_adj,
            state: host.cur_raw_proc_state,
            group: host.cur_sched_group,
            caps_add: Capability::empty(),
            reasons_add: CpuTimeReason::empty(),
            veto_add: FreezeVeto::empty(),
            treated_like_activity: false,
            cached_activity_client: false,
        }
    }

    /// Whether committing this outcome would change the host.
    fn promotes(&self, host: &ProcessRecord) -> bool {
        self.adj < host.cur_raw_adj
            || self.state < host.cur_raw_proc_state
            || self.group > host.cur_sched_group
            || !host.cur_capability.contains(self.caps_add)
            || (!self.veto_add.is_empty() && !host.should_not_freeze_reason.contains(self.veto_add))
            || (self.treated_like_activity && !host.treated_like_activity)
            || (self.cached_activity_client && !host.cached_activity_client)
    }

    fn commit(self, host: &mut ProcessRecord, adj_type: &'static str) {
        if self.adj < host.cur_raw_adj {
            host.cur_raw_adj = self.adj;
            host.cur_adj = self.adj;
            host.adj_type = adj_type;
        }
        if self.state < host.cur_raw_proc_state {
            host.cur_raw_proc_state = self.state;
            host.cur_proc_state = self.state;
        }
        if self.group > host.cur_sched_group {
            host.cur_sched_group = self.group;
        }
        host.cur_capability |= self.caps_add;
        host.cur_cpu_time_reasons |= self.reasons_add;
        if !self.veto_add.is_empty() {
            host.should_not_freeze = true;
            host.should_not_freeze_reason |= self.veto_add;
        }
        host.treated_like_activity |= self.treated_like_activity;
        host.cached_activity_client |= self.cached_activity_client;
    }
}

/// Bind flags that can push the host beyond the client's own attributes,
/// disqualifying the unimportant-connection fast path.
const ELEVATING_FLAGS: BindFlags = BindFlags::ABOVE_CLIENT
    .union(BindFlags::IMPORTANT)
    .union(BindFlags::SCHEDULE_LIKE_TOP_APP)
    .union(BindFlags::TREAT_LIKE_ACTIVITY)
    .union(BindFlags::ADJUST_WITH_ACTIVITY)
    .union(BindFlags::BYPASS_POWER_NETWORK_RESTRICTIONS)
    .union(BindFlags::BYPASS_USER_NETWORK_RESTRICTIONS);

/// Apply (or probe) the effect of one service binding on its host.
///
/// Returns whether the host was (or would be) promoted in any dimension.
pub(crate) fn compute_service_host(
    host: &mut ProcessRecord,
    client: &ClientView,
    conn: &mut ConnectionRecord,
    ctx: &ComputeContext<'_>,
    dry_run: bool,
) -> bool {
    // Startup attributes are pinned until attach finishes.
    if host.is_pending_finish_attach {
        return false;
    }

    // Fast path: the host already dominates the client in every dimension
    // and the flags cannot push it further.
    if !conn.flags.intersects(ELEVATING_FLAGS)
        && host.cur_raw_adj <= client.adj
        && host.cur_raw_proc_state <= client.proc_state
        && host.cur_sched_group >= client.sched_group
        && host.cur_capability.contains(client.capability)
        && host.should_not_freeze
    {
        return false;
    }

    let mut out = Outcome::from_host(host);
    let flags = conn.flags;

    // Capability propagation applies regardless of priority flags.
    if client.capability.contains(Capability::BFSL) {
        out.caps_add |= Capability::BFSL;
    }
    match conn.cpu_time_propagation {
        CpuTimePropagation::Normal => {
            if client.capability.contains(Capability::CPU_TIME) {
                out.caps_add |= Capability::CPU_TIME;
                out.reasons_add |= CpuTimeReason::BOUND_CLIENT;
            }
            if client.capability.contains(Capability::IMPLICIT_CPU_TIME) {
                out.caps_add |= Capability::IMPLICIT_CPU_TIME;
            }
        }
        CpuTimePropagation::Legacy => {
            if client.capability.has_cpu_time() {
                out.caps_add |= Capability::IMPLICIT_CPU_TIME;
            }
        }
        CpuTimePropagation::None => {}
    }
    if flags.contains(BindFlags::INCLUDE_CAPABILITIES) {
        out.caps_add |= client.capability & Capability::while_in_use();
    }
    if flags.contains(BindFlags::BYPASS_POWER_NETWORK_RESTRICTIONS) {
        out.caps_add |= Capability::POWER_RESTRICTED_NETWORK;
    }
    if flags.contains(BindFlags::BYPASS_USER_NETWORK_RESTRICTIONS) {
        out.caps_add |= Capability::USER_RESTRICTED_NETWORK;
    }

    if flags.contains(BindFlags::WAIVE_PRIORITY) {
        // A waived binding carries no priority, only the freezer veto from
        // a client that is itself not cached. ALLOW_FREEZE opts out of the
        // veto; SIMULATE_ALLOW_FREEZE keeps it and only measures.
        if !client.is_cached() && !flags.contains(BindFlags::ALLOW_FREEZE) {
            out.veto_add |= FreezeVeto::NON_CACHED_CLIENT;
        }
    } else {
        propagate_priority(&mut out, host, client, flags, ctx);
    }

    if flags.contains(BindFlags::TREAT_LIKE_ACTIVITY) {
        out.treated_like_activity = true;
    }
    if conn.has_activity {
        out.cached_activity_client = true;
    }
    if flags.contains(BindFlags::ADJUST_WITH_ACTIVITY) && conn.has_activity && conn.activity_visible
    {
        if FOREGROUND_APP_ADJ < out.adj {
            out.adj = FOREGROUND_APP_ADJ;
        }
    }

    let promoted = out.promotes(host);
    if dry_run {
        return promoted;
    }
    out.commit(host, "service");
    conn.track_proc_state(host.cur_raw_proc_state);
    promoted
}

/// The non-waived adj / sched-group / procstate rules.
fn propagate_priority(
    out: &mut Outcome,
    host: &ProcessRecord,
    client: &ClientView,
    flags: BindFlags,
    ctx: &ComputeContext<'_>,
) {
    let mut client_adj = client.adj;
    if flags.contains(BindFlags::ALLOW_OOM_MANAGEMENT) {
        // A cached client still keeps an oom-managed host at the
        // started-service level, and the host must stay unfrozen.
        if client_adj >= CACHED_APP_MIN_ADJ {
            client_adj = SERVICE_ADJ;
        }
        out.veto_add |= FreezeVeto::OOM_MANAGEMENT;
    }

    // -- adj ---------------------------------------------------------------
    if out.adj > client_adj {
        let mut candidate = if flags.contains(BindFlags::ABOVE_CLIENT | BindFlags::IMPORTANT)
            && client_adj < PERSISTENT_SERVICE_ADJ
        {
            out.state = out.state.min(ProcState::Persistent);
            PERSISTENT_SERVICE_ADJ
        } else if flags.contains(BindFlags::NOT_PERCEPTIBLE)
            && client_adj <= PERCEPTIBLE_APP_ADJ
            && out.adj >= PERCEPTIBLE_LOW_APP_ADJ
        {
            PERCEPTIBLE_LOW_APP_ADJ
        } else if flags.contains(BindFlags::ALMOST_PERCEPTIBLE)
            && !flags.contains(BindFlags::NOT_FOREGROUND)
        {
            PERCEPTIBLE_APP_ADJ + 1
        } else if flags.contains(BindFlags::ALMOST_PERCEPTIBLE) {
            PERCEPTIBLE_MEDIUM_APP_ADJ + 2
        } else if flags.contains(BindFlags::NOT_VISIBLE) && client_adj <= PERCEPTIBLE_APP_ADJ {
            PERCEPTIBLE_APP_ADJ
        } else if flags.contains(BindFlags::TREAT_LIKE_VISIBLE_FOREGROUND_SERVICE)
            && client_adj <= VISIBLE_APP_ADJ
        {
            VISIBLE_APP_ADJ
        } else if client_adj >= PERCEPTIBLE_APP_ADJ || flags.contains(BindFlags::IMPORTANT) {
            client_adj
        } else {
            client_adj.max(VISIBLE_APP_ADJ)
        };

        // An isolated child never outranks the client that spawned it.
        if host.is_isolated
            && host.isolated_owner == Some(client.id)
            && !host.is_sdk_sandbox
        {
            candidate = candidate.max(client_adj + 1);
        }
        if candidate < out.adj {
            out.adj = candidate;
        }
    }

    // -- scheduling group --------------------------------------------------
    if !flags.intersects(BindFlags::NOT_FOREGROUND | BindFlags::IMPORTANT_BACKGROUND) {
        let mut group = client.sched_group;
        if !flags.contains(BindFlags::IMPORTANT) {
            group = group.min(SchedGroup::Default);
        }
        if flags.contains(BindFlags::SCHEDULE_LIKE_TOP_APP) && client.is_system() {
            group = SchedGroup::TopApp;
        }
        if group > out.group {
            out.group = group;
        }
    }

    // -- procstate ---------------------------------------------------------
    let inherit = if client.is_cached() {
        ProcState::CachedEmpty
    } else {
        client.proc_state
    };
    let mut target = if inherit < ProcState::Top {
        // Persistent-tier client: bounded unless the binding asks for the
        // foreground-service level.
        if flags.contains(BindFlags::FOREGROUND_SERVICE) {
            ProcState::BoundForegroundService
        } else if flags.contains(BindFlags::FOREGROUND_SERVICE_WHILE_AWAKE)
            && ctx.wakefulness.is_awake()
        {
            ProcState::BoundForegroundService
        } else {
            ProcState::ImportantForeground
        }
    } else if inherit == ProcState::Top {
        ProcState::BoundTop
    } else {
        inherit
    };
    if flags.contains(BindFlags::IMPORTANT_BACKGROUND) {
        target = target.max(ProcState::ImportantBackground);
    } else if flags.contains(BindFlags::NOT_FOREGROUND) {
        target = target.max(ProcState::TransientBackground);
    }
    if target < out.state {
        out.state = target;
    }
}

/// Apply (or probe) the effect of one provider binding on its host.
/// A strict subset of the service rules.
pub(crate) fn compute_provider_host(
    host: &mut ProcessRecord,
    client: &ClientView,
    _ctx: &ComputeContext<'_>,
    dry_run: bool,
) -> bool {
    if host.is_pending_finish_attach {
        return false;
    }

    let mut out = Outcome::from_host(host);
    if client.capability.contains(Capability::BFSL) {
        out.caps_add |= Capability::BFSL;
    }

    if out.adj > client.adj {
        let candidate = client.adj.max(FOREGROUND_APP_ADJ);
        if candidate < out.adj {
            out.adj = candidate;
        }
        out.group = out.group.max(client.sched_group.min(SchedGroup::Default));
    }

    let inherit = if client.is_cached() {
        ProcState::CachedEmpty
    } else {
        client.proc_state
    };
    let target = if inherit == ProcState::Top {
        ProcState::BoundTop
    } else if inherit <= ProcState::ForegroundService {
        ProcState::BoundForegroundService
    } else {
        inherit
    };
    if target < out.state {
        out.state = target;
    }

    let promoted = out.promotes(host);
    if dry_run {
        return promoted;
    }
    out.commit(host, "provider");
    promoted
}
