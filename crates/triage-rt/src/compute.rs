//! Intrinsic attribute computation.
//!
//! Given one process record and the global context, assign the initial
//! adj, procstate, scheduling group and capabilities from the process's
//! own facts -- no connections. The decision waterfall picks the base
//! assignment; the adjustment rules after it only ever move a process in
//! the important direction (lower adj, lower numerical procstate), so the
//! order of the adjustments does not matter beyond their clamps.
//!
//! Connection effects are layered on top by the propagator during queue
//! traversal; the final capability composition happens in the driver once
//! the procstate has settled.

use rustc_hash::FxHashSet;

use triage_common::adj::{
    BACKUP_APP_ADJ, FOREGROUND_APP_ADJ, HEAVY_WEIGHT_APP_ADJ, HOME_APP_ADJ,
    PERCEPTIBLE_APP_ADJ, PERCEPTIBLE_MEDIUM_APP_ADJ, PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ,
    PREVIOUS_APP_ADJ, SERVICE_ADJ, VISIBLE_APP_ADJ, VISIBLE_APP_MAX_ADJ,
};
use triage_common::{
    ActivityFlags, Capability, CompatChange, CpuTimeReason, FgsTypeMask, FreezeVeto, ProcState,
    SchedGroup, Uid, Wakefulness,
};

use crate::config::AdjusterConfig;
use crate::observer::PlatformCompat;
use crate::record::{ProcessId, ProcessRecord};

/// Global facts shared by every computation in one pass.
pub(crate) struct ComputeContext<'a> {
    pub now: u64,
    pub top: Option<ProcessId>,
    /// TOP while awake, TOP_SLEEPING otherwise.
    pub top_proc_state: ProcState,
    pub wakefulness: Wakefulness,
    pub temp_allowlist: &'a FxHashSet<Uid>,
    pub compat: &'a dyn PlatformCompat,
    pub config: &'a AdjusterConfig,
    #[allow(dead_code)]
    pub doing_all: bool,
}

/// Lower the raw adj if the new value is more important.
fn lower_adj(proc: &mut ProcessRecord, adj: i16, adj_type: &'static str) -> bool {
    if adj < proc.cur_raw_adj {
        proc.cur_raw_adj = adj;
        proc.adj_type = adj_type;
        true
    } else {
        false
    }
}

/// Lower the raw procstate if the new value is more important.
fn lower_state(proc: &mut ProcessRecord, state: ProcState) {
    if state < proc.cur_raw_proc_state {
        proc.cur_raw_proc_state = state;
    }
}

/// Raise the scheduling group if the new one is more favored.
fn raise_group(proc: &mut ProcessRecord, group: SchedGroup) {
    if group > proc.cur_sched_group {
        proc.cur_sched_group = group;
    }
}

/// Run the decision waterfall and the monotone adjustments for one process.
///
/// Expects `reset_computed` to have run for this pass. Records follow-up
/// times for every time-bounded floor that is currently active.
pub(crate) fn compute_intrinsic(proc: &mut ProcessRecord, ctx: &ComputeContext<'_>) {
    let is_top = ctx.top == Some(proc.id);

    // Privileged processes are pinned by max_adj and never re-ranked.
    if proc.has_fixed_adj() {
        proc.cur_raw_adj = proc.max_adj;
        proc.cur_adj = proc.max_adj;
        proc.cur_raw_proc_state = if proc.has_top_ui {
            ProcState::PersistentUi
        } else {
            ProcState::Persistent
        };
        proc.cur_proc_state = proc.cur_raw_proc_state;
        proc.cur_sched_group = if is_top {
            SchedGroup::TopApp
        } else {
            SchedGroup::Default
        };
        proc.cur_capability = Capability::all_granted();
        proc.adj_type = "fixed";
        return;
    }

    // -- waterfall: first match sets the base assignment -------------------
    if is_top && ctx.top_proc_state == ProcState::Top {
        proc.cur_raw_adj = FOREGROUND_APP_ADJ;
        proc.cur_raw_proc_state = ProcState::Top;
        proc.cur_sched_group = SchedGroup::TopApp;
        proc.adj_type = "top-activity";
        proc.cur_cpu_time_reasons |= CpuTimeReason::TOP;
    } else if proc.is_running_remote_anim {
        proc.cur_raw_adj = VISIBLE_APP_ADJ;
        proc.cur_raw_proc_state = ctx.top_proc_state;
        proc.cur_sched_group = SchedGroup::TopApp;
        proc.adj_type = "running-remote-anim";
    } else if proc.has_active_instrumentation {
        proc.cur_raw_adj = FOREGROUND_APP_ADJ;
        proc.cur_raw_proc_state = ProcState::ForegroundService;
        proc.cur_sched_group = SchedGroup::Default;
        proc.cur_capability |= Capability::BFSL;
        proc.cur_cpu_time_reasons |= CpuTimeReason::INSTRUMENTATION;
        proc.adj_type = "instrumentation";
    } else if proc.is_receiving_broadcast {
        proc.cur_raw_adj = FOREGROUND_APP_ADJ;
        proc.cur_raw_proc_state = ProcState::Receiver;
        proc.cur_sched_group = proc.broadcast_sched_group;
        proc.cur_cpu_time_reasons |= CpuTimeReason::BROADCAST;
        proc.adj_type = "broadcast";
    } else if proc.executing_service_count > 0 {
        proc.cur_raw_adj = FOREGROUND_APP_ADJ;
        proc.cur_raw_proc_state = ProcState::Service;
        proc.cur_sched_group = if proc.exec_services_fg {
            SchedGroup::Default
        } else {
            SchedGroup::Background
        };
        proc.cur_cpu_time_reasons |= CpuTimeReason::EXECUTING_SERVICE;
        proc.adj_type = "exec-service";
    } else if is_top {
        // Top of the stack while the device sleeps.
        proc.cur_raw_adj = FOREGROUND_APP_ADJ;
        proc.cur_raw_proc_state = ctx.top_proc_state;
        proc.cur_sched_group = SchedGroup::Background;
        proc.adj_type = "top-sleeping";
    }
    // Otherwise the placeholder from reset_computed stands: UNKNOWN adj,
    // CACHED_EMPTY procstate, background group.

    // -- activities (non-top) ----------------------------------------------
    if !is_top && proc.has_activities() {
        let flags = proc.activity_flags;
        if flags.contains(ActivityFlags::VISIBLE) {
            let layered =
                (VISIBLE_APP_ADJ + proc.visible_app_layer).min(VISIBLE_APP_MAX_ADJ);
            lower_adj(proc, layered, "vis-activity");
            lower_state(proc, ProcState::ImportantForeground);
            raise_group(proc, SchedGroup::Default);
        } else if flags.contains(ActivityFlags::PAUSED) {
            lower_adj(proc, PERCEPTIBLE_APP_ADJ, "pause-activity");
            lower_state(proc, ProcState::ImportantForeground);
            raise_group(proc, SchedGroup::Default);
        } else if flags.contains(ActivityFlags::STOPPING) {
            lower_adj(proc, PERCEPTIBLE_APP_ADJ, "stop-activity");
            if !flags.contains(ActivityFlags::FINISHING) {
                lower_state(proc, ProcState::LastActivity);
            }
        } else {
            lower_state(proc, ProcState::CachedActivity);
            if proc.cur_raw_adj >= triage_common::adj::UNKNOWN_ADJ {
                proc.adj_type = "cch-act";
            }
        }
    }
    if let Some(stopped) = proc.perceptible_stop_uptime {
        let until = stopped + ctx.config.recent_perceptible_ms;
        if ctx.now < until {
            lower_adj(proc, PERCEPTIBLE_MEDIUM_APP_ADJ, "recent-perceptible");
            proc.schedule_followup(until);
        }
    }

    // -- foreground services -----------------------------------------------
    if proc.has_foreground_services {
        lower_adj(proc, PERCEPTIBLE_APP_ADJ, "fg-service");
        lower_state(proc, ProcState::ForegroundService);
        raise_group(proc, SchedGroup::Default);
        let type_caps = fgs_type_capabilities(proc.fgs_types, proc.uid, ctx);
        proc.cur_capability |= Capability::BFSL | type_caps;
        proc.cur_cpu_time_reasons |= CpuTimeReason::FOREGROUND_SERVICE;
    } else if let Some(deadline) = proc.short_fgs_deadline {
        // A short foreground service is perceptible but weaker, and never
        // grants the background-start capability.
        if ctx.now < deadline {
            lower_adj(proc, PERCEPTIBLE_MEDIUM_APP_ADJ + 1, "fg-service-short");
            lower_state(proc, ProcState::ForegroundService);
            raise_group(proc, SchedGroup::Default);
            proc.cur_cpu_time_reasons |= CpuTimeReason::FOREGROUND_SERVICE;
            proc.schedule_followup(deadline);
        }
    }
    if proc.has_overlay_ui {
        lower_adj(proc, PERCEPTIBLE_APP_ADJ, "has-overlay-ui");
        lower_state(proc, ProcState::ImportantForeground);
    }

    // -- recent-foreground grace windows -----------------------------------
    let has_any_fgs = proc.has_foreground_services || proc.short_fgs_deadline.is_some();
    if has_any_fgs && proc.last_top_time > 0 {
        let until = proc.last_top_time + ctx.config.top_to_fgs_grace_ms;
        if ctx.now < until {
            let adj = if proc.has_foreground_services {
                PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ
            } else {
                PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ + 1
            };
            lower_adj(proc, adj, "fg-service-recent-top");
            proc.schedule_followup(until);
        }
    }
    if proc.has_expedited_work && proc.last_top_time > 0 {
        let until = proc.last_top_time + ctx.config.top_to_almost_perceptible_grace_ms;
        if ctx.now < until {
            lower_adj(
                proc,
                PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ + 2,
                "expedited-recent-top",
            );
            proc.schedule_followup(until);
        }
    }

    if proc.forcing_to_important {
        lower_adj(proc, PERCEPTIBLE_APP_ADJ, "force-imp");
        lower_state(proc, ProcState::TransientBackground);
        raise_group(proc, SchedGroup::Default);
    }

    // -- role caps ----------------------------------------------------------
    if proc.is_heavy_weight {
        lower_adj(proc, HEAVY_WEIGHT_APP_ADJ, "heavy");
        lower_state(proc, ProcState::HeavyWeight);
    }
    if proc.is_home {
        lower_adj(proc, HOME_APP_ADJ, "home");
        lower_state(proc, ProcState::Home);
    }
    if proc.is_previous {
        let until = proc.previous_since + ctx.config.max_previous_time_ms;
        if ctx.now < until {
            lower_adj(proc, PREVIOUS_APP_ADJ, "previous");
            lower_state(proc, ProcState::LastActivity);
            proc.schedule_followup(until);
        } else {
            lower_state(proc, ProcState::LastActivity);
        }
    }
    if proc.is_backup_target {
        lower_adj(proc, BACKUP_APP_ADJ, "backup");
        lower_state(proc, ProcState::Backup);
    }

    // -- started services ---------------------------------------------------
    if let Some((last_activity, keep_warming)) = proc.started_service_activity() {
        let until = last_activity + ctx.config.max_service_inactivity_ms;
        if keep_warming || ctx.now < until {
            lower_adj(proc, SERVICE_ADJ, "started-services");
            lower_state(proc, ProcState::Service);
            if !keep_warming {
                proc.schedule_followup(until);
            }
        }
    }

    // -- providers ----------------------------------------------------------
    if proc.providers.iter().any(|p| p.has_external_handles) {
        lower_adj(proc, FOREGROUND_APP_ADJ, "ext-provider");
        lower_state(proc, ProcState::ImportantForeground);
    }
    if let Some(last) = proc.last_provider_time {
        let until = last + ctx.config.provider_retain_ms;
        if ctx.now < until {
            lower_adj(proc, PREVIOUS_APP_ADJ, "recent-provider");
            lower_state(proc, ProcState::LastActivity);
            proc.schedule_followup(until);
        }
    }

    // -- temp allowlist ------------------------------------------------------
    if ctx.temp_allowlist.contains(&proc.uid) {
        proc.cur_cpu_time_reasons |= CpuTimeReason::TEMP_ALLOWLIST;
        proc.should_not_freeze = true;
        proc.should_not_freeze_reason |= FreezeVeto::TEMP_ALLOWLIST;
    }
    if proc.freeze_exempt {
        proc.should_not_freeze = true;
        proc.should_not_freeze_reason |= FreezeVeto::EXEMPT_PACKAGE;
    }

    // Default capabilities for the intrinsic procstate, so clients expose
    // them to hosts during traversal. The driver recomposes against the
    // final procstate after connections settle; states only improve from
    // here, so these grants never have to be revoked.
    if proc.cur_raw_proc_state <= ProcState::BoundTop {
        proc.cur_capability |= Capability::all_granted();
    }
    if proc.cur_raw_proc_state <= ProcState::BoundForegroundService {
        proc.cur_capability |= Capability::POWER_RESTRICTED_NETWORK;
    }
    if !proc.cur_cpu_time_reasons.is_empty() {
        proc.cur_capability |= Capability::CPU_TIME;
    }

    // max_adj caps from above for everyone that got this far.
    if proc.cur_raw_adj > proc.max_adj {
        proc.cur_raw_adj = proc.max_adj;
        proc.adj_type = "fixed";
    }
    proc.cur_adj = proc.cur_raw_adj;
    proc.cur_proc_state = proc.cur_raw_proc_state;
}

/// While-in-use capabilities from declared foreground-service types.
///
/// Camera and microphone are gated by the platform-compat change: when it
/// is enabled for the app the types must be declared explicitly; when
/// disabled both are granted regardless of the mask.
fn fgs_type_capabilities(
    types: FgsTypeMask,
    uid: Uid,
    ctx: &ComputeContext<'_>,
) -> Capability {
    let mut caps = Capability::empty();
    if types.contains(FgsTypeMask::LOCATION) {
        caps |= Capability::FG_LOCATION;
    }
    if types.contains(FgsTypeMask::MEDIA_PLAYBACK) {
        caps |= Capability::FG_AUDIO_CONTROL;
    }
    let gated = ctx
        .compat
        .is_change_enabled(CompatChange::CameraMicrophoneCapability, uid);
    if gated {
        if types.contains(FgsTypeMask::CAMERA) {
            caps |= Capability::FG_CAMERA;
        }
        if types.contains(FgsTypeMask::MICROPHONE) {
            caps |= Capability::FG_MICROPHONE;
        }
    } else {
        caps |= Capability::FG_CAMERA | Capability::FG_MICROPHONE;
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::AllChangesEnabled;
    use triage_common::adj::{PERSISTENT_PROC_ADJ, UNKNOWN_ADJ};

    struct NoChanges;
    impl PlatformCompat for NoChanges {
        fn is_change_enabled(&self, _change: CompatChange, _uid: Uid) -> bool {
            false
        }
    }

    fn ctx<'a>(
        allowlist: &'a FxHashSet<Uid>,
        compat: &'a dyn PlatformCompat,
        config: &'a AdjusterConfig,
    ) -> ComputeContext<'a> {
        ComputeContext {
            now: 100_000,
            top: None,
            top_proc_state: ProcState::Top,
            wakefulness: Wakefulness::Awake,
            temp_allowlist: allowlist,
            compat,
            config,
            doing_all: true,
        }
    }

    fn fresh(id: u64) -> ProcessRecord {
        let mut p = ProcessRecord::new(ProcessId(id), id as i32, 10_000, 0, "test.proc");
        p.reset_computed(1);
        p
    }

    #[test]
    fn test_empty_process_stays_cached_placeholder() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, UNKNOWN_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::CachedEmpty);
        assert_eq!(p.cur_sched_group, SchedGroup::Background);
    }

    #[test]
    fn test_top_process_awake() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let mut c = ctx(&allow, &compat, &config);
        c.top = Some(ProcessId(1));
        let mut p = fresh(1);
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, FOREGROUND_APP_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::Top);
        assert_eq!(p.cur_sched_group, SchedGroup::TopApp);
        assert_eq!(p.adj_type, "top-activity");
    }

    #[test]
    fn test_top_process_sleeping() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let mut c = ctx(&allow, &compat, &config);
        c.top = Some(ProcessId(1));
        c.top_proc_state = ProcState::TopSleeping;
        c.wakefulness = Wakefulness::Asleep;
        let mut p = fresh(1);
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, FOREGROUND_APP_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::TopSleeping);
        assert_eq!(p.cur_sched_group, SchedGroup::Background);
    }

    #[test]
    fn test_persistent_pinned() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.max_adj = PERSISTENT_PROC_ADJ;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, PERSISTENT_PROC_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::Persistent);
        assert_eq!(p.cur_capability, Capability::all_granted());
    }

    #[test]
    fn test_visible_activity_with_layer() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.activity_flags = ActivityFlags::HAS_ACTIVITIES | ActivityFlags::VISIBLE;
        p.visible_app_layer = 2;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, VISIBLE_APP_ADJ + 2);
        assert_eq!(p.adj_type, "vis-activity");
        assert_eq!(p.cur_sched_group, SchedGroup::Default);
    }

    #[test]
    fn test_stopping_not_finishing_keeps_last_activity_state() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.activity_flags = ActivityFlags::HAS_ACTIVITIES | ActivityFlags::STOPPING;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_proc_state, ProcState::LastActivity);

        let mut q = fresh(2);
        q.activity_flags =
            ActivityFlags::HAS_ACTIVITIES | ActivityFlags::STOPPING | ActivityFlags::FINISHING;
        compute_intrinsic(&mut q, &c);
        assert_eq!(q.cur_raw_proc_state, ProcState::CachedEmpty);
    }

    #[test]
    fn test_regular_fgs_grants_bfsl() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.has_foreground_services = true;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, PERCEPTIBLE_APP_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::ForegroundService);
        assert!(p.cur_capability.contains(Capability::BFSL));
    }

    #[test]
    fn test_short_fgs_no_bfsl_and_weaker() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.short_fgs_deadline = Some(c.now + 5_000);
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, PERCEPTIBLE_MEDIUM_APP_ADJ + 1);
        assert_eq!(p.cur_raw_proc_state, ProcState::ForegroundService);
        assert!(!p.cur_capability.contains(Capability::BFSL));
        assert_eq!(p.followup_update_uptime, Some(c.now + 5_000));
    }

    #[test]
    fn test_short_fgs_expired_floor_gone() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.short_fgs_deadline = Some(c.now - 1);
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, UNKNOWN_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::CachedEmpty);
    }

    #[test]
    fn test_fgs_camera_mic_gating() {
        let allow = FxHashSet::default();
        let config = AdjusterConfig::default();

        // Change enabled, types declared: granted.
        let compat = AllChangesEnabled;
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.has_foreground_services = true;
        p.fgs_types = FgsTypeMask::CAMERA | FgsTypeMask::MICROPHONE;
        compute_intrinsic(&mut p, &c);
        assert!(p.cur_capability.contains(Capability::FG_CAMERA | Capability::FG_MICROPHONE));

        // Change enabled, types not declared: withheld.
        let mut p = fresh(2);
        p.has_foreground_services = true;
        compute_intrinsic(&mut p, &c);
        assert!(!p.cur_capability.intersects(Capability::FG_CAMERA | Capability::FG_MICROPHONE));

        // Change disabled: both granted regardless of mask.
        let compat = NoChanges;
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(3);
        p.has_foreground_services = true;
        compute_intrinsic(&mut p, &c);
        assert!(p.cur_capability.contains(Capability::FG_CAMERA | Capability::FG_MICROPHONE));
    }

    #[test]
    fn test_recent_top_fgs_grace() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.has_foreground_services = true;
        p.last_top_time = c.now - 5_000;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ);
        assert_eq!(
            p.followup_update_uptime,
            Some(p.last_top_time + config.top_to_fgs_grace_ms)
        );
    }

    #[test]
    fn test_home_and_heavy_caps() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.is_home = true;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, HOME_APP_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::Home);

        let mut p = fresh(2);
        p.is_heavy_weight = true;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, HEAVY_WEIGHT_APP_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::HeavyWeight);
    }

    #[test]
    fn test_previous_expires() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);

        let mut p = fresh(1);
        p.is_previous = true;
        p.previous_since = c.now - 1_000;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, PREVIOUS_APP_ADJ);

        let mut p = fresh(2);
        p.is_previous = true;
        p.previous_since = c.now.saturating_sub(config.max_previous_time_ms + 1);
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, UNKNOWN_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::LastActivity);
    }

    #[test]
    fn test_started_service_window() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);

        let mut p = fresh(1);
        p.services.push(crate::record::ServiceRecord {
            id: crate::record::ServiceId(1),
            is_start_requested: true,
            last_activity_ms: c.now - 1_000,
            keep_warming: false,
            connections: Vec::new(),
        });
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, SERVICE_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::Service);

        // Inactive past the window: floor gone.
        let mut p = fresh(2);
        p.services.push(crate::record::ServiceRecord {
            id: crate::record::ServiceId(2),
            is_start_requested: true,
            last_activity_ms: 0,
            keep_warming: false,
            connections: Vec::new(),
        });
        let mut c2 = ctx(&allow, &compat, &config);
        c2.now = config.max_service_inactivity_ms + 1;
        compute_intrinsic(&mut p, &c2);
        assert_eq!(p.cur_raw_adj, UNKNOWN_ADJ);
    }

    #[test]
    fn test_temp_allowlist_grants_cpu_reason() {
        let mut allow = FxHashSet::default();
        allow.insert(10_000);
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        compute_intrinsic(&mut p, &c);
        assert!(p.cur_cpu_time_reasons.contains(CpuTimeReason::TEMP_ALLOWLIST));
        assert!(p.should_not_freeze);
        assert!(p.should_not_freeze_reason.contains(FreezeVeto::TEMP_ALLOWLIST));
    }

    #[test]
    fn test_broadcast_uses_delivery_group() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.is_receiving_broadcast = true;
        p.broadcast_sched_group = SchedGroup::Default;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, FOREGROUND_APP_ADJ);
        assert_eq!(p.cur_raw_proc_state, ProcState::Receiver);
        assert_eq!(p.cur_sched_group, SchedGroup::Default);
    }

    #[test]
    fn test_max_adj_caps_from_above() {
        let allow = FxHashSet::default();
        let compat = AllChangesEnabled;
        let config = AdjusterConfig::default();
        let c = ctx(&allow, &compat, &config);
        let mut p = fresh(1);
        p.max_adj = SERVICE_ADJ;
        compute_intrinsic(&mut p, &c);
        assert_eq!(p.cur_raw_adj, SERVICE_ADJ);
        assert_eq!(p.adj_type, "fixed");
    }
}
