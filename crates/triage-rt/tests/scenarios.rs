//! End-to-end scenarios driven through the public adjuster API.

use std::sync::Arc;

use parking_lot::Mutex;

use triage_common::adj::{
    CACHED_APP_MIN_ADJ, FOREGROUND_APP_ADJ, PERCEPTIBLE_MEDIUM_APP_ADJ, VISIBLE_APP_ADJ,
};
use triage_common::{
    BindFlags, Capability, CompatChange, FgsTypeMask, OomAdjReason, Pid, ProcState, SchedGroup,
    Uid,
};
use triage_rt::{
    Adjuster, AdjusterConfig, AdjusterObserver, AllChangesEnabled, Clock, ConnectionOpts,
    FreezerDecision, ManualClock, PlatformCompat, ProcessId, ProcessSpec, SinkError,
};

#[derive(Default)]
struct Recorder {
    oom_adj: Mutex<Vec<(Pid, Uid, i16)>>,
    proc_states: Mutex<Vec<(Pid, ProcState)>>,
    freezer: Mutex<Vec<(Pid, FreezerDecision)>>,
}

impl Recorder {
    fn callback_count(&self) -> usize {
        self.oom_adj.lock().len() + self.proc_states.lock().len() + self.freezer.lock().len()
    }
}

impl AdjusterObserver for Recorder {
    fn on_oom_adj(&self, pid: Pid, uid: Uid, adj: i16) -> Result<(), SinkError> {
        self.oom_adj.lock().push((pid, uid, adj));
        Ok(())
    }
    fn on_proc_state(&self, pid: Pid, state: ProcState) {
        self.proc_states.lock().push((pid, state));
    }
    fn on_freezer_decision(&self, pid: Pid, decision: FreezerDecision) {
        self.freezer.lock().push((pid, decision));
    }
}

struct NoCompatChanges;
impl PlatformCompat for NoCompatChanges {
    fn is_change_enabled(&self, _change: CompatChange, _uid: Uid) -> bool {
        false
    }
}

struct Fixture {
    adjuster: Adjuster,
    recorder: Arc<Recorder>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    fixture_with(AdjusterConfig::default(), Arc::new(AllChangesEnabled))
}

fn fixture_with(config: AdjusterConfig, compat: Arc<dyn PlatformCompat>) -> Fixture {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let adjuster = Adjuster::new(config, clock.clone() as Arc<dyn Clock>, compat);
    let recorder = Arc::new(Recorder::default());
    adjuster.register_observer(recorder.clone());
    Fixture {
        adjuster,
        recorder,
        clock,
    }
}

fn spawn(adjuster: &Adjuster, pid: Pid) -> ProcessId {
    adjuster.register_process(ProcessSpec::new(
        pid,
        10_000 + pid as Uid,
        0,
        format!("com.example.app{}", pid),
    ))
}

#[test]
fn scenario_top_app_tagging() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let b = spawn(&f.adjuster, 2);
    let c = spawn(&f.adjuster, 3);

    f.adjuster.set_top(Some(a), true);
    f.adjuster.run_full_update(OomAdjReason::SystemInit);

    let attrs = f.adjuster.process_attrs(a).unwrap();
    assert_eq!(attrs.adj, FOREGROUND_APP_ADJ);
    assert_eq!(attrs.proc_state, ProcState::Top);
    assert_eq!(attrs.sched_group, SchedGroup::TopApp);

    for id in [b, c] {
        let attrs = f.adjuster.process_attrs(id).unwrap();
        assert!(attrs.adj >= CACHED_APP_MIN_ADJ, "adj {} not cached", attrs.adj);
        assert_eq!(attrs.proc_state, ProcState::CachedEmpty);
    }
}

#[test]
fn scenario_bound_top_propagation() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let b = spawn(&f.adjuster, 2);
    let c = spawn(&f.adjuster, 3);

    f.adjuster.set_top(Some(a), true);
    f.adjuster.run_full_update(OomAdjReason::SystemInit);

    // A cached client with a foreground-service flag moves nothing.
    let svc = f.adjuster.publish_service(c, false).unwrap();
    f.adjuster
        .add_connection(b, c, svc, BindFlags::FOREGROUND_SERVICE, ConnectionOpts::default())
        .unwrap();
    f.adjuster.run_full_update(OomAdjReason::BindService);
    assert_eq!(
        f.adjuster.process_attrs(c).unwrap().proc_state,
        ProcState::CachedEmpty
    );

    // The top process binding with no flags pulls the host to bound-top.
    let conn = f
        .adjuster
        .add_connection(a, c, svc, BindFlags::empty(), ConnectionOpts::default())
        .unwrap();
    f.adjuster.run_pending_update(OomAdjReason::BindService);
    let attrs = f.adjuster.process_attrs(c).unwrap();
    assert_eq!(attrs.proc_state, ProcState::BoundTop);
    assert_eq!(attrs.adj, VISIBLE_APP_ADJ);
    assert_eq!(attrs.sched_group, SchedGroup::Default);

    // Unbinding drops the host back to the cached ladder.
    f.adjuster.remove_connection(conn);
    f.adjuster.run_pending_update(OomAdjReason::UnbindService);
    let attrs = f.adjuster.process_attrs(c).unwrap();
    assert_eq!(attrs.proc_state, ProcState::CachedEmpty);
    assert!(attrs.adj >= CACHED_APP_MIN_ADJ);
}

#[test]
fn scenario_cyclic_binding_stabilization() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let b = spawn(&f.adjuster, 2);

    let svc_a = f.adjuster.publish_service(a, false).unwrap();
    let svc_b = f.adjuster.publish_service(b, false).unwrap();
    f.adjuster
        .add_connection(a, b, svc_b, BindFlags::empty(), ConnectionOpts::default())
        .unwrap();
    f.adjuster
        .add_connection(b, a, svc_a, BindFlags::empty(), ConnectionOpts::default())
        .unwrap();

    f.adjuster.run_full_update(OomAdjReason::BindService);

    let retry_limit = AdjusterConfig::default().cycle_retry_limit;
    for id in [a, b] {
        let attrs = f.adjuster.process_attrs(id).unwrap();
        assert_eq!(attrs.proc_state, ProcState::CachedEmpty);
        assert!(attrs.adj >= CACHED_APP_MIN_ADJ);
        f.adjuster
            .with_process(id, |p| assert!(p.revisit_count <= retry_limit))
            .unwrap();
    }
}

#[test]
fn scenario_fgs_capability_gating() {
    // Compat change enabled: declared types decide.
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    f.adjuster.set_has_foreground_services(
        a,
        true,
        FgsTypeMask::CAMERA | FgsTypeMask::MICROPHONE,
        false,
    );
    f.adjuster.run_pending_update(OomAdjReason::StartService);
    let caps = f.adjuster.process_attrs(a).unwrap().capability;
    assert!(caps.contains(Capability::FG_CAMERA | Capability::FG_MICROPHONE));

    let b = spawn(&f.adjuster, 2);
    f.adjuster
        .set_has_foreground_services(b, true, FgsTypeMask::empty(), true);
    f.adjuster.run_pending_update(OomAdjReason::StartService);
    let caps = f.adjuster.process_attrs(b).unwrap().capability;
    assert!(!caps.intersects(Capability::FG_CAMERA | Capability::FG_MICROPHONE));

    // Compat change disabled: both granted regardless of the mask.
    let g = fixture_with(AdjusterConfig::default(), Arc::new(NoCompatChanges));
    let c = spawn(&g.adjuster, 3);
    g.adjuster
        .set_has_foreground_services(c, true, FgsTypeMask::empty(), true);
    g.adjuster.run_pending_update(OomAdjReason::StartService);
    let caps = g.adjuster.process_attrs(c).unwrap().capability;
    assert!(caps.contains(Capability::FG_CAMERA | Capability::FG_MICROPHONE));
}

#[test]
fn scenario_short_fgs_has_no_bfsl() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let svc = f.adjuster.publish_service(a, false).unwrap();
    f.adjuster.start_service(a, svc);
    f.adjuster
        .set_short_fgs_info(a, f.clock.uptime_ms() + 60_000);
    f.adjuster.run_pending_update(OomAdjReason::StartService);

    let attrs = f.adjuster.process_attrs(a).unwrap();
    assert_eq!(attrs.adj, PERCEPTIBLE_MEDIUM_APP_ADJ + 1);
    assert_eq!(attrs.proc_state, ProcState::ForegroundService);
    assert!(!attrs.capability.contains(Capability::BFSL));

    // Timeout expiry demotes to the started-service level (or lower).
    f.clock.advance(60_001);
    f.adjuster.run_followup_update();
    let attrs = f.adjuster.process_attrs(a).unwrap();
    assert!(attrs.proc_state >= ProcState::Service);
}

#[test]
fn scenario_partial_update_reachability() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let b = spawn(&f.adjuster, 2);
    let c = spawn(&f.adjuster, 3);
    let d = spawn(&f.adjuster, 4);
    let e = spawn(&f.adjuster, 5);
    f.adjuster.run_full_update(OomAdjReason::SystemInit);

    let svc_b = f.adjuster.publish_service(b, false).unwrap();
    let svc_c = f.adjuster.publish_service(c, false).unwrap();
    f.adjuster
        .add_connection(a, b, svc_b, BindFlags::empty(), ConnectionOpts::default())
        .unwrap();
    f.adjuster
        .add_connection(b, c, svc_c, BindFlags::empty(), ConnectionOpts::default())
        .unwrap();

    let seq_d = f.adjuster.process_attrs(d).unwrap().adj_seq;
    let seq_e = f.adjuster.process_attrs(e).unwrap().adj_seq;

    f.adjuster.set_top(Some(a), true);
    f.adjuster.run_update(a, OomAdjReason::Activity);

    let seq_a = f.adjuster.process_attrs(a).unwrap().adj_seq;
    assert_eq!(f.adjuster.process_attrs(b).unwrap().adj_seq, seq_a);
    assert_eq!(f.adjuster.process_attrs(c).unwrap().adj_seq, seq_a);
    assert!(seq_a > seq_d);
    assert_eq!(f.adjuster.process_attrs(d).unwrap().adj_seq, seq_d);
    assert_eq!(f.adjuster.process_attrs(e).unwrap().adj_seq, seq_e);

    assert_eq!(f.adjuster.process_attrs(a).unwrap().proc_state, ProcState::Top);
    assert_eq!(f.adjuster.process_attrs(b).unwrap().proc_state, ProcState::BoundTop);
}

#[test]
fn scenario_lru_ladder_tiered_mode() {
    let f = fixture();
    let x = spawn(&f.adjuster, 1);
    let y = spawn(&f.adjuster, 2);
    let z = spawn(&f.adjuster, 3);

    f.adjuster.run_full_update(OomAdjReason::SystemInit);

    let config = AdjusterConfig::default();
    let expected = CACHED_APP_MIN_ADJ + 10 + config.ui_tier_size;
    for id in [x, y, z] {
        assert_eq!(f.adjuster.process_attrs(id).unwrap().adj, expected);
    }
}

#[test]
fn scenario_freezer_policy_transition() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    // Perceptible and entitled to cpu time: stays unfrozen.
    f.adjuster.set_forcing_to_important(a, true);
    f.adjuster.run_pending_update(OomAdjReason::UiVisibility);
    assert!(f
        .adjuster
        .process_attrs(a)
        .unwrap()
        .capability
        .has_cpu_time());
    assert!(f.recorder.freezer.lock().iter().all(|&(pid, _)| pid != 1));

    // Losing the grant produces exactly one freeze decision.
    f.adjuster.set_forcing_to_important(a, false);
    f.adjuster.run_pending_update(OomAdjReason::UiVisibility);
    let decisions: Vec<FreezerDecision> = f
        .recorder
        .freezer
        .lock()
        .iter()
        .filter(|&&(pid, _)| pid == 1)
        .map(|&(_, d)| d)
        .collect();
    assert_eq!(decisions, vec![FreezerDecision::Freeze { immediate: false }]);
}

#[test]
fn repeated_pass_is_quiescent() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    spawn(&f.adjuster, 2);
    f.adjuster.set_top(Some(a), true);
    f.adjuster.run_full_update(OomAdjReason::SystemInit);

    let after_first = f.recorder.callback_count();
    f.adjuster.run_full_update(OomAdjReason::SystemInit);
    f.adjuster.run_full_update(OomAdjReason::SystemInit);
    assert_eq!(f.recorder.callback_count(), after_first);
}

#[test]
fn independent_mutations_commute() {
    let run = |first_shown_ui: bool| {
        let f = fixture();
        let a = spawn(&f.adjuster, 1);
        let b = spawn(&f.adjuster, 2);
        if first_shown_ui {
            f.adjuster.set_has_shown_ui(a, true);
            f.adjuster.set_has_recent_tasks(b, true);
        } else {
            f.adjuster.set_has_recent_tasks(b, true);
            f.adjuster.set_has_shown_ui(a, true);
        }
        f.adjuster.run_full_update(OomAdjReason::SystemInit);
        (
            f.adjuster.process_attrs(a).unwrap(),
            f.adjuster.process_attrs(b).unwrap(),
        )
    };
    let (a1, b1) = run(true);
    let (a2, b2) = run(false);
    assert_eq!(a1, a2);
    assert_eq!(b1, b2);
}

#[test]
fn committed_attributes_converge_after_pass() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let b = spawn(&f.adjuster, 2);
    f.adjuster.set_top(Some(a), true);
    let svc = f.adjuster.publish_service(b, false).unwrap();
    f.adjuster
        .add_connection(a, b, svc, BindFlags::IMPORTANT, ConnectionOpts::default())
        .unwrap();
    f.adjuster.run_full_update(OomAdjReason::SystemInit);

    for id in [a, b] {
        f.adjuster
            .with_process(id, |p| {
                assert_eq!(p.set_adj, p.cur_adj);
                assert_eq!(p.set_proc_state, p.cur_proc_state);
                assert_eq!(p.set_sched_group, p.cur_sched_group);
                assert_eq!(p.set_capability, p.cur_capability);
                assert!(!p.reachable);
            })
            .unwrap();
    }
}

#[test]
fn waived_binding_keeps_host_unfrozen() {
    let f = fixture();
    let a = spawn(&f.adjuster, 1);
    let b = spawn(&f.adjuster, 2);
    f.adjuster.set_top(Some(a), true);
    let svc = f.adjuster.publish_service(b, false).unwrap();
    f.adjuster
        .add_connection(a, b, svc, BindFlags::WAIVE_PRIORITY, ConnectionOpts::default())
        .unwrap();
    f.adjuster.run_full_update(OomAdjReason::BindService);

    let attrs = f.adjuster.process_attrs(b).unwrap();
    // No priority flows through a waived binding...
    assert_eq!(attrs.proc_state, ProcState::CachedEmpty);
    assert!(attrs.adj >= CACHED_APP_MIN_ADJ);
    // ...but the host must not be frozen while its client is non-cached.
    assert!(attrs.should_not_freeze);
    assert!(f.recorder.freezer.lock().iter().all(|&(pid, d)| {
        pid != 2 || matches!(d, FreezerDecision::Unfreeze { .. })
    }));
}
