//! The state controller: the public mutation surface, batched async
//! sessions, the applier thread, and effect dispatch to observers.
//!
//! ## Locking
//!
//! All adjuster state lives in [`AdjusterCore`] behind one
//! `parking_lot::Mutex` -- the service lock. Every mutation and every
//! update pass runs fully synchronously under it. Observer callbacks are
//! invoked after the pass with the lock released and must not call back
//! into the adjuster. Scheduling-group changes, which may block on the
//! kernel, are posted to the applier thread instead.
//!
//! ## Sessions
//!
//! Producers that want to batch several mutations open a
//! [`MutationSession`]. Staged mutations land in a lock-free MPSC queue;
//! dropping (or closing) the outermost session posts one flush job to the
//! applier thread, which drains the queue in FIFO order under the lock and
//! then runs the requested update. Cancelling a session leaves its staged
//! items in the queue for the next flush -- nothing is silently dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{trace, warn};
use parking_lot::Mutex;

use triage_common::adj::UNKNOWN_ADJ;
use triage_common::{
    ActivityFlags, BindFlags, Capability, FgsTypeMask, OomAdjReason, Pid, ProcState, SchedGroup,
    Uid, Wakefulness,
};

use crate::clock::{Clock, SystemClock};
use crate::config::AdjusterConfig;
use crate::connection::{compute_service_host, ClientView};
use crate::compute::ComputeContext;
use crate::core::AdjusterCore;
use crate::driver::PassEffects;
use crate::observer::{AdjusterObserver, AllChangesEnabled, PlatformCompat};
use crate::record::{ConnId, ProcessId, ProvConnId, ProviderId, ServiceId};
use crate::store::ConnectionOpts;

// ---------------------------------------------------------------------------
// Process registration
// ---------------------------------------------------------------------------

/// Facts known at process start.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub pid: Pid,
    pub uid: Uid,
    pub user_id: u32,
    pub name: String,
    pub max_adj: i16,
    pub is_sdk_sandbox: bool,
    pub is_isolated: bool,
    pub isolated_owner: Option<ProcessId>,
    pub freeze_exempt: bool,
    pub connection_group: u32,
    /// Process attached but attach has not finished; its attributes stay
    /// pinned until `finish_attach`.
    pub pending_finish_attach: bool,
}

impl ProcessSpec {
    pub fn new(pid: Pid, uid: Uid, user_id: u32, name: impl Into<String>) -> Self {
        ProcessSpec {
            pid,
            uid,
            user_id,
            name: name.into(),
            max_adj: UNKNOWN_ADJ,
            is_sdk_sandbox: false,
            is_isolated: false,
            isolated_owner: None,
            freeze_exempt: false,
            connection_group: 0,
            pending_finish_attach: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Applier jobs and staged mutations
// ---------------------------------------------------------------------------

enum ApplierJob {
    /// Drain the staged-mutation queue and optionally run an update.
    Flush { update: Option<OomAdjReason> },
    SetProcessGroup {
        pid: Pid,
        group: SchedGroup,
        process_name: String,
        ui_boost: Option<bool>,
    },
    OomAdjBatch(Vec<(Pid, Uid, i16)>),
    Shutdown,
}

/// One staged mutation from an async session.
enum StagedMutation {
    SetTop {
        target: Option<ProcessId>,
        clear_previous: bool,
    },
    SetHasActivity(ProcessId, bool),
    SetActivityFlags {
        id: ProcessId,
        flags: ActivityFlags,
        visible_layer: i16,
        perceptible_stop_uptime: Option<u64>,
    },
    SetHasRecentTasks(ProcessId, bool),
    SetHasTopUi(ProcessId, bool),
    SetHasOverlayUi(ProcessId, bool),
    SetRunningRemoteAnimation(ProcessId, bool),
    SetHasShownUi(ProcessId, bool),
    SetForcingToImportant(ProcessId, bool),
    SetNotificationShadeExpanded(bool),
}

// ---------------------------------------------------------------------------
// Adjuster
// ---------------------------------------------------------------------------

/// The process importance adjuster.
///
/// Constructed once by the host service with a context handle for the
/// platform-compat cache; torn down when the service shuts down.
pub struct Adjuster {
    core: Arc<Mutex<AdjusterCore>>,
    clock: Arc<dyn Clock>,
    observers: Arc<Mutex<Vec<Arc<dyn AdjusterObserver>>>>,
    staged_tx: Sender<StagedMutation>,
    staged_rx: Receiver<StagedMutation>,
    jobs_tx: Sender<ApplierJob>,
    jobs_high_tx: Sender<ApplierJob>,
    session_depth: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
    applier: Mutex<Option<JoinHandle<()>>>,
}

impl Adjuster {
    pub fn new(
        config: AdjusterConfig,
        clock: Arc<dyn Clock>,
        compat: Arc<dyn PlatformCompat>,
    ) -> Self {
        let core = Arc::new(Mutex::new(AdjusterCore::new(config, compat)));
        let observers: Arc<Mutex<Vec<Arc<dyn AdjusterObserver>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let (staged_tx, staged_rx) = unbounded();
        let (jobs_tx, jobs_rx) = unbounded();
        let (jobs_high_tx, jobs_high_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let applier = spawn_applier(
            Arc::clone(&core),
            Arc::clone(&clock),
            Arc::clone(&observers),
            staged_rx.clone(),
            jobs_rx,
            jobs_high_rx,
            jobs_tx.clone(),
            Arc::clone(&shutdown),
        );

        Adjuster {
            core,
            clock,
            observers,
            staged_tx,
            staged_rx,
            jobs_tx,
            jobs_high_tx,
            session_depth: Arc::new(AtomicU32::new(0)),
            shutdown,
            applier: Mutex::new(Some(applier)),
        }
    }

    /// Production defaults: system clock, every compat change enabled.
    pub fn with_defaults(config: AdjusterConfig) -> Self {
        Adjuster::new(
            config,
            Arc::new(SystemClock::new()),
            Arc::new(AllChangesEnabled),
        )
    }

    pub fn register_observer(&self, observer: Arc<dyn AdjusterObserver>) {
        self.observers.lock().push(observer);
    }

    fn now(&self) -> u64 {
        self.clock.uptime_ms()
    }

    // -- process lifecycle -------------------------------------------------

    pub fn register_process(&self, spec: ProcessSpec) -> ProcessId {
        let mut core = self.core.lock();
        let id = core.store.insert(spec.pid, spec.uid, spec.user_id, &spec.name);
        {
            let proc = core.store.get_mut(id).expect("just inserted");
            proc.max_adj = spec.max_adj;
            proc.is_sdk_sandbox = spec.is_sdk_sandbox;
            proc.is_isolated = spec.is_isolated;
            proc.isolated_owner = spec.isolated_owner;
            proc.freeze_exempt = spec.freeze_exempt;
            proc.connection_group = spec.connection_group;
            proc.is_pending_finish_attach = spec.pending_finish_attach;
        }
        core.enqueue_target(id);
        id
    }

    /// Startup finished; the process becomes adjustable.
    pub fn finish_attach(&self, id: ProcessId) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.is_pending_finish_attach = false;
        }
        core.enqueue_target(id);
    }

    /// Remove a dead process; its former hosts are queued for demotion.
    pub fn unregister_process(&self, id: ProcessId) {
        let mut core = self.core.lock();
        let mut hosts: Vec<ProcessId> = Vec::new();
        if let Some(proc) = core.store.get(id) {
            for &conn_id in &proc.service_bindings {
                if let Some(conn) = core.store.connection(conn_id) {
                    hosts.push(conn.host);
                }
            }
            for &pc_id in &proc.provider_bindings {
                if let Some(pc) = core.store.provider_connection(pc_id) {
                    hosts.push(pc.host);
                }
            }
        }
        core.remove_process(id);
        for host in hosts {
            core.enqueue_target(host);
        }
    }

    pub fn process_id_for_pid(&self, pid: Pid) -> Option<ProcessId> {
        self.core.lock().store.by_pid(pid)
    }

    /// Collaborator API: mark a process most recently used.
    pub fn touch_lru(&self, id: ProcessId) {
        self.core.lock().store.touch(id);
    }

    // -- global mutations ----------------------------------------------------

    pub fn set_top(&self, target: Option<ProcessId>, clear_previous: bool) {
        let now = self.now();
        let top_pid = {
            let mut core = self.core.lock();
            mut_set_top(&mut core, now, target, clear_previous)
        };
        for obs in self.observers_snapshot() {
            obs.on_top_changed(top_pid);
        }
    }

    pub fn set_wakefulness(&self, wakefulness: Wakefulness) {
        let mut core = self.core.lock();
        core.global.wakefulness = wakefulness;
        if let Some(top) = core.global.top {
            core.enqueue_target(top);
        }
    }

    pub fn set_notification_shade_expanded(&self, expanded: bool) {
        self.core.lock().global.notification_shade_expanded = expanded;
    }

    pub fn set_unlocking(&self, unlocking: bool) {
        self.core.lock().global.is_unlocking = unlocking;
    }

    pub fn set_uid_temp_allowlist(&self, uid: Uid, allowed: bool) {
        let mut core = self.core.lock();
        if allowed {
            core.global.temp_allowlist.insert(uid);
        } else {
            core.global.temp_allowlist.remove(&uid);
        }
        let members: Vec<ProcessId> = core
            .store
            .ids()
            .filter(|&id| core.store.get(id).is_some_and(|p| p.uid == uid))
            .collect();
        for id in members {
            core.enqueue_target(id);
        }
    }

    pub fn set_backup_target(&self, id: ProcessId, user: u32) {
        let mut core = self.core.lock();
        core.global.backup_targets.insert(user, id);
        if let Some(proc) = core.store.get_mut(id) {
            proc.is_backup_target = true;
        }
        core.enqueue_target(id);
    }

    pub fn stop_backup_target(&self, user: u32) {
        let mut core = self.core.lock();
        if let Some(id) = core.global.backup_targets.remove(&user) {
            if let Some(proc) = core.store.get_mut(id) {
                proc.is_backup_target = false;
            }
            core.enqueue_target(id);
        }
    }

    // -- per-process role mutations ------------------------------------------

    pub fn set_previous(&self, target: Option<ProcessId>) {
        let now = self.now();
        let mut core = self.core.lock();
        mut_set_single_role(&mut core, target, |p| &mut p.is_previous);
        if let Some(id) = target {
            if let Some(proc) = core.store.get_mut(id) {
                proc.previous_since = now;
            }
        }
    }

    pub fn set_home(&self, target: Option<ProcessId>) {
        let mut core = self.core.lock();
        mut_set_single_role(&mut core, target, |p| &mut p.is_home);
    }

    pub fn set_heavy_weight(&self, target: Option<ProcessId>) {
        let mut core = self.core.lock();
        mut_set_single_role(&mut core, target, |p| &mut p.is_heavy_weight);
    }

    pub fn set_has_activity(&self, id: ProcessId, has_activity: bool) {
        let mut core = self.core.lock();
        mut_set_has_activity(&mut core, id, has_activity);
    }

    pub fn set_activity_flags(
        &self,
        id: ProcessId,
        flags: ActivityFlags,
        visible_layer: i16,
        perceptible_stop_uptime: Option<u64>,
    ) {
        let mut core = self.core.lock();
        mut_set_activity_flags(&mut core, id, flags, visible_layer, perceptible_stop_uptime);
    }

    pub fn set_has_recent_tasks(&self, id: ProcessId, has: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, has, |p, v| p.has_recent_tasks = v);
    }

    pub fn set_has_top_ui(&self, id: ProcessId, has: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, has, |p, v| p.has_top_ui = v);
    }

    pub fn set_has_overlay_ui(&self, id: ProcessId, has: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, has, |p, v| p.has_overlay_ui = v);
    }

    pub fn set_running_remote_animation(&self, id: ProcessId, running: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, running, |p, v| p.is_running_remote_anim = v);
    }

    pub fn set_has_shown_ui(&self, id: ProcessId, shown: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, shown, |p, v| p.has_shown_ui = v);
    }

    pub fn set_forcing_to_important(&self, id: ProcessId, forcing: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, forcing, |p, v| p.forcing_to_important = v);
    }

    pub fn set_has_expedited_work(&self, id: ProcessId, has: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, has, |p, v| p.has_expedited_work = v);
    }

    pub fn set_active_instrumentation(&self, id: ProcessId, active: bool) {
        let mut core = self.core.lock();
        mut_set_flag(&mut core, id, active, |p, v| p.has_active_instrumentation = v);
    }

    pub fn set_process_connection_group(&self, id: ProcessId, group: u32) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.connection_group = group;
        }
    }

    // -- services -------------------------------------------------------------

    /// Create a service record on the host without starting it (a
    /// bind-only service).
    pub fn publish_service(&self, host: ProcessId, keep_warming: bool) -> Option<ServiceId> {
        let now = self.now();
        let mut core = self.core.lock();
        core.store.add_service(host, false, keep_warming, now)
    }

    pub fn start_service(&self, host: ProcessId, service: ServiceId) {
        let now = self.now();
        let mut core = self.core.lock();
        if let Some(svc) = core
            .store
            .get_mut(host)
            .and_then(|p| p.find_service_mut(service))
        {
            svc.is_start_requested = true;
            svc.last_activity_ms = now;
        }
        core.enqueue_target(host);
    }

    /// Stop a started service; the record is dropped once no client is
    /// bound to it.
    pub fn stop_service(&self, host: ProcessId, service: ServiceId) {
        let mut core = self.core.lock();
        let remove = match core
            .store
            .get_mut(host)
            .and_then(|p| p.find_service_mut(service))
        {
            Some(svc) => {
                svc.is_start_requested = false;
                svc.connections.is_empty()
            }
            None => false,
        };
        if remove {
            core.store.remove_service(host, service);
        }
        core.enqueue_target(host);
    }

    pub fn start_executing_service(&self, host: ProcessId, foreground: bool) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(host) {
            proc.executing_service_count += 1;
            proc.exec_services_fg |= foreground;
        }
        core.enqueue_target(host);
    }

    pub fn stop_executing_service(&self, host: ProcessId) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(host) {
            proc.executing_service_count = proc.executing_service_count.saturating_sub(1);
            if proc.executing_service_count == 0 {
                proc.exec_services_fg = false;
            }
        }
        core.enqueue_target(host);
    }

    pub fn set_has_foreground_services(
        &self,
        id: ProcessId,
        has_foreground_services: bool,
        fgs_types: FgsTypeMask,
        has_none_type: bool,
    ) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.has_foreground_services = has_foreground_services;
            proc.fgs_types = if has_foreground_services {
                fgs_types
            } else {
                FgsTypeMask::empty()
            };
            proc.fgs_has_none_type = has_foreground_services && has_none_type;
        }
        core.enqueue_target(id);
    }

    pub fn set_short_fgs_info(&self, id: ProcessId, procstate_deadline_ms: u64) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.short_fgs_deadline = Some(procstate_deadline_ms);
        }
        core.enqueue_target(id);
    }

    pub fn clear_short_fgs_info(&self, id: ProcessId) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.short_fgs_deadline = None;
        }
        core.enqueue_target(id);
    }

    // -- bindings -------------------------------------------------------------

    /// Bind a client to a service. The client is queued as an update
    /// target when a dry-run of the propagator says the binding would
    /// promote the host.
    pub fn add_connection(
        &self,
        client: ProcessId,
        host: ProcessId,
        service: ServiceId,
        flags: BindFlags,
        opts: ConnectionOpts,
    ) -> Option<ConnId> {
        let now = self.now();
        let mut core = self.core.lock();
        let conn_id = core.store.add_connection(client, host, service, flags, opts)?;
        if let Some(svc) = core
            .store
            .get_mut(host)
            .and_then(|p| p.find_service_mut(service))
        {
            svc.last_activity_ms = now;
        }
        let effective = opts.attributed_client.unwrap_or(client);
        if connection_would_promote(&mut core, conn_id, now) {
            core.enqueue_target(effective);
        }
        Some(conn_id)
    }

    pub fn remove_connection(&self, conn: ConnId) {
        let mut core = self.core.lock();
        let host = core.store.connection(conn).map(|c| c.host);
        core.store.remove_connection(conn);
        if let Some(host) = host {
            core.enqueue_target(host);
        }
    }

    // -- providers ------------------------------------------------------------

    pub fn add_published_provider(
        &self,
        host: ProcessId,
        has_external_handles: bool,
    ) -> Option<ProviderId> {
        let mut core = self.core.lock();
        let id = core.store.add_provider(host, has_external_handles);
        core.enqueue_target(host);
        id
    }

    pub fn remove_published_provider(&self, host: ProcessId, provider: ProviderId) {
        let mut core = self.core.lock();
        core.store.remove_provider(host, provider);
        core.enqueue_target(host);
    }

    pub fn add_provider_connection(
        &self,
        client: ProcessId,
        host: ProcessId,
        provider: ProviderId,
    ) -> Option<ProvConnId> {
        let mut core = self.core.lock();
        let id = core.store.add_provider_connection(client, host, provider);
        if id.is_some() {
            core.enqueue_target(client);
        }
        id
    }

    pub fn remove_provider_connection(&self, conn: ProvConnId) {
        let mut core = self.core.lock();
        let host = core.store.provider_connection(conn).map(|c| c.host);
        core.store.remove_provider_connection(conn);
        if let Some(host) = host {
            core.enqueue_target(host);
        }
    }

    /// Record a provider access on behalf of a client; the host keeps a
    /// retain-window floor afterwards.
    pub fn set_last_provider_time(&self, id: ProcessId) {
        let now = self.now();
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.last_provider_time = Some(now);
        }
        core.enqueue_target(id);
    }

    // -- broadcasts -----------------------------------------------------------

    pub fn note_broadcast_delivery_started(&self, id: ProcessId, sched_group: SchedGroup) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.is_receiving_broadcast = true;
            proc.broadcast_sched_group = sched_group;
        }
        core.enqueue_target(id);
    }

    pub fn note_broadcast_delivery_ended(&self, id: ProcessId) {
        let mut core = self.core.lock();
        if let Some(proc) = core.store.get_mut(id) {
            proc.is_receiving_broadcast = false;
            proc.broadcast_sched_group = SchedGroup::Background;
        }
        core.enqueue_target(id);
    }

    // -- triggers -------------------------------------------------------------

    pub fn enqueue_update_target(&self, id: ProcessId) {
        self.core.lock().enqueue_target(id);
    }

    /// Partial update for one process and everything reachable from it.
    pub fn run_update(&self, id: ProcessId, reason: OomAdjReason) {
        let now = self.now();
        let effects = {
            let mut core = self.core.lock();
            core.enqueue_target(id);
            core.run_pending_update(reason, now)
        };
        self.dispatch(effects);
    }

    pub fn run_pending_update(&self, reason: OomAdjReason) {
        let now = self.now();
        let effects = self.core.lock().run_pending_update(reason, now);
        self.dispatch(effects);
    }

    pub fn run_full_update(&self, reason: OomAdjReason) {
        let now = self.now();
        let effects = self.core.lock().run_full_update(reason, now);
        self.dispatch(effects);
    }

    pub fn run_followup_update(&self) {
        let now = self.now();
        let effects = self.core.lock().run_followup_update(now);
        self.dispatch(effects);
    }

    /// Synchronously drain staged session mutations and, if asked, run the
    /// pending update. The applier thread uses this for flush jobs.
    pub fn flush_staged(&self, update: Option<OomAdjReason>) {
        let now = self.now();
        let effects = {
            let mut core = self.core.lock();
            let mut top_changes: Vec<Option<Pid>> = Vec::new();
            while let Ok(m) = self.staged_rx.try_recv() {
                apply_staged(&mut core, m, now, &mut top_changes);
            }
            let effects = match update {
                Some(reason) => core.run_pending_update(reason, now),
                None => PassEffects::default(),
            };
            drop(core);
            for top in top_changes {
                for obs in self.observers_snapshot() {
                    obs.on_top_changed(top);
                }
            }
            effects
        };
        self.dispatch(effects);
    }

    // -- sessions -------------------------------------------------------------

    /// Open an async mutation session. Sessions nest; only the outermost
    /// close posts the flush. `priority` flushes ahead of other applier
    /// work.
    pub fn begin_session(&self, priority: bool) -> MutationSession<'_> {
        self.session_depth.fetch_add(1, Ordering::SeqCst);
        MutationSession {
            adjuster: self,
            priority,
            update: None,
            closed: false,
        }
    }

    // -- inputs / read API ----------------------------------------------------

    pub fn top_process(&self) -> Option<ProcessId> {
        self.core.lock().global.top
    }

    pub fn is_awake(&self) -> bool {
        self.core.lock().global.wakefulness.is_awake()
    }

    pub fn is_unlocking(&self) -> bool {
        self.core.lock().global.is_unlocking
    }

    /// The procstate the top process is currently entitled to.
    pub fn top_proc_state(&self) -> ProcState {
        self.core.lock().global.top_proc_state()
    }

    pub fn notification_shade_expanded(&self) -> bool {
        self.core.lock().global.notification_shade_expanded
    }

    pub fn next_followup_uptime(&self) -> Option<u64> {
        self.core.lock().followups.next_uptime()
    }

    /// Committed attribute snapshot for one process.
    pub fn process_attrs(&self, id: ProcessId) -> Option<ProcessAttrs> {
        let core = self.core.lock();
        core.store.get(id).map(|p| ProcessAttrs {
            pid: p.pid,
            uid: p.uid,
            adj: p.set_adj,
            proc_state: p.set_proc_state,
            sched_group: p.set_sched_group,
            capability: p.set_capability,
            should_not_freeze: p.should_not_freeze,
            adj_type: p.adj_type,
            adj_seq: p.adj_seq,
        })
    }

    /// Run a closure against the full process record; test and dump aid.
    pub fn with_process<R>(
        &self,
        id: ProcessId,
        f: impl FnOnce(&crate::record::ProcessRecord) -> R,
    ) -> Option<R> {
        let core = self.core.lock();
        core.store.get(id).map(f)
    }

    pub fn uid_state(&self, uid: Uid) -> Option<crate::uid::UidRecord> {
        self.core.lock().uids.get(uid).cloned()
    }

    // -- internals ------------------------------------------------------------

    fn observers_snapshot(&self) -> Vec<Arc<dyn AdjusterObserver>> {
        self.observers.lock().clone()
    }

    /// Deliver pass effects. Kernel-facing group changes go through the
    /// applier thread; everything else is emitted inline.
    fn dispatch(&self, effects: PassEffects) {
        if effects.is_empty() {
            return;
        }
        let observers = self.observers_snapshot();
        let batch = self.core.lock().config.batch_oom_adj;
        dispatch_effects(effects, &observers, &self.jobs_tx, batch);
    }
}

impl Drop for Adjuster {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.jobs_high_tx.send(ApplierJob::Shutdown);
        if let Some(handle) = self.applier.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Committed attributes as collaborators last saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessAttrs {
    pub pid: Pid,
    pub uid: Uid,
    pub adj: i16,
    pub proc_state: ProcState,
    pub sched_group: SchedGroup,
    pub capability: Capability,
    pub should_not_freeze: bool,
    pub adj_type: &'static str,
    pub adj_seq: u64,
}

// ---------------------------------------------------------------------------
// MutationSession
// ---------------------------------------------------------------------------

/// Scoped async batch of mutations (see module docs).
pub struct MutationSession<'a> {
    adjuster: &'a Adjuster,
    priority: bool,
    update: Option<OomAdjReason>,
    closed: bool,
}

impl MutationSession<'_> {
    fn stage(&self, m: StagedMutation) {
        let _ = self.adjuster.staged_tx.send(m);
    }

    pub fn set_top(&self, target: Option<ProcessId>, clear_previous: bool) {
        self.stage(StagedMutation::SetTop {
            target,
            clear_previous,
        });
    }

    pub fn set_has_activity(&self, id: ProcessId, has: bool) {
        self.stage(StagedMutation::SetHasActivity(id, has));
    }

    pub fn set_activity_flags(
        &self,
        id: ProcessId,
        flags: ActivityFlags,
        visible_layer: i16,
        perceptible_stop_uptime: Option<u64>,
    ) {
        self.stage(StagedMutation::SetActivityFlags {
            id,
            flags,
            visible_layer,
            perceptible_stop_uptime,
        });
    }

    pub fn set_has_recent_tasks(&self, id: ProcessId, has: bool) {
        self.stage(StagedMutation::SetHasRecentTasks(id, has));
    }

    pub fn set_has_top_ui(&self, id: ProcessId, has: bool) {
        self.stage(StagedMutation::SetHasTopUi(id, has));
    }

    pub fn set_has_overlay_ui(&self, id: ProcessId, has: bool) {
        self.stage(StagedMutation::SetHasOverlayUi(id, has));
    }

    pub fn set_running_remote_animation(&self, id: ProcessId, running: bool) {
        self.stage(StagedMutation::SetRunningRemoteAnimation(id, running));
    }

    pub fn set_has_shown_ui(&self, id: ProcessId, shown: bool) {
        self.stage(StagedMutation::SetHasShownUi(id, shown));
    }

    pub fn set_forcing_to_important(&self, id: ProcessId, forcing: bool) {
        self.stage(StagedMutation::SetForcingToImportant(id, forcing));
    }

    pub fn set_notification_shade_expanded(&self, expanded: bool) {
        self.stage(StagedMutation::SetNotificationShadeExpanded(expanded));
    }

    /// Ask the flush to run an update pass once the batch is applied.
    pub fn request_update(&mut self, reason: OomAdjReason) {
        self.update = Some(reason);
    }

    /// Flush now (outermost session only; inner closes just unwind).
    pub fn close(mut self) {
        self.finish(true);
    }

    /// Leave staged items queued for the next flush without posting one.
    pub fn cancel(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, flush: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        let remaining = self.adjuster.session_depth.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && flush {
            let job = ApplierJob::Flush {
                update: self.update,
            };
            let tx = if self.priority {
                &self.adjuster.jobs_high_tx
            } else {
                &self.adjuster.jobs_tx
            };
            let _ = tx.send(job);
        }
    }
}

impl Drop for MutationSession<'_> {
    fn drop(&mut self) {
        self.finish(true);
    }
}

// ---------------------------------------------------------------------------
// Mutation bodies shared by the sync API and staged apply
// ---------------------------------------------------------------------------

fn mut_set_top(
    core: &mut AdjusterCore,
    now: u64,
    target: Option<ProcessId>,
    clear_previous: bool,
) -> Option<Pid> {
    let old = core.global.top;
    core.global.top = target;
    if let Some(old_id) = old {
        if old != target {
            if let Some(proc) = core.store.get_mut(old_id) {
                proc.last_top_time = now;
                if !clear_previous {
                    proc.is_previous = true;
                    proc.previous_since = now;
                }
            }
            core.enqueue_target(old_id);
        }
    }
    if let Some(new_id) = target {
        if let Some(proc) = core.store.get_mut(new_id) {
            proc.is_previous = false;
        }
        core.enqueue_target(new_id);
    }
    target.and_then(|id| core.store.get(id).map(|p| p.pid))
}

/// Move a single-holder role flag (previous/home/heavy-weight) to a new
/// process, clearing every other holder.
fn mut_set_single_role(
    core: &mut AdjusterCore,
    target: Option<ProcessId>,
    field: impl Fn(&mut crate::record::ProcessRecord) -> &mut bool,
) {
    let ids: Vec<ProcessId> = core.store.ids().collect();
    for id in ids {
        let changed = match core.store.get_mut(id) {
            Some(proc) => {
                let flag = field(proc);
                let should = target == Some(id);
                if *flag != should {
                    *flag = should;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if changed {
            core.enqueue_target(id);
        }
    }
}

fn mut_set_flag(
    core: &mut AdjusterCore,
    id: ProcessId,
    value: bool,
    set: impl Fn(&mut crate::record::ProcessRecord, bool),
) {
    if let Some(proc) = core.store.get_mut(id) {
        set(proc, value);
    }
    core.enqueue_target(id);
}

fn mut_set_has_activity(core: &mut AdjusterCore, id: ProcessId, has: bool) {
    if let Some(proc) = core.store.get_mut(id) {
        proc.activity_flags.set(ActivityFlags::HAS_ACTIVITIES, has);
        if !has {
            proc.activity_flags = ActivityFlags::empty();
        }
    }
    core.enqueue_target(id);
}

fn mut_set_activity_flags(
    core: &mut AdjusterCore,
    id: ProcessId,
    flags: ActivityFlags,
    visible_layer: i16,
    perceptible_stop_uptime: Option<u64>,
) {
    if let Some(proc) = core.store.get_mut(id) {
        proc.activity_flags = flags;
        proc.visible_app_layer = visible_layer;
        proc.perceptible_stop_uptime = perceptible_stop_uptime;
    }
    core.enqueue_target(id);
}

fn apply_staged(
    core: &mut AdjusterCore,
    m: StagedMutation,
    now: u64,
    top_changes: &mut Vec<Option<Pid>>,
) {
    match m {
        StagedMutation::SetTop {
            target,
            clear_previous,
        } => {
            top_changes.push(mut_set_top(core, now, target, clear_previous));
        }
        StagedMutation::SetHasActivity(id, has) => mut_set_has_activity(core, id, has),
        StagedMutation::SetActivityFlags {
            id,
            flags,
            visible_layer,
            perceptible_stop_uptime,
        } => mut_set_activity_flags(core, id, flags, visible_layer, perceptible_stop_uptime),
        StagedMutation::SetHasRecentTasks(id, has) => {
            mut_set_flag(core, id, has, |p, v| p.has_recent_tasks = v)
        }
        StagedMutation::SetHasTopUi(id, has) => {
            mut_set_flag(core, id, has, |p, v| p.has_top_ui = v)
        }
        StagedMutation::SetHasOverlayUi(id, has) => {
            mut_set_flag(core, id, has, |p, v| p.has_overlay_ui = v)
        }
        StagedMutation::SetRunningRemoteAnimation(id, running) => {
            mut_set_flag(core, id, running, |p, v| p.is_running_remote_anim = v)
        }
        StagedMutation::SetHasShownUi(id, shown) => {
            mut_set_flag(core, id, shown, |p, v| p.has_shown_ui = v)
        }
        StagedMutation::SetForcingToImportant(id, forcing) => {
            mut_set_flag(core, id, forcing, |p, v| p.forcing_to_important = v)
        }
        StagedMutation::SetNotificationShadeExpanded(expanded) => {
            core.global.notification_shade_expanded = expanded;
        }
    }
}

/// Dry-run the propagator for a fresh binding to decide whether an update
/// target is worth queueing.
fn connection_would_promote(core: &mut AdjusterCore, conn_id: ConnId, now: u64) -> bool {
    let Some(conn) = core.store.connection(conn_id) else {
        return false;
    };
    let client_id = conn.attributed_client.unwrap_or(conn.client);
    let host_id = conn.host;
    let Some(client) = core.store.get(client_id) else {
        return false;
    };
    if core
        .store
        .get(host_id)
        .is_none_or(|h| h.is_killed || h.is_persistent_system())
    {
        return false;
    }
    let view = ClientView::snapshot(client);
    let mut conn_copy = core.store.connection(conn_id).expect("checked above").clone();
    let ctx = ComputeContext {
        now,
        top: core.global.top,
        top_proc_state: core.global.top_proc_state(),
        wakefulness: core.global.wakefulness,
        temp_allowlist: &core.global.temp_allowlist,
        compat: &*core.compat,
        config: &core.config,
        doing_all: false,
    };
    let host = core.store.get_mut(host_id).expect("checked above");
    compute_service_host(host, &view, &mut conn_copy, &ctx, true)
}

/// Deliver effects to observers. Group changes always travel through the
/// applier thread since the kernel call may block.
fn dispatch_effects(
    effects: PassEffects,
    observers: &[Arc<dyn AdjusterObserver>],
    jobs_tx: &Sender<ApplierJob>,
    batch_oom_adj: bool,
) {
    if batch_oom_adj {
        if !effects.oom_adj.is_empty() {
            let _ = jobs_tx.send(ApplierJob::OomAdjBatch(effects.oom_adj));
        }
    } else {
        for (pid, uid, adj) in effects.oom_adj {
            for obs in observers {
                if let Err(err) = obs.on_oom_adj(pid, uid, adj) {
                    warn!("oom-adj sink failed for pid {}: {}", pid, err);
                }
            }
        }
    }
    for change in effects.groups {
        let _ = jobs_tx.send(ApplierJob::SetProcessGroup {
            pid: change.pid,
            group: change.group,
            process_name: change.process_name,
            ui_boost: change.ui_boost,
        });
    }
    for (pid, state) in effects.proc_states {
        for obs in observers {
            obs.on_proc_state(pid, state);
        }
    }
    for (pid, caps) in effects.capabilities {
        for obs in observers {
            obs.on_capability(pid, caps);
        }
    }
    for (pid, decision) in effects.freezer {
        for obs in observers {
            obs.on_freezer_decision(pid, decision);
        }
    }
    for (uid, flags) in effects.uid_changes {
        for obs in observers {
            obs.on_uid_change(uid, flags);
        }
    }
}

// ---------------------------------------------------------------------------
// Applier thread
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn spawn_applier(
    core: Arc<Mutex<AdjusterCore>>,
    clock: Arc<dyn Clock>,
    observers: Arc<Mutex<Vec<Arc<dyn AdjusterObserver>>>>,
    staged_rx: Receiver<StagedMutation>,
    jobs_rx: Receiver<ApplierJob>,
    jobs_high_rx: Receiver<ApplierJob>,
    jobs_tx: Sender<ApplierJob>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("oomtriage-applier".into())
        .spawn(move || {
            applier_loop(
                core, clock, observers, staged_rx, jobs_rx, jobs_high_rx, jobs_tx, shutdown,
            )
        })
        .expect("spawn applier thread")
}

#[allow(clippy::too_many_arguments)]
fn applier_loop(
    core: Arc<Mutex<AdjusterCore>>,
    clock: Arc<dyn Clock>,
    observers: Arc<Mutex<Vec<Arc<dyn AdjusterObserver>>>>,
    staged_rx: Receiver<StagedMutation>,
    jobs_rx: Receiver<ApplierJob>,
    jobs_high_rx: Receiver<ApplierJob>,
    jobs_tx: Sender<ApplierJob>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        // High-priority jobs first, mirroring session post-to-head.
        let job = match jobs_high_rx.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                let deadline = core.lock().followups.next_uptime();
                let timeout = deadline
                    .map(|d| Duration::from_millis(d.saturating_sub(clock.uptime_ms()).min(500)))
                    .unwrap_or(Duration::from_millis(500));
                crossbeam_channel::select! {
                    recv(jobs_high_rx) -> job => job.ok(),
                    recv(jobs_rx) -> job => job.ok(),
                    default(timeout) => None,
                }
            }
        };

        match job {
            Some(ApplierJob::Shutdown) => break,
            Some(ApplierJob::Flush { update }) => {
                handle_flush(&core, &clock, &observers, &staged_rx, &jobs_tx, update);
            }
            Some(ApplierJob::SetProcessGroup {
                pid,
                group,
                process_name,
                ui_boost,
            }) => {
                let observers = observers.lock().clone();
                for obs in &observers {
                    if let Err(err) = obs.on_process_group(pid, group, &process_name) {
                        warn!("process-group sink failed for {}: {}", process_name, err);
                    }
                    if let Some(boosted) = ui_boost {
                        obs.on_ui_thread_boost(pid, boosted);
                    }
                }
            }
            Some(ApplierJob::OomAdjBatch(batch)) => {
                let observers = observers.lock().clone();
                for obs in &observers {
                    if let Err(err) = obs.on_oom_adj_batch(&batch) {
                        warn!("oom-adj batch sink failed: {}", err);
                    }
                }
            }
            None => {
                // Timer path: fire the follow-up update when due.
                let now = clock.uptime_ms();
                let due = core
                    .lock()
                    .followups
                    .next_uptime()
                    .is_some_and(|d| d <= now);
                if due {
                    trace!("applier firing follow-up update");
                    let effects = core.lock().run_followup_update(now);
                    if !effects.is_empty() {
                        let observers = observers.lock().clone();
                        let batch = core.lock().config.batch_oom_adj;
                        dispatch_effects(effects, &observers, &jobs_tx, batch);
                    }
                }
            }
        }
    }
}

fn handle_flush(
    core: &Arc<Mutex<AdjusterCore>>,
    clock: &Arc<dyn Clock>,
    observers: &Arc<Mutex<Vec<Arc<dyn AdjusterObserver>>>>,
    staged_rx: &Receiver<StagedMutation>,
    jobs_tx: &Sender<ApplierJob>,
    update: Option<OomAdjReason>,
) {
    let now = clock.uptime_ms();
    let (effects, top_changes, batch) = {
        let mut core = core.lock();
        let mut top_changes: Vec<Option<Pid>> = Vec::new();
        while let Ok(m) = staged_rx.try_recv() {
            apply_staged(&mut core, m, now, &mut top_changes);
        }
        let effects = match update {
            Some(reason) => core.run_pending_update(reason, now),
            None => PassEffects::default(),
        };
        (effects, top_changes, core.config.batch_oom_adj)
    };
    let observers = observers.lock().clone();
    for top in top_changes {
        for obs in &observers {
            obs.on_top_changed(top);
        }
    }
    if !effects.is_empty() {
        dispatch_effects(effects, &observers, jobs_tx, batch);
    }
}
