//! Update passes.
//!
//! A pass turns staged facts into committed attributes: every in-scope
//! process is re-computed from intrinsic facts, connection effects are
//! propagated in priority order over the two queues, the cached tier is
//! laddered from the LRU, and the apply step emits one callback per
//! attribute that actually changed.
//!
//! ## Cycle handling
//!
//! Bindings form arbitrary cycles. The traversal tolerates them because
//! every propagation rule is monotone: a promoted host is re-inserted into
//! the queue at its better slot and its outgoing edges re-evaluated, so
//! information flows around a cycle in finite rounds. The per-process
//! revisit budget bounds termination; a process that exhausts it keeps its
//! last computed values.

use std::collections::VecDeque;

use log::{debug, error, trace, warn};
use rustc_hash::FxHashSet;

use triage_common::adj::UNKNOWN_ADJ;
use triage_common::{Capability, OomAdjReason, Pid, ProcState, SchedGroup, Uid, UidChangeFlags};

use crate::compute::{compute_intrinsic, ComputeContext};
use crate::connection::{compute_provider_host, compute_service_host, ClientView};
use crate::core::AdjusterCore;
use crate::followup::FollowUps;
use crate::freezer::should_freeze;
use crate::index::PriorityIndex;
use crate::ladder::assign_ladder_adjs;
use crate::observer::FreezerDecision;
use crate::record::ProcessId;
use crate::store::ProcessStore;

/// A scheduling-group change to deliver, with the optional UI-thread
/// boost transition when the top-app boundary was crossed.
#[derive(Debug, Clone)]
pub struct GroupChange {
    pub pid: Pid,
    pub group: SchedGroup,
    pub process_name: String,
    pub ui_boost: Option<bool>,
}

/// Everything one pass decided to tell the collaborators.
#[derive(Debug, Default)]
pub struct PassEffects {
    pub oom_adj: Vec<(Pid, Uid, i16)>,
    pub groups: Vec<GroupChange>,
    pub proc_states: Vec<(Pid, ProcState)>,
    pub capabilities: Vec<(Pid, Capability)>,
    pub freezer: Vec<(Pid, FreezerDecision)>,
    pub uid_changes: Vec<(Uid, UidChangeFlags)>,
}

impl PassEffects {
    pub fn is_empty(&self) -> bool {
        self.oom_adj.is_empty()
            && self.groups.is_empty()
            && self.proc_states.is_empty()
            && self.capabilities.is_empty()
            && self.freezer.is_empty()
            && self.uid_changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ProcState,
    Adj,
}

impl AdjusterCore {
    /// Recompute every process from scratch.
    pub fn run_full_update(&mut self, reason: OomAdjReason, now: u64) -> PassEffects {
        self.seq += 1;
        self.force_full_next = false;
        let seq = self.seq;
        self.take_pending();
        self.ps_queue.reset(&mut self.store);
        self.adj_queue.reset(&mut self.store);

        let order = self.store.lru_snapshot();
        debug!(
            "full update ({}): {} processes, seq {}",
            reason,
            order.len(),
            seq
        );

        let ctx = ComputeContext {
            now,
            top: self.global.top,
            top_proc_state: self.global.top_proc_state(),
            wakefulness: self.global.wakefulness,
            temp_allowlist: &self.global.temp_allowlist,
            compat: &*self.compat,
            config: &self.config,
            doing_all: true,
        };
        for &id in &order {
            if let Some(proc) = self.store.get_mut(id) {
                if proc.is_killed {
                    continue;
                }
                proc.reset_computed(seq);
                compute_intrinsic(proc, &ctx);
            }
        }
        for &id in &order {
            if self.store.get(id).is_some_and(|p| !p.is_killed) {
                self.ps_queue.offer(&mut self.store, id);
            }
        }
        drain_queue(
            &mut self.store,
            &mut self.ps_queue,
            &ctx,
            None,
            Phase::ProcState,
            seq,
            self.config.cycle_retry_limit,
        );
        for &id in &order {
            if self.store.get(id).is_some_and(|p| !p.is_killed) {
                self.adj_queue.offer(&mut self.store, id);
            }
        }
        drain_queue(
            &mut self.store,
            &mut self.adj_queue,
            &ctx,
            None,
            Phase::Adj,
            seq,
            self.config.cycle_retry_limit,
        );

        assign_ladder_adjs(&mut self.store, &self.config, now);
        let effects = self.finalize_and_apply(reason, now);
        self.followups.rebuild(&self.store);
        effects
    }

    /// Re-evaluate only the processes transitively reachable from the
    /// targets through outgoing bindings.
    pub fn run_partial_update(
        &mut self,
        targets: Vec<ProcessId>,
        reason: OomAdjReason,
        now: u64,
    ) -> PassEffects {
        if self.config.full_pass_only || self.force_full_next {
            return self.run_full_update(reason, now);
        }
        let targets: Vec<ProcessId> = targets
            .into_iter()
            .filter(|&t| self.store.contains(t))
            .collect();
        if targets.is_empty() {
            return PassEffects::default();
        }
        self.seq += 1;
        let seq = self.seq;

        let reachable = self.collect_reachable(&targets);
        for &id in &reachable {
            if let Some(proc) = self.store.get_mut(id) {
                proc.reachable = true;
            }
        }
        self.ps_queue.reset(&mut self.store);
        self.adj_queue.reset(&mut self.store);

        let order: Vec<ProcessId> = self
            .store
            .lru_snapshot()
            .into_iter()
            .filter(|id| reachable.contains(id))
            .collect();
        debug!(
            "partial update ({}): {} targets, {} reachable, seq {}",
            reason,
            targets.len(),
            order.len(),
            seq
        );

        let ctx = ComputeContext {
            now,
            top: self.global.top,
            top_proc_state: self.global.top_proc_state(),
            wakefulness: self.global.wakefulness,
            temp_allowlist: &self.global.temp_allowlist,
            compat: &*self.compat,
            config: &self.config,
            doing_all: false,
        };
        for &id in &order {
            if let Some(proc) = self.store.get_mut(id) {
                if proc.is_killed {
                    continue;
                }
                proc.reset_computed(seq);
                compute_intrinsic(proc, &ctx);
            }
        }
        // Edges from outside the reachable set carry fixed attributes;
        // fold them in before the queue traversal starts.
        for &id in &order {
            apply_external_edges(&mut self.store, &ctx, id, &reachable);
        }
        for &id in &order {
            if self.store.get(id).is_some_and(|p| !p.is_killed) {
                self.ps_queue.offer(&mut self.store, id);
            }
        }
        drain_queue(
            &mut self.store,
            &mut self.ps_queue,
            &ctx,
            Some(&reachable),
            Phase::ProcState,
            seq,
            self.config.cycle_retry_limit,
        );
        for &id in &order {
            if self.store.get(id).is_some_and(|p| !p.is_killed) {
                self.adj_queue.offer(&mut self.store, id);
            }
        }
        drain_queue(
            &mut self.store,
            &mut self.adj_queue,
            &ctx,
            Some(&reachable),
            Phase::Adj,
            seq,
            self.config.cycle_retry_limit,
        );

        let needs_ladder = order
            .iter()
            .any(|&id| self.store.get(id).is_some_and(|p| p.cur_raw_adj >= UNKNOWN_ADJ));
        if needs_ladder {
            assign_ladder_adjs(&mut self.store, &self.config, now);
        }

        for &id in &reachable {
            if let Some(proc) = self.store.get_mut(id) {
                proc.reachable = false;
            }
        }
        let effects = self.finalize_and_apply(reason, now);
        self.followups.rebuild(&self.store);
        effects
    }

    /// Run a partial pass over the staged targets, if any.
    pub fn run_pending_update(&mut self, reason: OomAdjReason, now: u64) -> PassEffects {
        let targets = self.take_pending();
        if self.config.full_pass_only || self.force_full_next {
            return self.run_full_update(reason, now);
        }
        if targets.is_empty() {
            return PassEffects::default();
        }
        self.run_partial_update(targets, reason, now)
    }

    /// Promote processes whose follow-up window has elapsed and re-run.
    pub fn run_followup_update(&mut self, now: u64) -> PassEffects {
        let due = FollowUps::collect_due(&mut self.store, now);
        if due.is_empty() {
            self.followups.rebuild(&self.store);
            return PassEffects::default();
        }
        trace!("follow-up fired for {} processes", due.len());
        for id in due {
            self.enqueue_target(id);
        }
        self.run_pending_update(OomAdjReason::FollowUp, now)
    }

    /// BFS over outgoing bindings, ignoring edges into persistent-range
    /// system processes (their attributes never change).
    fn collect_reachable(&self, targets: &[ProcessId]) -> FxHashSet<ProcessId> {
        let mut reachable: FxHashSet<ProcessId> = targets.iter().copied().collect();
        let mut frontier: VecDeque<ProcessId> = targets.iter().copied().collect();
        while let Some(p) = frontier.pop_front() {
            let Some(proc) = self.store.get(p) else {
                continue;
            };
            for &conn_id in &proc.service_bindings {
                let Some(conn) = self.store.connection(conn_id) else {
                    continue;
                };
                if conn.attributed_client.unwrap_or(conn.client) != p {
                    continue;
                }
                let host_id = conn.host;
                if reachable.contains(&host_id) {
                    continue;
                }
                let Some(host) = self.store.get(host_id) else {
                    continue;
                };
                if host.is_killed || host.is_persistent_system() {
                    continue;
                }
                reachable.insert(host_id);
                frontier.push_back(host_id);
            }
            for &pc_id in &proc.provider_bindings {
                let Some(pc) = self.store.provider_connection(pc_id) else {
                    continue;
                };
                if pc.client != p {
                    continue;
                }
                let host_id = pc.host;
                if reachable.contains(&host_id) {
                    continue;
                }
                let Some(host) = self.store.get(host_id) else {
                    continue;
                };
                if host.is_killed || host.is_persistent_system() {
                    continue;
                }
                reachable.insert(host_id);
                frontier.push_back(host_id);
            }
        }
        reachable
    }

    /// Commit computed attributes, emitting one callback per changed one.
    fn finalize_and_apply(&mut self, reason: OomAdjReason, now: u64) -> PassEffects {
        let seq = self.seq;
        let mut effects = PassEffects::default();
        for id in self.store.lru_snapshot() {
            let Some(proc) = self.store.get_mut(id) else {
                continue;
            };
            if proc.is_killed {
                continue;
            }
            let computed = proc.adj_seq == seq;
            if computed {
                // Cached-tier procstate refinement.
                if proc.cur_raw_proc_state == ProcState::CachedEmpty {
                    proc.cur_proc_state = if proc.treated_like_activity {
                        ProcState::CachedActivity
                    } else if proc.cached_activity_client {
                        ProcState::CachedActivityClient
                    } else if proc.has_recent_tasks {
                        ProcState::CachedRecent
                    } else {
                        ProcState::CachedEmpty
                    };
                } else {
                    proc.cur_proc_state = proc.cur_raw_proc_state;
                }
                // Default capabilities from the settled procstate. A
                // short-fgs-only process sits at the fgs state without the
                // background-start grant.
                let ps = proc.cur_proc_state;
                if ps <= ProcState::BoundTop {
                    proc.cur_capability |= Capability::all_granted();
                } else if ps == ProcState::ForegroundService && proc.has_foreground_services {
                    proc.cur_capability |= Capability::BFSL;
                }
                if ps <= ProcState::BoundForegroundService {
                    proc.cur_capability |= Capability::POWER_RESTRICTED_NETWORK;
                }
                if !proc.cur_cpu_time_reasons.is_empty() {
                    proc.cur_capability |= Capability::CPU_TIME;
                }
            }
            // Implicit cpu time follows the final (laddered) adj, and BFSL
            // never survives past the bound-foreground-service state.
            if proc.cur_adj < self.config.freezer_cutoff_adj {
                proc.cur_capability |= Capability::IMPLICIT_CPU_TIME;
            } else {
                proc.cur_capability -= Capability::IMPLICIT_CPU_TIME;
            }
            if proc.cur_proc_state > ProcState::BoundForegroundService {
                proc.cur_capability -= Capability::BFSL;
            }

            let pid = proc.pid;
            let uid = proc.uid;
            if proc.cur_adj != proc.set_adj {
                trace!(
                    "{} adj {} -> {} ({})",
                    proc.process_name,
                    proc.set_adj,
                    proc.cur_adj,
                    proc.adj_type
                );
                effects.oom_adj.push((pid, uid, proc.cur_adj));
                proc.set_adj = proc.cur_adj;
            }
            if proc.cur_sched_group != proc.set_sched_group {
                let was_top = proc.set_sched_group == SchedGroup::TopApp;
                let is_top = proc.cur_sched_group == SchedGroup::TopApp;
                effects.groups.push(GroupChange {
                    pid,
                    group: proc.cur_sched_group,
                    process_name: proc.process_name.clone(),
                    ui_boost: (was_top != is_top).then_some(is_top),
                });
                proc.set_sched_group = proc.cur_sched_group;
            }
            if proc.cur_proc_state != proc.set_proc_state {
                effects.proc_states.push((pid, proc.cur_proc_state));
                proc.set_proc_state = proc.cur_proc_state;
                proc.last_state_time = now;
                if proc.cur_proc_state.is_cached() {
                    if proc.cached_since.is_none() {
                        proc.cached_since = Some(now);
                    }
                } else {
                    proc.cached_since = None;
                }
            }
            if proc.cur_capability != proc.set_capability {
                effects.capabilities.push((pid, proc.cur_capability));
                proc.set_capability = proc.cur_capability;
            }
            let freeze = should_freeze(proc, &self.config);
            if freeze != proc.frozen {
                proc.frozen = freeze;
                effects.freezer.push((
                    pid,
                    if freeze {
                        FreezerDecision::Freeze { immediate: false }
                    } else {
                        FreezerDecision::Unfreeze { reason }
                    },
                ));
            }
        }
        effects.uid_changes = self.uids.recompute(&self.store);
        self.check_apply_invariants();
        effects
    }

    /// Post-apply sanity: committed values converged and no traversal
    /// flags leaked. A violation forces a full pass on the next trigger.
    fn check_apply_invariants(&mut self) {
        let mut broken = false;
        for id in self.store.ids() {
            let proc = self.store.get(id).expect("iterated id resolves");
            if proc.is_killed {
                continue;
            }
            if proc.set_adj != proc.cur_adj
                || proc.set_proc_state != proc.cur_proc_state
                || proc.set_sched_group != proc.cur_sched_group
                || proc.set_capability != proc.cur_capability
                || proc.reachable
            {
                error!(
                    "attribute drift on {} after apply (adj {}/{}, state {:?}/{:?})",
                    proc.process_name,
                    proc.set_adj,
                    proc.cur_adj,
                    proc.set_proc_state,
                    proc.cur_proc_state
                );
                broken = true;
            }
        }
        debug_assert!(!broken, "apply-step invariant violation");
        if broken {
            self.force_full_next = true;
        }
    }
}

/// Drain one queue, propagating each popped process's outgoing bindings.
fn drain_queue(
    store: &mut ProcessStore,
    queue: &mut PriorityIndex,
    ctx: &ComputeContext<'_>,
    scope: Option<&FxHashSet<ProcessId>>,
    phase: Phase,
    seq: u64,
    cycle_limit: u32,
) {
    while let Some(client_id) = queue.poll(store) {
        if let Some(proc) = store.get_mut(client_id) {
            proc.completed_adj_seq = seq;
        }
        propagate_outgoing(store, queue, ctx, scope, client_id, phase, cycle_limit);
    }
}

/// Evaluate every outgoing binding of `client_id` against its host,
/// re-queueing hosts the propagation promoted.
fn propagate_outgoing(
    store: &mut ProcessStore,
    queue: &mut PriorityIndex,
    ctx: &ComputeContext<'_>,
    scope: Option<&FxHashSet<ProcessId>>,
    client_id: ProcessId,
    phase: Phase,
    cycle_limit: u32,
) {
    let (bindings, prov_bindings) = match store.get(client_id) {
        Some(p) => (p.service_bindings.clone(), p.provider_bindings.clone()),
        None => return,
    };

    for conn_id in bindings {
        let Some(conn) = store.connection(conn_id) else {
            continue;
        };
        // Sandbox bindings propagate from the attributed client only.
        if conn.attributed_client.unwrap_or(conn.client) != client_id {
            continue;
        }
        let host_id = conn.host;
        if host_id == client_id {
            continue;
        }
        if !host_in_scope(store, host_id, scope) {
            continue;
        }
        let view = ClientView::snapshot(store.get(client_id).expect("popped process resolves"));
        let mut conn_copy = store.connection(conn_id).expect("checked above").clone();
        let host = store.get_mut(host_id).expect("checked above");
        let before_state = host.cur_raw_proc_state;
        let before_adj = host.cur_raw_adj;
        let changed = compute_service_host(host, &view, &mut conn_copy, ctx, false);
        let tracked = conn_copy.tracked_proc_state;
        if let Some(c) = store.connection_mut(conn_id) {
            c.tracked_proc_state = tracked;
        }
        if changed {
            requeue_host(store, queue, host_id, before_state, before_adj, phase, cycle_limit);
        }
    }

    for pc_id in prov_bindings {
        let Some(pc) = store.provider_connection(pc_id) else {
            continue;
        };
        if pc.client != client_id {
            continue;
        }
        let host_id = pc.host;
        if host_id == client_id {
            continue;
        }
        if !host_in_scope(store, host_id, scope) {
            continue;
        }
        let view = ClientView::snapshot(store.get(client_id).expect("popped process resolves"));
        let host = store.get_mut(host_id).expect("checked above");
        let before_state = host.cur_raw_proc_state;
        let before_adj = host.cur_raw_adj;
        let changed = compute_provider_host(host, &view, ctx, false);
        if changed {
            requeue_host(store, queue, host_id, before_state, before_adj, phase, cycle_limit);
        }
    }
}

/// A host is evaluated only when alive, adjustable, and inside the pass
/// scope (all processes for a full pass, the reachable set otherwise).
fn host_in_scope(
    store: &ProcessStore,
    host_id: ProcessId,
    scope: Option<&FxHashSet<ProcessId>>,
) -> bool {
    let Some(host) = store.get(host_id) else {
        return false;
    };
    if host.is_killed || host.is_persistent_system() {
        return false;
    }
    scope.is_none_or(|s| s.contains(&host_id))
}

/// Re-insert a promoted host so the traversal revisits it at its improved
/// slot; bounded per process by the cycle retry budget.
fn requeue_host(
    store: &mut ProcessStore,
    queue: &mut PriorityIndex,
    host_id: ProcessId,
    before_state: ProcState,
    before_adj: i16,
    phase: Phase,
    cycle_limit: u32,
) {
    let improved = match store.get(host_id) {
        Some(host) => match phase {
            Phase::ProcState => host.cur_raw_proc_state < before_state,
            Phase::Adj => host.cur_raw_adj < before_adj,
        },
        None => false,
    };
    if !improved {
        return;
    }
    if queue.contains(store, host_id) {
        // Still queued: just move it to the better slot.
        queue.offer(store, host_id);
        return;
    }
    let allow = {
        let host = store.get_mut(host_id).expect("checked above");
        if host.revisit_count < cycle_limit {
            host.revisit_count += 1;
            true
        } else {
            false
        }
    };
    if allow {
        queue.offer(store, host_id);
    } else {
        warn!(
            "cycle retry budget exhausted for {:?}; keeping last computed values",
            host_id
        );
    }
}

/// Fold importance from clients outside the reachable set into a host
/// before the in-scope traversal runs. Their attributes are fixed for
/// this pass.
fn apply_external_edges(
    store: &mut ProcessStore,
    ctx: &ComputeContext<'_>,
    host_id: ProcessId,
    reachable: &FxHashSet<ProcessId>,
) {
    let Some(host) = store.get(host_id) else {
        return;
    };
    if host.is_killed {
        return;
    }
    let conn_ids: Vec<_> = host
        .services
        .iter()
        .flat_map(|s| s.connections.iter().copied())
        .collect();
    let prov_conn_ids: Vec<_> = host
        .providers
        .iter()
        .flat_map(|p| p.connections.iter().copied())
        .collect();

    for conn_id in conn_ids {
        let Some(conn) = store.connection(conn_id) else {
            continue;
        };
        let client_id = conn.attributed_client.unwrap_or(conn.client);
        if client_id == host_id || reachable.contains(&client_id) {
            continue;
        }
        let Some(client) = store.get(client_id) else {
            continue;
        };
        if client.is_killed {
            continue;
        }
        let view = ClientView::snapshot(client);
        let mut conn_copy = store.connection(conn_id).expect("checked above").clone();
        let host = store.get_mut(host_id).expect("checked above");
        compute_service_host(host, &view, &mut conn_copy, ctx, false);
        let tracked = conn_copy.tracked_proc_state;
        if let Some(c) = store.connection_mut(conn_id) {
            c.tracked_proc_state = tracked;
        }
    }
    for pc_id in prov_conn_ids {
        let Some(pc) = store.provider_connection(pc_id) else {
            continue;
        };
        let client_id = pc.client;
        if client_id == host_id || reachable.contains(&client_id) {
            continue;
        }
        let Some(client) = store.get(client_id) else {
            continue;
        };
        if client.is_killed {
            continue;
        }
        let view = ClientView::snapshot(client);
        let host = store.get_mut(host_id).expect("checked above");
        compute_provider_host(host, &view, ctx, false);
    }
}
