//! Collaborator callback surface.
//!
//! The adjuster computes attributes; external collaborators act on them:
//! the low-memory killer consumes oom-adj scores, the scheduler setter
//! consumes group changes, the freezer consumes freeze decisions, and
//! state observers consume procstate/capability/uid transitions.
//!
//! Callbacks are invoked with the service lock held (or from the applier
//! thread for group changes) and must not call back into the adjuster.

use std::fmt;

use triage_common::{Capability, Pid, ProcState, SchedGroup, Uid, UidChangeFlags};
use triage_common::{CompatChange, OomAdjReason};

/// Outcome of the freezer policy gate for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerDecision {
    Freeze { immediate: bool },
    Unfreeze { reason: OomAdjReason },
}

/// Failure reported by a collaborator callback that reaches the kernel.
///
/// Such failures are logged and swallowed; the next state change naturally
/// retries (spec: errors never escape a pass).
#[derive(Debug, Clone)]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        SinkError {
            message: message.into(),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collaborator callback failed: {}", self.message)
    }
}

impl std::error::Error for SinkError {}

/// Callbacks fired when committed attributes change.
///
/// All methods default to no-ops so collaborators implement only what they
/// consume. `on_oom_adj` and `on_process_group` talk to the kernel and are
/// fallible; everything else is in-process bookkeeping.
#[allow(unused_variables)]
pub trait AdjusterObserver: Send + Sync {
    fn on_oom_adj(&self, pid: Pid, uid: Uid, adj: i16) -> Result<(), SinkError> {
        Ok(())
    }

    /// Batched variant, used when oom-adj batching is configured. The
    /// default forwards to `on_oom_adj` per entry.
    fn on_oom_adj_batch(&self, batch: &[(Pid, Uid, i16)]) -> Result<(), SinkError> {
        for &(pid, uid, adj) in batch {
            self.on_oom_adj(pid, uid, adj)?;
        }
        Ok(())
    }

    fn on_process_group(
        &self,
        pid: Pid,
        group: SchedGroup,
        process_name: &str,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    /// Fired when a process crosses the top-app group boundary, so the
    /// collaborator can boost or unboost its UI thread.
    fn on_ui_thread_boost(&self, pid: Pid, boosted: bool) {}

    fn on_proc_state(&self, pid: Pid, proc_state: ProcState) {}

    fn on_capability(&self, pid: Pid, capability: Capability) {}

    fn on_freezer_decision(&self, pid: Pid, decision: FreezerDecision) {}

    fn on_uid_change(&self, uid: Uid, flags: UidChangeFlags) {}

    fn on_top_changed(&self, pid: Option<Pid>) {}
}

/// Read-only view of the platform-compat cache.
///
/// Built once by the host service and handed to the adjuster constructor;
/// the cache keeps its own internal lock.
pub trait PlatformCompat: Send + Sync {
    fn is_change_enabled(&self, change: CompatChange, uid: Uid) -> bool;
}

/// Compat policy with every change enabled; the production default.
#[derive(Debug, Default)]
pub struct AllChangesEnabled;

impl PlatformCompat for AllChangesEnabled {
    fn is_change_enabled(&self, _change: CompatChange, _uid: Uid) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingObserver(std::sync::atomic::AtomicUsize);

    impl AdjusterObserver for CountingObserver {
        fn on_oom_adj(&self, _pid: Pid, _uid: Uid, _adj: i16) -> Result<(), SinkError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_batch_default_forwards() {
        let obs = CountingObserver(std::sync::atomic::AtomicUsize::new(0));
        obs.on_oom_adj_batch(&[(1, 10_000, 0), (2, 10_001, 900)]).unwrap();
        assert_eq!(obs.0.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::new("setProcessGroup: no such process");
        assert!(err.to_string().contains("no such process"));
    }
}
