//! Freezer policy gate.
//!
//! The adjuster only decides *whether* a process should be frozen; the
//! freeze itself is a collaborator's job. The primary policy is
//! capability-based: a process entitled to cpu time, or exempted, stays
//! unfrozen; everything else freezes. The legacy adj-threshold policy
//! survives behind a config flag as a compatibility shim.

use triage_common::adj::CACHED_APP_MIN_ADJ;

use crate::config::AdjusterConfig;
use crate::record::ProcessRecord;

/// Whether the process should be frozen under the configured policy.
pub(crate) fn should_freeze(proc: &ProcessRecord, config: &AdjusterConfig) -> bool {
    if config.legacy_freezer_policy {
        return proc.cur_adj >= CACHED_APP_MIN_ADJ
            && !proc.should_not_freeze
            && !proc.freeze_exempt;
    }
    !(proc.cur_capability.has_cpu_time() || proc.freeze_exempt || proc.should_not_freeze)
}
