//! Runtime configuration for the adjuster.

use triage_common::adj::CACHED_APP_MIN_ADJ;

/// How the cached tier is laddered over the LRU list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedLadderMode {
    /// Fixed bands: shown-ui band, new-cached band, old-cached band.
    Tiered,
    /// LRU position distributed across importance levels; connection-group
    /// members share a slot.
    Distributed,
}

/// Tunables for update passes, grace windows and the freezer gate.
#[derive(Debug, Clone)]
pub struct AdjusterConfig {
    /// Bound on re-visits of one process within a pass when bindings form
    /// cycles. Past the bound the last computed values stand.
    pub cycle_retry_limit: u32,
    pub ladder: CachedLadderMode,
    /// Width of the shown-ui band in tiered mode.
    pub ui_tier_size: i16,
    /// Cached processes older than this land in the old-cached band.
    pub cached_decay_ms: u64,
    /// Importance levels in distributed mode.
    pub cached_importance_levels: usize,
    pub max_cached_processes: usize,
    pub max_empty_processes: usize,
    /// Grace window keeping recently-top FGS processes perceptible.
    pub top_to_fgs_grace_ms: u64,
    /// Grace window for recently-top processes with expedited work.
    pub top_to_almost_perceptible_grace_ms: u64,
    /// Window during which a recently perceptible activity process keeps a
    /// perceptible-medium floor.
    pub recent_perceptible_ms: u64,
    /// How long the previous app keeps its floor.
    pub max_previous_time_ms: u64,
    /// Started services older than this stop holding the service floor.
    pub max_service_inactivity_ms: u64,
    /// Window during which a recent provider client pins its host.
    pub provider_retain_ms: u64,
    /// Adj below which implicit cpu time is granted.
    pub freezer_cutoff_adj: i16,
    /// Compatibility shim: freeze on `adj >= CACHED_MIN` instead of the
    /// capability-based policy.
    pub legacy_freezer_policy: bool,
    /// Compatibility shim: run a full pass for every trigger, never a
    /// partial one.
    pub full_pass_only: bool,
    /// Deliver oom-adj changes as one batch per pass instead of one call
    /// per process.
    pub batch_oom_adj: bool,
}

impl Default for AdjusterConfig {
    fn default() -> Self {
        AdjusterConfig {
            cycle_retry_limit: 10,
            ladder: CachedLadderMode::Tiered,
            ui_tier_size: 10,
            cached_decay_ms: 30 * 60 * 1000,
            cached_importance_levels: 5,
            max_cached_processes: 32,
            max_empty_processes: 16,
            top_to_fgs_grace_ms: 15_000,
            top_to_almost_perceptible_grace_ms: 15_000,
            recent_perceptible_ms: 15_000,
            max_previous_time_ms: 60_000,
            max_service_inactivity_ms: 30 * 60 * 1000,
            provider_retain_ms: 20_000,
            freezer_cutoff_adj: CACHED_APP_MIN_ADJ,
            legacy_freezer_policy: false,
            full_pass_only: false,
            batch_oom_adj: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdjusterConfig::default();
        assert_eq!(config.cycle_retry_limit, 10);
        assert_eq!(config.ladder, CachedLadderMode::Tiered);
        assert!(!config.full_pass_only);
        assert_eq!(config.freezer_cutoff_adj, CACHED_APP_MIN_ADJ);
    }
}
