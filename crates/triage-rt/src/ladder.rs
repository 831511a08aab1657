//! Final adj assignment for the laddered tiers.
//!
//! After queue traversal, processes left with the placeholder adj are in
//! the cached tier; their final score comes from their LRU position. The
//! visible and previous tiers are always laddered so the killer has a
//! deterministic order inside each tier as well.

use rustc_hash::FxHashMap;

use triage_common::adj::{
    CACHED_APP_MAX_ADJ, CACHED_APP_MIN_ADJ, PREVIOUS_APP_ADJ, SERVICE_B_ADJ, UNKNOWN_ADJ,
    VISIBLE_APP_ADJ, VISIBLE_APP_MAX_ADJ,
};
use triage_common::Uid;

use crate::config::{AdjusterConfig, CachedLadderMode};
use crate::store::ProcessStore;

/// Assign final adjs to the visible, previous and cached tiers, walking
/// the LRU most-recently-used first.
pub(crate) fn assign_ladder_adjs(store: &mut ProcessStore, config: &AdjusterConfig, now: u64) {
    let order = store.lru_snapshot();

    let mut visible_count: i16 = 0;
    let mut previous_count: i16 = 0;

    // Distributed-mode bookkeeping.
    let cached_step =
        ((CACHED_APP_MAX_ADJ - CACHED_APP_MIN_ADJ + 1) as usize / (2 * config.cached_importance_levels))
            .max(1) as i16;
    let mut cached_seen = 0usize;
    let mut empty_seen = 0usize;
    let mut group_slots: FxHashMap<(Uid, u32), i16> = FxHashMap::default();

    for id in order {
        let Some(proc) = store.get_mut(id) else {
            continue;
        };

        // Visible tier: first process keeps the base, later ones step up.
        if proc.cur_raw_adj >= VISIBLE_APP_ADJ && proc.cur_raw_adj <= VISIBLE_APP_MAX_ADJ {
            proc.cur_adj = (VISIBLE_APP_ADJ + visible_count).min(VISIBLE_APP_MAX_ADJ);
            visible_count += 1;
            continue;
        }
        // Previous tier.
        if proc.cur_raw_adj == PREVIOUS_APP_ADJ {
            proc.cur_adj = (PREVIOUS_APP_ADJ + previous_count).min(SERVICE_B_ADJ - 1);
            previous_count += 1;
            continue;
        }
        if proc.cur_raw_adj < UNKNOWN_ADJ {
            continue;
        }

        // Cached tier.
        let adj = match config.ladder {
            CachedLadderMode::Tiered => {
                if proc.freeze_exempt {
                    CACHED_APP_MIN_ADJ
                } else if proc.has_shown_ui {
                    let offset = 10 + (cached_seen as i16).min(config.ui_tier_size - 1);
                    cached_seen += 1;
                    CACHED_APP_MIN_ADJ + offset
                } else if proc
                    .cached_since
                    .is_some_and(|since| now.saturating_sub(since) > config.cached_decay_ms)
                {
                    CACHED_APP_MIN_ADJ + 40 + config.ui_tier_size
                } else {
                    CACHED_APP_MIN_ADJ + 10 + config.ui_tier_size
                }
            }
            CachedLadderMode::Distributed => {
                let has_activity_state = proc.cur_raw_proc_state < triage_common::ProcState::CachedEmpty
                    || proc.has_activities()
                    || proc.treated_like_activity;
                let group_key = (proc.uid, proc.connection_group);
                if proc.connection_group != 0 {
                    if let Some(&slot_adj) = group_slots.get(&group_key) {
                        proc.cur_adj = slot_adj;
                        continue;
                    }
                }
                let levels = config.cached_importance_levels.max(1);
                let adj = if has_activity_state {
                    let slot = distribute_slot(cached_seen, config.max_cached_processes, levels);
                    cached_seen += 1;
                    CACHED_APP_MIN_ADJ + (slot as i16) * 2 * cached_step
                } else {
                    let slot = distribute_slot(empty_seen, config.max_empty_processes, levels);
                    empty_seen += 1;
                    CACHED_APP_MIN_ADJ + cached_step + (slot as i16) * 2 * cached_step
                };
                let adj = adj.min(CACHED_APP_MAX_ADJ);
                if proc.connection_group != 0 {
                    group_slots.insert(group_key, adj);
                }
                adj
            }
        };
        proc.cur_adj = adj.min(CACHED_APP_MAX_ADJ);
    }
}

/// Importance level for the `position`-th process of a tier.
fn distribute_slot(position: usize, tier_capacity: usize, levels: usize) -> usize {
    let capacity = tier_capacity.max(1);
    ((position * levels) / capacity).min(levels - 1)
}
