//! The oom-adj tier table.
//!
//! Every live process carries a signed adjustment score; lower means more
//! important, kept alive longer under memory pressure. The constants below
//! name the tier boundaries. `adj_slot` maps a score to its slot in the
//! adj-keyed priority index by binary search over the cut-off table, so
//! slot indices stay consistent with the numerical value by construction.

/// Native (non-managed) processes. The adjuster never assigns below this.
pub const NATIVE_ADJ: i16 = -1000;
/// The system server itself.
pub const SYSTEM_ADJ: i16 = -900;
/// Persistent system processes.
pub const PERSISTENT_PROC_ADJ: i16 = -800;
/// Processes bound by a persistent process with an important binding.
pub const PERSISTENT_SERVICE_ADJ: i16 = -700;
/// The foreground (top) application.
pub const FOREGROUND_APP_ADJ: i16 = 0;
/// Recently left the foreground while holding a foreground service.
pub const PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ: i16 = 50;
/// Visible but not top. The visible tier ladders upward from here.
pub const VISIBLE_APP_ADJ: i16 = 100;
/// Upper bound of the visible-app ladder.
pub const VISIBLE_APP_MAX_ADJ: i16 = 199;
/// Not visible, but perceptible to the user (foreground services, toasts).
pub const PERCEPTIBLE_APP_ADJ: i16 = 200;
/// Weaker perceptible tier (short foreground services, expedited work).
pub const PERCEPTIBLE_MEDIUM_APP_ADJ: i16 = 225;
/// Weakest perceptible tier.
pub const PERCEPTIBLE_LOW_APP_ADJ: i16 = 250;
/// The current backup target.
pub const BACKUP_APP_ADJ: i16 = 300;
/// Heavy-weight processes, expensive to restart.
pub const HEAVY_WEIGHT_APP_ADJ: i16 = 400;
/// Processes with recently-active started services.
pub const SERVICE_ADJ: i16 = 500;
/// The home (launcher) process.
pub const HOME_APP_ADJ: i16 = 600;
/// The previous foreground application.
pub const PREVIOUS_APP_ADJ: i16 = 700;
/// Demoted started-service tier.
pub const SERVICE_B_ADJ: i16 = 800;
/// First cached slot. Everything at or above is a kill candidate.
pub const CACHED_APP_MIN_ADJ: i16 = 900;
/// Last cached slot.
pub const CACHED_APP_MAX_ADJ: i16 = 999;
/// Placeholder assigned before the cached-tier ladder runs.
pub const UNKNOWN_ADJ: i16 = 1001;

/// Tier cut-offs in ascending order. Slot `i` covers
/// `[ADJ_SLOT_CUTOFFS[i], ADJ_SLOT_CUTOFFS[i + 1])`.
pub const ADJ_SLOT_CUTOFFS: [i16; 18] = [
    NATIVE_ADJ,
    SYSTEM_ADJ,
    PERSISTENT_PROC_ADJ,
    PERSISTENT_SERVICE_ADJ,
    FOREGROUND_APP_ADJ,
    PERCEPTIBLE_RECENT_FOREGROUND_APP_ADJ,
    VISIBLE_APP_ADJ,
    PERCEPTIBLE_APP_ADJ,
    PERCEPTIBLE_MEDIUM_APP_ADJ,
    PERCEPTIBLE_LOW_APP_ADJ,
    BACKUP_APP_ADJ,
    HEAVY_WEIGHT_APP_ADJ,
    SERVICE_ADJ,
    HOME_APP_ADJ,
    PREVIOUS_APP_ADJ,
    SERVICE_B_ADJ,
    CACHED_APP_MIN_ADJ,
    UNKNOWN_ADJ,
];

/// Number of slots in the adj-keyed priority index.
pub const ADJ_SLOT_COUNT: usize = ADJ_SLOT_CUTOFFS.len();

/// Map an adj score to its slot index.
///
/// Returns the index of the last cut-off `<=` the score. Scores below
/// `NATIVE_ADJ` clamp to slot 0; scores at or above `UNKNOWN_ADJ` land in
/// the final slot.
pub fn adj_slot(adj: i16) -> usize {
    let after = ADJ_SLOT_CUTOFFS.partition_point(|&cutoff| cutoff <= adj);
    after.saturating_sub(1)
}
