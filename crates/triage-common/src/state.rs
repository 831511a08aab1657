//! Process state, scheduling group, and device wakefulness enumerations.

use std::fmt;

// ---------------------------------------------------------------------------
// ProcState
// ---------------------------------------------------------------------------

/// Ordered summary of a process's user-visible role.
///
/// Lower numerical value means more important. The discriminant doubles as
/// the slot index in the procstate-keyed priority index, so the variants
/// must stay contiguous from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProcState {
    Persistent = 0,
    PersistentUi = 1,
    Top = 2,
    BoundTop = 3,
    ForegroundService = 4,
    BoundForegroundService = 5,
    ImportantForeground = 6,
    ImportantBackground = 7,
    TransientBackground = 8,
    Backup = 9,
    Service = 10,
    Receiver = 11,
    TopSleeping = 12,
    HeavyWeight = 13,
    Home = 14,
    LastActivity = 15,
    CachedActivity = 16,
    CachedActivityClient = 17,
    CachedRecent = 18,
    CachedEmpty = 19,
    Unknown = 20,
}

/// Number of slots in the procstate-keyed priority index.
pub const PROC_STATE_SLOT_COUNT: usize = 21;

impl ProcState {
    /// Slot index in the procstate priority index.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`ProcState::index`]. Out-of-range values map to `Unknown`.
    pub fn from_index(index: usize) -> Self {
        use ProcState::*;
        const TABLE: [ProcState; PROC_STATE_SLOT_COUNT] = [
            Persistent,
            PersistentUi,
            Top,
            BoundTop,
            ForegroundService,
            BoundForegroundService,
            ImportantForeground,
            ImportantBackground,
            TransientBackground,
            Backup,
            Service,
            Receiver,
            TopSleeping,
            HeavyWeight,
            Home,
            LastActivity,
            CachedActivity,
            CachedActivityClient,
            CachedRecent,
            CachedEmpty,
            Unknown,
        ];
        TABLE.get(index).copied().unwrap_or(Unknown)
    }

    /// Cached states are kill candidates and subject to the LRU ladder.
    #[inline]
    pub fn is_cached(self) -> bool {
        self >= ProcState::CachedActivity
    }

    /// States in which the process is doing work the user can notice.
    #[inline]
    pub fn is_active(self) -> bool {
        self <= ProcState::Receiver
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// SchedGroup
// ---------------------------------------------------------------------------

/// Kernel scheduling group assigned to a process.
///
/// Ordered from least to most favored; the adjuster only ever raises a
/// host's group during connection propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SchedGroup {
    Background = 0,
    Restricted = 1,
    Default = 2,
    ForegroundWindow = 3,
    TopAppBound = 4,
    TopApp = 5,
}

// ---------------------------------------------------------------------------
// Wakefulness
// ---------------------------------------------------------------------------

/// Device interactive state, as reported by the power collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakefulness {
    Awake,
    Dozing,
    Asleep,
}

impl Wakefulness {
    #[inline]
    pub fn is_awake(self) -> bool {
        matches!(self, Wakefulness::Awake)
    }
}

// ---------------------------------------------------------------------------
// CompatChange
// ---------------------------------------------------------------------------

/// Platform-compat change ids the adjuster queries.
///
/// The compat cache is an external collaborator; the adjuster only asks
/// whether a change is enabled for a given uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompatChange {
    /// When enabled, camera/microphone capabilities are granted only to
    /// foreground services that declared the matching type.
    CameraMicrophoneCapability,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for i in 0..PROC_STATE_SLOT_COUNT {
            assert_eq!(ProcState::from_index(i).index(), i);
        }
    }

    #[test]
    fn test_ordering_matches_importance() {
        assert!(ProcState::Persistent < ProcState::Top);
        assert!(ProcState::Top < ProcState::BoundTop);
        assert!(ProcState::ForegroundService < ProcState::Service);
        assert!(ProcState::CachedActivity < ProcState::CachedEmpty);
    }

    #[test]
    fn test_cached_boundary() {
        assert!(!ProcState::LastActivity.is_cached());
        assert!(ProcState::CachedActivity.is_cached());
        assert!(ProcState::Unknown.is_cached());
    }

    #[test]
    fn test_active_boundary() {
        assert!(ProcState::Receiver.is_active());
        assert!(!ProcState::TopSleeping.is_active());
    }

    #[test]
    fn test_from_index_out_of_range() {
        assert_eq!(ProcState::from_index(99), ProcState::Unknown);
    }

    #[test]
    fn test_sched_group_ordering() {
        assert!(SchedGroup::Background < SchedGroup::Default);
        assert!(SchedGroup::Default < SchedGroup::TopApp);
    }
}
