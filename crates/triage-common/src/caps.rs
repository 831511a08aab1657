//! Bit-set vocabulary: capabilities, bind flags, activity state, cpu-time
//! reasons, freezer vetoes, and uid change notifications.

use bitflags::bitflags;

bitflags! {
    /// Privileged operations a process may perform in its current state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capability: u32 {
        /// May start a foreground service from the background.
        const BFSL = 1 << 0;
        /// While-in-use location access.
        const FG_LOCATION = 1 << 1;
        /// While-in-use camera access.
        const FG_CAMERA = 1 << 2;
        /// While-in-use microphone access.
        const FG_MICROPHONE = 1 << 3;
        /// May take audio focus and control playback routing.
        const FG_AUDIO_CONTROL = 1 << 4;
        /// Network access despite power-save restrictions.
        const POWER_RESTRICTED_NETWORK = 1 << 5;
        /// Network access despite user (vpn/lockdown) restrictions.
        const USER_RESTRICTED_NETWORK = 1 << 6;
        /// Entitled to cpu time for an enumerated reason.
        const CPU_TIME = 1 << 7;
        /// Entitled to cpu time because the adj is below the freezer cutoff.
        const IMPLICIT_CPU_TIME = 1 << 8;
    }
}

impl Capability {
    /// The while-in-use subset copied by `INCLUDE_CAPABILITIES` bindings.
    pub fn while_in_use() -> Self {
        Capability::FG_LOCATION
            | Capability::FG_CAMERA
            | Capability::FG_MICROPHONE
            | Capability::FG_AUDIO_CONTROL
    }

    /// Everything granted to persistent and top-tier processes.
    pub fn all_granted() -> Self {
        Capability::BFSL
            | Capability::while_in_use()
            | Capability::POWER_RESTRICTED_NETWORK
            | Capability::USER_RESTRICTED_NETWORK
    }

    /// Either cpu-time grant.
    #[inline]
    pub fn has_cpu_time(self) -> bool {
        self.intersects(Capability::CPU_TIME | Capability::IMPLICIT_CPU_TIME)
    }
}

bitflags! {
    /// Why a process currently holds the `CPU_TIME` capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuTimeReason: u32 {
        const TOP = 1 << 0;
        const FOREGROUND_SERVICE = 1 << 1;
        const INSTRUMENTATION = 1 << 2;
        const BROADCAST = 1 << 3;
        const EXECUTING_SERVICE = 1 << 4;
        const TEMP_ALLOWLIST = 1 << 5;
        /// Granted through a binding from a client that holds cpu time.
        const BOUND_CLIENT = 1 << 6;
    }
}

bitflags! {
    /// Why a process must not be frozen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FreezeVeto: u32 {
        /// Bound with waived priority by a non-cached client.
        const NON_CACHED_CLIENT = 1 << 0;
        /// Bound with `ALLOW_OOM_MANAGEMENT`.
        const OOM_MANAGEMENT = 1 << 1;
        /// Uid is on the temporary allowlist.
        const TEMP_ALLOWLIST = 1 << 2;
        /// Statically exempt per package configuration.
        const EXEMPT_PACKAGE = 1 << 3;
    }
}

bitflags! {
    /// Attributes of a service binding controlling importance propagation
    /// from client to host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BindFlags: u64 {
        const ABOVE_CLIENT = 1 << 0;
        const ALLOW_OOM_MANAGEMENT = 1 << 1;
        const WAIVE_PRIORITY = 1 << 2;
        const ADJUST_WITH_ACTIVITY = 1 << 3;
        const IMPORTANT = 1 << 4;
        const NOT_PERCEPTIBLE = 1 << 5;
        const ALMOST_PERCEPTIBLE = 1 << 6;
        const NOT_VISIBLE = 1 << 7;
        const NOT_FOREGROUND = 1 << 8;
        const IMPORTANT_BACKGROUND = 1 << 9;
        const INCLUDE_CAPABILITIES = 1 << 10;
        const FOREGROUND_SERVICE = 1 << 11;
        const FOREGROUND_SERVICE_WHILE_AWAKE = 1 << 12;
        const SCHEDULE_LIKE_TOP_APP = 1 << 13;
        const TREAT_LIKE_ACTIVITY = 1 << 14;
        const TREAT_LIKE_VISIBLE_FOREGROUND_SERVICE = 1 << 15;
        const SHOWING_UI = 1 << 16;
        const BYPASS_POWER_NETWORK_RESTRICTIONS = 1 << 17;
        const BYPASS_USER_NETWORK_RESTRICTIONS = 1 << 18;
        const SIMULATE_ALLOW_FREEZE = 1 << 19;
        const ALLOW_FREEZE = 1 << 20;
    }
}

bitflags! {
    /// Summary of the activities hosted by a process, as reported by the
    /// window-management collaborator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ActivityFlags: u32 {
        const HAS_ACTIVITIES = 1 << 0;
        const VISIBLE = 1 << 1;
        const PAUSED = 1 << 2;
        const STOPPING = 1 << 3;
        /// The stopping activity is finishing rather than being cached.
        const FINISHING = 1 << 4;
    }
}

bitflags! {
    /// Foreground-service type declarations carried by a service record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FgsTypeMask: u32 {
        const LOCATION = 1 << 0;
        const CAMERA = 1 << 1;
        const MICROPHONE = 1 << 2;
        const MEDIA_PLAYBACK = 1 << 3;
    }
}

bitflags! {
    /// Aggregate change flags reported per uid after an update pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UidChangeFlags: u32 {
        const IDLE = 1 << 0;
        const ACTIVE = 1 << 1;
        const CACHED = 1 << 2;
        const UNCACHED = 1 << 3;
        const CAPABILITY = 1 << 4;
        const PROCSTATE = 1 << 5;
        const PROCADJ = 1 << 6;
    }
}

/// How cpu-time entitlement flows across one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuTimePropagation {
    /// Explicit and implicit cpu time both flow from client to host.
    #[default]
    Normal,
    /// Only implicit cpu time flows; the host gets no explicit grant.
    Legacy,
    /// Nothing flows.
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_while_in_use_subset_of_all() {
        assert!(Capability::all_granted().contains(Capability::while_in_use()));
    }

    #[test]
    fn test_has_cpu_time() {
        assert!(Capability::CPU_TIME.has_cpu_time());
        assert!(Capability::IMPLICIT_CPU_TIME.has_cpu_time());
        assert!(!Capability::BFSL.has_cpu_time());
    }

    #[test]
    fn test_bind_flags_disjoint() {
        // Every declared flag occupies a distinct bit.
        let all = BindFlags::all();
        assert_eq!(all.bits().count_ones(), 21);
    }

    #[test]
    fn test_activity_flags_default_empty() {
        assert!(ActivityFlags::default().is_empty());
    }
}
