//! Shared vocabulary for the oomtriage process importance adjuster.
//!
//! This crate holds the closed enumerations and constants the runtime is
//! specified against: the procstate ladder, the oom-adj tier table and its
//! slot math, scheduling groups, capability and bind-flag bit sets, and the
//! reasons an update pass can be triggered for. It contains no policy --
//! the runtime crate (`triage-rt`) decides how these values are assigned.

pub mod adj;
pub mod caps;
pub mod reason;
pub mod state;

pub use adj::{adj_slot, ADJ_SLOT_COUNT, ADJ_SLOT_CUTOFFS};
pub use caps::{
    ActivityFlags, BindFlags, Capability, CpuTimePropagation, CpuTimeReason, FgsTypeMask,
    FreezeVeto, UidChangeFlags,
};
pub use reason::OomAdjReason;
pub use state::{CompatChange, ProcState, SchedGroup, Wakefulness};

/// Kernel process id, as reported to collaborators.
pub type Pid = i32;

/// Kernel user id owning one or more processes.
pub type Uid = u32;

/// Uids below this belong to the system image, not to installed packages.
pub const FIRST_APPLICATION_UID: Uid = 10_000;
