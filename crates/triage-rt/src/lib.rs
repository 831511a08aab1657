//! oomtriage runtime: continuous process importance scoring.
//!
//! For a device with a population of long-lived processes competing for
//! memory and cpu, this crate assigns each live process an oom-adj score,
//! a procstate, a scheduling group and a capability set, and keeps those
//! attributes consistent as facts change and importance flows across the
//! inter-process binding graph.
//!
//! ## Architecture
//!
//! - **Store** (`store.rs`): exclusive owner of all [`ProcessRecord`]s and
//!   binding records, keyed by stable ids; exposes the LRU sequence a
//!   collaborator maintains.
//! - **Priority index** (`index.rs`): two slot-keyed intrusive queues (by
//!   procstate, by adj) driving deterministic update traversal.
//! - **Attribute computer** (`compute.rs`): per-process decision waterfall
//!   over intrinsic facts.
//! - **Connection propagator** (`connection.rs`): client-to-host importance
//!   flow, moderated by bind flags, with a dry-run mode.
//! - **Update driver** (`driver.rs`): full and partial passes, reachability
//!   collection, cycle handling, the cached-tier ladder (`ladder.rs`), and
//!   the apply step emitting observer callbacks.
//! - **State controller** (`controller.rs`): the public mutation API,
//!   async batch sessions over a lock-free queue, and the applier thread
//!   for kernel-facing side effects.
//! - **Policy gates**: freezer decisions (`freezer.rs`) and follow-up
//!   scheduling (`followup.rs`).
//!
//! All state lives under one service lock; passes are synchronous and
//! never suspend. See `controller.rs` for the locking and session rules.

pub mod clock;
pub mod config;
pub mod controller;
pub mod observer;
pub mod record;
pub mod store;
pub mod uid;

mod compute;
mod connection;
mod core;
mod driver;
mod followup;
mod freezer;
mod index;
mod ladder;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdjusterConfig, CachedLadderMode};
pub use controller::{Adjuster, MutationSession, ProcessAttrs, ProcessSpec};
pub use driver::{GroupChange, PassEffects};
pub use observer::{
    AdjusterObserver, AllChangesEnabled, FreezerDecision, PlatformCompat, SinkError,
};
pub use record::{ConnId, ProcessId, ProcessRecord, ProvConnId, ProviderId, ServiceId};
pub use store::ConnectionOpts;
pub use uid::UidRecord;
