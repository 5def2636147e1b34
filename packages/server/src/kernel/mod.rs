//! Infrastructure shared across domains: the job queue and the
//! provider slot manager.

pub mod jobs;
pub mod slot;

pub use slot::{SlotGuard, SlotManager, SlotStatus};
