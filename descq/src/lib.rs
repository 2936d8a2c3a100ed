//! Buffer descriptor queues between two endpoints that share registered
//! memory regions.
//!
//! A [`Queue`] keeps the [`RegionPool`] and validates every descriptor; the
//! [`Backend`] behind it moves descriptors. Two backends ship with the crate:
//! [`LoopbackQueue`] for a single process and [`ShmQueue`] over a pair of
//! named shared-memory segments.

pub mod errors;
pub mod loopback;
pub mod queue;
pub mod region;
pub mod shm;

#[cfg(test)]
mod tests;

pub use errors::{QueueError, Result};
pub use loopback::LoopbackQueue;
pub use queue::{control, flags, Backend, Queue};
pub use region::{Buffer, Capability, GenOffset, RegionId, RegionPool};
pub use shm::{PeerRegionHook, ShmQueue, ShmQueueConfig};
