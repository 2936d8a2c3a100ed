use thiserror::Error;

use crate::region::{Buffer, RegionId};

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend has no room for another descriptor. Retry later.
    #[error("queue is full")]
    QueueFull,
    /// Nothing to dequeue. Retry later.
    #[error("queue is empty")]
    QueueEmpty,

    #[error("unknown region {0}")]
    UnknownRegion(RegionId),
    #[error("no region contains address {0:#x}")]
    UnknownAddress(u64),
    #[error("region id {0} is already in use")]
    RegionIdInUse(RegionId),
    #[error("region {0} still has outstanding buffers")]
    RegionHasOutstandingBuffers(RegionId),
    /// The region was announced by the peer. Only the peer may withdraw it
    /// or lend its buffers out.
    #[error("region {0} belongs to the peer")]
    RegionNotOwned(RegionId),
    /// Zero-length capability, duplicate base address or an exhausted id space.
    #[error("invalid region arguments")]
    InvalidRegionArgs,

    #[error("buffer exceeds the bounds of its region")]
    BufferNotInRegion,
    #[error("invalid buffer arguments")]
    InvalidBufferArgs,
    #[error("buffer is already in use")]
    BufferAlreadyInUse,
    #[error("buffer is not in use")]
    BufferNotInUse,

    /// A dequeued descriptor failed validation. The slot is already
    /// consumed, so the descriptor is handed to the caller here.
    #[error("dequeued descriptor {buf:?} rejected: {source}")]
    Rejected {
        buf: Buffer,
        source: Box<QueueError>,
    },

    #[error("unknown flag or request {0:#x}")]
    UnknownFlag(u64),

    #[error("configuration error: {0}")]
    Config(String),
    #[error("shared memory segment {name} is {found} bytes, expected at least {expected}")]
    SegmentTooSmall {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
}

impl QueueError {
    /// `QueueFull` and `QueueEmpty` are flow-control conditions, everything
    /// else is a failure the caller has to act on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::QueueFull | QueueError::QueueEmpty)
    }

    /// The descriptor carried by a `Rejected` error.
    pub fn rejected_buffer(&self) -> Option<Buffer> {
        match self {
            QueueError::Rejected { buf, .. } => Some(*buf),
            _ => None,
        }
    }
}
