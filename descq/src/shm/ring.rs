//! Single-producer/single-consumer ring over one shared segment.
//!
//! The producer owns the slots, the consumer owns the ack cell in the
//! header. A slot is published by storing its sequence number last
//! (`Release`); the consumer reads the sequence first (`Acquire`) and only
//! then the body. The producer may reuse a slot once the consumer's ack has
//! moved past it.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::layout::{
    slot_offset, SlotRecord, ACK_OFFSET, FIRST_SEQ, MIN_SLOTS, NOTIFY_OFFSET, SEQ_FIELD, SLOT_SIZE,
};
use crate::errors::{QueueError, Result};

/// Raw view of a mapped segment. Does not own the memory.
#[derive(Debug)]
pub(crate) struct RingView {
    base: NonNull<u8>,
    slots: usize,
}

impl RingView {
    /// # Safety
    ///
    /// `base` must point to at least `segment_size(slots)` bytes, 8-byte
    /// aligned, that stay mapped for the lifetime of the view.
    pub(crate) unsafe fn new(base: NonNull<u8>, slots: usize) -> RingView {
        debug_assert!(slots >= MIN_SLOTS);
        debug_assert_eq!(base.as_ptr() as usize % 8, 0);
        RingView { base, slots }
    }

    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    fn cell(&self, at: usize) -> &AtomicU64 {
        // SAFETY: `at` is 8-aligned and inside the segment (see `new`).
        unsafe { &*(self.base.as_ptr().add(at) as *const AtomicU64) }
    }

    #[inline]
    fn ack(&self) -> &AtomicU64 {
        self.cell(ACK_OFFSET)
    }

    #[inline]
    fn notify_count(&self) -> &AtomicU64 {
        self.cell(NOTIFY_OFFSET)
    }

    #[inline]
    fn seq(&self, index: usize) -> &AtomicU64 {
        self.cell(slot_offset(index) + SEQ_FIELD)
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: index < slots, so the slot lies inside the segment.
        unsafe { self.base.as_ptr().add(slot_offset(index)) }
    }

    #[inline]
    fn index_of(&self, seq: u64) -> usize {
        (seq % self.slots as u64) as usize
    }

    /// Zeroes the whole segment. Only safe before the peer starts using it.
    pub(crate) fn clear(&self) {
        // SAFETY: see `new`.
        unsafe { ptr::write_bytes(self.base.as_ptr(), 0, slot_offset(self.slots)) }
    }
}

// Body bytes around the sequence field. The sequence is only ever touched
// atomically.
const BODY_HEAD: usize = SEQ_FIELD;
const BODY_TAIL: usize = SEQ_FIELD + 8;

/// Writing side of a ring.
#[derive(Debug)]
pub(crate) struct Producer {
    ring: RingView,
    seq: u64,
}

impl Producer {
    pub(crate) fn new(ring: RingView) -> Producer {
        Producer {
            ring,
            seq: FIRST_SEQ,
        }
    }

    /// Descriptors the ring can hold at once. One slot stays unused.
    pub(crate) fn capacity(&self) -> usize {
        self.ring.slots() - 1
    }

    fn acked(&self) -> u64 {
        u64::from_le(self.ring.ack().load(Ordering::Acquire))
    }

    pub(crate) fn free_slots(&self) -> usize {
        let used = self.seq.saturating_sub(self.acked()) as usize;
        self.ring.slots().saturating_sub(used)
    }

    pub(crate) fn push(&mut self, record: &SlotRecord) -> Result<()> {
        let acked = self.acked();
        if self.seq.saturating_sub(acked) >= self.ring.slots() as u64 {
            return Err(QueueError::QueueFull);
        }

        let index = self.ring.index_of(self.seq);
        let mut raw = [0u8; SLOT_SIZE];
        record.encode(&mut raw);
        let dst = self.ring.slot_ptr(index);
        // SAFETY: the consumer is done with this slot (ack check above) and
        // only reads it again after the sequence store below.
        unsafe {
            ptr::copy_nonoverlapping(raw.as_ptr(), dst, BODY_HEAD);
            ptr::copy_nonoverlapping(
                raw.as_ptr().add(BODY_TAIL),
                dst.add(BODY_TAIL),
                SLOT_SIZE - BODY_TAIL,
            );
        }
        self.ring.seq(index).store(self.seq.to_le(), Ordering::Release);
        trace!(seq = self.seq, index, acked, cmd = record.cmd, "slot published");
        self.seq += 1;
        Ok(())
    }

    /// Bumps the notification counter the consumer can poll.
    pub(crate) fn notify(&self) {
        let cell = self.ring.notify_count();
        let n = u64::from_le(cell.load(Ordering::Relaxed));
        cell.store(n.wrapping_add(1).to_le(), Ordering::Release);
    }
}

/// Reading side of a ring.
#[derive(Debug)]
pub(crate) struct Consumer {
    ring: RingView,
    seq: u64,
}

impl Consumer {
    pub(crate) fn new(ring: RingView) -> Consumer {
        Consumer {
            ring,
            seq: FIRST_SEQ,
        }
    }

    /// Takes the next published slot, if any, and acknowledges it.
    ///
    /// # Panics
    ///
    /// If the slot holds a sequence ahead of the expected one. The producer
    /// cannot get there without overwriting an unacknowledged slot.
    pub(crate) fn poll(&mut self) -> Option<SlotRecord> {
        let index = self.ring.index_of(self.seq);
        let stored = u64::from_le(self.ring.seq(index).load(Ordering::Acquire));
        if stored < self.seq {
            return None;
        }
        assert!(
            stored == self.seq,
            "ring slot {} holds sequence {} but {} was expected",
            index,
            stored,
            self.seq
        );

        let mut raw = [0u8; SLOT_SIZE];
        let src = self.ring.slot_ptr(index);
        // SAFETY: the Acquire load above synchronizes with the producer's
        // Release store, and the producer leaves the slot alone until acked.
        unsafe {
            ptr::copy_nonoverlapping(src, raw.as_mut_ptr(), BODY_HEAD);
            ptr::copy_nonoverlapping(
                src.add(BODY_TAIL),
                raw.as_mut_ptr().add(BODY_TAIL),
                SLOT_SIZE - BODY_TAIL,
            );
        }
        let record = SlotRecord::decode(&raw);

        self.ring.ack().store(self.seq.to_le(), Ordering::Release);
        trace!(seq = self.seq, index, cmd = record.cmd, "slot consumed");
        self.seq += 1;
        Some(record)
    }

    /// Notifications the producer has posted on this ring.
    pub(crate) fn notifications(&self) -> u64 {
        u64::from_le(self.ring.notify_count().load(Ordering::Acquire))
    }
}
