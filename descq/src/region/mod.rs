use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::errors::{QueueError, Result};

pub type RegionId = u32;
pub type GenOffset = u64;

/// Describes a span of memory handed to a queue. The pool never dereferences
/// the addresses; they only name the memory.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub vaddr: u64,
    pub paddr: u64,
    pub len: u64,
}

impl Capability {
    pub fn new(vaddr: u64, paddr: u64, len: u64) -> Capability {
        Capability { vaddr, paddr, len }
    }

    /// Capability for memory of the current process. Virtual and physical
    /// address are the same.
    pub fn from_slice(mem: &[u8]) -> Capability {
        let addr = mem.as_ptr() as u64;
        Capability::new(addr, addr, mem.len() as u64)
    }

    #[inline]
    fn end(&self) -> u64 {
        self.vaddr.saturating_add(self.len)
    }
}

/// A buffer descriptor: a sub-range of a registered region.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Buffer {
    pub rid: RegionId,
    pub offset: GenOffset,
    pub length: GenOffset,
    pub valid_data: GenOffset,
    pub valid_length: GenOffset,
    pub flags: u64,
}

impl Buffer {
    pub fn new(
        rid: RegionId,
        offset: GenOffset,
        length: GenOffset,
        valid_data: GenOffset,
        valid_length: GenOffset,
        flags: u64,
    ) -> Buffer {
        Buffer {
            rid,
            offset,
            length,
            valid_data,
            valid_length,
            flags,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Ownership {
    // Enqueued by us, the other side may touch it.
    Lent,
    // Dequeued from the other side, we have to hand it back.
    Held,
}

#[derive(Copy, Clone, Debug)]
struct Tracked {
    length: GenOffset,
    ownership: Ownership,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Origin {
    // Registered through this pool's owner. The base address is ours.
    Local,
    // Announced by the peer. The base address belongs to its process.
    Peer,
}

struct Region {
    cap: Capability,
    origin: Origin,
    // Keyed by offset. Entries never overlap.
    buffers: BTreeMap<GenOffset, Tracked>,
}

impl Region {
    fn overlapping(
        &self,
        offset: GenOffset,
        length: GenOffset,
    ) -> impl Iterator<Item = (&GenOffset, &Tracked)> {
        // Entries are disjoint, so their ends are sorted like their starts.
        self.buffers
            .range(..offset + length)
            .rev()
            .take_while(move |(start, t)| *start + t.length > offset)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Outbound {
    Lend,
    Return,
}

/// Result of validating an outgoing buffer. Apply it with
/// [`RegionPool::commit`] once the backend accepted the descriptor.
#[must_use]
#[derive(Copy, Clone, Debug)]
pub struct OutboundTransfer {
    rid: RegionId,
    offset: GenOffset,
    length: GenOffset,
    kind: Outbound,
}

/// Bookkeeping of registered regions and of the buffers in flight in them.
///
/// Regions announced by a peer share the id space with local ones but are
/// kept out of the address index, and this side may only hand their buffers
/// back, never lend them out or withdraw the region.
pub struct RegionPool {
    regions: HashMap<RegionId, Region>,
    // Local regions only.
    by_base: BTreeMap<u64, RegionId>,
    next_id: RegionId,
}

impl Default for RegionPool {
    fn default() -> Self {
        RegionPool::new()
    }
}

impl RegionPool {
    pub fn new() -> RegionPool {
        RegionPool::with_first_id(1)
    }

    /// Pool that hands out ids starting at `first_id`.
    pub fn with_first_id(first_id: RegionId) -> RegionPool {
        RegionPool {
            regions: HashMap::new(),
            by_base: BTreeMap::new(),
            next_id: first_id,
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_ids(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.regions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registers `cap` under a pool-chosen id.
    pub fn add_region(&mut self, cap: Capability) -> Result<RegionId> {
        self.check_capability(&cap)?;
        let rid = self.next_free_id()?;
        self.insert(cap, rid, Origin::Local);
        Ok(rid)
    }

    /// Registers `cap` under a caller-supplied id.
    pub fn add_region_with_id(&mut self, cap: Capability, rid: RegionId) -> Result<()> {
        if self.regions.contains_key(&rid) {
            return Err(QueueError::RegionIdInUse(rid));
        }
        self.check_capability(&cap)?;
        self.insert(cap, rid, Origin::Local);
        Ok(())
    }

    /// Records a region the peer registered under `rid`. Only the id has to
    /// be free; the address is not ours to check.
    pub fn add_peer_region(&mut self, cap: Capability, rid: RegionId) -> Result<()> {
        if self.regions.contains_key(&rid) {
            return Err(QueueError::RegionIdInUse(rid));
        }
        self.insert(cap, rid, Origin::Peer);
        Ok(())
    }

    /// Whether `rid` was announced by the peer rather than registered here.
    pub fn is_peer_region(&self, rid: RegionId) -> Result<bool> {
        Ok(self.region(rid)?.origin == Origin::Peer)
    }

    pub fn remove_region(&mut self, rid: RegionId) -> Result<Capability> {
        let region = self.regions.get(&rid).ok_or(QueueError::UnknownRegion(rid))?;
        if !region.buffers.is_empty() {
            return Err(QueueError::RegionHasOutstandingBuffers(rid));
        }
        let (cap, origin) = (region.cap, region.origin);
        self.regions.remove(&rid);
        if origin == Origin::Local {
            self.by_base.remove(&cap.vaddr);
        }
        debug!(rid, vaddr = cap.vaddr, "region removed");
        Ok(cap)
    }

    pub fn lookup_by_id(&self, rid: RegionId) -> Result<Capability> {
        self.regions
            .get(&rid)
            .map(|r| r.cap)
            .ok_or(QueueError::UnknownRegion(rid))
    }

    /// Id of the local region whose base address is exactly `vaddr`.
    pub fn lookup_by_base_address(&self, vaddr: u64) -> Result<RegionId> {
        self.by_base
            .get(&vaddr)
            .copied()
            .ok_or(QueueError::UnknownAddress(vaddr))
    }

    /// Translates an address anywhere inside a local region into
    /// `(id, offset)`.
    pub fn resolve_address(&self, addr: u64) -> Result<(RegionId, GenOffset)> {
        let (base, rid) = self
            .by_base
            .range(..=addr)
            .next_back()
            .ok_or(QueueError::UnknownAddress(addr))?;
        let cap = self.lookup_by_id(*rid)?;
        if addr >= cap.end() {
            return Err(QueueError::UnknownAddress(addr));
        }
        Ok((*rid, addr - base))
    }

    /// Number of buffers of `rid` that are currently tracked as in flight.
    pub fn outstanding(&self, rid: RegionId) -> Result<usize> {
        self.regions
            .get(&rid)
            .map(|r| r.buffers.len())
            .ok_or(QueueError::UnknownRegion(rid))
    }

    /// First region that still has buffers in flight, if any.
    pub fn first_busy_region(&self) -> Option<RegionId> {
        self.regions
            .iter()
            .filter(|(_, r)| !r.buffers.is_empty())
            .map(|(rid, _)| *rid)
            .min()
    }

    /// Checks that the buffer lies inside a registered region and that its
    /// valid-data window lies inside the buffer.
    pub fn check_bounds(&self, buf: &Buffer) -> Result<()> {
        let region = self
            .regions
            .get(&buf.rid)
            .ok_or(QueueError::UnknownRegion(buf.rid))?;
        match buf.offset.checked_add(buf.length) {
            Some(end) if end <= region.cap.len => {}
            _ => return Err(QueueError::BufferNotInRegion),
        }
        if buf.length == 0 {
            return Err(QueueError::InvalidBufferArgs);
        }
        match buf.valid_data.checked_add(buf.valid_length) {
            Some(end) if end <= buf.length => Ok(()),
            _ => Err(QueueError::InvalidBufferArgs),
        }
    }

    /// Validates a buffer that is about to be enqueued. Nothing changes until
    /// the returned transfer is committed.
    pub fn prepare_enqueue(&self, buf: &Buffer) -> Result<OutboundTransfer> {
        self.check_bounds(buf)?;
        let region = self.region(buf.rid)?;
        let mut kind = Outbound::Lend;
        for (start, tracked) in region.overlapping(buf.offset, buf.length) {
            let exact = *start == buf.offset && tracked.length == buf.length;
            if exact && tracked.ownership == Ownership::Held {
                kind = Outbound::Return;
            } else {
                return Err(QueueError::BufferAlreadyInUse);
            }
        }
        if kind == Outbound::Lend && region.origin == Origin::Peer {
            return Err(QueueError::RegionNotOwned(buf.rid));
        }
        Ok(OutboundTransfer {
            rid: buf.rid,
            offset: buf.offset,
            length: buf.length,
            kind,
        })
    }

    pub fn commit(&mut self, transfer: OutboundTransfer) {
        let region = match self.regions.get_mut(&transfer.rid) {
            Some(r) => r,
            None => return,
        };
        match transfer.kind {
            Outbound::Lend => {
                region.buffers.insert(
                    transfer.offset,
                    Tracked {
                        length: transfer.length,
                        ownership: Ownership::Lent,
                    },
                );
            }
            Outbound::Return => {
                region.buffers.remove(&transfer.offset);
            }
        }
        trace!(rid = transfer.rid, offset = transfer.offset, kind = ?transfer.kind, "buffer out");
    }

    /// Records a dequeued buffer: either one of ours coming back, or one the
    /// other side lends us.
    pub fn record_dequeue(&mut self, buf: &Buffer) -> Result<()> {
        self.check_bounds(buf)?;
        let region = self
            .regions
            .get_mut(&buf.rid)
            .ok_or(QueueError::UnknownRegion(buf.rid))?;

        let mut returned = false;
        for (start, tracked) in region.overlapping(buf.offset, buf.length) {
            let exact = *start == buf.offset && tracked.length == buf.length;
            match (tracked.ownership, exact) {
                (Ownership::Lent, true) => returned = true,
                (Ownership::Lent, false) => return Err(QueueError::BufferNotInUse),
                (Ownership::Held, _) => return Err(QueueError::BufferAlreadyInUse),
            }
        }

        if returned {
            region.buffers.remove(&buf.offset);
        } else {
            region.buffers.insert(
                buf.offset,
                Tracked {
                    length: buf.length,
                    ownership: Ownership::Held,
                },
            );
        }
        trace!(rid = buf.rid, offset = buf.offset, returned, "buffer in");
        Ok(())
    }

    fn region(&self, rid: RegionId) -> Result<&Region> {
        self.regions.get(&rid).ok_or(QueueError::UnknownRegion(rid))
    }

    fn check_capability(&self, cap: &Capability) -> Result<()> {
        if cap.len == 0 || self.by_base.contains_key(&cap.vaddr) {
            return Err(QueueError::InvalidRegionArgs);
        }
        Ok(())
    }

    fn next_free_id(&mut self) -> Result<RegionId> {
        let start = self.next_id;
        let mut rid = start;
        while self.regions.contains_key(&rid) {
            rid = rid.wrapping_add(1);
            if rid == start {
                return Err(QueueError::InvalidRegionArgs);
            }
        }
        self.next_id = rid.wrapping_add(1);
        Ok(rid)
    }

    fn insert(&mut self, cap: Capability, rid: RegionId, origin: Origin) {
        self.regions.insert(
            rid,
            Region {
                cap,
                origin,
                buffers: BTreeMap::new(),
            },
        );
        if origin == Origin::Local {
            self.by_base.insert(cap.vaddr, rid);
        }
        debug!(rid, vaddr = cap.vaddr, len = cap.len, ?origin, "region added");
    }
}
