//! Queue backend over two named shared-memory segments, one per direction.
//!
//! Each side writes descriptors into its send segment and reads the peer's
//! descriptors from its receive segment. Region (de)registrations travel in
//! band as control slots so both region pools name the same regions.

pub mod layout;
mod ring;

use std::ptr::NonNull;

use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, warn};

use self::layout::{segment_size, Command, SlotRecord, DEFAULT_SLOTS, MIN_SLOTS};
use self::ring::{Consumer, Producer, RingView};
use crate::errors::{QueueError, Result};
use crate::queue::{control, Backend, Queue};
use crate::region::{Buffer, Capability, RegionId, RegionPool};

/// Flipped by [`ShmQueueConfig::peer`] so the two ends hand out region ids
/// from disjoint halves of the id space.
pub const PEER_REGION_ID_BIT: RegionId = 1 << 31;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmQueueConfig {
    /// Segment this side writes to.
    pub send_name: String,
    /// Segment this side reads from.
    pub recv_name: String,
    /// Ring slots per direction. Both sides must agree.
    pub slots: usize,
    /// Zero both segments when opening them.
    pub clear: bool,
    /// First region id the local pool hands out.
    pub region_id_base: RegionId,
}

impl Default for ShmQueueConfig {
    fn default() -> Self {
        ShmQueueConfig {
            send_name: "descq-send".to_string(),
            recv_name: "descq-recv".to_string(),
            slots: DEFAULT_SLOTS,
            clear: false,
            region_id_base: 1,
        }
    }
}

impl ShmQueueConfig {
    /// Configuration of the other end of this queue.
    pub fn peer(&self) -> ShmQueueConfig {
        ShmQueueConfig {
            send_name: self.recv_name.clone(),
            recv_name: self.send_name.clone(),
            slots: self.slots,
            clear: false,
            region_id_base: self.region_id_base ^ PEER_REGION_ID_BIT,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.slots < MIN_SLOTS {
            return Err(QueueError::Config(format!(
                "slots must be at least {}, got {}",
                MIN_SLOTS, self.slots
            )));
        }
        if self.send_name.is_empty() || self.recv_name.is_empty() {
            return Err(QueueError::Config("segment names must not be empty".to_string()));
        }
        if self.send_name == self.recv_name {
            return Err(QueueError::Config(format!(
                "send and receive segment are both {}",
                self.send_name
            )));
        }
        Ok(())
    }
}

/// Called when the peer announces or withdraws a region, after the local
/// pool was updated.
pub trait PeerRegionHook {
    fn region_registered(&mut self, rid: RegionId, cap: &Capability) -> Result<()>;
    fn region_deregistered(&mut self, rid: RegionId) -> Result<()>;
}

fn os_id(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

/// Creates the segment, or maps it if the peer created it first.
fn open_segment(name: &str, size: usize) -> Result<Shmem> {
    let id = os_id(name);
    let shmem = match ShmemConf::new().size(size).os_id(&id).create() {
        Ok(v) => v,
        Err(ShmemError::MappingIdExists) => ShmemConf::new().os_id(&id).open()?,
        Err(e) => return Err(e.into()),
    };
    if shmem.len() < size {
        return Err(QueueError::SegmentTooSmall {
            name: id,
            expected: size,
            found: shmem.len(),
        });
    }
    debug!(name = %id, size, owner = shmem.is_owner(), "segment mapped");
    Ok(shmem)
}

fn view_of(shmem: &Shmem, slots: usize) -> Result<RingView> {
    let base = NonNull::new(shmem.as_ptr()).ok_or_else(|| {
        QueueError::Config(format!("segment {} mapped at null", shmem.get_os_id()))
    })?;
    // SAFETY: `open_segment` checked the length, mappings are page aligned and
    // the Shmem lives in the same ShmQueue as the view.
    Ok(unsafe { RingView::new(base, slots) })
}

pub struct ShmQueue {
    tx: Producer,
    rx: Consumer,
    hook: Option<Box<dyn PeerRegionHook + Send>>,
    // Keep the mappings alive for the views above. Dropped last.
    send_shmem: Shmem,
    recv_shmem: Shmem,
}

// SAFETY: the raw views only point into the two mappings owned by this value,
// and the ring protocol needs exactly one owner per side, not a fixed thread.
unsafe impl Send for ShmQueue {}

impl ShmQueue {
    pub fn create(cfg: &ShmQueueConfig) -> Result<Queue<ShmQueue>> {
        ShmQueue::open(cfg, None)
    }

    pub fn create_with_hook(
        cfg: &ShmQueueConfig,
        hook: Box<dyn PeerRegionHook + Send>,
    ) -> Result<Queue<ShmQueue>> {
        ShmQueue::open(cfg, Some(hook))
    }

    fn open(
        cfg: &ShmQueueConfig,
        hook: Option<Box<dyn PeerRegionHook + Send>>,
    ) -> Result<Queue<ShmQueue>> {
        cfg.validate()?;
        let size = segment_size(cfg.slots);
        let send = open_segment(&cfg.send_name, size)?;
        let recv = open_segment(&cfg.recv_name, size)?;

        let tx_view = view_of(&send, cfg.slots)?;
        let rx_view = view_of(&recv, cfg.slots)?;
        if cfg.clear {
            tx_view.clear();
            rx_view.clear();
        }

        let backend = ShmQueue {
            tx: Producer::new(tx_view),
            rx: Consumer::new(rx_view),
            hook,
            send_shmem: send,
            recv_shmem: recv,
        };
        debug!(send = %cfg.send_name, recv = %cfg.recv_name, slots = cfg.slots, "shm queue ready");
        Ok(Queue::with_pool(
            backend,
            RegionPool::with_first_id(cfg.region_id_base),
        ))
    }

    /// Descriptors that fit in the send ring at once.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Notifications the peer has posted so far.
    pub fn peer_notifications(&self) -> u64 {
        self.rx.notifications()
    }

    fn apply_register(&mut self, pool: &mut RegionPool, rid: RegionId, cap: Capability) {
        if let Err(e) = pool.add_peer_region(cap, rid) {
            warn!(rid, error = %e, "ignoring region announced by peer");
            return;
        }
        debug!(rid, len = cap.len, "peer registered region");
        if let Some(hook) = self.hook.as_mut() {
            if let Err(e) = hook.region_registered(rid, &cap) {
                warn!(rid, error = %e, "peer region hook failed");
            }
        }
    }

    fn apply_deregister(&mut self, pool: &mut RegionPool, rid: RegionId) {
        // The peer may only withdraw what it announced.
        match pool.is_peer_region(rid) {
            Ok(true) => {}
            Ok(false) => {
                warn!(rid, "ignoring peer withdrawal of a local region");
                return;
            }
            Err(e) => {
                warn!(rid, error = %e, "ignoring region withdrawn by peer");
                return;
            }
        }
        if let Err(e) = pool.remove_region(rid) {
            warn!(rid, error = %e, "ignoring region withdrawn by peer");
            return;
        }
        debug!(rid, "peer deregistered region");
        if let Some(hook) = self.hook.as_mut() {
            if let Err(e) = hook.region_deregistered(rid) {
                warn!(rid, error = %e, "peer region hook failed");
            }
        }
    }
}

impl Backend for ShmQueue {
    fn register(&mut self, cap: Capability, rid: RegionId) -> Result<()> {
        self.tx.push(&SlotRecord::register(rid, &cap))
    }

    fn deregister(&mut self, rid: RegionId) -> Result<()> {
        self.tx.push(&SlotRecord::deregister(rid))
    }

    fn control(&mut self, request: u64, _value: u64) -> Result<u64> {
        match request {
            control::QUERY_CAPACITY => Ok(self.tx.capacity() as u64),
            control::QUERY_FREE_SLOTS => Ok(self.tx.free_slots() as u64),
            control::QUERY_NOTIFICATIONS => Ok(self.rx.notifications()),
            _ => Err(QueueError::UnknownFlag(request)),
        }
    }

    fn notify(&mut self) -> Result<()> {
        self.tx.notify();
        Ok(())
    }

    fn enqueue(&mut self, buf: &Buffer) -> Result<()> {
        self.tx.push(&SlotRecord::data(*buf))
    }

    fn dequeue(&mut self, pool: &mut RegionPool) -> Result<Buffer> {
        // Control slots are applied and skipped until data or nothing is left.
        loop {
            let record = self.rx.poll().ok_or(QueueError::QueueEmpty)?;
            match record.command() {
                Some(Command::Data) => return Ok(record.buffer),
                Some(Command::RegisterRegion) => {
                    self.apply_register(pool, record.buffer.rid, record.capability())
                }
                Some(Command::DeregisterRegion) => self.apply_deregister(pool, record.buffer.rid),
                None => {
                    warn!(cmd = record.cmd, "dropping slot with unknown command");
                    return Err(QueueError::UnknownFlag(record.cmd));
                }
            }
        }
    }

    fn destroy(&mut self) -> Result<()> {
        debug!(
            send = %self.send_shmem.get_os_id(),
            recv = %self.recv_shmem.get_os_id(),
            "unmapping shm queue"
        );
        Ok(())
    }
}
