use tracing::{debug, trace, warn};

use crate::errors::{QueueError, Result};
use crate::region::{Buffer, Capability, RegionId, RegionPool};

/// Bits of the flags word understood by every backend.
pub mod flags {
    /// Marks the last fragment of a multi-buffer packet.
    pub const LAST: u64 = 1 << 30;
}

/// Requests understood by [`Queue::control`]. Backends may not support all.
pub mod control {
    /// Number of descriptors the queue can hold.
    pub const QUERY_CAPACITY: u64 = 1;
    /// Number of descriptors that can be enqueued right now.
    pub const QUERY_FREE_SLOTS: u64 = 2;
    /// Number of notifications the peer has posted so far.
    pub const QUERY_NOTIFICATIONS: u64 = 3;
}

/// The operations a queue backend provides. The region bookkeeping and all
/// buffer validation live in [`Queue`]; a backend only moves descriptors.
pub trait Backend {
    /// Called after the region was added to the pool. An error rolls the
    /// pool insertion back.
    fn register(&mut self, _cap: Capability, _rid: RegionId) -> Result<()> {
        Ok(())
    }

    /// Called before the region is removed from the pool.
    fn deregister(&mut self, _rid: RegionId) -> Result<()> {
        Ok(())
    }

    fn control(&mut self, request: u64, _value: u64) -> Result<u64> {
        Err(QueueError::UnknownFlag(request))
    }

    /// Tells the other side that new descriptors are available.
    fn notify(&mut self) -> Result<()> {
        Ok(())
    }

    fn enqueue(&mut self, buf: &Buffer) -> Result<()>;

    /// Backends that carry region updates in band apply them to `pool`.
    fn dequeue(&mut self, pool: &mut RegionPool) -> Result<Buffer>;

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn register(&mut self, cap: Capability, rid: RegionId) -> Result<()> {
        (**self).register(cap, rid)
    }

    fn deregister(&mut self, rid: RegionId) -> Result<()> {
        (**self).deregister(rid)
    }

    fn control(&mut self, request: u64, value: u64) -> Result<u64> {
        (**self).control(request, value)
    }

    fn notify(&mut self) -> Result<()> {
        (**self).notify()
    }

    fn enqueue(&mut self, buf: &Buffer) -> Result<()> {
        (**self).enqueue(buf)
    }

    fn dequeue(&mut self, pool: &mut RegionPool) -> Result<Buffer> {
        (**self).dequeue(pool)
    }

    fn destroy(&mut self) -> Result<()> {
        (**self).destroy()
    }
}

/// A queue handle: the region pool plus one backend.
pub struct Queue<B: Backend> {
    pool: RegionPool,
    backend: B,
}

impl<B: Backend> Queue<B> {
    pub fn new(backend: B) -> Queue<B> {
        Queue::with_pool(backend, RegionPool::new())
    }

    pub fn with_pool(backend: B, pool: RegionPool) -> Queue<B> {
        Queue { pool, backend }
    }

    pub fn pool(&self) -> &RegionPool {
        &self.pool
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Registers a region under a pool-chosen id.
    pub fn register(&mut self, cap: Capability) -> Result<RegionId> {
        let rid = self.pool.add_region(cap)?;
        self.register_hook(cap, rid)?;
        Ok(rid)
    }

    /// Registers a region under `rid`.
    pub fn register_with_id(&mut self, cap: Capability, rid: RegionId) -> Result<()> {
        self.pool.add_region_with_id(cap, rid)?;
        self.register_hook(cap, rid)
    }

    fn register_hook(&mut self, cap: Capability, rid: RegionId) -> Result<()> {
        if let Err(e) = self.backend.register(cap, rid) {
            // Fresh region, nothing can be in flight yet.
            let _ = self.pool.remove_region(rid);
            debug!(rid, error = %e, "backend refused region");
            return Err(e);
        }
        debug!(rid, len = cap.len, "registered region");
        Ok(())
    }

    /// Removes a region. Refused for regions the peer announced and while
    /// buffers of it are in flight; in both cases the backend is not asked.
    pub fn deregister(&mut self, rid: RegionId) -> Result<Capability> {
        if self.pool.is_peer_region(rid)? {
            return Err(QueueError::RegionNotOwned(rid));
        }
        if self.pool.outstanding(rid)? > 0 {
            return Err(QueueError::RegionHasOutstandingBuffers(rid));
        }
        self.backend.deregister(rid)?;
        let cap = self.pool.remove_region(rid)?;
        debug!(rid, "deregistered region");
        Ok(cap)
    }

    pub fn enqueue(&mut self, buf: Buffer) -> Result<()> {
        let transfer = self.pool.prepare_enqueue(&buf)?;
        self.backend.enqueue(&buf)?;
        self.pool.commit(transfer);
        trace!(?buf, "enqueued");
        Ok(())
    }

    /// A descriptor the pool refuses is already consumed from the backend;
    /// it comes back inside [`QueueError::Rejected`].
    pub fn dequeue(&mut self) -> Result<Buffer> {
        let buf = self.backend.dequeue(&mut self.pool)?;
        if let Err(e) = self.pool.record_dequeue(&buf) {
            warn!(?buf, error = %e, "rejected dequeued descriptor");
            return Err(QueueError::Rejected {
                buf,
                source: Box::new(e),
            });
        }
        trace!(?buf, "dequeued");
        Ok(buf)
    }

    pub fn notify(&mut self) -> Result<()> {
        self.backend.notify()
    }

    pub fn control(&mut self, request: u64, value: u64) -> Result<u64> {
        self.backend.control(request, value)
    }

    /// Tears down the backend, then the pool. Buffers still in flight are
    /// reported after the cleanup is done.
    pub fn destroy(mut self) -> Result<()> {
        let backend_result = self.backend.destroy();
        let busy = self.pool.first_busy_region();
        drop(self);
        backend_result?;
        match busy {
            Some(rid) => {
                warn!(rid, "queue destroyed with buffers in flight");
                Err(QueueError::RegionHasOutstandingBuffers(rid))
            }
            None => Ok(()),
        }
    }
}
