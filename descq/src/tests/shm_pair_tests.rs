use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use shared_memory::{Shmem, ShmemConf};

use crate::shm::layout::{slot_offset, SlotRecord, ACK_OFFSET, SEQ_FIELD, SLOT_SIZE};
use crate::{
    control, Buffer, Capability, PeerRegionHook, Queue, QueueError, RegionId, Result, ShmQueue,
    ShmQueueConfig,
};

const BUF_SIZE: u64 = 2048;

fn unique_config(slots: usize) -> ShmQueueConfig {
    static SHMEM_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = SHMEM_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    let stem = format!("descq_test_{}_{}", std::process::id(), n);
    ShmQueueConfig {
        send_name: format!("{}_ab", stem),
        recv_name: format!("{}_ba", stem),
        slots,
        clear: true,
        region_id_base: 1,
    }
}

fn pair(slots: usize) -> (ShmQueueConfig, Queue<ShmQueue>, Queue<ShmQueue>) {
    let cfg = unique_config(slots);
    let a = ShmQueue::create(&cfg).unwrap();
    let b = ShmQueue::create(&cfg.peer()).unwrap();
    (cfg, a, b)
}

fn raw_mapping(name: &str) -> Shmem {
    ShmemConf::new().os_id(format!("/{}", name)).open().unwrap()
}

/// Writes `record` as the slot with sequence `seq`, as a producer would.
fn publish_raw(seg: &Shmem, slots: usize, seq: u64, record: &SlotRecord) {
    let mut raw = [0u8; SLOT_SIZE];
    record.encode(&mut raw);
    raw[SEQ_FIELD..SEQ_FIELD + 8].copy_from_slice(&seq.to_le_bytes());
    let at = slot_offset((seq % slots as u64) as usize);
    // SAFETY: the slot lies inside the segment and its producer is idle.
    unsafe { std::ptr::copy_nonoverlapping(raw.as_ptr(), seg.as_ptr().add(at), SLOT_SIZE) }
}

fn assert_empty(q: &mut Queue<ShmQueue>) {
    assert!(matches!(q.dequeue(), Err(QueueError::QueueEmpty)));
}

#[test]
fn region_of_8192_bytes_round_trips() {
    let (_, mut a, mut b) = pair(16);
    let mem = vec![0u8; 8192];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();
    assert_eq!(rid, 1);

    let sent = Buffer::new(1, 0, 2048, 0, 64, 0);
    a.enqueue(sent).unwrap();
    assert_eq!(b.dequeue().unwrap(), sent);
    assert_empty(&mut b);
}

#[test]
fn control_slots_are_applied_not_returned() {
    let (_, mut a, mut b) = pair(16);
    let mem = vec![0u8; 4 * BUF_SIZE as usize];
    let cap = Capability::from_slice(&mem);
    let rid = a.register(cap).unwrap();
    assert!(b.pool().lookup_by_id(rid).is_err());

    let sent = Buffer::new(rid, BUF_SIZE, BUF_SIZE, 14, 100, 0x0102);
    a.enqueue(sent).unwrap();

    assert_eq!(b.dequeue().unwrap(), sent);
    assert_eq!(b.pool().lookup_by_id(rid).unwrap(), cap);
    assert!(b.pool().is_peer_region(rid).unwrap());
    // The address belongs to the other process.
    assert!(matches!(
        b.pool().lookup_by_base_address(cap.vaddr),
        Err(QueueError::UnknownAddress(_))
    ));
    assert_empty(&mut b);
}

#[test]
fn flow_control_leaves_one_slot_free() {
    let (_, mut a, mut b) = pair(8);
    let mem = vec![0u8; 16 * BUF_SIZE as usize];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();
    // Takes the registration slot out of the ring.
    assert_empty(&mut b);

    assert_eq!(a.control(control::QUERY_CAPACITY, 0).unwrap(), 7);
    for i in 0..7 {
        a.enqueue(Buffer::new(rid, i * BUF_SIZE, BUF_SIZE, 0, 0, i)).unwrap();
    }
    assert_eq!(a.control(control::QUERY_FREE_SLOTS, 0).unwrap(), 0);
    let extra = Buffer::new(rid, 7 * BUF_SIZE, BUF_SIZE, 0, 0, 7);
    assert!(matches!(a.enqueue(extra), Err(QueueError::QueueFull)));
    // A refused enqueue leaves the buffer with its owner.
    assert_eq!(a.pool().outstanding(rid).unwrap(), 7);

    b.dequeue().unwrap();
    a.enqueue(extra).unwrap();
    let another = Buffer::new(rid, 8 * BUF_SIZE, BUF_SIZE, 0, 0, 8);
    assert!(matches!(a.enqueue(another), Err(QueueError::QueueFull)));
}

#[test]
fn descriptors_arrive_in_order() {
    let (_, mut a, mut b) = pair(64);
    let mem = vec![0u8; 64 * BUF_SIZE as usize];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();

    let sent: Vec<Buffer> = (0..40)
        .map(|i| Buffer::new(rid, i * BUF_SIZE, BUF_SIZE, i % 7, 64, i << 8))
        .collect();
    for buf in &sent {
        a.enqueue(*buf).unwrap();
    }
    let received: Vec<Buffer> = (0..40).map(|_| b.dequeue().unwrap()).collect();
    assert_eq!(received, sent);
}

#[test]
fn echoed_buffer_returns_to_its_owner() {
    let (_, mut a, mut b) = pair(16);
    let mem = vec![0u8; 4 * BUF_SIZE as usize];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();
    let buf = Buffer::new(rid, 0, BUF_SIZE, 0, 64, 0);

    a.enqueue(buf).unwrap();
    assert!(matches!(
        a.deregister(rid),
        Err(QueueError::RegionHasOutstandingBuffers(r)) if r == rid
    ));

    let held = b.dequeue().unwrap();
    assert_eq!(b.pool().outstanding(rid).unwrap(), 1);
    b.enqueue(held).unwrap();
    assert_eq!(b.pool().outstanding(rid).unwrap(), 0);

    assert_eq!(a.dequeue().unwrap(), buf);
    assert_eq!(a.pool().outstanding(rid).unwrap(), 0);

    // The refused deregistration above never reached the peer.
    assert!(b.pool().lookup_by_id(rid).is_ok());
    a.deregister(rid).unwrap();
    assert_empty(&mut b);
    assert!(b.pool().is_empty());

    a.destroy().unwrap();
    b.destroy().unwrap();
}

#[test]
fn peer_cannot_return_more_than_it_got() {
    let (_, mut a, mut b) = pair(16);
    let mem = vec![0u8; 4 * BUF_SIZE as usize];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();
    a.enqueue(Buffer::new(rid, 0, BUF_SIZE, 0, 64, 0)).unwrap();
    b.dequeue().unwrap();

    // Overlaps the held buffer without being it.
    assert!(matches!(
        b.enqueue(Buffer::new(rid, 64, 128, 0, 0, 0)),
        Err(QueueError::BufferAlreadyInUse)
    ));
    assert!(matches!(
        b.enqueue(Buffer::new(rid, 0, 8 * BUF_SIZE, 0, 0, 0)),
        Err(QueueError::BufferNotInRegion)
    ));
}

#[derive(Clone, Default)]
struct SeenRegions(Arc<Mutex<Vec<(RegionId, Option<Capability>)>>>);

impl PeerRegionHook for SeenRegions {
    fn region_registered(&mut self, rid: RegionId, cap: &Capability) -> Result<()> {
        self.0.lock().unwrap().push((rid, Some(*cap)));
        Ok(())
    }

    fn region_deregistered(&mut self, rid: RegionId) -> Result<()> {
        self.0.lock().unwrap().push((rid, None));
        Ok(())
    }
}

#[test]
fn peer_hook_sees_region_updates() {
    let cfg = unique_config(16);
    let seen = SeenRegions::default();
    let mut a = ShmQueue::create(&cfg).unwrap();
    let mut b = ShmQueue::create_with_hook(&cfg.peer(), Box::new(seen.clone())).unwrap();

    let first = vec![0u8; 4096];
    let second = vec![0u8; 4096];
    let r1 = a.register(Capability::from_slice(&first)).unwrap();
    let r2 = a.register(Capability::from_slice(&second)).unwrap();
    a.deregister(r1).unwrap();
    assert_empty(&mut b);

    assert_eq!(
        *seen.0.lock().unwrap(),
        vec![
            (r1, Some(Capability::from_slice(&first))),
            (r2, Some(Capability::from_slice(&second))),
            (r1, None),
        ]
    );
    assert_eq!(b.pool().region_ids(), vec![r2]);
}

#[test]
fn both_sides_register_without_id_clashes() {
    let (cfg, mut a, mut b) = pair(16);
    let mem_a = vec![0u8; 4096];
    let mem_b = vec![0u8; 4096];
    let ra = a.register(Capability::from_slice(&mem_a)).unwrap();
    let rb = b.register(Capability::from_slice(&mem_b)).unwrap();
    assert_ne!(ra, rb);
    assert_eq!(rb, cfg.peer().region_id_base);

    assert_empty(&mut a);
    assert_empty(&mut b);
    assert_eq!(a.pool().len(), 2);
    assert_eq!(b.pool().len(), 2);
}

#[test]
fn full_ring_rolls_back_registration() {
    let (_, mut a, mut b) = pair(4);
    let regions: Vec<Vec<u8>> = (0..4).map(|_| vec![0u8; 1024]).collect();
    for mem in &regions[..3] {
        a.register(Capability::from_slice(mem)).unwrap();
    }
    assert!(matches!(
        a.register(Capability::from_slice(&regions[3])),
        Err(QueueError::QueueFull)
    ));
    assert_eq!(a.pool().len(), 3);

    assert_empty(&mut b);
    assert_eq!(b.pool().len(), 3);
    a.register(Capability::from_slice(&regions[3])).unwrap();
    assert_empty(&mut b);
    assert_eq!(b.pool().len(), 4);
}

#[test]
fn notifications_reach_the_peer() {
    let (_, mut a, mut b) = pair(8);
    assert_eq!(b.control(control::QUERY_NOTIFICATIONS, 0).unwrap(), 0);
    a.notify().unwrap();
    a.notify().unwrap();
    assert_eq!(b.backend().peer_notifications(), 2);
    assert_eq!(b.control(control::QUERY_NOTIFICATIONS, 0).unwrap(), 2);
    assert_eq!(a.control(control::QUERY_NOTIFICATIONS, 0).unwrap(), 0);
    assert!(matches!(a.control(42, 0), Err(QueueError::UnknownFlag(42))));
}

#[test]
fn data_slot_bytes_are_fixed() {
    let (cfg, mut a, _b) = pair(8);
    let mem = vec![0u8; 8192];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();
    a.enqueue(Buffer::new(rid, 2048, 1024, 16, 32, 0xabcd)).unwrap();

    let seg = raw_mapping(&cfg.send_name);
    // SAFETY: the segment holds eight slots and nothing writes it now.
    let bytes = unsafe { std::slice::from_raw_parts(seg.as_ptr(), slot_offset(3)) };
    let seq_at = |index: usize| {
        let at = slot_offset(index) + SEQ_FIELD;
        &bytes[at..at + 8]
    };
    // Sequence 1 is the registration in slot 1, the data follows in slot 2.
    assert_eq!(seq_at(1), &1u64.to_le_bytes());
    assert_eq!(seq_at(2), &2u64.to_le_bytes());
    assert_eq!(seq_at(0), &0u64.to_le_bytes());

    let slot = &bytes[slot_offset(2)..slot_offset(2) + SLOT_SIZE];
    assert_eq!(&slot[0..8], &2048u64.to_le_bytes());
    assert_eq!(&slot[8..16], &1024u64.to_le_bytes());
    assert_eq!(&slot[16..24], &16u64.to_le_bytes());
    assert_eq!(&slot[24..32], &32u64.to_le_bytes());
    assert_eq!(&slot[32..40], &0xabcdu64.to_le_bytes());
    assert_eq!(&slot[48..56], &0u64.to_le_bytes());
    assert_eq!(&slot[56..60], &rid.to_le_bytes());
    assert_eq!(&bytes[ACK_OFFSET..ACK_OFFSET + 8], &0u64.to_le_bytes());
}

#[test]
fn unknown_command_is_reported_and_skipped() {
    let (cfg, _a, mut b) = pair(8);
    let seg = raw_mapping(&cfg.send_name);
    let mut record = SlotRecord::data(Buffer::new(1, 0, 64, 0, 0, 0));
    record.cmd = 7;
    publish_raw(&seg, cfg.slots, 1, &record);

    assert!(matches!(b.dequeue(), Err(QueueError::UnknownFlag(7))));
    assert_empty(&mut b);
}

#[test]
fn descriptor_for_unknown_region_is_handed_back() {
    let (cfg, _a, mut b) = pair(8);
    let seg = raw_mapping(&cfg.send_name);
    let stray = Buffer::new(99, 0, 64, 0, 8, 0);
    publish_raw(&seg, cfg.slots, 1, &SlotRecord::data(stray));

    match b.dequeue() {
        Err(e @ QueueError::Rejected { .. }) => {
            assert_eq!(e.rejected_buffer(), Some(stray));
            assert!(e.to_string().contains("unknown region 99"));
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    assert_empty(&mut b);
}

#[test]
fn bad_peer_control_slots_are_skipped() {
    let cfg = unique_config(8);
    let seen = SeenRegions::default();
    let _a = ShmQueue::create(&cfg).unwrap();
    let mut b = ShmQueue::create_with_hook(&cfg.peer(), Box::new(seen.clone())).unwrap();
    let mem = vec![0u8; 4096];
    let own = b.register(Capability::from_slice(&mem)).unwrap();

    let seg = raw_mapping(&cfg.send_name);
    let announced = Capability::new(0x10_0000, 0x10_0000, 8192);
    let data = Buffer::new(5, 0, 1024, 0, 10, 0);
    // Unknown id, the peer's own region, a clashing id, then a good one.
    publish_raw(&seg, cfg.slots, 1, &SlotRecord::deregister(77));
    publish_raw(&seg, cfg.slots, 2, &SlotRecord::deregister(own));
    publish_raw(&seg, cfg.slots, 3, &SlotRecord::register(own, &announced));
    publish_raw(&seg, cfg.slots, 4, &SlotRecord::register(5, &announced));
    publish_raw(&seg, cfg.slots, 5, &SlotRecord::data(data));

    assert_eq!(b.dequeue().unwrap(), data);
    assert_empty(&mut b);
    assert_eq!(*seen.0.lock().unwrap(), vec![(5, Some(announced))]);
    assert_eq!(b.pool().lookup_by_id(own).unwrap(), Capability::from_slice(&mem));
    assert!(!b.pool().is_peer_region(own).unwrap());
    assert!(b.pool().is_peer_region(5).unwrap());
}

#[test]
fn colliding_base_addresses_stay_apart() {
    let (_, mut a, mut b) = pair(16);
    // Both processes happen to map their region at the same address.
    let shared_base = Capability::new(0x10_0000, 0x10_0000, 8192);
    let rb = b.register(shared_base).unwrap();
    let ra = a.register(shared_base).unwrap();

    let sent = Buffer::new(ra, 0, 2048, 0, 64, 0);
    a.enqueue(sent).unwrap();
    assert_eq!(b.dequeue().unwrap(), sent);
    assert_eq!(b.pool().lookup_by_base_address(shared_base.vaddr).unwrap(), rb);
    assert!(b.pool().is_peer_region(ra).unwrap());

    b.enqueue(sent).unwrap();
    assert_eq!(a.dequeue().unwrap(), sent);
    assert_eq!(a.pool().lookup_by_base_address(shared_base.vaddr).unwrap(), ra);
    assert!(a.pool().is_peer_region(rb).unwrap());

    a.deregister(ra).unwrap();
    assert_empty(&mut b);
    assert_eq!(b.pool().region_ids(), vec![rb]);
}

#[test]
fn only_the_owner_withdraws_a_region() {
    let (_, mut a, mut b) = pair(16);
    let mem = vec![0u8; 4 * BUF_SIZE as usize];
    let rb = b.register(Capability::from_slice(&mem)).unwrap();
    let lent = Buffer::new(rb, 0, BUF_SIZE, 0, 64, 0);
    b.enqueue(lent).unwrap();

    // Not seen yet, then seen but owned by the peer.
    assert!(matches!(a.deregister(rb), Err(QueueError::UnknownRegion(_))));
    assert_eq!(a.dequeue().unwrap(), lent);
    assert!(matches!(
        a.deregister(rb),
        Err(QueueError::RegionNotOwned(r)) if r == rb
    ));
    // Nor may this side lend out buffers of the peer's region.
    assert!(matches!(
        a.enqueue(Buffer::new(rb, BUF_SIZE, BUF_SIZE, 0, 0, 0)),
        Err(QueueError::RegionNotOwned(_))
    ));
    assert_empty(&mut b);

    a.enqueue(lent).unwrap();
    assert!(matches!(
        b.deregister(rb),
        Err(QueueError::RegionHasOutstandingBuffers(_))
    ));
    assert_eq!(b.dequeue().unwrap(), lent);
    b.deregister(rb).unwrap();
    assert_empty(&mut a);
    assert!(a.pool().is_empty());
}

#[test]
fn undersized_segment_is_refused() {
    let (cfg, _a, _b) = pair(4);
    let bigger = ShmQueueConfig {
        slots: 63,
        clear: false,
        ..cfg
    };
    assert!(matches!(
        ShmQueue::create(&bigger),
        Err(QueueError::SegmentTooSmall { expected: 4096, .. })
    ));
}

#[test]
fn echo_thread_returns_every_buffer() {
    const TOTAL: u64 = 2000;
    const IN_REGION: u64 = 64;

    let (_, mut a, mut b) = pair(16);
    let mem = vec![0u8; (IN_REGION * BUF_SIZE) as usize];
    let rid = a.register(Capability::from_slice(&mem)).unwrap();

    let echo = thread::spawn(move || {
        let mut echoed = 0;
        let mut pending: Option<Buffer> = None;
        while echoed < TOTAL {
            if let Some(buf) = pending {
                match b.enqueue(buf) {
                    Ok(()) => {
                        pending = None;
                        echoed += 1;
                        b.notify().unwrap();
                    }
                    Err(QueueError::QueueFull) => thread::yield_now(),
                    Err(e) => panic!("echo enqueue failed: {}", e),
                }
                continue;
            }
            match b.dequeue() {
                Ok(buf) => pending = Some(buf),
                Err(QueueError::QueueEmpty) => thread::yield_now(),
                Err(e) => panic!("echo dequeue failed: {}", e),
            }
        }
        b
    });

    let expected = |i: u64| Buffer::new(rid, (i % IN_REGION) * BUF_SIZE, BUF_SIZE, 0, 60, i);
    let mut sent = 0;
    let mut received = 0;
    while received < TOTAL {
        if sent < TOTAL {
            match a.enqueue(expected(sent)) {
                Ok(()) => sent += 1,
                Err(QueueError::QueueFull) => {}
                Err(e) => panic!("enqueue failed: {}", e),
            }
        }
        match a.dequeue() {
            Ok(buf) => {
                assert_eq!(buf, expected(received));
                received += 1;
            }
            Err(QueueError::QueueEmpty) => thread::yield_now(),
            Err(e) => panic!("dequeue failed: {}", e),
        }
    }

    let b = echo.join().unwrap();
    assert_eq!(a.pool().outstanding(rid).unwrap(), 0);
    assert_eq!(b.pool().outstanding(rid).unwrap(), 0);
    a.deregister(rid).unwrap();
    a.destroy().unwrap();
    b.destroy().unwrap();
}
