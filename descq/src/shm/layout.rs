//! Byte layout of a shared-memory ring segment.
//!
//! Both processes encode and decode slots explicitly, so the layout does not
//! depend on how either side was compiled.
//!
//! ```text
//! cell 0          header: ack seq (u64 @0), notify count (u64 @8), padding
//! cell 1..=slots  ring slots, SLOT_SIZE bytes each
//! ```
//!
//! Slot fields, all little-endian:
//!
//! | offset | field        | type |
//! |--------|--------------|------|
//! | 0      | offset       | u64  |
//! | 8      | length       | u64  |
//! | 16     | valid_data   | u64  |
//! | 24     | valid_length | u64  |
//! | 32     | flags        | u64  |
//! | 40     | seq          | u64  |
//! | 48     | cmd          | u64  |
//! | 56     | rid          | u32  |
//! | 60     | padding      | 4    |

use crate::region::{Buffer, Capability, RegionId};

pub const CACHE_LINE: usize = 64;
pub const SLOT_SIZE: usize = 64;
pub const HEADER_SIZE: usize = CACHE_LINE;
/// 63 slots plus the header make a 4096-byte segment.
pub const DEFAULT_SLOTS: usize = 63;
pub const MIN_SLOTS: usize = 2;

pub const ACK_OFFSET: usize = 0;
pub const NOTIFY_OFFSET: usize = 8;

pub const OFFSET_FIELD: usize = 0;
pub const LENGTH_FIELD: usize = 8;
pub const VALID_DATA_FIELD: usize = 16;
pub const VALID_LENGTH_FIELD: usize = 24;
pub const FLAGS_FIELD: usize = 32;
pub const SEQ_FIELD: usize = 40;
pub const CMD_FIELD: usize = 48;
pub const RID_FIELD: usize = 56;

/// Sequence number of the first slot a producer writes. A zeroed slot
/// therefore never looks published.
pub const FIRST_SEQ: u64 = 1;

pub const CMD_DATA: u64 = 0;
pub const CMD_REGISTER: u64 = 1;
pub const CMD_DEREGISTER: u64 = 2;

pub fn segment_size(slots: usize) -> usize {
    HEADER_SIZE + slots * SLOT_SIZE
}

#[inline]
pub fn slot_offset(index: usize) -> usize {
    HEADER_SIZE + index * SLOT_SIZE
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Data,
    RegisterRegion,
    DeregisterRegion,
}

impl Command {
    pub fn from_raw(cmd: u64) -> Option<Command> {
        match cmd {
            CMD_DATA => Some(Command::Data),
            CMD_REGISTER => Some(Command::RegisterRegion),
            CMD_DEREGISTER => Some(Command::DeregisterRegion),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            Command::Data => CMD_DATA,
            Command::RegisterRegion => CMD_REGISTER,
            Command::DeregisterRegion => CMD_DEREGISTER,
        }
    }
}

/// Everything a slot carries except its sequence number.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlotRecord {
    pub buffer: Buffer,
    pub cmd: u64,
}

impl SlotRecord {
    pub fn data(buffer: Buffer) -> SlotRecord {
        SlotRecord {
            buffer,
            cmd: CMD_DATA,
        }
    }

    /// Region announcement: vaddr travels in `offset`, len in `length` and
    /// paddr in `valid_data`.
    pub fn register(rid: RegionId, cap: &Capability) -> SlotRecord {
        SlotRecord {
            buffer: Buffer::new(rid, cap.vaddr, cap.len, cap.paddr, 0, 0),
            cmd: CMD_REGISTER,
        }
    }

    pub fn deregister(rid: RegionId) -> SlotRecord {
        SlotRecord {
            buffer: Buffer::new(rid, 0, 0, 0, 0, 0),
            cmd: CMD_DEREGISTER,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_raw(self.cmd)
    }

    pub fn capability(&self) -> Capability {
        Capability::new(self.buffer.offset, self.buffer.valid_data, self.buffer.length)
    }

    /// Writes all fields but `seq`; those bytes are left zero.
    pub fn encode(&self, out: &mut [u8; SLOT_SIZE]) {
        let b = &self.buffer;
        put_u64(out, OFFSET_FIELD, b.offset);
        put_u64(out, LENGTH_FIELD, b.length);
        put_u64(out, VALID_DATA_FIELD, b.valid_data);
        put_u64(out, VALID_LENGTH_FIELD, b.valid_length);
        put_u64(out, FLAGS_FIELD, b.flags);
        put_u64(out, SEQ_FIELD, 0);
        put_u64(out, CMD_FIELD, self.cmd);
        out[RID_FIELD..RID_FIELD + 4].copy_from_slice(&b.rid.to_le_bytes());
        out[RID_FIELD + 4..].fill(0);
    }

    pub fn decode(raw: &[u8; SLOT_SIZE]) -> SlotRecord {
        SlotRecord {
            buffer: Buffer::new(
                get_u32(raw, RID_FIELD),
                get_u64(raw, OFFSET_FIELD),
                get_u64(raw, LENGTH_FIELD),
                get_u64(raw, VALID_DATA_FIELD),
                get_u64(raw, VALID_LENGTH_FIELD),
                get_u64(raw, FLAGS_FIELD),
            ),
            cmd: get_u64(raw, CMD_FIELD),
        }
    }
}

#[inline]
fn put_u64(out: &mut [u8; SLOT_SIZE], at: usize, v: u64) {
    out[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn get_u64(raw: &[u8; SLOT_SIZE], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
fn get_u32(raw: &[u8; SLOT_SIZE], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[at..at + 4]);
    u32::from_le_bytes(bytes)
}
