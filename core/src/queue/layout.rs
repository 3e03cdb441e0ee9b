//! On-disk layout of the product queue.
//!
//! A queue file is `[header][slot table][signature index][time index][data]`,
//! all fields big-endian. The layout must round-trip bit-exactly across
//! processes; every structure here has a fixed size computed from the slot
//! count and data capacity in the header.

use byteorder::{BigEndian, ByteOrder};

use crate::feedtype::Feedtype;
use crate::product::{ProductInfo, Signature, Timestamp};

pub const MAGIC: u32 = 0x5354_5051; // "STPQ"
pub const VERSION: u32 = 1;

/// Bytes reserved for the header region.
pub const HEADER_SIZE: usize = 256;

/// Fixed size of one slot-table entry.
pub const SLOT_SIZE: usize = 384;
/// Inline identifier capacity within a slot entry.
pub const MAX_IDENT: usize = 224;
/// Inline origin-host capacity within a slot entry.
pub const MAX_ORIGIN: usize = 64;

/// One signature-index or time-index entry.
pub const INDEX_ENTRY_SIZE: usize = 24;

/// Slot states. Anything else is corruption.
pub const SLOT_FREE: u32 = 0;
/// Reserved by a writer; payload not yet committed. Not indexed.
pub const SLOT_WRITING: u32 = 1;
/// Committed and indexed.
pub const SLOT_LIVE: u32 = 2;

/// Queue header. The mutable fields change only under the header lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub slot_count: u64,
    pub data_capacity: u64,
    pub oldest: Timestamp,
    pub youngest: Timestamp,
    /// Monotonic per-insert counter; timestamp tie-break and wake signal.
    pub seq: u64,
    /// Number of LIVE slots; equals both index lengths.
    pub live: u64,
    /// Total slots reclaimed to make room.
    pub evictions: u64,
    /// Largest `(arrival, qseq)` key ever evicted; consumers whose cursor is
    /// behind it have missed products (overrun).
    pub evicted_key: (Timestamp, u64),
    pub slot_table_root: u64,
    pub sig_index_root: u64,
    pub time_index_root: u64,
    pub data_root: u64,
}

impl Header {
    pub fn encode(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..], self.magic);
        BigEndian::write_u32(&mut buf[4..], self.version);
        BigEndian::write_u64(&mut buf[8..], self.slot_count);
        BigEndian::write_u64(&mut buf[16..], self.data_capacity);
        BigEndian::write_u64(&mut buf[24..], self.oldest.sec);
        BigEndian::write_u64(&mut buf[32..], self.oldest.usec as u64);
        BigEndian::write_u64(&mut buf[40..], self.youngest.sec);
        BigEndian::write_u64(&mut buf[48..], self.youngest.usec as u64);
        BigEndian::write_u64(&mut buf[56..], self.seq);
        BigEndian::write_u64(&mut buf[64..], self.live);
        BigEndian::write_u64(&mut buf[72..], self.evictions);
        BigEndian::write_u64(&mut buf[80..], self.evicted_key.0.sec);
        BigEndian::write_u64(&mut buf[88..], self.evicted_key.0.usec as u64);
        BigEndian::write_u64(&mut buf[96..], self.evicted_key.1);
        BigEndian::write_u64(&mut buf[104..], self.slot_table_root);
        BigEndian::write_u64(&mut buf[112..], self.sig_index_root);
        BigEndian::write_u64(&mut buf[120..], self.time_index_root);
        BigEndian::write_u64(&mut buf[128..], self.data_root);
    }

    pub fn decode(buf: &[u8]) -> Header {
        Header {
            magic: BigEndian::read_u32(&buf[0..]),
            version: BigEndian::read_u32(&buf[4..]),
            slot_count: BigEndian::read_u64(&buf[8..]),
            data_capacity: BigEndian::read_u64(&buf[16..]),
            oldest: Timestamp::new(
                BigEndian::read_u64(&buf[24..]),
                BigEndian::read_u64(&buf[32..]) as u32,
            ),
            youngest: Timestamp::new(
                BigEndian::read_u64(&buf[40..]),
                BigEndian::read_u64(&buf[48..]) as u32,
            ),
            seq: BigEndian::read_u64(&buf[56..]),
            live: BigEndian::read_u64(&buf[64..]),
            evictions: BigEndian::read_u64(&buf[72..]),
            evicted_key: (
                Timestamp::new(
                    BigEndian::read_u64(&buf[80..]),
                    BigEndian::read_u64(&buf[88..]) as u32,
                ),
                BigEndian::read_u64(&buf[96..]),
            ),
            slot_table_root: BigEndian::read_u64(&buf[104..]),
            sig_index_root: BigEndian::read_u64(&buf[112..]),
            time_index_root: BigEndian::read_u64(&buf[120..]),
            data_root: BigEndian::read_u64(&buf[128..]),
        }
    }
}

/// One slot-table entry: placement, metadata, and the payload fence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotEntry {
    pub flags: u32,
    /// Payload offset relative to the data root.
    pub offset: u64,
    pub length: u32,
    pub crc: u32,
    pub arrival: Timestamp,
    /// Queue-assigned sequence; tie-break for equal arrival times.
    pub qseq: u64,
    pub signature: Signature,
    pub feedtype: Feedtype,
    pub seqno: u32,
    pub ident: String,
    pub origin: String,
}

impl SlotEntry {
    pub fn vacant() -> SlotEntry {
        SlotEntry {
            flags: SLOT_FREE,
            offset: 0,
            length: 0,
            crc: 0,
            arrival: Timestamp::default(),
            qseq: 0,
            signature: Signature::default(),
            feedtype: Feedtype(0),
            seqno: 0,
            ident: String::new(),
            origin: String::new(),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SLOT_SIZE);
        BigEndian::write_u32(&mut buf[0..], self.flags);
        BigEndian::write_u64(&mut buf[4..], self.offset);
        BigEndian::write_u32(&mut buf[12..], self.length);
        BigEndian::write_u32(&mut buf[16..], self.crc);
        BigEndian::write_u64(&mut buf[20..], self.arrival.sec);
        BigEndian::write_u32(&mut buf[28..], self.arrival.usec);
        BigEndian::write_u64(&mut buf[32..], self.qseq);
        buf[40..56].copy_from_slice(self.signature.as_bytes());
        BigEndian::write_u32(&mut buf[56..], self.feedtype.0);
        BigEndian::write_u32(&mut buf[60..], self.seqno);
        let ident = self.ident.as_bytes();
        let origin = self.origin.as_bytes();
        let ident_len = ident.len().min(MAX_IDENT);
        let origin_len = origin.len().min(MAX_ORIGIN);
        BigEndian::write_u16(&mut buf[64..], ident_len as u16);
        BigEndian::write_u16(&mut buf[66..], origin_len as u16);
        buf[68..68 + ident_len].copy_from_slice(&ident[..ident_len]);
        for b in &mut buf[68 + ident_len..68 + MAX_IDENT] {
            *b = 0;
        }
        let origin_off = 68 + MAX_IDENT;
        buf[origin_off..origin_off + origin_len].copy_from_slice(&origin[..origin_len]);
        for b in &mut buf[origin_off + origin_len..origin_off + MAX_ORIGIN] {
            *b = 0;
        }
    }

    pub fn decode(buf: &[u8]) -> SlotEntry {
        debug_assert!(buf.len() >= SLOT_SIZE);
        let mut sig = [0u8; 16];
        sig.copy_from_slice(&buf[40..56]);
        let ident_len = (BigEndian::read_u16(&buf[64..]) as usize).min(MAX_IDENT);
        let origin_len = (BigEndian::read_u16(&buf[66..]) as usize).min(MAX_ORIGIN);
        let origin_off = 68 + MAX_IDENT;
        SlotEntry {
            flags: BigEndian::read_u32(&buf[0..]),
            offset: BigEndian::read_u64(&buf[4..]),
            length: BigEndian::read_u32(&buf[12..]),
            crc: BigEndian::read_u32(&buf[16..]),
            arrival: Timestamp::new(
                BigEndian::read_u64(&buf[20..]),
                BigEndian::read_u32(&buf[28..]),
            ),
            qseq: BigEndian::read_u64(&buf[32..]),
            signature: Signature(sig),
            feedtype: Feedtype(BigEndian::read_u32(&buf[56..])),
            seqno: BigEndian::read_u32(&buf[60..]),
            ident: String::from_utf8_lossy(&buf[68..68 + ident_len]).into_owned(),
            origin: String::from_utf8_lossy(&buf[origin_off..origin_off + origin_len])
                .into_owned(),
        }
    }

    pub fn info(&self) -> ProductInfo {
        ProductInfo {
            signature: self.signature,
            arrival: self.arrival,
            feedtype: self.feedtype,
            seqno: self.seqno,
            ident: self.ident.clone(),
            origin: self.origin.clone(),
            size: self.length,
        }
    }
}

/// Signature-index entry: signature bytes then the slot id.
pub fn encode_sig_entry(buf: &mut [u8], sig: &Signature, slot: u32) {
    buf[0..16].copy_from_slice(sig.as_bytes());
    BigEndian::write_u32(&mut buf[16..], slot);
    BigEndian::write_u32(&mut buf[20..], 0);
}

pub fn decode_sig_entry(buf: &[u8]) -> (Signature, u32) {
    let mut sig = [0u8; 16];
    sig.copy_from_slice(&buf[0..16]);
    (Signature(sig), BigEndian::read_u32(&buf[16..]))
}

/// Time-index entry: `(sec, usec, qseq, slot)`, ordered by `(sec, usec, qseq)`.
pub fn encode_time_entry(buf: &mut [u8], ts: Timestamp, qseq: u64, slot: u32) {
    BigEndian::write_u64(&mut buf[0..], ts.sec);
    BigEndian::write_u32(&mut buf[8..], ts.usec);
    BigEndian::write_u64(&mut buf[12..], qseq);
    BigEndian::write_u32(&mut buf[20..], slot);
}

pub fn decode_time_entry(buf: &[u8]) -> (Timestamp, u64, u32) {
    (
        Timestamp::new(BigEndian::read_u64(&buf[0..]), BigEndian::read_u32(&buf[8..])),
        BigEndian::read_u64(&buf[12..]),
        BigEndian::read_u32(&buf[20..]),
    )
}

/// Region offsets derived from the header geometry.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub slot_count: usize,
    pub data_capacity: u64,
    pub slot_table: usize,
    pub sig_index: usize,
    pub time_index: usize,
    pub data: usize,
}

impl Geometry {
    pub fn new(slot_count: usize, data_capacity: u64) -> Geometry {
        let slot_table = HEADER_SIZE;
        let sig_index = slot_table + slot_count * SLOT_SIZE;
        let time_index = sig_index + slot_count * INDEX_ENTRY_SIZE;
        let data = time_index + slot_count * INDEX_ENTRY_SIZE;
        Geometry {
            slot_count,
            data_capacity,
            slot_table,
            sig_index,
            time_index,
            data,
        }
    }

    pub fn file_size(&self) -> u64 {
        self.data as u64 + self.data_capacity
    }

    pub fn slot_offset(&self, slot: usize) -> usize {
        self.slot_table + slot * SLOT_SIZE
    }

    pub fn sig_entry_offset(&self, index: usize) -> usize {
        self.sig_index + index * INDEX_ENTRY_SIZE
    }

    pub fn time_entry_offset(&self, index: usize) -> usize {
        self.time_index + index * INDEX_ENTRY_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_header_roundtrip() {
        let hdr = Header {
            magic: MAGIC,
            version: VERSION,
            slot_count: 1024,
            data_capacity: 1 << 20,
            oldest: Timestamp::new(1000, 1),
            youngest: Timestamp::new(2000, 999_999),
            seq: 77,
            live: 42,
            evictions: 5,
            evicted_key: (Timestamp::new(1500, 3), 9),
            slot_table_root: HEADER_SIZE as u64,
            sig_index_root: 1,
            time_index_root: 2,
            data_root: 3,
        };
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(Header::decode(&buf), hdr);
    }

    #[test]
    fn layout_slot_roundtrip() {
        let entry = SlotEntry {
            flags: SLOT_LIVE,
            offset: 4096,
            length: 100,
            crc: 0xdead_beef,
            arrival: Timestamp::new(1000, 42),
            qseq: 9,
            signature: Signature([1; 16]),
            feedtype: Feedtype(0b110),
            seqno: 12,
            ident: "ABCD12 KWBC 012330".to_string(),
            origin: "origin.example".to_string(),
        };
        let mut buf = [0u8; SLOT_SIZE];
        entry.encode(&mut buf);
        assert_eq!(SlotEntry::decode(&buf), entry);
    }

    #[test]
    fn layout_slot_truncates_long_ident() {
        let mut entry = SlotEntry::vacant();
        entry.ident = "x".repeat(MAX_IDENT + 50);
        let mut buf = [0u8; SLOT_SIZE];
        entry.encode(&mut buf);
        assert_eq!(SlotEntry::decode(&buf).ident.len(), MAX_IDENT);
    }

    #[test]
    fn layout_index_entries_roundtrip() {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        let sig = Signature([7; 16]);
        encode_sig_entry(&mut buf, &sig, 13);
        assert_eq!(decode_sig_entry(&buf), (sig, 13));

        encode_time_entry(&mut buf, Timestamp::new(55, 66), 3, 8);
        assert_eq!(decode_time_entry(&buf), (Timestamp::new(55, 66), 3, 8));
    }

    #[test]
    fn layout_geometry_regions_do_not_overlap() {
        let g = Geometry::new(16, 4096);
        assert!(g.slot_table >= HEADER_SIZE);
        assert!(g.sig_index >= g.slot_table + 16 * SLOT_SIZE);
        assert!(g.time_index >= g.sig_index + 16 * INDEX_ENTRY_SIZE);
        assert!(g.data >= g.time_index + 16 * INDEX_ENTRY_SIZE);
        assert_eq!(g.file_size(), g.data as u64 + 4096);
    }
}
