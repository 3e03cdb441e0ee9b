//! The product queue: a bounded, crash-resistant, memory-mapped FIFO of
//! timestamped products shared between processes.
//!
//! The queue file holds a header, a fixed slot table, two in-file sorted
//! indexes (by signature for insert-time deduplication, by arrival time for
//! cursor scans), and a variable-extent data region. All cross-process
//! coordination is by advisory byte-range file locks; there is no in-process
//! owner, so a participant may die at any point and another recovers.
//! Within one process, a writer gate serializes inserts and a light rwlock
//! guards index mutation against concurrent searches (fcntl locks do not
//! conflict within a single process).
//!
//! Lock order is signature index → header/allocator → time index → slot;
//! slot locks inside an insert are only ever *tried*, never waited on, so
//! a reader stalled in its handler can pin a slot without deadlocking a
//! writer.

mod layout;
mod lock;
mod region;

pub use self::layout::{Header, HEADER_SIZE, MAX_IDENT, MAX_ORIGIN};

use self::layout::{
    decode_sig_entry, decode_time_entry, encode_sig_entry, encode_time_entry, Geometry, SlotEntry,
    INDEX_ENTRY_SIZE, MAGIC, SLOT_FREE, SLOT_LIVE, SLOT_SIZE, SLOT_WRITING, VERSION,
};
use self::lock::{lock_range, try_lock_range, LockKind, RangeLock};
use self::region::RegionMap;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use thiserror::Error;

use crate::class::ProductClass;
use crate::control::SignalControl;
use crate::product::{Product, ProductInfo, Signature, Timestamp, TS_ZERO};

/// Default queue geometry for newly created queues.
pub const DEFAULT_SLOTS: usize = 4096;
pub const DEFAULT_CAPACITY: u64 = 500 * 1024 * 1024;

/// Cross-process wake latency bound for [`ProductQueue::suspend`].
const SUSPEND_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("not a product queue (magic {found:#010x})")]
    BadMagic { found: u32 },

    #[error("unsupported queue version {found}")]
    BadVersion { found: u32 },

    #[error("queue file truncated: {actual} bytes, expected {expected}")]
    Truncated { actual: u64, expected: u64 },

    #[error("every evictable slot is pinned by a reader")]
    AllPinned,
}

/// Result of an insert attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored; carries the queue-assigned arrival timestamp.
    Inserted(Timestamp),
    /// A product with this signature is already present; dropped.
    Duplicate,
    /// Larger than the whole data region; dropped.
    TooBig,
}

/// Result of a cursor step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextOutcome {
    /// A product was visited. `matched` tells whether the class selected it;
    /// `delivered` is false only when the handler refused it (the cursor
    /// then stays put so the product is retried).
    Processed { matched: bool, delivered: bool },
    /// Nothing beyond the cursor.
    EndOfQueue,
    /// The slot failed its fence checks; the cursor advanced past it.
    Corrupt,
}

/// Why a suspended consumer woke.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    NewData,
    Timeout,
    /// Products this cursor had not yet read were evicted; the gap is
    /// accepted and reported once.
    Overrun,
    Interrupted,
}

/// Per-consumer read position: resume strictly after `(ts, qseq)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub ts: Timestamp,
    pub qseq: u64,
    overrun_pending: bool,
    overrun_ack: (Timestamp, u64),
}

impl Cursor {
    /// From the beginning of the queue.
    pub fn zero() -> Cursor {
        Cursor {
            ts: TS_ZERO,
            qseq: 0,
            overrun_pending: false,
            overrun_ack: (TS_ZERO, 0),
        }
    }

    /// Strictly after every product whose arrival time is `<= ts`.
    pub fn after(ts: Timestamp) -> Cursor {
        Cursor {
            ts,
            qseq: u64::MAX,
            overrun_pending: false,
            overrun_ack: (TS_ZERO, 0),
        }
    }

    fn key(&self) -> (Timestamp, u64) {
        (self.ts, self.qseq)
    }

    fn advance(&mut self, ts: Timestamp, qseq: u64) {
        self.ts = ts;
        self.qseq = qseq;
    }
}

/// Live occupancy and bookkeeping snapshot, for monitoring.
#[derive(Clone, Copy, Debug)]
pub struct QueueStats {
    pub live: u64,
    pub used_bytes: u64,
    pub data_capacity: u64,
    pub evictions: u64,
    pub oldest: Timestamp,
    pub youngest: Timestamp,
}

pub struct ProductQueue {
    file: File,
    path: PathBuf,
    geom: Geometry,
    base: *mut u8,
    _map: MmapMut,
    /// Serializes inserts within this process.
    writer_gate: Mutex<()>,
    /// Index-array mutation vs. search, within this process.
    index_rw: RwLock<()>,
    /// Slots pinned by in-process readers mid-handler.
    pins: Mutex<HashMap<u32, usize>>,
    /// Local wake for suspend(); cross-process wake is header polling.
    wake: (Mutex<u64>, Condvar),
}

// SAFETY: the raw mapping base is shared across threads deliberately; all
// mutation happens behind the fcntl protocol plus the in-process gate and
// rwlock described in the module docs.
unsafe impl Send for ProductQueue {}
unsafe impl Sync for ProductQueue {}

impl ProductQueue {
    /// Creates (or truncates) a queue file with the given geometry.
    pub fn create(path: &Path, slot_count: usize, data_capacity: u64) -> Result<Self, QueueError> {
        let geom = Geometry::new(slot_count, data_capacity);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(geom.file_size())?;
        let queue = Self::map(file, path.to_path_buf(), geom)?;
        let header = Header {
            magic: MAGIC,
            version: VERSION,
            slot_count: slot_count as u64,
            data_capacity,
            oldest: TS_ZERO,
            youngest: TS_ZERO,
            seq: 0,
            live: 0,
            evictions: 0,
            evicted_key: (TS_ZERO, 0),
            slot_table_root: geom.slot_table as u64,
            sig_index_root: geom.sig_index as u64,
            time_index_root: geom.time_index as u64,
            data_root: geom.data as u64,
        };
        queue.write_header(&header);
        queue._map.flush()?;
        log::info!(
            "created product queue {} ({} slots, {} data bytes)",
            path.display(),
            slot_count,
            data_capacity
        );
        Ok(queue)
    }

    /// Opens an existing queue, verifying magic and version.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut head = [0u8; HEADER_SIZE];
        {
            use std::io::Read;
            let mut f = &file;
            let n = f.read(&mut head)?;
            if n < HEADER_SIZE {
                return Err(QueueError::Truncated {
                    actual: n as u64,
                    expected: HEADER_SIZE as u64,
                });
            }
        }
        let header = Header::decode(&head);
        if header.magic != MAGIC {
            return Err(QueueError::BadMagic {
                found: header.magic,
            });
        }
        if header.version != VERSION {
            return Err(QueueError::BadVersion {
                found: header.version,
            });
        }
        let geom = Geometry::new(header.slot_count as usize, header.data_capacity);
        let actual = file.metadata()?.len();
        if actual < geom.file_size() {
            return Err(QueueError::Truncated {
                actual,
                expected: geom.file_size(),
            });
        }
        Self::map(file, path.to_path_buf(), geom)
    }

    /// Opens `path`, creating it with the given geometry when absent.
    pub fn open_or_create(
        path: &Path,
        slot_count: usize,
        data_capacity: u64,
    ) -> Result<Self, QueueError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, slot_count, data_capacity)
        }
    }

    fn map(file: File, path: PathBuf, geom: Geometry) -> Result<Self, QueueError> {
        // SAFETY: the mapping covers a regular file we keep open for the
        // queue's lifetime; concurrent mutation is governed by the lock
        // protocol.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();
        Ok(ProductQueue {
            file,
            path,
            geom,
            base,
            _map: map,
            writer_gate: Mutex::new(()),
            index_rw: RwLock::new(()),
            pins: Mutex::new(HashMap::new()),
            wake: (Mutex::new(0), Condvar::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        // SAFETY: offset/len stay inside the mapping (geometry-derived) and
        // writers to the same region hold the covering lock.
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        // SAFETY: as above; callers hold the exclusive lock covering the
        // region they mutate.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    fn header(&self) -> Header {
        Header::decode(self.bytes(0, HEADER_SIZE))
    }

    fn write_header(&self, header: &Header) {
        header.encode(self.bytes_mut(0, HEADER_SIZE));
    }

    fn slot(&self, slot: u32) -> SlotEntry {
        SlotEntry::decode(self.bytes(self.geom.slot_offset(slot as usize), SLOT_SIZE))
    }

    fn write_slot(&self, slot: u32, entry: &SlotEntry) {
        entry.encode(self.bytes_mut(self.geom.slot_offset(slot as usize), SLOT_SIZE));
    }

    // ------------------------------------------------------------------
    // Lock helpers. Ranges correspond to the on-disk regions they guard.

    fn lock_sig_index(&self, kind: LockKind) -> Result<RangeLock, QueueError> {
        Ok(lock_range(
            &self.file,
            self.geom.sig_index as u64,
            (self.geom.slot_count * INDEX_ENTRY_SIZE) as u64,
            kind,
        )?)
    }

    fn lock_header(&self, kind: LockKind) -> Result<RangeLock, QueueError> {
        Ok(lock_range(&self.file, 0, HEADER_SIZE as u64, kind)?)
    }

    fn lock_time_index(&self, kind: LockKind) -> Result<RangeLock, QueueError> {
        Ok(lock_range(
            &self.file,
            self.geom.time_index as u64,
            (self.geom.slot_count * INDEX_ENTRY_SIZE) as u64,
            kind,
        )?)
    }

    fn lock_slot(&self, slot: u32, kind: LockKind) -> Result<RangeLock, QueueError> {
        Ok(lock_range(
            &self.file,
            self.geom.slot_offset(slot as usize) as u64,
            SLOT_SIZE as u64,
            kind,
        )?)
    }

    fn try_lock_slot(&self, slot: u32, kind: LockKind) -> Result<Option<RangeLock>, QueueError> {
        Ok(try_lock_range(
            &self.file,
            self.geom.slot_offset(slot as usize) as u64,
            SLOT_SIZE as u64,
            kind,
        )?)
    }

    // ------------------------------------------------------------------
    // Index arrays. Callers hold the corresponding region lock; in-process
    // searches additionally hold `index_rw`.

    fn sig_index_find(&self, sig: &Signature, live: usize) -> Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = live;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (entry_sig, _) =
                decode_sig_entry(self.bytes(self.geom.sig_entry_offset(mid), INDEX_ENTRY_SIZE));
            match entry_sig.cmp(sig) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn time_entry(&self, index: usize) -> (Timestamp, u64, u32) {
        decode_time_entry(self.bytes(self.geom.time_entry_offset(index), INDEX_ENTRY_SIZE))
    }

    /// First index position whose `(ts, qseq)` exceeds `key`.
    fn time_index_upper_bound(&self, key: (Timestamp, u64), live: usize) -> usize {
        let mut lo = 0usize;
        let mut hi = live;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (ts, qseq, _) = self.time_entry(mid);
            if (ts, qseq) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn index_insert(&self, region_root: usize, at: usize, live: usize, entry: &[u8]) {
        debug_assert!(at <= live && live < self.geom.slot_count);
        let src = region_root + at * INDEX_ENTRY_SIZE;
        let moving = (live - at) * INDEX_ENTRY_SIZE;
        if moving > 0 {
            self.bytes_mut(src, moving + INDEX_ENTRY_SIZE)
                .copy_within(0..moving, INDEX_ENTRY_SIZE);
        }
        self.bytes_mut(src, INDEX_ENTRY_SIZE).copy_from_slice(entry);
    }

    fn index_remove(&self, region_root: usize, at: usize, live: usize) {
        debug_assert!(at < live);
        let src = region_root + at * INDEX_ENTRY_SIZE;
        let moving = (live - at - 1) * INDEX_ENTRY_SIZE;
        if moving > 0 {
            self.bytes_mut(src, moving + INDEX_ENTRY_SIZE)
                .copy_within(INDEX_ENTRY_SIZE.., 0);
        }
    }

    // ------------------------------------------------------------------
    // Insert path.

    /// Appends a product. Assigns the arrival timestamp, rejects duplicate
    /// signatures and oversized payloads, and evicts oldest products to make
    /// room. The caller's handler context must not re-enter `insert` on the
    /// same queue.
    pub fn insert(&self, product: &Product) -> Result<InsertOutcome, QueueError> {
        let _gate = self.writer_gate.lock().unwrap();
        let need = product.data.len() as u64;

        let _sig_lock = self.lock_sig_index(LockKind::Exclusive)?;
        let mut header = self.header();

        if self
            .sig_index_find(&product.info.signature, header.live as usize)
            .is_ok()
        {
            log::debug!("duplicate product {}", product.info.signature);
            return Ok(InsertOutcome::Duplicate);
        }
        if need > header.data_capacity {
            log::warn!(
                "product {} ({} bytes) exceeds queue capacity {}",
                product.info.ident,
                need,
                header.data_capacity
            );
            return Ok(InsertOutcome::TooBig);
        }

        let _header_lock = self.lock_header(LockKind::Exclusive)?;
        let _time_lock = self.lock_time_index(LockKind::Exclusive)?;

        // Any WRITING slot observed under the header lock belongs to a dead
        // writer; reclaim it before accounting free space.
        let mut regions = RegionMap::new(header.data_capacity, vec![]);
        let mut free_slot = None;
        for slot in 0..self.geom.slot_count as u32 {
            let entry = self.slot(slot);
            match entry.flags {
                SLOT_LIVE => regions.claim(entry.offset, entry.length as u64),
                SLOT_WRITING => {
                    log::warn!("reclaiming abandoned slot {} from a dead writer", slot);
                    let mut vacated = SlotEntry::vacant();
                    vacated.flags = SLOT_FREE;
                    self.write_slot(slot, &vacated);
                    if free_slot.is_none() {
                        free_slot = Some(slot);
                    }
                }
                _ => {
                    if free_slot.is_none() {
                        free_slot = Some(slot);
                    }
                }
            }
        }

        // Evict oldest until a slot entry and a contiguous run are free.
        let mut data_offset;
        loop {
            data_offset = regions.first_fit(need);
            if data_offset.is_some() && free_slot.is_some() {
                break;
            }
            let victim = self.evict_oldest(&mut header, &mut regions)?;
            if free_slot.is_none() {
                free_slot = Some(victim);
            }
        }
        let data_offset = data_offset.unwrap_or_default();
        let slot = free_slot.unwrap_or_default();

        // Reserve the slot before touching the data region, so a crash
        // between here and commit leaves a reclaimable WRITING slot.
        let mut entry = SlotEntry {
            flags: SLOT_WRITING,
            offset: data_offset,
            length: product.data.len() as u32,
            crc: {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&product.data);
                hasher.finalize()
            },
            arrival: TS_ZERO,
            qseq: 0,
            signature: product.info.signature,
            feedtype: product.info.feedtype,
            seqno: product.info.seqno,
            ident: product.info.ident.clone(),
            origin: product.info.origin.clone(),
        };
        self.write_slot(slot, &entry);

        let payload_at = self.geom.data + data_offset as usize;
        self.bytes_mut(payload_at, product.data.len())
            .copy_from_slice(&product.data);
        // Indexes must never point at unwritten payload bytes.
        self._map.flush_range(payload_at, product.data.len())?;

        let mut arrival = Timestamp::now();
        if arrival < header.youngest {
            arrival = header.youngest;
        }
        let qseq = header.seq;
        header.seq += 1;

        entry.flags = SLOT_LIVE;
        entry.arrival = arrival;
        entry.qseq = qseq;
        self.write_slot(slot, &entry);

        {
            let _w = self.index_rw.write().unwrap();
            let live = header.live as usize;

            let at = self
                .sig_index_find(&product.info.signature, live)
                .unwrap_err();
            let mut buf = [0u8; INDEX_ENTRY_SIZE];
            encode_sig_entry(&mut buf, &product.info.signature, slot);
            self.index_insert(self.geom.sig_index, at, live, &buf);

            let at = self.time_index_upper_bound((arrival, qseq), live);
            encode_time_entry(&mut buf, arrival, qseq, slot);
            self.index_insert(self.geom.time_index, at, live, &buf);

            header.live += 1;
            header.youngest = arrival;
            if header.live == 1 {
                header.oldest = arrival;
            }
            self.write_header(&header);
        }

        // Locks release in reverse acquisition order as the guards drop.
        self.notify_local();
        log::debug!(
            "inserted {} at {} (slot {}, {} bytes)",
            product.info.ident,
            arrival,
            slot,
            product.data.len()
        );
        Ok(InsertOutcome::Inserted(arrival))
    }

    /// Evicts the oldest non-pinned live slot. Caller holds the signature,
    /// header, and time-index locks.
    fn evict_oldest(&self, header: &mut Header, regions: &mut RegionMap) -> Result<u32, QueueError> {
        let live = header.live as usize;
        for position in 0..live {
            let (ts, qseq, slot) = self.time_entry(position);
            // Readers pin while still holding the index read lock, so a pin
            // taken before this write lock is always visible here.
            let _w = self.index_rw.write().unwrap();
            if self.pins.lock().unwrap().contains_key(&slot) {
                log::warn!("eviction skipping slot {}: pinned by a local reader", slot);
                continue;
            }
            // A reader in another process holds a shared slot lock; skip it.
            let slot_lock = self.try_lock_slot(slot, LockKind::Exclusive)?;
            if slot_lock.is_none() {
                log::warn!("eviction skipping slot {}: read-locked by another process", slot);
                continue;
            }

            let entry = self.slot(slot);
            {
                if let Ok(at) = self.sig_index_find(&entry.signature, live) {
                    self.index_remove(self.geom.sig_index, at, live);
                }
                self.index_remove(self.geom.time_index, position, live);
            }
            regions.release(entry.offset);
            let mut vacated = SlotEntry::vacant();
            vacated.flags = SLOT_FREE;
            self.write_slot(slot, &vacated);

            header.live -= 1;
            header.evictions += 1;
            if header.evicted_key < (ts, qseq) {
                header.evicted_key = (ts, qseq);
            }
            header.oldest = if header.live == 0 {
                header.youngest
            } else {
                self.time_entry(0).0
            };
            self.write_header(header);
            log::debug!("evicted slot {} ({} {})", slot, ts, entry.ident);
            return Ok(slot);
        }
        Err(QueueError::AllPinned)
    }

    // ------------------------------------------------------------------
    // Read path.

    /// Visits the first product strictly after `cursor` in arrival order.
    ///
    /// Non-matching products advance the cursor and count as delivered, so
    /// durable consumers can persist progress over skipped items. The
    /// handler runs with the slot read-locked (the payload cannot be
    /// reclaimed underneath it) and must not insert into the same queue.
    pub fn next<H>(
        &self,
        cursor: &mut Cursor,
        class: &ProductClass,
        mut handler: H,
    ) -> Result<NextOutcome, QueueError>
    where
        H: FnMut(&ProductInfo, &[u8]) -> bool,
    {
        let (slot, entry_ts, entry_qseq, _slot_lock) = {
            let _time_lock = self.lock_time_index(LockKind::Shared)?;
            let _r = self.index_rw.read().unwrap();
            let header = self.header();
            let live = header.live as usize;
            let at = self.time_index_upper_bound(cursor.key(), live);
            if at >= live {
                return Ok(NextOutcome::EndOfQueue);
            }
            if header.evicted_key > cursor.key() && header.evicted_key > cursor.overrun_ack {
                cursor.overrun_pending = true;
            }
            let (ts, qseq, slot) = self.time_entry(at);
            // Acquired while the time index is held shared, so the slot
            // cannot be evicted between the index read and this lock; the
            // pin must also land before `_r` drops so an in-process writer
            // sees it.
            let slot_lock = self.lock_slot(slot, LockKind::Shared)?;
            self.pin(slot);
            (slot, ts, qseq, slot_lock)
        };

        let outcome = self.visit_slot(cursor, class, &mut handler, slot, entry_ts, entry_qseq);
        self.unpin(slot);
        outcome
    }

    fn visit_slot<H>(
        &self,
        cursor: &mut Cursor,
        class: &ProductClass,
        handler: &mut H,
        slot: u32,
        entry_ts: Timestamp,
        entry_qseq: u64,
    ) -> Result<NextOutcome, QueueError>
    where
        H: FnMut(&ProductInfo, &[u8]) -> bool,
    {
        let entry = self.slot(slot);
        if entry.flags != SLOT_LIVE || entry.qseq != entry_qseq {
            log::error!("slot {} no longer matches its index entry", slot);
            cursor.advance(entry_ts, entry_qseq);
            return Ok(NextOutcome::Corrupt);
        }
        let payload = self.bytes(
            self.geom.data + entry.offset as usize,
            entry.length as usize,
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != entry.crc {
            log::error!(
                "slot {} fails its payload fence ({} bytes at {})",
                slot,
                entry.length,
                entry.offset
            );
            cursor.advance(entry_ts, entry_qseq);
            return Ok(NextOutcome::Corrupt);
        }

        let info = entry.info();
        if !class.matches(&info) {
            cursor.advance(entry_ts, entry_qseq);
            return Ok(NextOutcome::Processed {
                matched: false,
                delivered: true,
            });
        }
        let delivered = handler(&info, payload);
        if delivered {
            cursor.advance(entry_ts, entry_qseq);
        }
        Ok(NextOutcome::Processed {
            matched: true,
            delivered,
        })
    }

    fn pin(&self, slot: u32) {
        *self.pins.lock().unwrap().entry(slot).or_insert(0) += 1;
    }

    fn unpin(&self, slot: u32) {
        let mut pins = self.pins.lock().unwrap();
        if let Some(count) = pins.get_mut(&slot) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&slot);
            }
        }
    }

    // ------------------------------------------------------------------
    // Waiting.

    fn notify_local(&self) {
        let (gen, condvar) = &self.wake;
        *gen.lock().unwrap() += 1;
        condvar.notify_all();
    }

    /// Blocks up to `interval` for a product beyond `cursor` to appear.
    ///
    /// Pending overrun is reported (once) in preference to anything else.
    /// In-process inserts wake immediately; inserts from other processes
    /// are noticed within [`SUSPEND_POLL`]. Interruptible via `control`.
    pub fn suspend(
        &self,
        cursor: &mut Cursor,
        interval: Duration,
        control: Option<&SignalControl>,
    ) -> Wake {
        let deadline = Instant::now() + interval;
        let start_seq = self.header().seq;
        loop {
            // Unsynchronized header peek; the overrun branch re-reads under
            // the header lock before reporting so a torn read cannot raise a
            // false alarm.
            let header = self.header();
            if cursor.overrun_pending
                || (header.evicted_key > cursor.key() && header.evicted_key > cursor.overrun_ack)
            {
                let confirmed = match self.lock_header(LockKind::Shared) {
                    Ok(_held) => self.header().evicted_key,
                    Err(_) => header.evicted_key,
                };
                if cursor.overrun_pending
                    || (confirmed > cursor.key() && confirmed > cursor.overrun_ack)
                {
                    cursor.overrun_pending = false;
                    cursor.overrun_ack = confirmed.max(cursor.overrun_ack);
                    return Wake::Overrun;
                }
            }
            if header.seq != start_seq {
                return Wake::NewData;
            }
            if let Some(control) = control {
                if control.interrupted() {
                    return Wake::Interrupted;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Wake::Timeout;
            }
            let step = SUSPEND_POLL.min(deadline - now);
            let (gen, condvar) = &self.wake;
            let guard = gen.lock().unwrap();
            let _unused = condvar.wait_timeout(guard, step).unwrap();
        }
    }

    // ------------------------------------------------------------------
    // Positioning.

    /// Cursor at the current tail: only products inserted later are seen.
    pub fn cursor_at_end(&self) -> Result<Cursor, QueueError> {
        let _time_lock = self.lock_time_index(LockKind::Shared)?;
        let _r = self.index_rw.read().unwrap();
        let header = self.header();
        if header.live == 0 {
            // Position after everything ever inserted; the next insert gets
            // a larger qseq, so it is still seen.
            if header.seq == 0 {
                return Ok(Cursor::zero());
            }
            let mut cursor = Cursor::zero();
            cursor.advance(header.youngest, header.seq - 1);
            return Ok(cursor);
        }
        let (ts, qseq, _) = self.time_entry(header.live as usize - 1);
        let mut cursor = Cursor::zero();
        cursor.advance(ts, qseq);
        Ok(cursor)
    }

    /// Cursor resuming strictly after the product with `sig`, when present.
    pub fn cursor_from_signature(&self, sig: &Signature) -> Result<Option<Cursor>, QueueError> {
        let _sig_lock = self.lock_sig_index(LockKind::Shared)?;
        let _r = self.index_rw.read().unwrap();
        let header = self.header();
        let at = match self.sig_index_find(sig, header.live as usize) {
            Ok(at) => at,
            Err(_) => return Ok(None),
        };
        let (_, slot) =
            decode_sig_entry(self.bytes(self.geom.sig_entry_offset(at), INDEX_ENTRY_SIZE));
        let entry = self.slot(slot);
        let mut cursor = Cursor::zero();
        cursor.advance(entry.arrival, entry.qseq);
        Ok(Some(cursor))
    }

    pub fn stats(&self) -> QueueStats {
        let header = self.header();
        let mut used = 0u64;
        for slot in 0..self.geom.slot_count as u32 {
            let entry = self.slot(slot);
            if entry.flags == SLOT_LIVE {
                used += entry.length as u64;
            }
        }
        QueueStats {
            live: header.live,
            used_bytes: used,
            data_capacity: header.data_capacity,
            evictions: header.evictions,
            oldest: header.oldest,
            youngest: header.youngest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassSpec;
    use crate::feedtype::Feedtype;

    fn make_queue(slots: usize, capacity: u64) -> (tempfile::TempDir, ProductQueue) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pq");
        let queue = ProductQueue::create(&path, slots, capacity).unwrap();
        (dir, queue)
    }

    fn product(ident: &str, size: usize, fill: u8) -> Product {
        Product::new(
            Feedtype(0b110),
            1,
            ident,
            "test.host",
            vec![fill; size],
        )
    }

    fn any_class() -> ProductClass {
        ProductClass::new(vec![ClassSpec::new(Feedtype(u32::MAX), ".*").unwrap()])
    }

    #[test]
    fn queue_insert_read_roundtrip() {
        let (_dir, queue) = make_queue(16, 1 << 20);
        let p = product("foo", 100, 7);
        let outcome = queue.insert(&p).unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));

        let mut cursor = Cursor::zero();
        let mut seen = vec![];
        let outcome = queue
            .next(&mut cursor, &any_class(), |info, data| {
                seen.push((info.clone(), data.to_vec()));
                true
            })
            .unwrap();
        assert_eq!(
            outcome,
            NextOutcome::Processed {
                matched: true,
                delivered: true
            }
        );
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.ident, "foo");
        assert_eq!(seen[0].1, vec![7u8; 100]);

        let outcome = queue.next(&mut cursor, &any_class(), |_, _| true).unwrap();
        assert_eq!(outcome, NextOutcome::EndOfQueue);
    }

    #[test]
    fn queue_duplicate_signature_rejected() {
        let (_dir, queue) = make_queue(16, 1 << 20);
        let p = product("foo", 100, 7);
        assert!(matches!(
            queue.insert(&p).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        let again = Product::new(Feedtype(1), 9, "other-name", "elsewhere", vec![7u8; 100]);
        assert_eq!(queue.insert(&again).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(queue.stats().live, 1);
    }

    #[test]
    fn queue_too_big_rejected() {
        let (_dir, queue) = make_queue(16, 1024);
        let p = product("huge", 2048, 1);
        assert_eq!(queue.insert(&p).unwrap(), InsertOutcome::TooBig);
    }

    #[test]
    fn queue_eviction_and_overrun() {
        let (_dir, queue) = make_queue(64, 1024);
        for i in 0..10 {
            let p = product(&format!("prod{}", i), 200, i as u8);
            assert!(matches!(
                queue.insert(&p).unwrap(),
                InsertOutcome::Inserted(_)
            ));
        }
        let stats = queue.stats();
        assert!(stats.evictions > 0);
        assert!(stats.live >= 4 && stats.live <= 5);

        let mut cursor = Cursor::zero();
        let mut seen = vec![];
        loop {
            match queue
                .next(&mut cursor, &any_class(), |info, _| {
                    seen.push(info.ident.clone());
                    true
                })
                .unwrap()
            {
                NextOutcome::EndOfQueue => break,
                NextOutcome::Processed { .. } | NextOutcome::Corrupt => {}
            }
        }
        // The newest products survive; the earliest were reclaimed.
        assert_eq!(seen.len() as u64, stats.live);
        assert_eq!(seen.last().unwrap(), "prod9");
        assert!(!seen.contains(&"prod0".to_string()));

        // The first suspend reports the missed products exactly once.
        let wake = queue.suspend(&mut cursor, Duration::from_millis(1), None);
        assert_eq!(wake, Wake::Overrun);
        let wake = queue.suspend(&mut cursor, Duration::from_millis(1), None);
        assert_eq!(wake, Wake::Timeout);
    }

    #[test]
    fn queue_delivery_order_is_monotonic() {
        let (_dir, queue) = make_queue(32, 1 << 20);
        for i in 0..20 {
            queue.insert(&product(&format!("p{}", i), 50, i as u8)).unwrap();
        }
        let mut cursor = Cursor::zero();
        let mut seen = vec![];
        let mut arrivals = vec![];
        while let NextOutcome::Processed { .. } = queue
            .next(&mut cursor, &any_class(), |info, _| {
                seen.push(info.ident.clone());
                arrivals.push(info.arrival);
                true
            })
            .unwrap()
        {}
        // Insertion order is delivery order, with non-decreasing arrivals.
        let expected: Vec<String> = (0..20).map(|i| format!("p{}", i)).collect();
        assert_eq!(seen, expected);
        assert!(arrivals.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn queue_nonmatching_advances_cursor() {
        let (_dir, queue) = make_queue(16, 1 << 20);
        queue.insert(&product("skipme", 10, 1)).unwrap();
        let class = ProductClass::new(vec![ClassSpec::new(Feedtype(0b110), "^other").unwrap()]);
        let mut cursor = Cursor::zero();
        let mut called = false;
        let outcome = queue
            .next(&mut cursor, &class, |_, _| {
                called = true;
                true
            })
            .unwrap();
        assert_eq!(
            outcome,
            NextOutcome::Processed {
                matched: false,
                delivered: true
            }
        );
        assert!(!called);
        assert_eq!(
            queue.next(&mut cursor, &class, |_, _| true).unwrap(),
            NextOutcome::EndOfQueue
        );
    }

    #[test]
    fn queue_handler_refusal_holds_cursor() {
        let (_dir, queue) = make_queue(16, 1 << 20);
        queue.insert(&product("retry", 10, 1)).unwrap();
        let mut cursor = Cursor::zero();
        let outcome = queue.next(&mut cursor, &any_class(), |_, _| false).unwrap();
        assert_eq!(
            outcome,
            NextOutcome::Processed {
                matched: true,
                delivered: false
            }
        );
        // Same product is visited again.
        let mut ident = String::new();
        queue
            .next(&mut cursor, &any_class(), |info, _| {
                ident = info.ident.clone();
                true
            })
            .unwrap();
        assert_eq!(ident, "retry");
    }

    #[test]
    fn queue_reopen_preserves_products() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.pq");
        {
            let queue = ProductQueue::create(&path, 16, 1 << 20).unwrap();
            queue.insert(&product("durable", 64, 3)).unwrap();
        }
        let queue = ProductQueue::open(&path).unwrap();
        assert_eq!(queue.stats().live, 1);
        let mut cursor = Cursor::zero();
        let mut seen = None;
        queue
            .next(&mut cursor, &any_class(), |info, data| {
                seen = Some((info.ident.clone(), data.len()));
                true
            })
            .unwrap();
        assert_eq!(seen, Some(("durable".to_string(), 64)));
    }

    #[test]
    fn queue_open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.pq");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        assert!(matches!(
            ProductQueue::open(&path),
            Err(QueueError::BadMagic { .. })
        ));
    }

    #[test]
    fn queue_corrupt_payload_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.pq");
        let queue = ProductQueue::create(&path, 16, 1 << 20).unwrap();
        queue.insert(&product("good", 32, 1)).unwrap();
        queue.insert(&product("bad", 32, 2)).unwrap();

        // Smash the second product's payload behind the queue's back.
        let entry = queue.slot(1);
        let at = queue.geom.data + entry.offset as usize;
        queue.bytes_mut(at, 1)[0] ^= 0xff;

        let mut cursor = Cursor::zero();
        let mut seen = vec![];
        let mut corrupt = 0;
        loop {
            match queue
                .next(&mut cursor, &any_class(), |info, _| {
                    seen.push(info.ident.clone());
                    true
                })
                .unwrap()
            {
                NextOutcome::EndOfQueue => break,
                NextOutcome::Corrupt => corrupt += 1,
                NextOutcome::Processed { .. } => {}
            }
        }
        assert_eq!(corrupt, 1);
        assert_eq!(seen, vec!["good".to_string()]);
    }

    #[test]
    fn queue_cursor_after_timestamp_skips_older() {
        let (_dir, queue) = make_queue(16, 1 << 20);
        let first = match queue.insert(&product("first", 10, 1)).unwrap() {
            InsertOutcome::Inserted(ts) => ts,
            other => panic!("unexpected {:?}", other),
        };
        queue.insert(&product("second", 10, 2)).unwrap();

        let mut cursor = Cursor::after(first);
        let mut seen = vec![];
        while let NextOutcome::Processed { .. } = queue
            .next(&mut cursor, &any_class(), |info, _| {
                seen.push(info.ident.clone());
                true
            })
            .unwrap()
        {}
        assert_eq!(seen, vec!["second".to_string()]);
    }

    #[test]
    fn queue_cursor_from_signature() {
        let (_dir, queue) = make_queue(16, 1 << 20);
        let p1 = product("one", 10, 1);
        let p2 = product("two", 10, 2);
        queue.insert(&p1).unwrap();
        queue.insert(&p2).unwrap();

        let mut cursor = queue
            .cursor_from_signature(&p1.info.signature)
            .unwrap()
            .expect("signature present");
        let mut seen = vec![];
        while let NextOutcome::Processed { .. } = queue
            .next(&mut cursor, &any_class(), |info, _| {
                seen.push(info.ident.clone());
                true
            })
            .unwrap()
        {}
        assert_eq!(seen, vec!["two".to_string()]);

        let missing = Signature::of(b"never inserted");
        assert!(queue.cursor_from_signature(&missing).unwrap().is_none());
    }

    #[test]
    fn queue_suspend_wakes_on_local_insert() {
        use std::sync::Arc;
        let (_dir, queue) = make_queue(16, 1 << 20);
        let queue = Arc::new(queue);
        let mut cursor = queue.cursor_at_end().unwrap();

        let writer = Arc::clone(&queue);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.insert(&product("wake", 10, 1)).unwrap();
        });
        let wake = queue.suspend(&mut cursor, Duration::from_secs(5), None);
        t.join().unwrap();
        assert_eq!(wake, Wake::NewData);
    }
}
