// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MemPool: a shared-memory arena of fixed-size slots, with a lock-free
// free-list generalized from chunk_storage.rs's ChunkInfo (itself a port of
// cpp-ipc's chunk_info_t) and per-kind allocation counters mirroring
// original_source/include/core/io/imemblock.h's iMemPool::Stat.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::block::BLOCK_KIND_COUNT;
use crate::shm::{BackingKind, ShmOpenMode, ShmSegment};
use crate::spin_lock::adaptive_yield_pub;

/// Sentinel meaning "no more free slots" in the intrusive free-list.
const NIL: u32 = u32::MAX;

/// Per-`BlockKind` allocation counters, mirroring `iMemPool::Stat`.
#[derive(Default)]
pub struct Stat {
    allocated: [AtomicI64; BLOCK_KIND_COUNT],
    accumulated: [AtomicI64; BLOCK_KIND_COUNT],
}

impl Stat {
    fn record_alloc(&self, kind_idx: usize) {
        self.allocated[kind_idx].fetch_add(1, Ordering::Relaxed);
        self.accumulated[kind_idx].fetch_add(1, Ordering::Relaxed);
    }

    fn record_free(&self, kind_idx: usize) {
        self.allocated[kind_idx].fetch_sub(1, Ordering::Relaxed);
    }

    /// Currently outstanding allocations of `kind_idx`.
    pub fn allocated(&self, kind_idx: usize) -> i64 {
        self.allocated[kind_idx].load(Ordering::Relaxed)
    }

    /// Total allocations ever made of `kind_idx` (never decremented).
    pub fn accumulated(&self, kind_idx: usize) -> i64 {
        self.accumulated[kind_idx].load(Ordering::Relaxed)
    }
}

/// A free slot handed back by [`MemPool::allocate_slot`].
pub struct Slot {
    pub data_ptr: *mut u8,
    pub capacity: usize,
}

// Header at the very start of the pool's backing segment.
#[repr(C)]
struct PoolHeader {
    lock: AtomicU32,
    free_head: AtomicU32,
    slot_count: u32,
    slot_size: u32,
}

/// A pool of fixed-size slots carved out of a single shared-memory segment,
/// with a CAS/spin-lock-protected free-list threaded through the unused
/// slots themselves (the first 4 bytes of a free slot store the index of
/// the next free slot).
pub struct MemPool {
    segment: ShmSegment,
    slot_size: usize,
    slot_count: usize,
    base: *mut u8,
    stat: Stat,
    // Guards header mutation on top of the spin-lock, so the free-list walk
    // itself never races a concurrent `MemPool` drop.
    guard: Mutex<()>,
}

unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

/// Bytes occupied by `PoolHeader` at the front of every pool segment.
/// `offset_of`/`ptr_at_offset` are slot-array-relative (they exclude this);
/// anything resolving a raw offset against a segment's base pointer instead
/// of through those two (e.g. `MemImport::get` on the peer side) must add it
/// back in, or it ends up reading into the header.
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<PoolHeader>();

impl MemPool {
    /// Create a fresh pool with `slot_count` slots of `slot_size` bytes each,
    /// backed by private anonymous memory (single-process use).
    pub fn new_private(slot_size: usize, slot_count: usize) -> std::io::Result<Self> {
        let total = HEADER_SIZE + slot_size * slot_count;
        let segment = ShmSegment::create("mempool", BackingKind::Private, total, ShmOpenMode::Create)?;
        Self::from_segment(segment, slot_size, slot_count, true)
    }

    /// Create (or attach to) a pool backed by a named, cross-process segment.
    pub fn new_shared(
        name: &str,
        slot_size: usize,
        slot_count: usize,
        mode: ShmOpenMode,
    ) -> std::io::Result<Self> {
        let total = HEADER_SIZE + slot_size * slot_count;
        let segment = ShmSegment::create(name, BackingKind::PosixShared, total, mode)?;
        let fresh = mode != ShmOpenMode::Open;
        Self::from_segment(segment, slot_size, slot_count, fresh)
    }

    fn from_segment(
        segment: ShmSegment,
        slot_size: usize,
        slot_count: usize,
        initialize: bool,
    ) -> std::io::Result<Self> {
        let base = segment.as_mut_ptr();
        let header = unsafe { &mut *(base as *mut PoolHeader) };
        if initialize {
            header.lock = AtomicU32::new(0);
            header.slot_count = slot_count as u32;
            header.slot_size = slot_size as u32;
            // Thread the free-list: slot i's first 4 bytes hold i+1, last holds NIL.
            let slots_base = unsafe { base.add(HEADER_SIZE) };
            for i in 0..slot_count {
                let next = if i + 1 == slot_count { NIL } else { (i + 1) as u32 };
                unsafe {
                    let p = slots_base.add(i * slot_size) as *mut u32;
                    p.write_unaligned(next);
                }
            }
            header.free_head = AtomicU32::new(if slot_count == 0 { NIL } else { 0 });
        }
        Ok(Self {
            segment,
            slot_size,
            slot_count,
            base,
            stat: Stat::default(),
            guard: Mutex::new(()),
        })
    }

    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.base as *const PoolHeader) }
    }

    fn slots_base(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_SIZE) }
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        unsafe { self.slots_base().add(index as usize * self.slot_size) }
    }

    /// Maximum payload a single slot can hold (slot size minus the 4-byte
    /// free-list link embedded when the slot is unused — once allocated the
    /// full slot is available to the caller).
    pub fn block_size_max(&self) -> usize {
        self.slot_size
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }

    pub fn segment_id(&self) -> i64 {
        self.segment.id()
    }

    /// The pool's backing segment name, for peers to attach the same
    /// cross-process segment. `None` for a `Private` pool.
    pub fn segment_name(&self) -> Option<&str> {
        self.segment.name()
    }

    /// Offset of `ptr` from the pool's base, for cross-process export.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let start = self.slots_base() as usize;
        let end = start + self.slot_size * self.slot_count;
        let p = ptr as usize;
        if p < start || p >= end {
            return None;
        }
        Some(p - start)
    }

    pub fn ptr_at_offset(&self, offset: usize) -> *mut u8 {
        unsafe { self.slots_base().add(offset) }
    }

    /// Acquire a free slot able to hold at least `needed` bytes, or `None` if
    /// the pool is exhausted or `needed` exceeds the slot size.
    pub fn allocate_slot(&self, needed: usize) -> Option<Slot> {
        if needed > self.slot_size {
            return None;
        }
        let header = self.header();
        let _g = self.guard.lock().unwrap();
        spin_lock(&header.lock);
        let head = header.free_head.load(Ordering::Acquire);
        let index = if head == NIL {
            None
        } else {
            let next = unsafe { (self.slot_ptr(head) as *const u32).read_unaligned() };
            header.free_head.store(next, Ordering::Release);
            Some(head)
        };
        spin_unlock(&header.lock);
        drop(_g);

        let index = index?;
        self.stat.record_alloc(crate::block::BlockKind::Pool.index());
        Some(Slot {
            data_ptr: self.slot_ptr(index),
            capacity: self.slot_size,
        })
    }

    /// Return `data_ptr` (as previously returned by `allocate_slot`) to the
    /// free-list. `data_ptr` must point into this pool's slot array.
    pub fn release_slot(&self, data_ptr: *mut u8) {
        let Some(offset) = self.offset_of(data_ptr) else {
            return;
        };
        let index = (offset / self.slot_size) as u32;
        let header = self.header();
        let _g = self.guard.lock().unwrap();
        spin_lock(&header.lock);
        let head = header.free_head.load(Ordering::Acquire);
        unsafe {
            (self.slot_ptr(index) as *mut u32).write_unaligned(head);
        }
        header.free_head.store(index, Ordering::Release);
        spin_unlock(&header.lock);
        drop(_g);
        self.stat.record_free(crate::block::BlockKind::Pool.index());
    }

    /// Number of slots currently on the free-list (best-effort, racy).
    pub fn free_count(&self) -> usize {
        let header = self.header();
        let _g = self.guard.lock().unwrap();
        spin_lock(&header.lock);
        let mut count = 0usize;
        let mut cur = header.free_head.load(Ordering::Acquire);
        while cur != NIL {
            count += 1;
            cur = unsafe { (self.slot_ptr(cur) as *const u32).read_unaligned() };
        }
        spin_unlock(&header.lock);
        count
    }
}

fn spin_lock(lock: &AtomicU32) {
    let mut k = 0u32;
    while lock
        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        adaptive_yield_pub(&mut k);
    }
}

fn spin_unlock(lock: &AtomicU32) {
    lock.store(0, Ordering::Release);
}
