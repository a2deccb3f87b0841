// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MemBlock: a reference-counted, variable-length buffer with five backing
// variants. Ported from original_source/include/core/io/imemblock.h
// (iMemBlock / iMemDataWraper), with the RAII scoped-access shape kept from
// the teacher's scoped_access.rs.

use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::pool::MemPool;

/// Caller-supplied cleanup for a `User`-backed block. Invoked exactly once,
/// on last deref.
pub type FreeCb = Box<dyn FnOnce(*mut u8) + Send + Sync>;

// A tiny bitflags-alike so this module does not take on the `bitflags` crate
// for four option bits; kept local and trivial.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($ty);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn bits(self) -> $ty {
                self.0
            }

            pub const fn from_bits_truncate(bits: $ty) -> Self {
                $name(bits)
            }

            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Allocation option bits, mirroring `iMemBlock::ArrayOption`.
    pub struct ArrayOptions: u32 {
        const NONE = 0;
        const CAPACITY_RESERVED = 0x1;
        const GROWS_FORWARD = 0x2;
        const GROWS_BACKWARDS = 0x4;
    }
}

/// The storage kind backing a [`MemBlock`]. Mirrors `iMemBlock::Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Allocated from a `MemPool` slot; the pool's base pointer plus offset.
    Pool,
    /// Pool-backed data, but the `MemBlock` struct itself is heap-allocated.
    PoolExternal,
    /// Data is appended directly after the block (malloc'd, growable).
    Appended,
    /// Caller-supplied memory, freed via `FreeCb` on last deref.
    User,
    /// Fixed external memory; never freed by this block.
    Fixed,
    /// Imported from a peer via shared memory.
    Imported,
}

pub(crate) const BLOCK_KIND_COUNT: usize = 6;

impl BlockKind {
    pub(crate) fn index(self) -> usize {
        match self {
            BlockKind::Pool => 0,
            BlockKind::PoolExternal => 1,
            BlockKind::Appended => 2,
            BlockKind::User => 3,
            BlockKind::Fixed => 4,
            BlockKind::Imported => 5,
        }
    }
}

struct Imported {
    peer_block_id: u32,
    segment_shm_id: i64,
}

struct Inner {
    kind: BlockKind,
    options: AtomicUsize, // ArrayOptions bits
    read_only: std::sync::atomic::AtomicBool,
    is_silence: std::sync::atomic::AtomicBool,
    length: AtomicUsize,
    capacity: AtomicUsize,
    data: AtomicPtr<u8>,
    refcount: AtomicI32,
    n_acquired: AtomicI32,
    please_signal: AtomicI32,
    pool: Option<Arc<MemPool>>,
    free_cb: std::sync::Mutex<Option<FreeCb>>,
    imported: Option<Imported>,
}

/// A reference-counted, variable-length buffer. Cloning a `MemBlock` bumps
/// the shared refcount (`Arc`-like); once `count() > 1` the block is
/// effectively read-only (`needs_detach()`).
#[derive(Clone)]
pub struct MemBlock {
    inner: Arc<Inner>,
}

impl MemBlock {
    fn new(
        kind: BlockKind,
        options: ArrayOptions,
        data: *mut u8,
        length: usize,
        capacity: usize,
        read_only: bool,
        pool: Option<Arc<MemPool>>,
        free_cb: Option<FreeCb>,
        imported: Option<Imported>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                options: AtomicUsize::new(options.bits() as usize),
                read_only: std::sync::atomic::AtomicBool::new(read_only),
                is_silence: std::sync::atomic::AtomicBool::new(false),
                length: AtomicUsize::new(length),
                capacity: AtomicUsize::new(capacity),
                data: AtomicPtr::new(data),
                refcount: AtomicI32::new(1),
                n_acquired: AtomicI32::new(0),
                please_signal: AtomicI32::new(0),
                pool,
                free_cb: std::sync::Mutex::new(free_cb),
                imported,
            }),
        }
    }

    /// Allocate from `pool` if `count*element_size` fits a pool slot,
    /// otherwise fall back to an `Appended` (malloc) layout.
    ///
    /// Known quirk (preserved intentionally, see DESIGN.md): when falling
    /// through to the pool path, `options` is NOT propagated into the
    /// resulting block.
    pub fn new_one(
        pool: &Arc<MemPool>,
        count: usize,
        element_size: usize,
        _align: usize,
        options: ArrayOptions,
    ) -> Option<Self> {
        let total = count.checked_mul(element_size)?;
        if total <= pool.block_size_max() {
            // Pool path: options intentionally dropped (see quirk above).
            Self::new4_pool(pool, count, element_size, 0, ArrayOptions::NONE)
        } else {
            Self::new_appended(total, options)
        }
    }

    /// Pool-only allocation; returns `None` if no free slot.
    pub fn new4_pool(
        pool: &Arc<MemPool>,
        count: usize,
        element_size: usize,
        _align: usize,
        options: ArrayOptions,
    ) -> Option<Self> {
        let total = count.checked_mul(element_size)?;
        let slot = pool.allocate_slot(total)?;
        Some(Self::new(
            BlockKind::Pool,
            options,
            slot.data_ptr,
            total,
            slot.capacity,
            false,
            Some(Arc::clone(pool)),
            None,
            None,
        ))
    }

    fn new_appended(total: usize, options: ArrayOptions) -> Option<Self> {
        let layout = std::alloc::Layout::array::<u8>(total).ok()?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(Self::new(
            BlockKind::Appended,
            options,
            ptr,
            total,
            total,
            false,
            None,
            None,
            None,
        ))
    }

    /// Wrap caller-owned memory; `free_cb` runs exactly once on last deref.
    pub fn new4_user(data: *mut u8, length: usize, free_cb: FreeCb, read_only: bool) -> Self {
        Self::new(
            BlockKind::User,
            ArrayOptions::NONE,
            data,
            length,
            length,
            read_only,
            None,
            Some(free_cb),
            None,
        )
    }

    /// Wrap fixed external memory that outlives every reference; never freed.
    pub fn new4_fixed(data: *mut u8, length: usize, read_only: bool) -> Self {
        Self::new(
            BlockKind::Fixed,
            ArrayOptions::NONE,
            data,
            length,
            length,
            read_only,
            None,
            None,
            None,
        )
    }

    pub(crate) fn new_imported(
        data: *mut u8,
        length: usize,
        pool: Arc<MemPool>,
        peer_block_id: u32,
        segment_shm_id: i64,
    ) -> Self {
        Self::new(
            BlockKind::Imported,
            ArrayOptions::NONE,
            data,
            length,
            length,
            true,
            Some(pool),
            None,
            Some(Imported {
                peer_block_id,
                segment_shm_id,
            }),
        )
    }

    /// Reallocate an `Appended` block. Legal only when `n_acquired() == 0`;
    /// returns `None` (leaving `self` untouched) otherwise or on OOM.
    pub fn reallocate(&self, count: usize, element_size: usize, options: ArrayOptions) -> Option<Self> {
        if self.kind() != BlockKind::Appended || self.n_acquired() != 0 {
            return None;
        }
        let total = count.checked_mul(element_size)?;
        let new_cap = self.detach_capacity(total);
        let layout = std::alloc::Layout::array::<u8>(new_cap).ok()?;
        let new_ptr = unsafe { std::alloc::alloc(layout) };
        if new_ptr.is_null() {
            return None;
        }
        let old_ptr = self.inner.data.load(Ordering::Acquire);
        let old_len = self.length();
        unsafe {
            std::ptr::copy_nonoverlapping(old_ptr, new_ptr, old_len.min(total));
            let old_layout = std::alloc::Layout::array::<u8>(self.capacity()).unwrap();
            std::alloc::dealloc(old_ptr, old_layout);
        }
        Some(Self::new(
            BlockKind::Appended,
            options,
            new_ptr,
            total.max(old_len),
            new_cap,
            false,
            None,
            None,
            None,
        ))
    }

    pub fn kind(&self) -> BlockKind {
        self.inner.kind
    }

    pub fn is_ours(&self) -> bool {
        self.kind() != BlockKind::Imported
    }

    /// `refcount > 1` ⇒ effectively read-only, regardless of the explicit flag.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire) || self.count() > 1
    }

    pub fn is_shared(&self) -> bool {
        self.count() != 1
    }

    pub fn is_silence(&self) -> bool {
        self.inner.is_silence.load(Ordering::Acquire)
    }

    pub fn set_is_silence(&self, v: bool) {
        self.inner.is_silence.store(v, Ordering::Release);
    }

    pub fn count(&self) -> i32 {
        Arc::strong_count(&self.inner) as i32
    }

    pub fn ref_is_one(&self) -> bool {
        self.count() == 1
    }

    pub fn length(&self) -> usize {
        self.inner.length.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Acquire)
    }

    pub fn options(&self) -> ArrayOptions {
        ArrayOptions::from_bits_truncate(self.inner.options.load(Ordering::Acquire) as u32)
    }

    pub fn set_options(&self, o: ArrayOptions) {
        self.inner
            .options
            .fetch_or(o.bits() as usize, Ordering::AcqRel);
    }

    pub fn clear_options(&self, o: ArrayOptions) {
        self.inner
            .options
            .fetch_and(!(o.bits() as usize), Ordering::AcqRel);
    }

    /// Number of outstanding `ScopedData` acquisitions.
    pub fn n_acquired(&self) -> i32 {
        self.inner.n_acquired.load(Ordering::Acquire)
    }

    /// Whether a detach (private copy) is required before modifying the data.
    pub fn needs_detach(&self) -> bool {
        self.is_read_only()
    }

    /// Preferred capacity for a resize to `new_size`, honoring
    /// `CapacityReserved`.
    pub fn detach_capacity(&self, new_size: usize) -> usize {
        if self.options().contains(ArrayOptions::CAPACITY_RESERVED) && new_size < self.capacity() {
            self.capacity()
        } else {
            new_size
        }
    }

    /// A scoped, RAII data handle. Construction increments `n_acquired`;
    /// drop decrements it. Acquiring twice in the same scope is fine — each
    /// acquire has its own matching release.
    pub fn data(&self) -> ScopedData<'_> {
        self.inner.n_acquired.fetch_add(1, Ordering::AcqRel);
        ScopedData { block: self }
    }

    pub(crate) fn peer_descriptor(&self) -> Option<(u32, i64)> {
        self.inner
            .imported
            .as_ref()
            .map(|i| (i.peer_block_id, i.segment_shm_id))
    }
}

/// RAII scoped access to a [`MemBlock`]'s bytes. Increments `n_acquired` on
/// construction, decrements on drop — release happens on every exit path,
/// including early returns and panics during unwind.
pub struct ScopedData<'a> {
    block: &'a MemBlock,
}

impl<'a> ScopedData<'a> {
    /// Raw pointer to the block's data.
    pub fn as_ptr(&self) -> *const u8 {
        self.block.inner.data.load(Ordering::Acquire)
    }

    /// Mutable pointer — caller must have checked `needs_detach()` first.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.block.inner.data.load(Ordering::Acquire)
    }

    /// The block's data as an immutable byte slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.block.length()) }
    }
}

impl<'a> Clone for ScopedData<'a> {
    fn clone(&self) -> Self {
        self.block.inner.n_acquired.fetch_add(1, Ordering::AcqRel);
        ScopedData { block: self.block }
    }
}

impl<'a> Drop for ScopedData<'a> {
    fn drop(&mut self) {
        self.block.inner.n_acquired.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let ptr = *self.data.get_mut();
        if ptr.is_null() {
            return;
        }
        match self.kind {
            BlockKind::Appended => {
                let cap = *self.capacity.get_mut();
                if let Ok(layout) = std::alloc::Layout::array::<u8>(cap) {
                    unsafe { std::alloc::dealloc(ptr, layout) };
                }
            }
            BlockKind::User => {
                if let Some(cb) = self.free_cb.get_mut().unwrap().take() {
                    cb(ptr);
                }
            }
            BlockKind::Pool | BlockKind::PoolExternal => {
                if let Some(pool) = &self.pool {
                    pool.release_slot(ptr);
                }
            }
            // Fixed: never freed; Imported: owned by the MemImport table.
            BlockKind::Fixed | BlockKind::Imported => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_block_reports_length_and_read_only() {
        let mut buf = [1u8, 2, 3, 4];
        let block = MemBlock::new4_fixed(buf.as_mut_ptr(), buf.len(), true);
        assert_eq!(block.length(), 4);
        assert!(block.is_read_only());
        assert_eq!(block.count(), 1);
    }

    #[test]
    fn cloning_a_block_makes_it_shared_and_read_only() {
        let mut buf = [0u8; 8];
        let block = MemBlock::new4_fixed(buf.as_mut_ptr(), buf.len(), false);
        assert!(!block.is_read_only());
        let clone = block.clone();
        assert!(block.is_shared());
        assert!(block.is_read_only());
        assert!(clone.is_read_only());
    }

    #[test]
    fn scoped_data_tracks_n_acquired_across_nested_scopes() {
        let mut buf = [9u8; 4];
        let block = MemBlock::new4_fixed(buf.as_mut_ptr(), buf.len(), false);
        assert_eq!(block.n_acquired(), 0);
        {
            let g1 = block.data();
            assert_eq!(block.n_acquired(), 1);
            let g2 = g1.clone();
            assert_eq!(block.n_acquired(), 2);
            drop(g2);
            assert_eq!(block.n_acquired(), 1);
        }
        assert_eq!(block.n_acquired(), 0);
    }

    #[test]
    fn user_block_invokes_free_callback_exactly_once_on_last_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering as Ord};
        let calls = Arc::new(AtomicUsize::new(0));
        let mut buf = vec![0u8; 16];
        let ptr = buf.as_mut_ptr();
        std::mem::forget(buf);
        let calls2 = Arc::clone(&calls);
        let block = MemBlock::new4_user(
            ptr,
            16,
            Box::new(move |p| {
                calls2.fetch_add(1, Ord::SeqCst);
                unsafe { drop(Vec::from_raw_parts(p, 16, 16)) };
            }),
            false,
        );
        let clone = block.clone();
        drop(block);
        assert_eq!(calls.load(Ord::SeqCst), 0);
        drop(clone);
        assert_eq!(calls.load(Ord::SeqCst), 1);
    }
}
