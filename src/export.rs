// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MemExport: fixed-capacity (128) slot table of exported blocks.
// Ported from original_source/include/core/io/imemblock.h's iMemExport
// (IMEMEXPORT_SLOTS_MAX, intrusive free/used slot lists).

use std::sync::{Arc, Mutex};

use crate::block::{ArrayOptions, BlockKind, MemBlock};
use crate::pool::MemPool;

pub const SLOTS_MAX: usize = 128;

/// The descriptor returned by `put`, sent to the peer so it can `get()` the
/// same underlying storage without a payload copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    pub block_id: u32,
    pub shm_id: i64,
    /// The backing segment's cross-process name, empty for a `Private` pool
    /// (in which case the descriptor is only meaningful to a peer in the
    /// same process, e.g. over a loopback transport for testing).
    pub segment_name: String,
    pub offset: usize,
    pub size: usize,
}

struct Slot {
    block: Option<MemBlock>,
}

/// A per-connection table of blocks this side has exported to the peer.
/// Keeps a strong reference to each exported block until a matching
/// `process_release` arrives.
pub struct MemExport {
    slots: Mutex<Vec<Slot>>,
    pool: Arc<MemPool>,
}

impl MemExport {
    pub fn new(pool: Arc<MemPool>) -> Self {
        let slots = (0..SLOTS_MAX).map(|_| Slot { block: None }).collect();
        Self { slots: Mutex::new(slots), pool }
    }

    /// Export `block`. Only blocks whose storage lies within this export's
    /// pool can be exported directly; others are `shared_copy`'d into the
    /// pool first (allocate + memcpy).
    pub fn put(&self, block: &MemBlock) -> Option<ExportDescriptor> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots.iter().position(|s| s.block.is_none())?;

        let (exported, offset) = if block.kind() == BlockKind::Pool {
            match self.pool.offset_of(block_data_ptr(block)) {
                Some(off) => (block.clone(), off),
                None => self.shared_copy(block)?,
            }
        } else {
            self.shared_copy(block)?
        };

        let size = exported.length();
        slots[index].block = Some(exported);

        Some(ExportDescriptor {
            block_id: index as u32,
            shm_id: self.pool.segment_id(),
            segment_name: self.pool.segment_name().unwrap_or_default().to_string(),
            offset,
            size,
        })
    }

    fn shared_copy(&self, block: &MemBlock) -> Option<(MemBlock, usize)> {
        let copy = MemBlock::new4_pool(&self.pool, block.length(), 1, 0, ArrayOptions::NONE)?;
        {
            let src = block.data();
            let dst = copy.data();
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), block.length());
            }
        }
        let offset = self.pool.offset_of(block_data_ptr(&copy))?;
        Some((copy, offset))
    }

    /// Release the slot at `block_id`, dropping this side's strong reference.
    pub fn process_release(&self, block_id: u32) -> bool {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.get_mut(block_id as usize) else {
            return false;
        };
        slot.block.take().is_some()
    }

    pub fn outstanding_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.block.is_some()).count()
    }
}

fn block_data_ptr(block: &MemBlock) -> *const u8 {
    block.data().as_ptr()
}
