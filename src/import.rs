// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// MemImport: per-peer table of attached segments and imported blocks.
// Ported from original_source/include/core/io/imemblock.h's iMemImport.
// Table access uses std::sync::Mutex (per-process bookkeeping, not a named
// cross-process primitive — see DESIGN.md).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::block::MemBlock;
use crate::pool::{MemPool, HEADER_SIZE};
use crate::shm::{BackingKind, ShmOpenMode, ShmSegment};

struct ImportedEntry {
    block: MemBlock,
    offset: usize,
    size: usize,
    segment_shm_id: i64,
}

#[derive(Default)]
struct Tables {
    segments: HashMap<i64, Arc<ShmSegment>>,
    blocks: HashMap<u32, ImportedEntry>,
}

/// Per-peer table of attached shared-memory segments and the blocks
/// imported from them.
pub struct MemImport {
    tables: Mutex<Tables>,
    local_pool: Arc<MemPool>,
}

impl MemImport {
    pub fn new(local_pool: Arc<MemPool>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            local_pool,
        }
    }

    /// Attach (if not already attached) the segment `shm_id` and construct
    /// an IMPORTED `MemBlock` whose data pointer is
    /// `segment.base + HEADER_SIZE + offset` — `offset` arrives
    /// slot-array-relative (as `MemPool::offset_of`/the exporter's
    /// `ExportDescriptor` report it), so the pool header at the segment
    /// base has to be skipped to land on the same bytes.
    pub fn get(
        &self,
        block_id: u32,
        shm_id: i64,
        segment_name: &str,
        offset: usize,
        size: usize,
    ) -> Option<MemBlock> {
        let mut tables = self.tables.lock().unwrap();

        if let Some(entry) = tables.blocks.get(&block_id) {
            return Some(entry.block.clone());
        }

        let segment = match tables.segments.get(&shm_id) {
            Some(s) => Arc::clone(s),
            None => {
                let seg = ShmSegment::create(
                    segment_name,
                    BackingKind::PosixShared,
                    HEADER_SIZE + offset + size,
                    ShmOpenMode::Open,
                )
                .ok()?;
                let seg = Arc::new(seg);
                tables.segments.insert(shm_id, Arc::clone(&seg));
                seg
            }
        };

        // `offset` is slot-array-relative (how `MemPool::offset_of` reports
        // it, excluding `PoolHeader`); add `HEADER_SIZE` back in to land on
        // the same bytes the exporter's slot actually occupies.
        if HEADER_SIZE.saturating_add(offset).saturating_add(size) > segment.len() {
            return None;
        }
        let ptr = unsafe { segment.as_mut_ptr().add(HEADER_SIZE + offset) };
        let block = MemBlock::new_imported(ptr, size, Arc::clone(&self.local_pool), block_id, shm_id);

        tables.blocks.insert(
            block_id,
            ImportedEntry { block: block.clone(), offset, size, segment_shm_id: shm_id },
        );
        Some(block)
    }

    /// On revoke, replace the stored block in-place with a local copy
    /// (`makeLocal`): allocate from the owning pool, copy the bytes, swap
    /// the table entry. Existing holders of the old `MemBlock` clone keep
    /// reading valid, unchanged bytes (their `Arc` still points at the
    /// original imported storage) — only future `get()` calls observe the
    /// local copy.
    pub fn process_revoke(&self, block_id: u32) -> bool {
        let mut tables = self.tables.lock().unwrap();
        let Some(entry) = tables.blocks.get(&block_id) else {
            return false;
        };
        let local = match MemBlock::new4_pool(&self.local_pool, entry.size, 1, 0, crate::block::ArrayOptions::NONE) {
            Some(b) => b,
            None => return false,
        };
        {
            let src = entry.block.data();
            let dst = local.data();
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), entry.size);
            }
        }
        let offset = entry.offset;
        let size = entry.size;
        let segment_shm_id = entry.segment_shm_id;
        tables
            .blocks
            .insert(block_id, ImportedEntry { block: local, offset, size, segment_shm_id });
        true
    }

    /// Detach the segment `shm_id`. Legal only when no imported block still
    /// references it.
    pub fn detach_segment(&self, shm_id: i64) -> bool {
        let mut tables = self.tables.lock().unwrap();
        if tables.blocks.values().any(|e| e.segment_shm_id == shm_id) {
            return false;
        }
        tables.segments.remove(&shm_id).is_some()
    }

    pub fn imported_count(&self) -> usize {
        self.tables.lock().unwrap().blocks.len()
    }
}
