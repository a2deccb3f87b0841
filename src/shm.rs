// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// ShareMem: a page-aligned region backed by either private anonymous memory
// or a named POSIX/Windows shared-memory object. Adapted from the teacher's
// ShmHandle to add a private (non-named) backing kind and hole-punch advice.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use crate::platform::PlatformShm;

/// Open mode for named shared memory segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmOpenMode {
    /// Create exclusively — fail if already exists.
    Create,
    /// Open existing — fail if it does not exist.
    Open,
    /// Create if missing, open if it already exists.
    CreateOrOpen,
}

/// How a [`ShmSegment`]'s memory is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BackingKind {
    /// Anonymous memory private to this process; `id()` is always 0.
    Private,
    /// A named POSIX (or Windows file-mapping) object shared across processes.
    PosixShared,
}

fn next_shared_id() -> i64 {
    static COUNTER: OnceLock<AtomicI64> = OnceLock::new();
    COUNTER
        .get_or_init(|| AtomicI64::new(1))
        .fetch_add(1, Ordering::Relaxed)
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    4096
}

fn round_up_to_page(size: usize) -> usize {
    let ps = page_size();
    if size == 0 {
        return ps;
    }
    ((size + ps - 1) / ps) * ps
}

enum Backing {
    Private { ptr: *mut u8, len: usize },
    Shared(PlatformShm),
}

// Safety: anonymous private memory is only ever observed through this
// struct's own API; the shared variant is already Send+Sync.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

/// A mmap'd region, private-anonymous or named POSIX/Windows shared memory.
pub struct ShmSegment {
    backing: Option<Backing>,
    kind: BackingKind,
    id: i64,
    page_size: usize,
    requested: usize,
}

impl ShmSegment {
    /// Round `size` up to the page size and map it. For [`BackingKind::Private`]
    /// `name` is used only for diagnostics. For [`BackingKind::PosixShared`] it
    /// names the underlying kernel object.
    pub fn create(name: &str, kind: BackingKind, size: usize, mode: ShmOpenMode) -> io::Result<Self> {
        let rounded = round_up_to_page(size);
        match kind {
            BackingKind::Private => Self::create_private(rounded, size),
            BackingKind::PosixShared => Self::create_shared(name, rounded, size, mode),
        }
    }

    #[cfg(unix)]
    fn create_private(mapped_len: usize, requested: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            backing: Some(Backing::Private {
                ptr: ptr as *mut u8,
                len: mapped_len,
            }),
            kind: BackingKind::Private,
            id: 0,
            page_size: page_size(),
            requested,
        })
    }

    #[cfg(windows)]
    fn create_private(mapped_len: usize, requested: usize) -> io::Result<Self> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
        let ptr = unsafe { VirtualAlloc(std::ptr::null(), mapped_len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            backing: Some(Backing::Private {
                ptr: ptr as *mut u8,
                len: mapped_len,
            }),
            kind: BackingKind::Private,
            id: 0,
            page_size: page_size(),
            requested,
        })
    }

    fn create_shared(name: &str, mapped_len: usize, requested: usize, mode: ShmOpenMode) -> io::Result<Self> {
        #[cfg(unix)]
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::posix::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::posix::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::posix::ShmMode::CreateOrOpen,
        };
        #[cfg(windows)]
        let platform_mode = match mode {
            ShmOpenMode::Create => crate::platform::windows::ShmMode::Create,
            ShmOpenMode::Open => crate::platform::windows::ShmMode::Open,
            ShmOpenMode::CreateOrOpen => crate::platform::windows::ShmMode::CreateOrOpen,
        };
        let inner = PlatformShm::acquire(name, mapped_len, platform_mode)?;
        Ok(Self {
            backing: Some(Backing::Shared(inner)),
            kind: BackingKind::PosixShared,
            id: next_shared_id(),
            page_size: page_size(),
            requested,
        })
    }

    /// Backing kind.
    pub fn kind(&self) -> BackingKind {
        self.kind
    }

    /// Local id: 0 for `Private`, a unique positive value for `PosixShared`.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The underlying POSIX/Windows object name, for `PosixShared` segments
    /// a peer process needs in order to attach the same segment. `None` for
    /// `Private` segments, which have no cross-process name.
    pub fn name(&self) -> Option<&str> {
        match &self.backing {
            Some(Backing::Shared(shm)) => Some(shm.name()),
            _ => None,
        }
    }

    /// Pointer to the mapped region, or null after `detach`.
    pub fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            Some(Backing::Private { ptr, .. }) => *ptr,
            Some(Backing::Shared(shm)) => shm.as_ptr(),
            None => std::ptr::null(),
        }
    }

    /// Mutable pointer to the mapped region, or null after `detach`.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        match &self.backing {
            Some(Backing::Private { ptr, .. }) => *ptr,
            Some(Backing::Shared(shm)) => shm.as_mut_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    /// Current reference count for a `PosixShared` segment; always 1 for a
    /// `Private` one (it has no cross-process refcounting).
    pub fn ref_count(&self) -> i32 {
        match &self.backing {
            Some(Backing::Shared(shm)) => shm.ref_count(),
            Some(Backing::Private { .. }) => 1,
            None => 0,
        }
    }

    /// Force-remove the backing named object without releasing this
    /// mapping. A no-op for `Private` segments.
    pub fn unlink(&self) {
        if let Some(Backing::Shared(shm)) = &self.backing {
            shm.unlink();
        }
    }

    /// Force-remove a named segment's backing object by name, without
    /// needing a live handle to it.
    pub fn unlink_by_name(name: &str) {
        crate::platform::PlatformShm::unlink_by_name(name);
    }

    /// Mapped length, page-rounded and ≥ the originally requested size.
    /// Zero after `detach`.
    pub fn len(&self) -> usize {
        match &self.backing {
            Some(Backing::Private { len, .. }) => *len,
            Some(Backing::Shared(shm)) => shm.mapped_size(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The originally requested (pre-rounding) size.
    pub fn requested_size(&self) -> usize {
        self.requested
    }

    fn assert_page_aligned(&self) {
        debug_assert_eq!(self.len() % self.page_size, 0);
    }

    /// Best-effort `MADV_DONTNEED`-equivalent advice over `[offset, offset+len)`.
    /// May be a no-op depending on platform (§9 Open Questions).
    pub fn punch(&self, offset: usize, len: usize) -> io::Result<()> {
        match &self.backing {
            Some(Backing::Private { ptr, len: mapped_len }) => {
                if offset.saturating_add(len) > *mapped_len {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "punch out of range"));
                }
                #[cfg(target_os = "linux")]
                unsafe {
                    let p = ptr.add(offset) as *mut libc::c_void;
                    if libc::madvise(p, len, libc::MADV_DONTNEED) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                let _ = ptr;
                Ok(())
            }
            Some(Backing::Shared(shm)) => shm.punch(offset, len),
            None => Err(io::Error::new(io::ErrorKind::Other, "segment already detached")),
        }
    }

    /// Release the mapping. Returns `Ok(())`; a second call returns an error
    /// (double-detach).
    pub fn detach(&mut self) -> io::Result<()> {
        match self.backing.take() {
            Some(Backing::Private { ptr, len }) => {
                self.assert_page_aligned();
                #[cfg(unix)]
                unsafe {
                    libc::munmap(ptr as *mut libc::c_void, len);
                }
                #[cfg(windows)]
                unsafe {
                    windows_sys::Win32::System::Memory::VirtualFree(
                        ptr as *mut _,
                        0,
                        windows_sys::Win32::System::Memory::MEM_RELEASE,
                    );
                }
                Ok(())
            }
            Some(Backing::Shared(shm)) => {
                drop(shm); // Drop unmaps (and unlinks if last reference).
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "already detached")),
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_segment_rounds_up_to_page_size() {
        let seg = ShmSegment::create("anon", BackingKind::Private, 1, ShmOpenMode::Create).unwrap();
        assert_eq!(seg.len() % page_size(), 0);
        assert!(seg.len() >= 1);
        assert_eq!(seg.id(), 0);
    }

    #[test]
    fn detach_is_idempotent_error_on_second_call() {
        let mut seg = ShmSegment::create("anon2", BackingKind::Private, 4096, ShmOpenMode::Create).unwrap();
        assert!(seg.detach().is_ok());
        assert!(seg.detach().is_err());
        assert!(seg.as_ptr().is_null());
        assert_eq!(seg.len(), 0);
    }

    #[test]
    fn private_segments_get_distinct_backing_but_shared_ids_increment() {
        let a = ShmSegment::create("x", BackingKind::Private, 64, ShmOpenMode::Create).unwrap();
        let b = ShmSegment::create("y", BackingKind::Private, 64, ShmOpenMode::Create).unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 0);
    }
}
