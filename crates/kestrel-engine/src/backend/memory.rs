//! Executable memory management
//!
//! POSIX path: `mmap(READ|WRITE, PRIVATE|ANONYMOUS)` page-aligned, copy the
//! code in, then `mprotect(READ|EXEC)`. A process-wide pool amortizes
//! allocations, keeps a free list of released regions, optionally leaves a
//! guard page between artifacts, and tracks `entry address → size` for
//! release. Non-unix hosts report `UnsupportedPlatform` instead of taking an
//! unsound path.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::CodegenError;

/// Rounded-up page size used for regions.
const PAGE_SIZE: usize = 4096;

/// An executable region. Freed back to the owning pool on drop.
#[derive(Debug)]
pub struct ExecRegion {
    ptr: *mut u8,
    size: usize,
    code_len: usize,
}

// The region is immutable after protection flips to R+X.
unsafe impl Send for ExecRegion {}
unsafe impl Sync for ExecRegion {}

impl ExecRegion {
    /// Entry address of the code.
    pub fn entry(&self) -> *const u8 {
        self.ptr
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Length of the code actually copied in.
    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// The installed bytes, for inspection.
    pub fn bytes(&self) -> &[u8] {
        // Safety: the mapping is live for self's lifetime and R+X readable
        unsafe { std::slice::from_raw_parts(self.ptr, self.code_len) }
    }
}

/// Process-wide executable memory pool.
pub struct ExecMemoryPool {
    inner: Mutex<PoolInner>,
    guard_pages: bool,
}

#[derive(Default)]
struct PoolInner {
    /// entry address → mapped size, for release and introspection
    live: FxHashMap<usize, usize>,
    /// Released regions by size, reusable before touching mmap again
    free: Vec<(usize, usize)>, // (addr, size)
    total_mapped: usize,
}

impl ExecMemoryPool {
    /// New pool; `guard_pages` maps one inaccessible page after each region.
    pub fn new(guard_pages: bool) -> Self {
        ExecMemoryPool { inner: Mutex::new(PoolInner::default()), guard_pages }
    }

    /// Install `code` into fresh executable memory.
    pub fn install(&self, code: &[u8]) -> Result<ExecRegion, CodegenError> {
        if code.is_empty() {
            return Err(CodegenError::Memory("empty code".to_string()));
        }
        let size = round_up(code.len(), PAGE_SIZE);

        // Reuse a released region of sufficient size when available
        let reused = {
            let mut inner = self.inner.lock();
            match inner.free.iter().position(|&(_, s)| s >= size) {
                Some(i) => Some(inner.free.remove(i)),
                None => None,
            }
        };

        let (addr, mapped) = match reused {
            Some((addr, s)) => {
                remap_writable(addr as *mut u8, s)?;
                (addr as *mut u8, s)
            }
            None => (map_region(size, self.guard_pages)?, size),
        };

        // Safety: the region is RW and at least code.len() bytes long
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), addr, code.len());
        }
        protect_exec(addr, mapped)?;

        let mut inner = self.inner.lock();
        inner.live.insert(addr as usize, mapped);
        inner.total_mapped += mapped;
        Ok(ExecRegion { ptr: addr, size: mapped, code_len: code.len() })
    }

    /// Return a region to the free list. Called by the code cache once no
    /// frame can hold a return address inside it.
    pub fn release(&self, region: ExecRegion) {
        let mut inner = self.inner.lock();
        inner.live.remove(&(region.ptr as usize));
        inner.total_mapped = inner.total_mapped.saturating_sub(region.size);
        inner.free.push((region.ptr as usize, region.size));
        std::mem::forget(region);
    }

    /// Size recorded for an entry address.
    pub fn size_of(&self, entry: *const u8) -> Option<usize> {
        self.inner.lock().live.get(&(entry as usize)).copied()
    }

    /// Bytes currently mapped for live artifacts.
    pub fn total_mapped(&self) -> usize {
        self.inner.lock().total_mapped
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

#[cfg(unix)]
fn map_region(size: usize, guard: bool) -> Result<*mut u8, CodegenError> {
    let total = if guard { size + PAGE_SIZE } else { size };
    // Safety: anonymous private mapping, no fd
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(CodegenError::Memory("mmap failed".to_string()));
    }
    if guard {
        // Safety: the tail page belongs to the mapping above
        let rc = unsafe {
            libc::mprotect((addr as *mut u8).wrapping_add(size) as *mut libc::c_void, PAGE_SIZE, libc::PROT_NONE)
        };
        if rc != 0 {
            return Err(CodegenError::Memory("guard page mprotect failed".to_string()));
        }
    }
    Ok(addr as *mut u8)
}

#[cfg(unix)]
fn protect_exec(addr: *mut u8, size: usize) -> Result<(), CodegenError> {
    // Safety: addr/size come from map_region
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(CodegenError::Memory("mprotect R+X failed".to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn remap_writable(addr: *mut u8, size: usize) -> Result<(), CodegenError> {
    // Safety: addr/size come from a mapping this pool created
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(CodegenError::Memory("mprotect R+W failed".to_string()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn map_region(_size: usize, _guard: bool) -> Result<*mut u8, CodegenError> {
    Err(CodegenError::UnsupportedPlatform)
}

#[cfg(not(unix))]
fn protect_exec(_addr: *mut u8, _size: usize) -> Result<(), CodegenError> {
    Err(CodegenError::UnsupportedPlatform)
}

#[cfg(not(unix))]
fn remap_writable(_addr: *mut u8, _size: usize) -> Result<(), CodegenError> {
    Err(CodegenError::UnsupportedPlatform)
}
