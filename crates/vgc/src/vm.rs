//! Virtual memory chunks backing the heap.
//!
//! Regular heap chunks are anonymous read-write mappings. Code chunks
//! additionally need execute permission, which `memmap2` cannot express
//! together with write access, so those go through the platform
//! allocator directly.

use crate::error::{GcError, Result};
use memmap2::MmapMut;
use vela_util::align_up;

/// A contiguous span of committed memory owned by the collector.
pub struct Chunk {
    base: *mut u8,
    size: usize,
    executable: bool,
    backing: Backing,
}

enum Backing {
    Map(MmapMut),
    #[allow(dead_code)]
    Raw,
}

// The chunk is only handed out under the arena lock; the raw base
// pointer does not make it thread-bound.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Allocate a read-write chunk of at least `size` bytes.
    pub fn alloc(size: usize) -> Result<Chunk> {
        let size = align_up(size, page_size::get());
        let mut map = MmapMut::map_anon(size)
            .map_err(|e| GcError::VirtualMemory(format!("map_anon({}): {}", size, e)))?;
        let base = map.as_mut_ptr();
        Ok(Chunk {
            base,
            size,
            executable: false,
            backing: Backing::Map(map),
        })
    }

    /// Allocate a read-write-execute chunk of at least `size` bytes.
    #[cfg(unix)]
    pub fn alloc_exec(size: usize) -> Result<Chunk> {
        let size = align_up(size, page_size::get());
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(GcError::VirtualMemory(format!(
                "mmap rwx ({} bytes): {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Chunk {
            base: base as *mut u8,
            size,
            executable: true,
            backing: Backing::Raw,
        })
    }

    /// Allocate a read-write-execute chunk of at least `size` bytes.
    #[cfg(windows)]
    pub fn alloc_exec(size: usize) -> Result<Chunk> {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
        };
        let size = align_up(size, page_size::get());
        let base = unsafe {
            VirtualAlloc(
                std::ptr::null(),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if base.is_null() {
            return Err(GcError::VirtualMemory(format!(
                "VirtualAlloc rwx ({} bytes) failed",
                size
            )));
        }
        Ok(Chunk {
            base: base as *mut u8,
            size,
            executable: true,
            backing: Backing::Raw,
        })
    }

    /// Base address of the chunk.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Committed size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the end of the chunk.
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        (self.base as usize + self.size) as *mut u8
    }

    /// Is this an executable chunk?
    #[inline]
    pub fn executable(&self) -> bool {
        self.executable
    }

    /// Does the chunk contain `addr`?
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base as usize && addr < self.base as usize + self.size
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        match self.backing {
            Backing::Map(_) => {}
            Backing::Raw => unsafe {
                #[cfg(unix)]
                libc::munmap(self.base as *mut libc::c_void, self.size);
                #[cfg(windows)]
                {
                    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
                    VirtualFree(self.base as _, 0, MEM_RELEASE);
                }
            },
        }
    }
}
