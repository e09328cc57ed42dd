//! Host memory backing a single JIT page.
//!
//! On Unix hosts the page is an anonymous `mmap` mapping whose protection is switched with
//! `mprotect` between read+write and read+execute. Elsewhere it is a heap buffer and the
//! permission state is tracked by the manager alone.

use crate::JitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protection {
    ReadWrite,
    ReadExec,
}

pub(crate) fn host_page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: `sysconf` has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

pub(crate) fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[cfg(unix)]
pub(crate) struct PageMemory {
    base: *mut u8,
    size: usize,
}

// The mapping is owned exclusively by its `PageMemory` and only touched under the manager's
// page-table lock.
#[cfg(unix)]
unsafe impl Send for PageMemory {}

#[cfg(unix)]
impl PageMemory {
    /// Maps `size` zeroed bytes as read+write. `size` must be a multiple of the host page size.
    pub(crate) fn map(size: usize) -> Result<Self, JitError> {
        // SAFETY: anonymous private mapping with no address hint; the result is checked below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(JitError::AllocationFailed {
                size,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Self {
            base: base.cast(),
            size,
        })
    }

    pub(crate) fn protect(&mut self, prot: Protection) -> Result<(), JitError> {
        let flags = match prot {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        };
        // SAFETY: `base..base+size` is the mapping created in `map` and is still live.
        let ret = unsafe { libc::mprotect(self.base.cast(), self.size, flags) };
        if ret != 0 {
            return Err(JitError::PermissionTransition {
                to: prot.name(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        if prot == Protection::ReadExec {
            flush_icache(self.base, self.size);
        }
        Ok(())
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is always readable and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.base, self.size) }
    }

    /// Caller guarantees the page is currently read+write.
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; `&mut self` rules out aliasing.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.size) }
    }

    #[cfg(target_arch = "aarch64")]
    pub(crate) fn entry(&self) -> *const u8 {
        self.base
    }
}

#[cfg(unix)]
impl Drop for PageMemory {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `map`; no references outlive `self`.
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

#[cfg(not(unix))]
pub(crate) struct PageMemory {
    bytes: Vec<u8>,
}

#[cfg(not(unix))]
impl PageMemory {
    pub(crate) fn map(size: usize) -> Result<Self, JitError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|err| JitError::AllocationFailed {
                size,
                reason: err.to_string(),
            })?;
        bytes.resize(size, 0);
        Ok(Self { bytes })
    }

    pub(crate) fn protect(&mut self, _prot: Protection) -> Result<(), JitError> {
        Ok(())
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Protection {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Protection::ReadWrite => "read+write",
            Protection::ReadExec => "read+execute",
        }
    }
}

/// Instruction-cache maintenance after writing code; a no-op off AArch64.
#[cfg(unix)]
fn flush_icache(addr: *mut u8, len: usize) {
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    {
        extern "C" {
            fn sys_icache_invalidate(start: *mut libc::c_void, size: usize);
        }
        // SAFETY: `addr..addr+len` is a live mapping owned by the caller.
        unsafe { sys_icache_invalidate(addr.cast(), len) };
    }

    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    {
        extern "C" {
            fn __clear_cache(start: *mut libc::c_void, end: *mut libc::c_void);
        }
        // SAFETY: as above; `end` is one past the mapping.
        unsafe { __clear_cache(addr.cast(), addr.add(len).cast()) };
    }

    let _ = (addr, len);
}
