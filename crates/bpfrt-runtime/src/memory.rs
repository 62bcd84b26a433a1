//! Page-granular memory mappings
//!
//! Two building blocks: [`PageBuffer`], an anonymous mapping whose
//! protection can flip between read-write and read-only, and
//! [`DoubleMapping`], the contiguous-wrap trick for ring buffers where
//! two adjacent virtual ranges alias the same physical pages so a
//! record crossing the end of the ring is still one contiguous copy.

#[cfg(not(unix))]
compile_error!("bpfrt-runtime requires a unix platform");

use std::sync::OnceLock;

use bpfrt_core::error::{BpfError, BpfResult};
use bpfrt_core::kdebug;

/// Host page size, sampled once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// Round `size` up to a whole number of pages.
pub fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Anonymous page-aligned mapping with switchable protection.
pub struct PageBuffer {
    base: *mut u8,
    size: usize,
}

// Safety: the mapping is owned; callers serialize slice access through
// the usual borrow rules.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    /// Map `minimum_size` bytes (rounded up to pages) as read-write.
    pub fn new(minimum_size: usize) -> BpfResult<Self> {
        if minimum_size == 0 {
            return Err(BpfError::InvalidArgument);
        }
        let size = round_to_pages(minimum_size);
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(BpfError::NoMemory);
        }
        kdebug!("memory: mapped {} bytes at {:p}", size, base);
        Ok(PageBuffer {
            base: base.cast(),
            size,
        })
    }

    fn protect(&self, protection: libc::c_int) -> BpfResult {
        let rc = unsafe { libc::mprotect(self.base.cast(), self.size, protection) };
        if rc != 0 {
            return Err(BpfError::InvalidArgument);
        }
        Ok(())
    }

    /// Make the mapping read-only.
    pub fn protect_read_only(&self) -> BpfResult {
        self.protect(libc::PROT_READ)
    }

    /// Make the mapping read-write again.
    pub fn protect_read_write(&self) -> BpfResult {
        self.protect(libc::PROT_READ | libc::PROT_WRITE)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base, self.size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base, self.size) }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn backing_fd(size: usize) -> BpfResult<libc::c_int> {
            let name = b"bpfrt-ring\0";
            let fd = unsafe {
                libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC)
            };
            if fd < 0 {
                return Err(BpfError::NoMemory);
            }
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                unsafe { libc::close(fd) };
                return Err(BpfError::NoMemory);
            }
            Ok(fd)
        }
    } else {
        fn backing_fd(size: usize) -> BpfResult<libc::c_int> {
            // No memfd; an unlinked temp file provides the shared pages.
            let mut template = *b"/tmp/bpfrt-ring-XXXXXX\0";
            let fd = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
            if fd < 0 {
                return Err(BpfError::NoMemory);
            }
            unsafe { libc::unlink(template.as_ptr().cast()) };
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                unsafe { libc::close(fd) };
                return Err(BpfError::NoMemory);
            }
            Ok(fd)
        }
    }
}

/// A ring backing where `[0, size)` and `[size, 2*size)` alias the
/// same physical pages.
pub struct DoubleMapping {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for DoubleMapping {}
unsafe impl Sync for DoubleMapping {}

impl DoubleMapping {
    /// Create an aliased mapping of at least `minimum_size` bytes,
    /// rounded up to whole pages.
    pub fn new(minimum_size: usize) -> BpfResult<Self> {
        if minimum_size == 0 {
            return Err(BpfError::InvalidArgument);
        }
        let size = round_to_pages(minimum_size);
        let fd = backing_fd(size)?;

        // Reserve the doubled range first so both halves land adjacent.
        let reservation = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reservation == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(BpfError::NoMemory);
        }

        let base: *mut u8 = reservation.cast();
        for half in 0..2 {
            let target = unsafe { base.add(half * size) };
            let mapped = unsafe {
                libc::mmap(
                    target.cast(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                unsafe {
                    libc::munmap(reservation, size * 2);
                    libc::close(fd);
                }
                return Err(BpfError::NoMemory);
            }
        }
        unsafe { libc::close(fd) };

        kdebug!("memory: double-mapped {} bytes at {:p}", size, base);
        Ok(DoubleMapping { base, size })
    }

    /// Capacity of one half of the mapping.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Raw pointer to `offset` within the aliased range.
    ///
    /// `offset` is reduced modulo the capacity; thanks to the alias, a
    /// contiguous access of up to the capacity is valid from the
    /// returned pointer.
    #[inline]
    pub fn at(&self, offset: u64) -> *mut u8 {
        let reduced = (offset % self.size as u64) as usize;
        unsafe { self.base.add(reduced) }
    }

    /// Copy `data` into the ring at `offset`, wrapping transparently.
    ///
    /// Caller must guarantee exclusive write access to that range.
    pub unsafe fn write_at(&self, offset: u64, data: &[u8]) {
        debug_assert!(data.len() <= self.size);
        core::ptr::copy_nonoverlapping(data.as_ptr(), self.at(offset), data.len());
    }

    /// Copy bytes out of the ring at `offset`, wrapping transparently.
    ///
    /// Caller must guarantee the range is not concurrently written.
    pub unsafe fn read_at(&self, offset: u64, out: &mut [u8]) {
        debug_assert!(out.len() <= self.size);
        core::ptr::copy_nonoverlapping(self.at(offset), out.as_mut_ptr(), out.len());
    }
}

impl Drop for DoubleMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast(), self.size * 2);
        }
    }
}
