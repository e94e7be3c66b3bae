//! Physical Mapping - bringing device and DMA memory into the process
//!
//! Peripheral register blocks and VideoCore-allocated memory both live at
//! fixed physical addresses. A [`PhysMapper`] turns such a range into a
//! [`MappedRegion`]: a pointer into this process whose lifetime is tied to
//! the region value.
//!
//! Requests do not need to be page aligned. The mapping always covers whole
//! pages and the returned pointer is offset by the sub-page remainder, so the
//! caller sees exactly the address it asked for.

use core::any::Any;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::Result;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Round `addr` down to the containing page boundary
#[inline]
pub const fn align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round `size` up to a whole number of pages
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Number of pages needed to hold `size` bytes
#[inline]
pub const fn pages_needed(size: usize) -> usize {
    align_up(size) / PAGE_SIZE
}

/// Check whether an address sits on a page boundary
#[inline]
pub const fn is_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

/// Page-granular span covering a byte range
///
/// Returns `(aligned_base, offset_in_first_page, mapped_len)`.
pub(crate) const fn page_span(phys: u64, len: usize) -> (u64, usize, usize) {
    let base = align_down(phys);
    let offset = (phys - base) as usize;
    (base, offset, align_up(len + offset))
}

/// A physical range mapped into the process address space
///
/// The mapping stays valid for as long as the region (or a clone of the
/// `Arc` it is usually wrapped in) is alive. Access through the pointer must
/// be volatile: the memory is device memory or is shared with a DMA engine.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    phys: u64,
    len: usize,
    _backing: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the region is a plain address range; all accesses go through
// volatile reads and writes issued by the owner of the pointer.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Wrap a mapping established by a backend
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as `backing` is alive.
    pub unsafe fn from_raw_parts(
        ptr: NonNull<u8>,
        phys: u64,
        len: usize,
        backing: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            phys,
            len,
            _backing: backing,
        }
    }

    /// Pointer to the first requested byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Physical address of the first requested byte
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Length requested by the caller
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether a CPU address falls inside this region
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr - base < self.len
    }
}

impl core::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}

/// Maps physical memory into the process
pub trait PhysMapper {
    /// Map `len` bytes starting at physical address `phys`
    ///
    /// # Errors
    /// Returns error if:
    /// - `len` is zero
    /// - The backing device cannot be opened (usually missing privileges)
    /// - The kernel refuses the mapping
    fn map(&self, phys: u64, len: usize) -> Result<MappedRegion>;
}

#[cfg(all(feature = "runtime", unix))]
pub use devmem::DevMemMapper;

#[cfg(all(feature = "runtime", unix))]
mod devmem {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;
    use std::sync::Arc;

    use core::ptr::NonNull;
    use memmap2::MmapOptions;

    use super::{page_span, MappedRegion, PhysMapper};
    use crate::{PlatformError, Result};

    /// Maps physical memory through `/dev/mem`
    ///
    /// The device is opened with `O_SYNC` for every request and closed as soon
    /// as the mapping exists; the mapping itself outlives the descriptor.
    #[derive(Debug, Clone)]
    pub struct DevMemMapper {
        path: &'static str,
    }

    impl DevMemMapper {
        pub const DEFAULT_PATH: &'static str = "/dev/mem";

        pub fn new() -> Self {
            Self {
                path: Self::DEFAULT_PATH,
            }
        }

        /// Use a different device node (e.g. `/dev/gpiomem`)
        pub fn with_path(path: &'static str) -> Self {
            Self { path }
        }
    }

    impl Default for DevMemMapper {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PhysMapper for DevMemMapper {
        fn map(&self, phys: u64, len: usize) -> Result<MappedRegion> {
            if len == 0 {
                return Err(PlatformError::InvalidRange { phys, len });
            }

            let (base, offset, map_len) = page_span(phys, len);

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_SYNC)
                .open(self.path)
                .map_err(|source| PlatformError::DeviceOpen {
                    path: self.path,
                    source,
                })?;

            let mmap = MmapOptions::new()
                .offset(base)
                .len(map_len)
                .map_raw(&file)
                .map_err(|source| PlatformError::MapFailed { phys, len, source })?;
            drop(file);

            let ptr = NonNull::new(mmap.as_mut_ptr().wrapping_add(offset))
                .ok_or(PlatformError::InvalidRange { phys, len })?;

            log::debug!(
                "mapped {:#x}+{:#x} ({} pages) at {:p}",
                phys,
                len,
                map_len / super::PAGE_SIZE,
                ptr
            );

            // SAFETY: the pointer lies `offset` bytes into a mapping of
            // `map_len >= offset + len` bytes that `mmap` keeps alive.
            Ok(unsafe { MappedRegion::from_raw_parts(ptr, phys, len, Arc::new(mmap)) })
        }
    }
}
