//! Uncached Memory Pool - DMA-safe memory from the VideoCore
//!
//! The DMA engine does not snoop the ARM caches, so control blocks and data
//! buffers must live in memory the CPU maps uncached. The pool obtains one
//! block from the firmware (allocate + lock), maps it through the physical
//! mapper, and hands out pieces with a bump allocator.
//!
//! # Address spaces
//!
//! Each byte of the pool has three addresses:
//! - the **bus address** the firmware returned (with the `0xC` alias); this
//!   is what goes into DMA control blocks
//! - the **physical address** (bus address with the alias masked off); this
//!   is what gets mapped
//! - the **CPU address** inside the mapping
//!
//! Allocations are 32-byte granular and are never freed. The pool lives as
//! long as the last buffer referring to it.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bcm_platform::{align_up, Mailbox, MappedRegion, PhysMapper, PAGE_SIZE};

use crate::vcmem::{self, MemFlags};
use crate::{HalError, Result};

/// Allocation granularity (one DMA control block)
pub const GRANULE: usize = 32;

/// Round up to the allocation granularity
#[inline]
pub const fn granule_align(size: usize) -> usize {
    (size + GRANULE - 1) & !(GRANULE - 1)
}

/// Pool of uncached, DMA-addressable memory
#[derive(Debug)]
pub struct UncachedPool {
    handle: u32,
    bus_base: u32,
    phys_base: u32,
    region: MappedRegion,
    allocated: AtomicUsize,
}

impl UncachedPool {
    /// Allocate, lock and map `size` bytes (rounded up to pages)
    ///
    /// # Errors
    /// Any failure of the firmware calls or the mapping. Nothing that depends
    /// on DMA can work without the pool, so callers treat this as fatal.
    pub fn establish(mapper: &dyn PhysMapper, mailbox: &dyn Mailbox, size: usize) -> Result<Self> {
        let size = align_up(size);
        let handle = vcmem::alloc(mailbox, size as u32, PAGE_SIZE as u32, MemFlags::L1_NONALLOCATING)?;
        let bus_base = match vcmem::lock(mailbox, handle) {
            Ok(bus_base) => bus_base,
            Err(err) => {
                Self::release(mailbox, handle, false);
                return Err(err);
            }
        };
        let phys_base = vcmem::bus_to_phys(bus_base);
        let region = match mapper.map(u64::from(phys_base), size) {
            Ok(region) => region,
            Err(err) => {
                Self::release(mailbox, handle, true);
                return Err(err.into());
            }
        };

        log::info!(
            "uncached pool: {} bytes, handle {:#x}, bus {:#010x}, phys {:#010x}, cpu {:p}",
            size,
            handle,
            bus_base,
            phys_base,
            region.as_ptr()
        );

        Ok(Self {
            handle,
            bus_base,
            phys_base,
            region,
            allocated: AtomicUsize::new(0),
        })
    }

    /// Hand a half-established allocation back to the firmware
    fn release(mailbox: &dyn Mailbox, handle: u32, locked: bool) {
        if locked {
            if let Err(err) = vcmem::unlock(mailbox, handle) {
                log::warn!("cannot unlock VideoCore handle {:#x}: {}", handle, err);
            }
        }
        if let Err(err) = vcmem::free(mailbox, handle) {
            log::warn!("cannot free VideoCore handle {:#x}: {}", handle, err);
        }
    }

    /// Carve `size` bytes (rounded up to 32) out of the pool
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<UncachedBuffer> {
        let len = granule_align(size.max(1));
        let total = self.region.len();

        let offset = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|end| *end <= total)
            })
            .map_err(|used| {
                log::error!("uncached pool exhausted: {} requested, {} free", len, total - used);
                HalError::OutOfUncachedMemory {
                    requested: len,
                    available: total - used,
                }
            })?;

        let ptr = NonNull::new(self.region.as_ptr().wrapping_add(offset)).ok_or(
            HalError::OutOfUncachedMemory {
                requested: len,
                available: total - offset,
            },
        )?;

        log::debug!("uncached alloc {} bytes at offset {:#x}", len, offset);

        Ok(UncachedBuffer {
            ptr,
            len,
            bus_addr: self.bus_base + offset as u32,
            pool: Arc::clone(self),
        })
    }

    /// Bus address of any CPU pointer inside the pool
    ///
    /// # Errors
    /// `InvalidDmaAddress` if `ptr` lies outside the mapped pool.
    pub fn bus_address_of(&self, ptr: *const u8) -> Result<u32> {
        let addr = ptr as usize;
        if !self.region.contains(addr) {
            log::error!(
                "{:#x} is outside the uncached pool ({:p}+{:#x})",
                addr,
                self.region.as_ptr(),
                self.region.len()
            );
            return Err(HalError::InvalidDmaAddress { addr });
        }
        Ok(self.bus_base + (addr - self.region.as_ptr() as usize) as u32)
    }

    /// Firmware handle of the backing allocation
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn bus_base(&self) -> u32 {
        self.bus_base
    }

    pub fn phys_base(&self) -> u32 {
        self.phys_base
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Bytes handed out so far
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

/// A piece of the uncached pool
///
/// Contents may change underneath the CPU while a DMA transfer runs, so the
/// buffer only offers volatile copies, never references.
#[derive(Debug)]
pub struct UncachedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    bus_addr: u32,
    pool: Arc<UncachedPool>,
}

impl UncachedBuffer {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address to program into DMA control blocks
    pub fn bus_address(&self) -> u32 {
        self.bus_addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pool(&self) -> &Arc<UncachedPool> {
        &self.pool
    }

    /// Copy `data` into the buffer at `offset`
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: range checked above
            unsafe { self.ptr.as_ptr().add(offset + i).write_volatile(*byte) };
        }
        Ok(())
    }

    /// Copy bytes at `offset` out of the buffer
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: range checked above
            *byte = unsafe { self.ptr.as_ptr().add(offset + i).read_volatile() };
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(HalError::InvalidDmaAddress {
                addr: self.ptr.as_ptr() as usize + offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcm_platform::mock::tags;
    use bcm_platform::{MockMailbox, MockMapper};

    fn pool(size: usize) -> Arc<UncachedPool> {
        let mapper = MockMapper::new();
        let mailbox = MockMailbox::new();
        Arc::new(UncachedPool::establish(&mapper, &mailbox, size).unwrap())
    }

    #[test]
    fn test_pool_is_page_rounded_and_aliased() {
        let pool = pool(5000);
        assert_eq!(pool.size(), 2 * PAGE_SIZE);
        assert_eq!(pool.bus_base(), MockMailbox::ARENA_BASE | 0xC000_0000);
        assert_eq!(pool.phys_base(), MockMailbox::ARENA_BASE);
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn test_allocations_are_32_byte_granular() {
        let pool = pool(PAGE_SIZE);
        let a = pool.allocate(1).unwrap();
        let b = pool.allocate(33).unwrap();
        let c = pool.allocate(32).unwrap();

        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 64);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 32);
        assert_eq!(c.as_ptr() as usize - b.as_ptr() as usize, 64);
        assert_eq!(c.as_ptr() as usize % GRANULE, 0);
        assert_eq!(c.bus_address(), pool.bus_base() + 96);
        assert_eq!(pool.allocated(), 128);
    }

    #[test]
    fn test_exhaustion_fails_without_consuming() {
        let pool = pool(PAGE_SIZE);
        pool.allocate(PAGE_SIZE - 64).unwrap();

        assert!(matches!(
            pool.allocate(128),
            Err(HalError::OutOfUncachedMemory {
                requested: 128,
                available: 64
            })
        ));
        // the remainder is still usable
        pool.allocate(64).unwrap();
        assert_eq!(pool.allocated(), PAGE_SIZE);
    }

    #[test]
    fn test_bus_address_bijection() {
        let pool = pool(PAGE_SIZE);
        let base = pool.base_ptr();
        for offset in (0..pool.size()).step_by(97).chain([pool.size() - 1]) {
            let bus = pool.bus_address_of(base.wrapping_add(offset)).unwrap();
            assert_eq!(bus, pool.bus_base() + offset as u32);
        }
    }

    #[test]
    fn test_bus_address_outside_pool_fails() {
        let pool = pool(PAGE_SIZE);
        let base = pool.base_ptr();
        let outside = [
            base.wrapping_sub(1),
            base.wrapping_add(pool.size()),
            core::ptr::null_mut(),
        ];
        for ptr in outside {
            assert!(matches!(
                pool.bus_address_of(ptr),
                Err(HalError::InvalidDmaAddress { .. })
            ));
        }

        let stack_byte = 0u8;
        assert!(pool.bus_address_of(&stack_byte).is_err());
    }

    #[test]
    fn test_buffer_copies_are_bounds_checked() {
        let pool = pool(PAGE_SIZE);
        let buf = pool.allocate(16).unwrap();
        buf.write_bytes(4, b"abcd").unwrap();

        let mut out = [0u8; 6];
        buf.read_bytes(3, &mut out).unwrap();
        assert_eq!(&out, b"\0abcd\0");

        assert!(buf.write_bytes(30, b"xyz").is_err());
    }

    /// Mapper standing in for a `/dev/mem` the process may not open
    struct DeniedMapper;

    impl PhysMapper for DeniedMapper {
        fn map(&self, phys: u64, len: usize) -> bcm_platform::Result<MappedRegion> {
            Err(bcm_platform::PlatformError::InvalidRange { phys, len })
        }
    }

    #[test]
    fn test_failed_map_releases_allocation() {
        let mailbox = MockMailbox::new();
        for _ in 0..3 {
            assert!(UncachedPool::establish(&DeniedMapper, &mailbox, PAGE_SIZE).is_err());
        }
        assert_eq!(mailbox.live_allocations(), 0);
        assert_eq!(
            mailbox.calls()[..4],
            [
                tags::ALLOCATE_MEMORY,
                tags::LOCK_MEMORY,
                tags::UNLOCK_MEMORY,
                tags::RELEASE_MEMORY
            ]
        );
    }

    #[test]
    fn test_failed_lock_releases_allocation() {
        let mapper = MockMapper::new();
        let mailbox = MockMailbox::new();
        mailbox.reject_tag(tags::LOCK_MEMORY);

        assert!(matches!(
            UncachedPool::establish(&mapper, &mailbox, PAGE_SIZE),
            Err(HalError::MailboxRejected { .. })
        ));
        assert_eq!(mailbox.live_allocations(), 0);
        assert_eq!(
            mailbox.calls(),
            [tags::ALLOCATE_MEMORY, tags::LOCK_MEMORY, tags::RELEASE_MEMORY]
        );
        assert_eq!(mapper.map_count(), 0);
    }

    #[test]
    fn test_failed_lock_is_reported() {
        let mapper = MockMapper::new();
        let mailbox = MockMailbox::new();
        mailbox.set_rejecting(true);
        assert!(UncachedPool::establish(&mapper, &mailbox, PAGE_SIZE).is_err());
        assert_eq!(mapper.map_count(), 0);
    }
}
