//! Register access - volatile cells and typed views over mapped memory
//!
//! Hardware register blocks are declared as `#[repr(C)]` structs of [`Reg`]
//! cells whose layout matches the silicon. A [`RegisterView`] overlays such
//! a struct onto a mapped physical window. Every read and write goes through
//! `read_volatile`/`write_volatile`.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ops::Deref;
use core::ptr::{self, NonNull};
use std::sync::Arc;

use bcm_platform::{MappedRegion, PhysMapper};

use crate::{HalError, Result};

/// A single memory-mapped register
#[repr(transparent)]
pub struct Reg<T: Copy>(UnsafeCell<T>);

impl<T: Copy> Reg<T> {
    #[inline]
    pub fn read(&self) -> T {
        // SAFETY: the cell lives inside a mapped register block
        unsafe { ptr::read_volatile(self.0.get()) }
    }

    #[inline]
    pub fn write(&self, value: T) {
        // SAFETY: the cell lives inside a mapped register block
        unsafe { ptr::write_volatile(self.0.get(), value) }
    }

    /// Read-modify-write
    #[inline]
    pub fn modify(&self, f: impl FnOnce(T) -> T) {
        self.write(f(self.read()));
    }
}

impl Reg<u32> {
    /// Replace the `width`-bit field at `shift`, leaving other bits alone
    #[inline]
    pub fn write_field(&self, shift: u32, width: u32, value: u32) {
        let mask = ((1u32 << width) - 1) << shift;
        self.modify(|r| (r & !mask) | ((value << shift) & mask));
    }

    #[inline]
    pub fn read_field(&self, shift: u32, width: u32) -> u32 {
        (self.read() >> shift) & ((1u32 << width) - 1)
    }
}

/// An untyped span of registers, for windows shared by several blocks
#[repr(C, align(4))]
pub struct Window<const SIZE: usize> {
    _bytes: [u8; SIZE],
}

/// A typed overlay onto a mapped register window
///
/// Clones share the underlying mapping. Views are neither `Send` nor `Sync`:
/// a peripheral is driven from one thread.
pub struct RegisterView<T> {
    region: Arc<MappedRegion>,
    ptr: NonNull<T>,
    _marker: PhantomData<*const T>,
}

impl<T> RegisterView<T> {
    /// Map `size_of::<T>()` bytes at `phys` and overlay `T` on them
    pub fn map(mapper: &dyn PhysMapper, phys: u64) -> Result<Self> {
        let region = mapper.map(phys, size_of::<T>())?;
        Self::from_region(Arc::new(region), 0)
    }

    /// Overlay `T` at `offset` bytes into an existing mapping
    pub fn from_region(region: Arc<MappedRegion>, offset: usize) -> Result<Self> {
        let end = offset.checked_add(size_of::<T>());
        if end.map_or(true, |end| end > region.len()) {
            return Err(HalError::WindowOutOfRange {
                offset,
                size: size_of::<T>(),
                len: region.len(),
            });
        }

        let addr = region.as_ptr().wrapping_add(offset);
        if addr as usize % align_of::<T>() != 0 {
            return Err(HalError::WindowOutOfRange {
                offset,
                size: size_of::<T>(),
                len: region.len(),
            });
        }

        let ptr = NonNull::new(addr.cast::<T>()).ok_or(HalError::WindowOutOfRange {
            offset,
            size: size_of::<T>(),
            len: region.len(),
        })?;

        Ok(Self {
            region,
            ptr,
            _marker: PhantomData,
        })
    }

    /// A view of another block type at `offset` bytes past this one
    ///
    /// Used for peripherals that sit in one shared window at a fixed stride,
    /// like DMA channels and the PL011 cluster.
    pub fn project<U>(&self, offset: usize) -> Result<RegisterView<U>> {
        let base = self.ptr.as_ptr() as usize - self.region.as_ptr() as usize;
        RegisterView::from_region(Arc::clone(&self.region), base + offset)
    }

    /// Physical address of the block
    pub fn phys_addr(&self) -> u64 {
        let offset = self.ptr.as_ptr() as usize - self.region.as_ptr() as usize;
        self.region.phys_addr() + offset as u64
    }

    /// Raw pointer to the block (for precomputed register pointers)
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T> Clone for RegisterView<T> {
    fn clone(&self) -> Self {
        Self {
            region: Arc::clone(&self.region),
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for RegisterView<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: bounds and alignment were checked at construction and the
        // mapping lives as long as `region`
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> core::fmt::Debug for RegisterView<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisterView")
            .field("type", &core::any::type_name::<T>())
            .field("phys", &format_args!("{:#x}", self.phys_addr()))
            .finish()
    }
}
