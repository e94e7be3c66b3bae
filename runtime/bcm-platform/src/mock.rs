//! Mock backend - simulated physical memory and VideoCore firmware
//!
//! [`MockMapper`] hands out heap pages in place of physical memory. The same
//! physical page always resolves to the same heap page, so a driver's
//! register writes are visible to a test that inspects the address through
//! [`MockMapper::read_u32`], and vice versa. Tests play the part of the
//! hardware this way.
//!
//! [`MockMailbox`] implements the four memory-manager tags (allocate, lock,
//! unlock, release) over a simple arena of fake physical addresses.

use core::ptr::NonNull;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::mailbox::{check_buffer, Mailbox};
use crate::mapper::{page_span, MappedRegion, PhysMapper, PAGE_SIZE};
use crate::{PlatformError, Result};

/// One page-aligned run of simulated physical memory
struct Window {
    phys: u64,
    len: usize,
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the window owns its allocation; concurrent access is the same
// volatile free-for-all real device memory offers.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    fn new(phys: u64, len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|_| PlatformError::InvalidRange { phys, len })?;
        // SAFETY: layout has non-zero size (len is at least one page)
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(PlatformError::InvalidRange { phys, len })?;
        Ok(Self {
            phys,
            len,
            base,
            layout,
        })
    }

    fn contains(&self, phys: u64, len: usize) -> bool {
        phys >= self.phys && phys + len as u64 <= self.phys + self.len as u64
    }

    fn overlaps(&self, phys: u64, len: usize) -> bool {
        phys < self.phys + self.len as u64 && self.phys < phys + len as u64
    }

    fn ptr_at(&self, phys: u64) -> *mut u8 {
        self.base.as_ptr().wrapping_add((phys - self.phys) as usize)
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        // SAFETY: allocated in Window::new with this exact layout
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Heap-backed stand-in for `/dev/mem`
#[derive(Default)]
pub struct MockMapper {
    windows: Mutex<Vec<Arc<Window>>>,
    maps: AtomicUsize,
}

impl MockMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn windows(&self) -> MutexGuard<'_, Vec<Arc<Window>>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find the window holding `[phys, phys + len)`, creating it on demand
    fn window_for(&self, phys: u64, len: usize) -> Result<Arc<Window>> {
        let mut windows = self.windows();
        if let Some(window) = windows.iter().find(|w| w.contains(phys, len)) {
            return Ok(Arc::clone(window));
        }

        let (base, _, span) = page_span(phys, len);
        if windows.iter().any(|w| w.overlaps(base, span)) {
            // Growing a window would move memory already handed out
            log::warn!("mock mapping {:#x}+{:#x} straddles an existing window", phys, len);
            return Err(PlatformError::InvalidRange { phys, len });
        }

        let window = Arc::new(Window::new(base, span)?);
        windows.push(Arc::clone(&window));
        Ok(window)
    }

    /// Number of successful `map` calls so far
    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::Relaxed)
    }

    /// Read a word of simulated physical memory
    pub fn read_u32(&self, phys: u64) -> Result<u32> {
        let window = self.window_for(phys, 4)?;
        // SAFETY: inside the window; callers keep word alignment
        Ok(unsafe { window.ptr_at(phys).cast::<u32>().read_volatile() })
    }

    /// Write a word of simulated physical memory
    pub fn write_u32(&self, phys: u64, value: u32) -> Result<()> {
        let window = self.window_for(phys, 4)?;
        // SAFETY: inside the window; callers keep word alignment
        unsafe { window.ptr_at(phys).cast::<u32>().write_volatile(value) };
        Ok(())
    }

    /// Copy bytes out of simulated physical memory
    pub fn read_bytes(&self, phys: u64, out: &mut [u8]) -> Result<()> {
        let window = self.window_for(phys, out.len())?;
        let src = window.ptr_at(phys);
        for (i, byte) in out.iter_mut().enumerate() {
            // SAFETY: [phys, phys + out.len()) lies inside the window
            *byte = unsafe { src.add(i).read_volatile() };
        }
        Ok(())
    }

    /// Copy bytes into simulated physical memory
    pub fn write_bytes(&self, phys: u64, data: &[u8]) -> Result<()> {
        let window = self.window_for(phys, data.len())?;
        let dst = window.ptr_at(phys);
        for (i, byte) in data.iter().enumerate() {
            // SAFETY: [phys, phys + data.len()) lies inside the window
            unsafe { dst.add(i).write_volatile(*byte) };
        }
        Ok(())
    }
}

impl PhysMapper for MockMapper {
    fn map(&self, phys: u64, len: usize) -> Result<MappedRegion> {
        if len == 0 {
            return Err(PlatformError::InvalidRange { phys, len });
        }
        let window = self.window_for(phys, len)?;
        let ptr = NonNull::new(window.ptr_at(phys)).ok_or(PlatformError::InvalidRange { phys, len })?;
        self.maps.fetch_add(1, Ordering::Relaxed);

        // SAFETY: the window covers [phys, phys + len) and the region keeps
        // the window alive.
        Ok(unsafe { MappedRegion::from_raw_parts(ptr, phys, len, window) })
    }
}

/// Tags understood by the simulated memory manager
pub mod tags {
    pub const ALLOCATE_MEMORY: u32 = 0x0003_000c;
    pub const LOCK_MEMORY: u32 = 0x0003_000d;
    pub const UNLOCK_MEMORY: u32 = 0x0003_000e;
    pub const RELEASE_MEMORY: u32 = 0x0003_000f;
}

const RESPONSE_SUCCESS: u32 = 0x8000_0000;
const RESPONSE_ERROR: u32 = 0x8000_0001;

#[derive(Debug, Clone, Copy)]
struct Allocation {
    phys: u32,
    locked: bool,
}

struct VcState {
    next_phys: u32,
    next_handle: u32,
    allocations: BTreeMap<u32, Allocation>,
    calls: Vec<u32>,
    reject: bool,
    rejected_tags: Vec<u32>,
}

/// Simulated VideoCore memory manager
///
/// Allocations are carved out of a fake physical arena starting at
/// [`MockMailbox::ARENA_BASE`]. Locking returns the physical address with
/// the L1 non-allocating bus alias (`0xC000_0000`) applied, as the firmware
/// does for `MEM_FLAG_DIRECT` memory.
pub struct MockMailbox {
    state: Mutex<VcState>,
}

impl MockMailbox {
    pub const ARENA_BASE: u32 = 0x3B40_0000;
    pub const BUS_ALIAS: u32 = 0xC000_0000;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(VcState {
                next_phys: Self::ARENA_BASE,
                next_handle: 1,
                allocations: BTreeMap::new(),
                calls: Vec::new(),
                reject: false,
                rejected_tags: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, VcState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer every following request with an error response code
    pub fn set_rejecting(&self, reject: bool) {
        self.state().reject = reject;
    }

    /// Answer requests carrying `tag` with an error response code
    pub fn reject_tag(&self, tag: u32) {
        self.state().rejected_tags.push(tag);
    }

    /// Tags received so far, in order
    pub fn calls(&self) -> Vec<u32> {
        self.state().calls.clone()
    }

    /// Allocations not yet released
    pub fn live_allocations(&self) -> usize {
        self.state().allocations.len()
    }

    /// Whether the allocation behind `handle` is currently locked
    pub fn is_locked(&self, handle: u32) -> bool {
        self.state()
            .allocations
            .get(&handle)
            .map(|a| a.locked)
            .unwrap_or(false)
    }
}

impl Default for MockMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl VcState {
    fn allocate(&mut self, size: u32, align: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let align = align.max(PAGE_SIZE as u32);
        let phys = (self.next_phys + align - 1) & !(align - 1);
        let size = (size + PAGE_SIZE as u32 - 1) & !(PAGE_SIZE as u32 - 1);
        self.next_phys = phys + size;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.allocations.insert(handle, Allocation { phys, locked: false });
        handle
    }

    fn lock(&mut self, handle: u32) -> u32 {
        match self.allocations.get_mut(&handle) {
            Some(allocation) => {
                allocation.locked = true;
                allocation.phys | MockMailbox::BUS_ALIAS
            }
            None => 0,
        }
    }

    fn unlock(&mut self, handle: u32) -> u32 {
        match self.allocations.get_mut(&handle) {
            Some(allocation) => {
                allocation.locked = false;
                0
            }
            None => 1,
        }
    }

    fn release(&mut self, handle: u32) -> u32 {
        match self.allocations.remove(&handle) {
            Some(_) => 0,
            None => 1,
        }
    }
}

impl Mailbox for MockMailbox {
    fn call(&self, buffer: &mut [u32]) -> Result<()> {
        check_buffer(buffer)?;
        // single-tag messages with at least one value word
        if buffer.len() < 7 {
            return Err(PlatformError::MalformedBuffer(buffer.len()));
        }

        let mut state = self.state();
        let tag = buffer[2];
        state.calls.push(tag);

        if state.reject || state.rejected_tags.contains(&tag) {
            buffer[1] = RESPONSE_ERROR;
            return Ok(());
        }

        let value = match tag {
            tags::ALLOCATE_MEMORY if buffer.len() >= 9 => state.allocate(buffer[5], buffer[6]),
            tags::LOCK_MEMORY => state.lock(buffer[5]),
            tags::UNLOCK_MEMORY => state.unlock(buffer[5]),
            tags::RELEASE_MEMORY => state.release(buffer[5]),
            _ => {
                buffer[1] = RESPONSE_ERROR;
                return Ok(());
            }
        };

        buffer[1] = RESPONSE_SUCCESS;
        buffer[4] = RESPONSE_SUCCESS | 4;
        buffer[5] = value;
        Ok(())
    }
}
