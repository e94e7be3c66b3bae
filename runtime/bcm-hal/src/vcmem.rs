//! VideoCore memory manager - property-tag protocol
//!
//! DMA-visible memory that bypasses the ARM caches is allocated by the GPU
//! firmware. The protocol is four single-tag property calls:
//!
//! | Tag       | Request              | Response     |
//! |-----------|----------------------|--------------|
//! | `0x3000c` | size, align, flags   | handle       |
//! | `0x3000d` | handle               | bus address  |
//! | `0x3000e` | handle               | status       |
//! | `0x3000f` | handle               | status       |

use bitflags::bitflags;
use bcm_platform::Mailbox;

use crate::{HalError, Result};

pub const TAG_ALLOCATE_MEMORY: u32 = 0x0003_000c;
pub const TAG_LOCK_MEMORY: u32 = 0x0003_000d;
pub const TAG_UNLOCK_MEMORY: u32 = 0x0003_000e;
pub const TAG_RELEASE_MEMORY: u32 = 0x0003_000f;

const REQUEST_CODE: u32 = 0;
const RESPONSE_SUCCESS: u32 = 0x8000_0000;

/// Bits of a bus address that select the cache alias
pub const BUS_ALIAS_MASK: u32 = 0xC000_0000;

bitflags! {
    /// Allocation flags understood by the firmware
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Can be resized to 0 at any time
        const DISCARDABLE = 1 << 0;
        /// 0xC alias, uncached
        const DIRECT = 1 << 2;
        /// 0x8 alias, non-allocating in L2 but coherent
        const COHERENT = 2 << 2;
        const ZERO = 1 << 4;
        const NO_INIT = 1 << 5;
        const HINT_PERMALOCK = 1 << 6;
    }
}

impl MemFlags {
    /// Allocating in L2, not L1 (`DIRECT | COHERENT`)
    pub const L1_NONALLOCATING: MemFlags = MemFlags::DIRECT.union(MemFlags::COHERENT);
}

/// Physical address behind a bus address
pub const fn bus_to_phys(bus: u32) -> u32 {
    bus & !BUS_ALIAS_MASK
}

/// Issue one single-tag property call and return the first response word
fn property_call(mailbox: &dyn Mailbox, tag: u32, values: &[u32]) -> Result<u32> {
    // header (2) + tag header (3) + values + end tag
    let mut buf = [0u32; 9];
    let len = 6 + values.len();
    let buf = &mut buf[..len];

    buf[0] = (len * 4) as u32;
    buf[1] = REQUEST_CODE;
    buf[2] = tag;
    buf[3] = (values.len() * 4) as u32;
    buf[4] = (values.len() * 4) as u32;
    buf[5..5 + values.len()].copy_from_slice(values);
    buf[len - 1] = 0;

    mailbox.call(buf).map_err(|err| {
        log::error!("mailbox tag {:#x} failed: {}", tag, err);
        err
    })?;

    if buf[1] != RESPONSE_SUCCESS {
        log::error!("mailbox tag {:#x} rejected with {:#010x}", tag, buf[1]);
        return Err(HalError::MailboxRejected { tag, code: buf[1] });
    }
    Ok(buf[5])
}

/// Allocate `size` bytes of GPU memory, returning its handle
pub fn alloc(mailbox: &dyn Mailbox, size: u32, align: u32, flags: MemFlags) -> Result<u32> {
    let handle = property_call(mailbox, TAG_ALLOCATE_MEMORY, &[size, align, flags.bits()])?;
    if handle == 0 {
        log::error!("VideoCore refused to allocate {} bytes", size);
        return Err(HalError::VcAllocFailed { size });
    }
    Ok(handle)
}

/// Pin an allocation in place, returning its bus address
pub fn lock(mailbox: &dyn Mailbox, handle: u32) -> Result<u32> {
    let bus = property_call(mailbox, TAG_LOCK_MEMORY, &[handle])?;
    if bus == 0 {
        log::error!("VideoCore refused to lock handle {:#x}", handle);
        return Err(HalError::VcLockFailed { handle });
    }
    Ok(bus)
}

pub fn unlock(mailbox: &dyn Mailbox, handle: u32) -> Result<()> {
    match property_call(mailbox, TAG_UNLOCK_MEMORY, &[handle])? {
        0 => Ok(()),
        status => Err(HalError::VcStatus {
            tag: TAG_UNLOCK_MEMORY,
            status,
        }),
    }
}

/// Return an allocation to the firmware
pub fn free(mailbox: &dyn Mailbox, handle: u32) -> Result<()> {
    match property_call(mailbox, TAG_RELEASE_MEMORY, &[handle])? {
        0 => Ok(()),
        status => Err(HalError::VcStatus {
            tag: TAG_RELEASE_MEMORY,
            status,
        }),
    }
}
