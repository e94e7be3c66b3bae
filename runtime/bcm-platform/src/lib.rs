//! # BCM Platform Layer
//!
//! The operating-system boundary for user-space BCM2711 drivers. Everything
//! that touches a device node lives here; the peripheral drivers in
//! `bcm-hal` only ever see the two traits this crate exports:
//!
//! - [`PhysMapper`]: maps a physical address range into the process
//! - [`Mailbox`]: submits a VideoCore property-tag buffer
//!
//! ## Backends
//!
//! - **Runtime Mode** (`runtime`, default): [`DevMemMapper`] over `/dev/mem`
//!   and [`VcioMailbox`] over `/dev/vcio`. Needs root on a real board.
//! - **Mock Mode** (`mock`): [`MockMapper`] backs "physical memory" with heap
//!   pages and [`MockMailbox`] simulates the VideoCore memory manager, so the
//!   drivers can be exercised on any host.
//!
//! ```bash
//! # Real board
//! cargo build
//!
//! # Host testing
//! cargo test --features mock
//! ```

use std::io;

use thiserror::Error;

pub mod mailbox;
pub mod mapper;

#[cfg(feature = "mock")]
pub mod mock;

pub use mailbox::Mailbox;
pub use mapper::{align_down, align_up, is_aligned, pages_needed, MappedRegion, PhysMapper, PAGE_SIZE};

#[cfg(all(feature = "runtime", unix))]
pub use mailbox::VcioMailbox;
#[cfg(all(feature = "runtime", unix))]
pub use mapper::DevMemMapper;

#[cfg(feature = "mock")]
pub use mock::{MockMailbox, MockMapper};

/// Platform errors
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("cannot open {path}: {source}")]
    DeviceOpen {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot map physical range {phys:#x}+{len:#x}: {source}")]
    MapFailed {
        phys: u64,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("invalid mapping request {phys:#x}+{len:#x}")]
    InvalidRange { phys: u64, len: usize },

    #[error("mailbox property call failed: {0}")]
    MailboxIo(#[source] io::Error),

    #[error("malformed mailbox buffer ({0} words)")]
    MalformedBuffer(usize),
}

pub type Result<T> = core::result::Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_addresses() {
        let err = PlatformError::InvalidRange {
            phys: 0xFE20_0000,
            len: 0,
        };
        assert_eq!(err.to_string(), "invalid mapping request 0xfe200000+0x0");
    }
}
