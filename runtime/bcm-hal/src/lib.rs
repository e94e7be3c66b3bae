//! # BCM2711 Peripheral Drivers
//!
//! User-space drivers for the Raspberry Pi 4 family: GPIO, PL011 UARTs, the
//! full DMA channels and the system timer, all driven through registers
//! mapped from `/dev/mem`.
//!
//! ## Purpose
//! Move data between memory and peripherals without a kernel driver.
//! DMA control blocks and buffers live in uncached memory allocated by the
//! VideoCore firmware, so the engine and the CPU agree on their contents
//! without cache maintenance.
//!
//! ## Architecture
//! ```text
//!  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!  │ BcmGpio  │  │ BcmUart  │──│  BcmDma  │  │  System  │
//!  │  BcmPin  │  │          │  │ Channel  │  │  Timer   │
//!  └────┬─────┘  └────┬─────┘  └──┬────┬──┘  └────┬─────┘
//!       │             │           │    │          │
//!       └─────────────┴─────┬─────┘    │          │
//!                      ┌────▼────┐ ┌───▼────────┐ │
//!                      │   Soc   │─│ Uncached   │ │
//!                      │ context │ │ Pool       │ │
//!                      └────┬────┘ └───┬────────┘ │
//!                           │          │ vcmem    │
//!                 ┌─────────▼──────────▼──────────▼┐
//!                 │  bcm-platform: PhysMapper /    │
//!                 │  Mailbox (runtime or mock)     │
//!                 └────────────────────────────────┘
//! ```
//!
//! Each peripheral kind has a trait in [`hal`]; the `Bcm*` types implement
//! them for BCM2711.
//!
//! ## Testing Strategy
//! With the `mock` feature, physical memory and the firmware are simulated
//! by `bcm-platform`, and tests act as the hardware by reading and writing
//! register addresses directly.

use thiserror::Error;

pub mod clock;
pub mod config;
pub mod dma;
pub mod gpio;
pub mod hal;
pub mod regs;
pub mod soc;
pub mod uart;
pub mod uncached;
pub mod vcmem;

pub use bcm_platform::PlatformError;
pub use clock::SystemTimer;
pub use config::SocConfig;
pub use dma::{BcmDmaChannel, ChannelState};
pub use gpio::{BcmGpio, BcmPin};
pub use hal::{
    Clock, Direction, DmaChannel, DmaTransfer, GpioPin, PinConfig, PinController, PinDirection,
    PinValue, TransferFlags, UartDevice,
};
pub use soc::Soc;
pub use uart::{BcmUart, Parity, StopBits, UartConfig};
pub use uncached::{UncachedBuffer, UncachedPool};

/// Driver errors
#[derive(Debug, Error)]
pub enum HalError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("register block of {size:#x} bytes at offset {offset:#x} does not fit a {len:#x}-byte mapping")]
    WindowOutOfRange { offset: usize, size: usize, len: usize },

    #[error("mailbox tag {tag:#x} rejected (response code {code:#010x})")]
    MailboxRejected { tag: u32, code: u32 },

    #[error("mailbox tag {tag:#x} returned status {status}")]
    VcStatus { tag: u32, status: u32 },

    #[error("VideoCore could not allocate {size} bytes")]
    VcAllocFailed { size: u32 },

    #[error("VideoCore could not lock handle {handle:#x}")]
    VcLockFailed { handle: u32 },

    #[error("Out of uncached memory (requested: {requested} bytes, available: {available})")]
    OutOfUncachedMemory { requested: usize, available: usize },

    #[error("address {addr:#x} is outside the uncached pool")]
    InvalidDmaAddress { addr: usize },

    #[error("DMA channel {0} is not supported")]
    InvalidDmaChannel(usize),

    #[error("invalid DMA transfer: {0}")]
    InvalidTransfer(&'static str),

    #[error("no DMA channel assigned for {0:?}")]
    NoDmaChannel(Direction),

    #[error("GPIO {port}/{pin} is out of range")]
    InvalidPin { port: u32, pin: u32 },

    #[error("unsupported pin configuration {0:#x}")]
    InvalidPinConfig(u32),

    #[error("UART{0} is not supported")]
    InvalidUart(usize),

    #[error("invalid UART configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = core::result::Result<T, HalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_errors_convert() {
        let err: HalError = PlatformError::InvalidRange { phys: 0x1000, len: 0 }.into();
        assert!(matches!(err, HalError::Platform(_)));
        assert_eq!(err.to_string(), "invalid mapping request 0x1000+0x0");
    }

    #[test]
    fn test_error_display() {
        let err = HalError::OutOfUncachedMemory {
            requested: 64,
            available: 32,
        };
        assert_eq!(
            err.to_string(),
            "Out of uncached memory (requested: 64 bytes, available: 32)"
        );
        assert_eq!(
            HalError::NoDmaChannel(Direction::Tx).to_string(),
            "no DMA channel assigned for Tx"
        );
    }
}
