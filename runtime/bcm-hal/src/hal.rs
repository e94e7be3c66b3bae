//! Peripheral capability interfaces
//!
//! One trait per peripheral kind, plus the platform-neutral value types that
//! travel through them: pin configuration flags and the DMA transfer
//! descriptor. The BCM2711 drivers in this crate implement these traits;
//! application code should depend on the traits where it can.

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// Pin configuration flags
    ///
    /// Bits 8..10 select an alternate function; use [`PinConfig::af`] to
    /// build them. No alternate function and no `OUTPUT` means input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PinConfig: u32 {
        const OUTPUT = 1 << 0;
        const PULLUP = 1 << 1;
        const PULLDOWN = 1 << 2;
        /// Drive the pin high before switching it to output
        const GPIO_INIT_1 = 1 << 3;
        const AF_MASK = 0x7 << 8;
    }
}

impl PinConfig {
    pub const INPUT: PinConfig = PinConfig::empty();
    const AF_SHIFT: u32 = 8;

    /// Alternate function `n` (0..=5)
    pub const fn af(n: u32) -> PinConfig {
        PinConfig::from_bits_retain(((n + 1) & 0x7) << Self::AF_SHIFT)
    }

    /// The selected alternate function, if any
    pub const fn alt_function(&self) -> Option<u32> {
        match (self.bits() >> Self::AF_SHIFT) & 0x7 {
            0 => None,
            f => Some(f - 1),
        }
    }
}

/// Value written through a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinValue {
    Low,
    High,
    Toggle,
}

impl PinValue {
    /// Decode the raw 0 / 1 / toggle-bit encoding
    pub const fn from_raw(value: u32) -> PinValue {
        if value == 1 {
            PinValue::High
        } else if value & 2 != 0 {
            PinValue::Toggle
        } else {
            PinValue::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

/// Which way a DMA channel moves data relative to its peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Memory to peripheral
    Tx,
    /// Peripheral to memory
    Rx,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u32 {
        /// Keep reading the same source element
        const NO_SRC_INC = 1 << 0;
        /// Keep writing the same destination element
        const NO_DST_INC = 1 << 1;
        /// Restart from the first element after the last one
        const CIRCULAR = 1 << 2;
    }
}

/// One DMA transfer
///
/// Addresses are CPU addresses; the memory side must point into the uncached
/// pool. The peripheral side is fixed by [`DmaChannel::prepare`], so only one
/// of `src`/`dst` is used per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTransfer {
    pub src: usize,
    pub dst: usize,
    /// Bytes moved per DREQ-paced element
    pub bytewidth: u32,
    /// Number of elements
    pub count: u32,
    pub flags: TransferFlags,
}

impl DmaTransfer {
    /// Memory to peripheral, `count` elements of `bytewidth` bytes from `src`
    pub fn tx(src: *const u8, bytewidth: u32, count: u32) -> Self {
        Self {
            src: src as usize,
            dst: 0,
            bytewidth,
            count,
            flags: TransferFlags::NO_DST_INC,
        }
    }

    /// Peripheral to memory, `count` elements of `bytewidth` bytes into `dst`
    pub fn rx(dst: *mut u8, bytewidth: u32, count: u32) -> Self {
        Self {
            src: 0,
            dst: dst as usize,
            bytewidth,
            count,
            flags: TransferFlags::NO_SRC_INC,
        }
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn circular(self) -> Self {
        self.with_flags(TransferFlags::CIRCULAR)
    }

    /// Total bytes moved by one pass
    pub fn byte_len(&self) -> u32 {
        self.bytewidth * self.count
    }
}

/// Monotonic tick source with busy-wait delays
pub trait Clock {
    /// Current tick count
    fn now(&self) -> u64;

    /// Ticks per second
    fn ticks_per_second(&self) -> u64;

    /// Spin until at least `ticks` ticks have elapsed
    fn delay(&self, ticks: u64) {
        let start = self.now();
        while self.now().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }

    fn delay_us(&self, us: u64) {
        self.delay(us.saturating_mul(self.ticks_per_second()) / 1_000_000);
    }

    fn delay_ms(&self, ms: u64) {
        self.delay(ms.saturating_mul(self.ticks_per_second()) / 1_000);
    }
}

/// Pin function, pull and level control for a GPIO block
pub trait PinController {
    /// Configure function, pull resistor and initial level of one pin
    fn pin_setup(&self, port: u32, pin: u32, flags: PinConfig) -> Result<()>;

    /// Drive a pin low, high or to the opposite of its current output
    fn gpio_set(&self, port: u32, pin: u32, value: PinValue) -> Result<()>;
}

/// A single bound GPIO pin
///
/// `on`/`off` are logical levels; an inverted pin drives the opposite
/// electrical level.
pub trait GpioPin {
    fn set_on(&self);

    fn set_off(&self);

    fn set_to(&self, on: bool) {
        if on {
            self.set_on();
        } else {
            self.set_off();
        }
    }

    /// Logical level read back from the pin
    fn value(&self) -> bool;

    /// Logical level the pin is currently driven to
    fn output_value(&self) -> bool;

    fn toggle(&self) {
        self.set_to(!self.value());
    }

    fn switch_direction(&self, direction: PinDirection);
}

/// One hardware DMA channel with a single in-flight transfer
pub trait DmaChannel {
    /// Fix direction and the peripheral-side bus address
    fn prepare(&mut self, direction: Direction, peripheral_addr: u32);

    /// Fill the control block for `transfer` and load it into the channel
    fn prepare_transfer(&mut self, transfer: &DmaTransfer) -> Result<()>;

    fn enable(&mut self);

    /// Stop re-arming; an in-flight burst still completes
    fn disable(&mut self);

    fn is_active(&self) -> bool;

    /// Bytes the hardware still has to move
    fn remaining(&self) -> u32;

    fn start_transfer(&mut self, transfer: &DmaTransfer) -> Result<()> {
        self.prepare_transfer(transfer)?;
        self.enable();
        Ok(())
    }
}

/// Polled serial port
pub trait UartDevice {
    /// Queue one byte; `false` when the transmit FIFO is full
    fn try_send(&self, byte: u8) -> bool;

    /// Take one byte; `None` when the receive FIFO is empty
    fn try_recv(&self) -> Option<u8>;

    /// All queued bytes have left the shift register
    fn send_finished(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Clock that advances one tick per read
    struct SteppingClock {
        ticks: Cell<u64>,
        reads: Cell<u32>,
    }

    impl SteppingClock {
        fn starting_at(ticks: u64) -> Self {
            Self {
                ticks: Cell::new(ticks),
                reads: Cell::new(0),
            }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> u64 {
            let t = self.ticks.get();
            self.ticks.set(t.wrapping_add(1));
            self.reads.set(self.reads.get() + 1);
            t
        }

        fn ticks_per_second(&self) -> u64 {
            1_000_000
        }
    }

    /// 1 GHz clock that jumps 2^60 ticks per read
    struct LeapingClock(Cell<u64>);

    impl Clock for LeapingClock {
        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t.wrapping_add(1 << 60));
            t
        }

        fn ticks_per_second(&self) -> u64 {
            1_000_000_000
        }
    }

    #[test]
    fn test_long_delays_saturate() {
        let clock = LeapingClock(Cell::new(0));
        clock.delay_us(u64::MAX / 1_000);
        clock.delay_ms(u64::MAX);
        // the start read plus one check each
        assert_eq!(clock.0.get(), 4 << 60);
    }

    #[test]
    fn test_zero_delay_returns_immediately() {
        let clock = SteppingClock::starting_at(100);
        clock.delay(0);
        // the start read plus one check
        assert_eq!(clock.reads.get(), 2);
    }

    #[test]
    fn test_delay_waits_at_least_requested_ticks() {
        let clock = SteppingClock::starting_at(500);
        clock.delay(25);
        assert!(clock.ticks.get() - 500 >= 25);
    }

    #[test]
    fn test_delay_survives_counter_wrap() {
        let clock = SteppingClock::starting_at(u64::MAX - 3);
        clock.delay(10);
        assert!(clock.ticks.get().wrapping_sub(u64::MAX - 3) >= 10);
    }

    #[test]
    fn test_delay_us_and_ms_scale_by_rate() {
        let clock = SteppingClock::starting_at(0);
        clock.delay_us(7);
        assert!(clock.ticks.get() >= 7);

        let clock = SteppingClock::starting_at(0);
        clock.delay_ms(2);
        assert!(clock.ticks.get() >= 2_000);
    }

    #[test]
    fn test_alternate_function_encoding() {
        assert_eq!(PinConfig::INPUT.alt_function(), None);
        assert_eq!(PinConfig::OUTPUT.alt_function(), None);
        for n in 0..=5 {
            assert_eq!((PinConfig::af(n) | PinConfig::PULLUP).alt_function(), Some(n));
        }
    }

    #[test]
    fn test_raw_pin_values() {
        assert_eq!(PinValue::from_raw(0), PinValue::Low);
        assert_eq!(PinValue::from_raw(1), PinValue::High);
        assert_eq!(PinValue::from_raw(2), PinValue::Toggle);
        assert_eq!(PinValue::from_raw(3), PinValue::Toggle);
    }

    #[test]
    fn test_transfer_builders() {
        let buf = [0u8; 64];
        let tx = DmaTransfer::tx(buf.as_ptr(), 1, 64);
        assert_eq!(tx.src, buf.as_ptr() as usize);
        assert!(tx.flags.contains(TransferFlags::NO_DST_INC));
        assert_eq!(tx.byte_len(), 64);

        let rx = DmaTransfer::rx(core::ptr::null_mut(), 4, 8).circular();
        assert!(rx.flags.contains(TransferFlags::NO_SRC_INC | TransferFlags::CIRCULAR));
    }
}
