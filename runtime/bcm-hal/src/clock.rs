//! System timer - 64-bit free-running counter
//!
//! The BCM2711 system timer counts at 1 MHz and exposes its counter as two
//! 32-bit registers (`CLO`, `CHI`) that cannot be read as a pair. A carry
//! from `CLO` into `CHI` between the two reads would produce a value that
//! is off by 2^32, so reads go high/low/high and retry until both high
//! reads agree.

use static_assertions::const_assert_eq;

use crate::hal::Clock;
use crate::regs::{Reg, RegisterView};
use crate::soc::Soc;
use crate::Result;

/// System timer registers (BCM2711 ARM Peripherals, chapter 10)
#[repr(C)]
pub struct SystemTimerRegs {
    pub cs: Reg<u32>,  // 0x00 control/status (match flags)
    pub clo: Reg<u32>, // 0x04 counter, low word
    pub chi: Reg<u32>, // 0x08 counter, high word
    pub c0: Reg<u32>,  // 0x0C compare 0 (used by the GPU)
    pub c1: Reg<u32>,  // 0x10 compare 1
    pub c2: Reg<u32>,  // 0x14 compare 2 (used by the GPU)
    pub c3: Reg<u32>,  // 0x18 compare 3
}

const_assert_eq!(core::mem::size_of::<SystemTimerRegs>(), 0x1C);
const_assert_eq!(core::mem::offset_of!(SystemTimerRegs, chi), 0x08);

/// Combine a split 64-bit counter without tearing
///
/// Reads high, low, high and retries while the two high reads differ.
pub(crate) fn read_split(mut hi: impl FnMut() -> u32, mut lo: impl FnMut() -> u32) -> u64 {
    loop {
        let h1 = hi();
        let l = lo();
        let h2 = hi();
        if h1 == h2 {
            return (u64::from(h1) << 32) | u64::from(l);
        }
    }
}

/// Clock backed by the system timer
#[derive(Debug, Clone)]
pub struct SystemTimer {
    regs: RegisterView<SystemTimerRegs>,
    hz: u64,
}

impl SystemTimer {
    /// Bind to the SoC's system timer, mapping it on first use
    pub fn new(soc: &Soc) -> Result<Self> {
        Ok(Self {
            regs: soc.systimer()?,
            hz: soc.config().systimer_hz,
        })
    }

    pub fn regs(&self) -> &SystemTimerRegs {
        &self.regs
    }
}

impl Clock for SystemTimer {
    fn now(&self) -> u64 {
        read_split(|| self.regs.chi.read(), || self.regs.clo.read())
    }

    fn ticks_per_second(&self) -> u64 {
        self.hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocConfig;
    use bcm_platform::{MockMailbox, MockMapper};
    use std::cell::Cell;
    use std::sync::Arc;

    fn timer() -> (Arc<MockMapper>, SystemTimer) {
        let mapper = Arc::new(MockMapper::new());
        let soc = Soc::new(SocConfig::BCM2711, mapper.clone(), Arc::new(MockMailbox::new()));
        let timer = SystemTimer::new(&soc).unwrap();
        (mapper, timer)
    }

    #[test]
    fn test_now_combines_both_words() {
        let (mapper, timer) = timer();
        mapper.write_u32(0xFE00_3004, 0x8000_0001).unwrap();
        mapper.write_u32(0xFE00_3008, 0x0000_0002).unwrap();
        assert_eq!(timer.now(), 0x0000_0002_8000_0001);
        assert_eq!(timer.ticks_per_second(), 1_000_000);
    }

    #[test]
    fn test_monotonic_across_low_word_wrap() {
        let (mapper, timer) = timer();
        mapper.write_u32(0xFE00_3004, 0xFFFF_FFFF).unwrap();
        mapper.write_u32(0xFE00_3008, 4).unwrap();
        let before = timer.now();

        // hardware carries into the high word
        mapper.write_u32(0xFE00_3004, 0).unwrap();
        mapper.write_u32(0xFE00_3008, 5).unwrap();
        let after = timer.now();

        assert!(after > before);
        assert_eq!(after - before, 1);
    }

    #[test]
    fn test_torn_read_is_retried() {
        // the low word wraps between the first high read and the low read
        let hi = Cell::new(0);
        let his = [7u32, 8, 8, 8];
        let los = [0x0000_0003u32, 0x0000_0005];
        let lo = Cell::new(0);

        let value = read_split(
            || {
                let v = his[hi.get()];
                hi.set(hi.get() + 1);
                v
            },
            || {
                let v = los[lo.get()];
                lo.set(lo.get() + 1);
                v
            },
        );

        assert_eq!(value, (8u64 << 32) | 5);
        assert_eq!(hi.get(), 4);
        assert_eq!(lo.get(), 2);
    }

    #[test]
    fn test_clock_is_shared_between_bindings() {
        let mapper = Arc::new(MockMapper::new());
        let soc = Soc::new(SocConfig::BCM2711, mapper.clone(), Arc::new(MockMailbox::new()));
        let a = SystemTimer::new(&soc).unwrap();
        let b = SystemTimer::new(&soc).unwrap();

        mapper.write_u32(0xFE00_3004, 42).unwrap();
        assert_eq!(a.now(), b.now());
        assert_eq!(mapper.map_count(), 1);
    }
}
