//! GPIO - BCM2711 pin function, pull and level control
//!
//! The GPIO block packs pins densely into banks of 32-bit registers:
//!
//! | Bank            | Pins per register | Bits per pin |
//! |-----------------|-------------------|--------------|
//! | GPFSEL          | 10                | 3            |
//! | GPSET/CLR/LEV   | 32                | 1            |
//! | PUP_PDN_CNTRL   | 16                | 2            |
//!
//! GPSET and GPCLR are write-one-to-act, so driving a pin never disturbs its
//! neighbours. GPFSEL and the pull registers are read-modify-write.

use core::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::hal::{GpioPin, PinConfig, PinController, PinDirection, PinValue};
use crate::regs::{Reg, RegisterView};
use crate::soc::Soc;
use crate::{HalError, Result};

/// GPIO registers (BCM2711 ARM Peripherals, chapter 5)
#[repr(C)]
pub struct GpioRegs {
    pub gpfsel: [Reg<u32>; 6],        // 0x00 function select
    _reserved0: Reg<u32>,             // 0x18
    pub gpset: [Reg<u32>; 2],         // 0x1C output set
    _reserved1: Reg<u32>,             // 0x24
    pub gpclr: [Reg<u32>; 2],         // 0x28 output clear
    _reserved2: Reg<u32>,             // 0x30
    pub gplev: [Reg<u32>; 2],         // 0x34 pin level
    _reserved3: Reg<u32>,             // 0x3C
    pub gpeds: [Reg<u32>; 2],         // 0x40 event detect status
    _reserved4: Reg<u32>,             // 0x48
    pub gpren: [Reg<u32>; 2],         // 0x4C rising edge detect
    _reserved5: Reg<u32>,             // 0x54
    pub gpfen: [Reg<u32>; 2],         // 0x58 falling edge detect
    _reserved6: Reg<u32>,             // 0x60
    pub gphen: [Reg<u32>; 2],         // 0x64 high detect
    _reserved7: Reg<u32>,             // 0x6C
    pub gplen: [Reg<u32>; 2],         // 0x70 low detect
    _reserved8: Reg<u32>,             // 0x78
    pub gparen: [Reg<u32>; 2],        // 0x7C async rising edge
    _reserved9: Reg<u32>,             // 0x84
    pub gpafen: [Reg<u32>; 2],        // 0x88 async falling edge
    _reserved10: [Reg<u32>; 21],      // 0x90
    pub pup_pdn_cntrl: [Reg<u32>; 4], // 0xE4 pull-up / pull-down
}

const_assert_eq!(core::mem::offset_of!(GpioRegs, gpset), 0x1C);
const_assert_eq!(core::mem::offset_of!(GpioRegs, gplev), 0x34);
const_assert_eq!(core::mem::offset_of!(GpioRegs, gpafen), 0x88);
const_assert_eq!(core::mem::offset_of!(GpioRegs, pup_pdn_cntrl), 0xE4);
const_assert_eq!(core::mem::size_of::<GpioRegs>(), 0xF4);

/// GPFSEL function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Function {
    Input = 0b000,
    Output = 0b001,
    Alt0 = 0b100,
    Alt1 = 0b101,
    Alt2 = 0b110,
    Alt3 = 0b111,
    Alt4 = 0b011,
    Alt5 = 0b010,
}

impl Function {
    /// Alternate function by number (0..=5)
    pub fn alt(n: u32) -> Option<Function> {
        match n {
            0 => Some(Function::Alt0),
            1 => Some(Function::Alt1),
            2 => Some(Function::Alt2),
            3 => Some(Function::Alt3),
            4 => Some(Function::Alt4),
            5 => Some(Function::Alt5),
            _ => None,
        }
    }

    fn from_bits(bits: u32) -> Function {
        match bits & 0b111 {
            0b000 => Function::Input,
            0b001 => Function::Output,
            0b100 => Function::Alt0,
            0b101 => Function::Alt1,
            0b110 => Function::Alt2,
            0b111 => Function::Alt3,
            0b011 => Function::Alt4,
            _ => Function::Alt5,
        }
    }
}

/// PUP_PDN_CNTRL codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Pull {
    None = 0b00,
    Up = 0b01,
    Down = 0b10,
}

/// Register coordinates of a pin: (register index, bit shift)
#[inline]
const fn fsel_pos(pin: u32) -> (usize, u32) {
    ((pin / 10) as usize, (pin % 10) * 3)
}

#[inline]
const fn bank_pos(pin: u32) -> (usize, u32) {
    ((pin >> 5) as usize, 1 << (pin & 31))
}

#[inline]
const fn pull_pos(pin: u32) -> (usize, u32) {
    ((pin >> 4) as usize, (pin & 15) * 2)
}

/// The GPIO block of one SoC
#[derive(Debug, Clone)]
pub struct BcmGpio {
    regs: RegisterView<GpioRegs>,
    max_pin: u32,
}

impl BcmGpio {
    /// Highest supported port number
    pub const MAX_PORT: u32 = 0;

    pub fn new(soc: &Soc) -> Result<Self> {
        Ok(Self {
            regs: soc.gpio()?,
            max_pin: soc.config().gpio_max_pin,
        })
    }

    pub fn regs(&self) -> &GpioRegs {
        &self.regs
    }

    fn check(&self, port: u32, pin: u32) -> Result<()> {
        if port > Self::MAX_PORT || pin > self.max_pin {
            return Err(HalError::InvalidPin { port, pin });
        }
        Ok(())
    }

    /// Current function of a pin
    pub fn function(&self, port: u32, pin: u32) -> Result<Function> {
        self.check(port, pin)?;
        let (idx, shift) = fsel_pos(pin);
        Ok(Function::from_bits(self.regs.gpfsel[idx].read_field(shift, 3)))
    }

    pub fn set_function(&self, port: u32, pin: u32, function: Function) -> Result<()> {
        self.check(port, pin)?;
        let (idx, shift) = fsel_pos(pin);
        self.regs.gpfsel[idx].write_field(shift, 3, function as u32);
        Ok(())
    }

    pub fn set_pull(&self, port: u32, pin: u32, pull: Pull) -> Result<()> {
        self.check(port, pin)?;
        let (idx, shift) = pull_pos(pin);
        self.regs.pup_pdn_cntrl[idx].write_field(shift, 2, pull as u32);
        Ok(())
    }

    /// Bind a pin object, precomputing its register pointers
    pub fn pin(&self, port: u32, pin: u32, inverted: bool) -> Result<BcmPin> {
        BcmPin::assign(self, port, pin, inverted)
    }
}

impl PinController for BcmGpio {
    fn pin_setup(&self, port: u32, pin: u32, flags: PinConfig) -> Result<()> {
        self.check(port, pin)?;

        let function = match flags.alt_function() {
            Some(n) => Function::alt(n).ok_or(HalError::InvalidPinConfig(flags.bits()))?,
            None if flags.contains(PinConfig::OUTPUT) => Function::Output,
            None => Function::Input,
        };

        let pull = if flags.contains(PinConfig::PULLUP) {
            Pull::Up
        } else if flags.contains(PinConfig::PULLDOWN) {
            Pull::Down
        } else {
            Pull::None
        };

        // level before function, so an output never glitches
        let (bank, mask) = bank_pos(pin);
        if flags.contains(PinConfig::GPIO_INIT_1) {
            self.regs.gpset[bank].write(mask);
        } else {
            self.regs.gpclr[bank].write(mask);
        }

        self.set_function(port, pin, function)?;
        self.set_pull(port, pin, pull)
    }

    fn gpio_set(&self, port: u32, pin: u32, value: PinValue) -> Result<()> {
        self.check(port, pin)?;
        let (bank, mask) = bank_pos(pin);
        match value {
            PinValue::High => self.regs.gpset[bank].write(mask),
            PinValue::Low => self.regs.gpclr[bank].write(mask),
            PinValue::Toggle => {
                if self.regs.gpset[bank].read() & mask != 0 {
                    self.regs.gpclr[bank].write(mask);
                } else {
                    self.regs.gpset[bank].write(mask);
                }
            }
        }
        Ok(())
    }
}

/// A bound GPIO pin
///
/// For inverted pins the set and clear registers are swapped at bind time,
/// so `set_on` on an inverted pin writes GPCLR.
#[derive(Debug)]
pub struct BcmPin {
    gpio: BcmGpio,
    port: u32,
    pin: u32,
    inverted: bool,
    mask: u32,
    on_reg: NonNull<Reg<u32>>,
    off_reg: NonNull<Reg<u32>>,
    level_reg: NonNull<Reg<u32>>,
    fsel_reg: NonNull<Reg<u32>>,
    fsel_shift: u32,
}

impl BcmPin {
    pub fn assign(gpio: &BcmGpio, port: u32, pin: u32, inverted: bool) -> Result<Self> {
        gpio.check(port, pin)?;

        let gpio = gpio.clone();
        let regs = &gpio.regs;
        let (bank, mask) = bank_pos(pin);
        let (fsel_idx, fsel_shift) = fsel_pos(pin);

        let (on, off) = if inverted {
            (&regs.gpclr[bank], &regs.gpset[bank])
        } else {
            (&regs.gpset[bank], &regs.gpclr[bank])
        };
        let on_reg = NonNull::from(on);
        let off_reg = NonNull::from(off);
        let level_reg = NonNull::from(&regs.gplev[bank]);
        let fsel_reg = NonNull::from(&regs.gpfsel[fsel_idx]);

        Ok(Self {
            gpio,
            port,
            pin,
            inverted,
            mask,
            on_reg,
            off_reg,
            level_reg,
            fsel_reg,
            fsel_shift,
        })
    }

    #[inline]
    fn reg(&self, reg: NonNull<Reg<u32>>) -> &Reg<u32> {
        // SAFETY: points into the block `self.gpio` keeps mapped
        unsafe { reg.as_ref() }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn number(&self) -> u32 {
        self.pin
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// Configure the pin through its controller
    pub fn setup(&self, flags: PinConfig) -> Result<()> {
        self.gpio.pin_setup(self.port, self.pin, flags)
    }

    fn raw_level(&self) -> bool {
        self.reg(self.level_reg).read() & self.mask != 0
    }
}

impl GpioPin for BcmPin {
    #[inline]
    fn set_on(&self) {
        self.reg(self.on_reg).write(self.mask);
    }

    #[inline]
    fn set_off(&self) {
        self.reg(self.off_reg).write(self.mask);
    }

    fn value(&self) -> bool {
        self.raw_level() != self.inverted
    }

    fn output_value(&self) -> bool {
        self.value()
    }

    fn switch_direction(&self, direction: PinDirection) {
        let function = match direction {
            PinDirection::Input => Function::Input,
            PinDirection::Output => Function::Output,
        };
        self.reg(self.fsel_reg).write_field(self.fsel_shift, 3, function as u32);
    }
}
