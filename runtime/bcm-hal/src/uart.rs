//! PL011 UART Driver
//!
//! BCM2711 has five PL011 instances in one 4 KiB window. UART1 is the
//! mini-UART, which is a different block and is not handled here.
//!
//! | Device | Offset  |
//! |--------|---------|
//! | UART0  | `0x000` |
//! | UART2  | `0x400` |
//! | UART3  | `0x600` |
//! | UART4  | `0x800` |
//! | UART5  | `0xA00` |
//!
//! # Usage
//!
//! ```no_run
//! use bcm_hal::{BcmUart, Soc, UartConfig, UartDevice};
//!
//! let soc = Soc::open(Default::default());
//! let uart: BcmUart = BcmUart::init(&soc, 0, UartConfig::default())?;
//! while !uart.try_send(b'!') {}
//! # Ok::<(), bcm_hal::HalError>(())
//! ```
//!
//! # References
//! - ARM PrimeCell UART (PL011) Technical Reference Manual
//! - BCM2711 ARM Peripherals, chapter 11

use core::fmt;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::dma::BcmDmaChannel;
use crate::hal::{Direction, DmaChannel, DmaTransfer, UartDevice};
use crate::regs::{Reg, RegisterView};
use crate::soc::Soc;
use crate::{HalError, Result};

/// Offset of each PL011 inside the cluster window (`None` for the mini-UART)
pub const DEVICE_OFFSETS: [Option<usize>; 6] = [Some(0x000), None, Some(0x400), Some(0x600), Some(0x800), Some(0xA00)];

/// PL011 register block
#[repr(C)]
pub struct UartRegs {
    pub dr: Reg<u32>,          // 0x00 data
    pub rsrecr: Reg<u32>,      // 0x04 receive status / error clear
    _reserved0: [Reg<u32>; 4], // 0x08
    pub fr: Reg<u32>,          // 0x18 flags
    _reserved1: Reg<u32>,      // 0x1C
    pub ilpr: Reg<u32>,        // 0x20 IrDA low-power counter (unused)
    pub ibrd: Reg<u32>,        // 0x24 integer baud divisor
    pub fbrd: Reg<u32>,        // 0x28 fractional baud divisor
    pub lcrh: Reg<u32>,        // 0x2C line control
    pub cr: Reg<u32>,          // 0x30 control
    pub ifls: Reg<u32>,        // 0x34 FIFO level select
    pub imsc: Reg<u32>,        // 0x38 interrupt mask
    pub ris: Reg<u32>,         // 0x3C raw interrupt status
    pub mis: Reg<u32>,         // 0x40 masked interrupt status
    pub icr: Reg<u32>,         // 0x44 interrupt clear
    pub dmacr: Reg<u32>,       // 0x48 DMA control
    _reserved2: [Reg<u32>; 13], // 0x4C
    pub itcr: Reg<u32>,        // 0x80 test control
    pub itip: Reg<u32>,        // 0x84
    pub itop: Reg<u32>,        // 0x88
    pub tdr: Reg<u32>,         // 0x8C test data
}

const_assert_eq!(core::mem::offset_of!(UartRegs, fr), 0x18);
const_assert_eq!(core::mem::offset_of!(UartRegs, dmacr), 0x48);
const_assert_eq!(core::mem::offset_of!(UartRegs, itcr), 0x80);
const_assert_eq!(core::mem::size_of::<UartRegs>(), 0x90);

bitflags! {
    /// FR register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UartFlags: u32 {
        const CTS = 1 << 0;
        const BUSY = 1 << 3;
        const RXFE = 1 << 4;
        const TXFF = 1 << 5;
        const RXFF = 1 << 6;
        const TXFE = 1 << 7;
    }
}

bitflags! {
    /// LCRH register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineControl: u32 {
        const BRK = 1 << 0;
        const PEN = 1 << 1;
        const EPS = 1 << 2;
        const STP2 = 1 << 3;
        const FEN = 1 << 4;
        const WLEN = 0b11 << 5;
        const SPS = 1 << 7;
    }
}

bitflags! {
    /// CR register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UartControl: u32 {
        const UARTEN = 1 << 0;
        const LBE = 1 << 7;
        const TXE = 1 << 8;
        const RXE = 1 << 9;
        const RTS = 1 << 11;
        const RTSEN = 1 << 14;
        const CTSEN = 1 << 15;
    }
}

bitflags! {
    /// DMACR register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaControl: u32 {
        const RXDMAE = 1 << 0;
        const TXDMAE = 1 << 1;
        const DMAONERR = 1 << 2;
    }
}

/// All interrupt clear bits
const ICR_ALL: u32 = 0x7FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Line settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    pub baud_rate: u32,
    /// Word length, clamped to 5..=8
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl UartConfig {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// LCRH value for these settings, FIFOs enabled
    pub fn line_control(&self) -> LineControl {
        let bits = u32::from(self.data_bits.clamp(5, 8) - 5);
        let mut lcrh = LineControl::FEN | LineControl::from_bits_retain(bits << 5);
        if self.stop_bits == StopBits::Two {
            lcrh |= LineControl::STP2;
        }
        match self.parity {
            Parity::None => {}
            Parity::Odd => lcrh |= LineControl::PEN,
            Parity::Even => lcrh |= LineControl::PEN | LineControl::EPS,
        }
        lcrh
    }
}

/// Baud rate divisor as programmed into IBRD/FBRD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaudDivisor {
    pub integer: u32,
    pub fraction: u32,
}

/// Divisor for `baud` from reference clock `clock_hz`
///
/// The divisor is `clock / (16 * baud)` in 16.6 fixed point, i.e.
/// `clock * 4 / baud` split into its upper bits and low 6 bits.
pub const fn baud_divisor(clock_hz: u32, baud: u32) -> BaudDivisor {
    let x64 = (clock_hz as u64 * 4 / baud as u64) as u32;
    BaudDivisor {
        integer: (x64 >> 6) & 0xFFFF,
        fraction: x64 & 0x3F,
    }
}

/// One PL011 instance, optionally with DMA channels attached
#[derive(Debug)]
pub struct BcmUart<D: DmaChannel = BcmDmaChannel> {
    index: usize,
    regs: RegisterView<UartRegs>,
    config: UartConfig,
    dr_bus_addr: u32,
    tx_dma: Option<D>,
    rx_dma: Option<D>,
}

impl<D: DmaChannel> BcmUart<D> {
    /// Bring up UART `index` with the given line settings
    ///
    /// # Errors
    /// - `InvalidUart` for the mini-UART (1) and indices past 5
    /// - `InvalidConfig` for a zero baud rate
    /// - any mapping failure
    pub fn init(soc: &Soc, index: usize, config: UartConfig) -> Result<Self> {
        let offset = DEVICE_OFFSETS
            .get(index)
            .copied()
            .flatten()
            .ok_or(HalError::InvalidUart(index))?;
        if config.baud_rate == 0 {
            return Err(HalError::InvalidConfig("baud rate must be non-zero"));
        }
        if baud_divisor(soc.config().uart_clock_hz, config.baud_rate).integer == 0 {
            return Err(HalError::InvalidConfig("baud rate above clock / 16"));
        }

        let regs: RegisterView<UartRegs> = soc.uart_cluster()?.project(offset)?;
        let dr_bus_addr = soc.config().peripheral_bus_address(regs.phys_addr());

        let uart = Self {
            index,
            regs,
            config,
            dr_bus_addr,
            tx_dma: None,
            rx_dma: None,
        };
        uart.configure(soc.config().uart_clock_hz);

        log::info!(
            "UART{} up: {} baud, {:?}, data register at bus {:#010x}",
            index,
            config.baud_rate,
            config.line_control(),
            dr_bus_addr
        );
        Ok(uart)
    }

    fn configure(&self, clock_hz: u32) {
        let regs = &*self.regs;
        regs.cr.write(0);

        let div = baud_divisor(clock_hz, self.config.baud_rate);
        regs.ibrd.write(div.integer);
        regs.fbrd.write(div.fraction);
        regs.lcrh.write(self.config.line_control().bits());

        regs.ifls.write(0);
        regs.imsc.write(0);
        regs.icr.write(ICR_ALL);
        regs.dmacr.write(0);

        regs.cr.write((UartControl::RXE | UartControl::TXE | UartControl::UARTEN).bits());
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &UartConfig {
        &self.config
    }

    pub fn regs(&self) -> &UartRegs {
        &self.regs
    }

    /// Bus address of the data register, for DMA control blocks
    pub fn data_register_bus_address(&self) -> u32 {
        self.dr_bus_addr
    }

    fn flags(&self) -> UartFlags {
        UartFlags::from_bits_retain(self.regs.fr.read())
    }

    /// Bind `channel` to one direction of this UART
    ///
    /// Returns the channel previously bound to that direction, if any.
    pub fn assign_dma(&mut self, direction: Direction, mut channel: D) -> Option<D> {
        channel.prepare(direction, self.dr_bus_addr);
        match direction {
            Direction::Tx => self.tx_dma.replace(channel),
            Direction::Rx => self.rx_dma.replace(channel),
        }
    }

    /// Take a bound channel back
    pub fn release_dma(&mut self, direction: Direction) -> Option<D> {
        let (slot, flag) = match direction {
            Direction::Tx => (&mut self.tx_dma, DmaControl::TXDMAE),
            Direction::Rx => (&mut self.rx_dma, DmaControl::RXDMAE),
        };
        let channel = slot.take();
        if channel.is_some() {
            self.regs.dmacr.modify(|r| r & !flag.bits());
        }
        channel
    }

    pub fn tx_dma(&self) -> Option<&D> {
        self.tx_dma.as_ref()
    }

    pub fn tx_dma_mut(&mut self) -> Option<&mut D> {
        self.tx_dma.as_mut()
    }

    pub fn rx_dma(&self) -> Option<&D> {
        self.rx_dma.as_ref()
    }

    pub fn rx_dma_mut(&mut self) -> Option<&mut D> {
        self.rx_dma.as_mut()
    }

    /// Start a memory-to-UART transfer on the bound TX channel
    ///
    /// # Errors
    /// `NoDmaChannel` if nothing was assigned, or the channel's error if it
    /// refuses the transfer. The UART's DMA request stays off in both cases.
    pub fn start_dma_send(&mut self, transfer: &DmaTransfer) -> Result<()> {
        let channel = self.tx_dma.as_mut().ok_or(HalError::NoDmaChannel(Direction::Tx))?;
        channel.prepare_transfer(transfer)?;
        self.regs.dmacr.modify(|r| r | DmaControl::TXDMAE.bits());
        channel.enable();
        Ok(())
    }

    /// Start a UART-to-memory transfer on the bound RX channel
    pub fn start_dma_recv(&mut self, transfer: &DmaTransfer) -> Result<()> {
        let channel = self.rx_dma.as_mut().ok_or(HalError::NoDmaChannel(Direction::Rx))?;
        channel.prepare_transfer(transfer)?;
        self.regs.dmacr.modify(|r| r | DmaControl::RXDMAE.bits());
        channel.enable();
        Ok(())
    }
}

impl<D: DmaChannel> UartDevice for BcmUart<D> {
    fn try_send(&self, byte: u8) -> bool {
        if self.flags().contains(UartFlags::TXFF) {
            return false;
        }
        self.regs.dr.write(u32::from(byte));
        true
    }

    fn try_recv(&self) -> Option<u8> {
        if self.flags().contains(UartFlags::RXFE) {
            return None;
        }
        Some((self.regs.dr.read() & 0xFF) as u8)
    }

    fn send_finished(&self) -> bool {
        !self.flags().contains(UartFlags::BUSY)
    }
}

/// Blocking text output, spinning while the FIFO is full
impl<D: DmaChannel> fmt::Write for BcmUart<D> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                while !self.try_send(b'\r') {
                    core::hint::spin_loop();
                }
            }
            while !self.try_send(byte) {
                core::hint::spin_loop();
            }
        }
        Ok(())
    }
}
