//! DMA Controller - BCM2711 full DMA channels 0..=6
//!
//! Each channel walks a linked list of 32-byte control blocks that live in
//! bus-addressable memory. A channel owns exactly one control block, taken
//! from the uncached pool at init and rewritten in place for every transfer.
//!
//! # Transfer shape
//!
//! Transfers use 2D mode: `bytewidth` bytes per row (one DREQ-paced element),
//! `count` rows. The memory side advances between rows through the stride
//! register, so it increments even though `SRC_INC`/`DEST_INC` stay clear.
//! The peripheral side never moves.
//!
//! # References
//! - BCM2711 ARM Peripherals, chapter 4 (DMA Controller)

use std::sync::Arc;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::hal::{Clock, Direction, DmaChannel, DmaTransfer, TransferFlags};
use crate::regs::{Reg, RegisterView};
use crate::soc::Soc;
use crate::uncached::{UncachedBuffer, UncachedPool};
use crate::{HalError, Result};

/// Per-channel registers, repeated every 0x100 bytes
#[repr(C)]
pub struct DmaChannelRegs {
    pub cs: Reg<u32>,        // 0x00 control and status
    pub conblk_ad: Reg<u32>, // 0x04 control block address
    pub ti: Reg<u32>,        // 0x08 transfer information (loaded from CB)
    pub source_ad: Reg<u32>, // 0x0C
    pub dest_ad: Reg<u32>,   // 0x10
    pub txfr_len: Reg<u32>,  // 0x14 remaining length
    pub stride: Reg<u32>,    // 0x18 2D stride
    pub nextconbk: Reg<u32>, // 0x1C next control block
    pub debug: Reg<u32>,     // 0x20
}

const_assert_eq!(core::mem::size_of::<DmaChannelRegs>(), 0x24);
const_assert_eq!(core::mem::offset_of!(DmaChannelRegs, txfr_len), 0x14);

/// Control block, as read by the DMA engine
#[repr(C, align(32))]
pub struct ControlBlock {
    pub ti: Reg<u32>,
    pub source_ad: Reg<u32>,
    pub dest_ad: Reg<u32>,
    pub txfr_len: Reg<u32>,
    pub stride: Reg<u32>,
    pub nextconbk: Reg<u32>,
    _reserved: [Reg<u32>; 2],
}

const_assert_eq!(core::mem::size_of::<ControlBlock>(), 32);
const_assert_eq!(core::mem::align_of::<ControlBlock>(), 32);

bitflags! {
    /// CS register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaCs: u32 {
        const ACTIVE = 1 << 0;
        const END = 1 << 1;
        const INT = 1 << 2;
        const DREQ = 1 << 3;
        const PAUSED = 1 << 4;
        const DREQ_STOPS_DMA = 1 << 5;
        const WAITING_FOR_OUTSTANDING_WRITES = 1 << 6;
        const ERROR = 1 << 8;
        const PRIORITY = 0xF << 16;
        const PANIC_PRIORITY = 0xF << 20;
        const WAIT_FOR_OUTSTANDING_WRITES = 1 << 28;
        /// Keep running while the debug pause signal is asserted
        const DISDEBUG = 1 << 29;
        const ABORT = 1 << 30;
        const RESET = 1 << 31;
    }
}

impl DmaCs {
    pub const fn priority(level: u32) -> DmaCs {
        DmaCs::from_bits_retain((level & 0xF) << 16)
    }

    pub const fn panic_priority(level: u32) -> DmaCs {
        DmaCs::from_bits_retain((level & 0xF) << 20)
    }
}

bitflags! {
    /// TI field of control blocks
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaTi: u32 {
        const INTEN = 1 << 0;
        const TDMODE = 1 << 1;
        const WAIT_RESP = 1 << 3;
        const DEST_INC = 1 << 4;
        const DEST_WIDTH = 1 << 5;
        const DEST_DREQ = 1 << 6;
        const DEST_IGNORE = 1 << 7;
        const SRC_INC = 1 << 8;
        const SRC_WIDTH = 1 << 9;
        const SRC_DREQ = 1 << 10;
        const SRC_IGNORE = 1 << 11;
        const PERMAP = 0x1F << 16;
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

impl DmaTi {
    /// Peripheral DREQ line pacing the transfer
    pub const fn permap(dreq: u32) -> DmaTi {
        DmaTi::from_bits_retain((dreq & 0x1F) << 16)
    }
}

/// Priority used by [`BcmDmaChannel::init`]
pub const DEFAULT_PRIORITY: u32 = 8;
const PANIC_PRIORITY: u32 = 13;

/// Largest row count a 2D transfer can express (YLENGTH is 14 bits)
pub const MAX_COUNT: u32 = 0x4000;

/// TXFR_LEN for `count` rows of `bytewidth` bytes
pub const fn encode_txfr_len(bytewidth: u32, count: u32) -> u32 {
    ((count - 1) << 16) | (bytewidth & 0xFFFF)
}

/// Bytes left according to a live TXFR_LEN value
///
/// Counts the row in progress as a full row, so the result is an upper
/// bound while a transfer runs. It is exact before start and zero once the
/// hardware has drained the register.
pub const fn decode_remaining(txfr_len: u32) -> u32 {
    let width = txfr_len & 0xFFFF;
    let count = txfr_len >> 16;
    width * count + width
}

/// Where a channel is in its transfer cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Reset, or disabled with nothing armed
    Ready,
    /// Control block loaded, not yet enabled
    Armed,
    /// Hardware reports the channel active
    Running,
    /// Enabled transfer that the hardware has finished
    Complete,
}

/// One of the BCM2711 full DMA channels
#[derive(Debug)]
pub struct BcmDmaChannel {
    index: usize,
    dreq: u32,
    regs: RegisterView<DmaChannelRegs>,
    pool: Arc<UncachedPool>,
    cb: UncachedBuffer,
    cs_base: DmaCs,
    direction: Direction,
    peripheral_addr: u32,
    armed: bool,
    started: bool,
}

impl BcmDmaChannel {
    /// Reset channel `index` and bind it to peripheral request line `dreq`
    pub fn init(soc: &Soc, clock: &dyn Clock, index: usize, dreq: u32) -> Result<Self> {
        Self::init_with_priority(soc, clock, index, dreq, DEFAULT_PRIORITY)
    }

    /// Like [`BcmDmaChannel::init`] with an explicit AXI priority (0..=15)
    ///
    /// # Errors
    /// - `InvalidDmaChannel` if `index` is not a full channel
    /// - any failure establishing the uncached pool or mapping the registers
    pub fn init_with_priority(
        soc: &Soc,
        clock: &dyn Clock,
        index: usize,
        dreq: u32,
        priority: u32,
    ) -> Result<Self> {
        if index >= soc.config().dma_channels {
            log::error!("DMA channel {} is not supported", index);
            return Err(HalError::InvalidDmaChannel(index));
        }

        let regs = soc.dma_channel(index)?;
        let pool = soc.uncached_pool()?;
        let cb = pool.allocate(core::mem::size_of::<ControlBlock>())?;

        regs.cs.write(DmaCs::RESET.bits());
        clock.delay_us(1);

        let cs_base = DmaCs::DISDEBUG
            | DmaCs::WAIT_FOR_OUTSTANDING_WRITES
            | DmaCs::panic_priority(PANIC_PRIORITY)
            | DmaCs::priority(priority);

        regs.conblk_ad.write(0);
        regs.cs.write(cs_base.bits());

        log::debug!(
            "DMA{} ready: dreq {}, priority {}, control block at bus {:#010x}",
            index,
            dreq,
            priority & 0xF,
            cb.bus_address()
        );

        Ok(Self {
            index,
            dreq,
            regs,
            pool,
            cb,
            cs_base,
            direction: Direction::Tx,
            peripheral_addr: 0,
            armed: false,
            started: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peripheral_address(&self) -> u32 {
        self.peripheral_addr
    }

    pub fn regs(&self) -> &DmaChannelRegs {
        &self.regs
    }

    /// The channel's control block
    pub fn descriptor(&self) -> &ControlBlock {
        // SAFETY: the buffer is 32 bytes, 32-byte aligned (pool granule) and
        // lives as long as self
        unsafe { &*self.cb.as_ptr().cast::<ControlBlock>() }
    }

    pub fn descriptor_bus_address(&self) -> u32 {
        self.cb.bus_address()
    }

    pub fn state(&self) -> ChannelState {
        if self.is_active() {
            ChannelState::Running
        } else if self.started {
            ChannelState::Complete
        } else if self.armed {
            ChannelState::Armed
        } else {
            ChannelState::Ready
        }
    }

    fn check_transfer(transfer: &DmaTransfer) -> Result<()> {
        if transfer.bytewidth == 0 || transfer.bytewidth > 0xFFFF {
            return Err(HalError::InvalidTransfer("element width must be 1..=65535 bytes"));
        }
        if transfer.count == 0 || transfer.count > MAX_COUNT {
            return Err(HalError::InvalidTransfer("element count must be 1..=16384"));
        }
        Ok(())
    }
}

impl DmaChannel for BcmDmaChannel {
    fn prepare(&mut self, direction: Direction, peripheral_addr: u32) {
        self.direction = direction;
        self.peripheral_addr = peripheral_addr;
    }

    fn prepare_transfer(&mut self, transfer: &DmaTransfer) -> Result<()> {
        Self::check_transfer(transfer)?;

        let width = transfer.bytewidth;
        let mut ti = DmaTi::NO_WIDE_BURSTS | DmaTi::WAIT_RESP | DmaTi::TDMODE | DmaTi::permap(self.dreq);

        let (src, dst, src_inc, dst_inc) = match self.direction {
            Direction::Tx => {
                ti |= DmaTi::DEST_DREQ;
                let src_inc = if transfer.flags.contains(TransferFlags::NO_SRC_INC) {
                    0
                } else {
                    width
                };
                let src = self.pool.bus_address_of(transfer.src as *const u8)?;
                (src, self.peripheral_addr, src_inc, 0)
            }
            Direction::Rx => {
                ti |= DmaTi::SRC_DREQ;
                let dst_inc = if transfer.flags.contains(TransferFlags::NO_DST_INC) {
                    0
                } else {
                    width
                };
                let dst = self.pool.bus_address_of(transfer.dst as *const u8)?;
                (self.peripheral_addr, dst, 0, dst_inc)
            }
        };

        let cb_bus = self.cb.bus_address();
        let next = if transfer.flags.contains(TransferFlags::CIRCULAR) {
            cb_bus
        } else {
            0
        };

        let cb = self.descriptor();
        cb.ti.write(ti.bits());
        cb.source_ad.write(src);
        cb.dest_ad.write(dst);
        cb.txfr_len.write(encode_txfr_len(width, transfer.count));
        cb.stride.write(((dst_inc & 0xFFFF) << 16) | (src_inc & 0xFFFF));
        cb.nextconbk.write(next);

        self.regs.conblk_ad.write(cb_bus);
        self.armed = true;
        self.started = false;
        Ok(())
    }

    fn enable(&mut self) {
        self.regs.cs.write((self.cs_base | DmaCs::ACTIVE).bits());
        self.started = true;
        self.armed = false;
    }

    fn disable(&mut self) {
        self.regs.cs.write(self.cs_base.bits());
        self.started = false;
    }

    fn is_active(&self) -> bool {
        self.regs.cs.read() & DmaCs::ACTIVE.bits() != 0
    }

    fn remaining(&self) -> u32 {
        decode_remaining(self.regs.txfr_len.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocConfig;
    use bcm_platform::{MockMailbox, MockMapper};
    use std::cell::Cell;

    /// Clock that advances one microsecond per read
    struct StepClock(Cell<u64>);

    impl Clock for StepClock {
        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn ticks_per_second(&self) -> u64 {
            1_000_000
        }
    }

    const DMA_BASE: u64 = 0xFE00_7000;

    fn setup() -> (Arc<MockMapper>, Soc) {
        let mapper = Arc::new(MockMapper::new());
        let soc = Soc::new(SocConfig::BCM2711, mapper.clone(), Arc::new(MockMailbox::new()));
        (mapper, soc)
    }

    #[test]
    fn test_init_programs_persistent_control_bits() {
        let (mapper, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let ch = BcmDmaChannel::init_with_priority(&soc, &clock, 5, 2, 3).unwrap();

        let cs = mapper.read_u32(DMA_BASE + 5 * 0x100).unwrap();
        assert_eq!(cs, (1 << 29) | (1 << 28) | (13 << 20) | (3 << 16));
        assert_eq!(mapper.read_u32(DMA_BASE + 5 * 0x100 + 4).unwrap(), 0);
        assert_eq!(ch.state(), ChannelState::Ready);
        assert!(!ch.is_active());
        // the reset wait ran
        assert!(clock.0.get() >= 2);
    }

    #[test]
    fn test_channels_use_their_own_register_block() {
        let (mapper, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let ch0 = BcmDmaChannel::init(&soc, &clock, 0, 0).unwrap();
        let ch6 = BcmDmaChannel::init(&soc, &clock, 6, 0).unwrap();

        assert_ne!(ch0.descriptor_bus_address(), ch6.descriptor_bus_address());
        assert_eq!(mapper.read_u32(DMA_BASE + 0x600).unwrap() & (0xF << 16), 8 << 16);
    }

    #[test]
    fn test_channel_index_out_of_range() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        assert!(matches!(
            BcmDmaChannel::init(&soc, &clock, 7, 0),
            Err(HalError::InvalidDmaChannel(7))
        ));
    }

    #[test]
    fn test_length_round_trip() {
        for width in [1u32, 2, 4, 16, 255, 0xFFFF] {
            for count in [1u32, 2, 3, 64, 1000, MAX_COUNT] {
                assert_eq!(decode_remaining(encode_txfr_len(width, count)), width * count);
            }
        }
        assert_eq!(decode_remaining(0), 0);
    }

    #[test]
    fn test_remaining_reads_loaded_length() {
        let (mapper, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 3, 2).unwrap();
        let buf = soc.uncached_pool().unwrap().allocate(4096).unwrap();
        let txfr_len = DMA_BASE + 3 * 0x100 + 0x14;

        ch.prepare(Direction::Tx, 0x7E20_1000);
        for (width, count) in [(4u32, 16u32), (2, 100), (16, 8), (255, 3), (4096, 1)] {
            ch.prepare_transfer(&DmaTransfer::tx(buf.as_ptr(), width, count)).unwrap();
            // the engine copies TXFR_LEN out of the control block when it starts
            mapper.write_u32(txfr_len, ch.descriptor().txfr_len.read()).unwrap();
            assert_eq!(ch.remaining(), width * count, "{width} x {count}");
        }

        mapper.write_u32(txfr_len, 0).unwrap();
        assert_eq!(ch.remaining(), 0);
    }

    #[test]
    fn test_tx_control_block() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 1, 2).unwrap();
        let buf = soc.uncached_pool().unwrap().allocate(64).unwrap();

        ch.prepare(Direction::Tx, 0x7E20_1000);
        ch.prepare_transfer(&DmaTransfer::tx(buf.as_ptr(), 4, 16)).unwrap();

        let cb = ch.descriptor();
        let ti = DmaTi::from_bits_retain(cb.ti.read());
        assert!(ti.contains(DmaTi::DEST_DREQ | DmaTi::TDMODE | DmaTi::WAIT_RESP | DmaTi::NO_WIDE_BURSTS));
        assert!(!ti.intersects(DmaTi::SRC_DREQ | DmaTi::SRC_INC | DmaTi::DEST_INC));
        assert_eq!(ti.bits() & DmaTi::PERMAP.bits(), 2 << 16);
        assert_eq!(cb.source_ad.read(), buf.bus_address());
        assert_eq!(cb.dest_ad.read(), 0x7E20_1000);
        assert_eq!(cb.txfr_len.read(), (15 << 16) | 4);
        assert_eq!(cb.stride.read(), 4);
        assert_eq!(cb.nextconbk.read(), 0);
        assert_eq!(ch.regs().conblk_ad.read(), ch.descriptor_bus_address());
        assert_eq!(ch.state(), ChannelState::Armed);
    }

    #[test]
    fn test_rx_control_block() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 2, 14).unwrap();
        let buf = soc.uncached_pool().unwrap().allocate(32).unwrap();

        ch.prepare(Direction::Rx, 0x7E20_1000);
        ch.prepare_transfer(&DmaTransfer::rx(buf.as_mut_ptr(), 1, 32)).unwrap();

        let cb = ch.descriptor();
        let ti = DmaTi::from_bits_retain(cb.ti.read());
        assert!(ti.contains(DmaTi::SRC_DREQ));
        assert!(!ti.contains(DmaTi::DEST_DREQ));
        assert_eq!(cb.source_ad.read(), 0x7E20_1000);
        assert_eq!(cb.dest_ad.read(), buf.bus_address());
        assert_eq!(cb.stride.read(), 1 << 16);
    }

    #[test]
    fn test_no_increment_flag_suppresses_stride() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 3, 2).unwrap();
        let buf = soc.uncached_pool().unwrap().allocate(4).unwrap();

        ch.prepare(Direction::Tx, 0x7E20_1000);
        let xfer = DmaTransfer::tx(buf.as_ptr(), 4, 100).with_flags(TransferFlags::NO_SRC_INC);
        ch.prepare_transfer(&xfer).unwrap();
        assert_eq!(ch.descriptor().stride.read(), 0);
    }

    #[test]
    fn test_circular_descriptor_points_at_itself() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 4, 2).unwrap();
        let pool = soc.uncached_pool().unwrap();
        let buf = pool.allocate(128).unwrap();

        ch.prepare(Direction::Tx, 0x7E20_1000);
        ch.prepare_transfer(&DmaTransfer::tx(buf.as_ptr(), 1, 128).circular())
            .unwrap();

        let own = pool.bus_address_of(ch.descriptor() as *const ControlBlock as *const u8).unwrap();
        assert_eq!(ch.descriptor().nextconbk.read(), own);
        assert_eq!(own, ch.descriptor_bus_address());
    }

    #[test]
    fn test_pointer_outside_pool_never_arms() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 0, 2).unwrap();
        let heap = vec![0u8; 64];

        ch.prepare(Direction::Tx, 0x7E20_1000);
        assert!(matches!(
            ch.prepare_transfer(&DmaTransfer::tx(heap.as_ptr(), 1, 64)),
            Err(HalError::InvalidDmaAddress { .. })
        ));
        assert_eq!(ch.regs().conblk_ad.read(), 0);
        assert_eq!(ch.state(), ChannelState::Ready);
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        let (_, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 0, 2).unwrap();
        let buf = soc.uncached_pool().unwrap().allocate(32).unwrap();

        for (width, count) in [(0, 1), (1, 0), (1, MAX_COUNT + 1), (0x1_0000, 1)] {
            assert!(matches!(
                ch.prepare_transfer(&DmaTransfer::tx(buf.as_ptr(), width, count)),
                Err(HalError::InvalidTransfer(_))
            ));
        }
    }

    #[test]
    fn test_enable_disable_and_completion() {
        let (mapper, soc) = setup();
        let clock = StepClock(Cell::new(0));
        let mut ch = BcmDmaChannel::init(&soc, &clock, 5, 2).unwrap();
        let buf = soc.uncached_pool().unwrap().allocate(16).unwrap();
        let cs_addr = DMA_BASE + 5 * 0x100;

        ch.prepare(Direction::Tx, 0x7E20_1000);
        ch.start_transfer(&DmaTransfer::tx(buf.as_ptr(), 1, 16)).unwrap();
        assert!(ch.is_active());
        assert_eq!(ch.state(), ChannelState::Running);

        // hardware finishes: ACTIVE drops, END is set
        let cs = mapper.read_u32(cs_addr).unwrap();
        mapper.write_u32(cs_addr, (cs & !1) | 2).unwrap();
        assert!(!ch.is_active());
        assert_eq!(ch.state(), ChannelState::Complete);

        ch.disable();
        assert_eq!(mapper.read_u32(cs_addr).unwrap() & 1, 0);
        assert_eq!(ch.state(), ChannelState::Ready);
    }
}
