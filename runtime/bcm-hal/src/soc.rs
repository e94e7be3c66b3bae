//! SoC context - owner of register mappings and the uncached pool
//!
//! A [`Soc`] holds the platform backends and creates each peripheral's
//! register view the first time a driver asks for it. Later requests get a
//! clone of the same view, so every driver built from one context shares
//! one mapping per peripheral. The uncached pool is established the same
//! way, on the first DMA channel init.
//!
//! Drivers take `&Soc` at construction and keep what they need; the context
//! can be dropped afterwards without invalidating them.

use core::cell::OnceCell;
use std::sync::Arc;

use bcm_platform::{Mailbox, PhysMapper};

use crate::clock::SystemTimerRegs;
use crate::config::SocConfig;
use crate::dma::DmaChannelRegs;
use crate::gpio::GpioRegs;
use crate::regs::{RegisterView, Window};
use crate::uncached::UncachedPool;
use crate::{HalError, Result};

/// The PL011 cluster page
pub type UartWindow = Window<0x1000>;

/// The DMA controller page (channels 0..=14 and the global registers)
pub type DmaWindow = Window<0x1000>;

/// Initialize a lazily created handle, or clone the existing one
fn get_or_try_init<T: Clone>(cell: &OnceCell<T>, init: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(value) = cell.get() {
        return Ok(value.clone());
    }
    let value = init()?;
    Ok(cell.get_or_init(|| value).clone())
}

/// Application-level context for one SoC
pub struct Soc {
    config: SocConfig,
    mapper: Arc<dyn PhysMapper>,
    mailbox: Arc<dyn Mailbox>,
    systimer: OnceCell<RegisterView<SystemTimerRegs>>,
    gpio: OnceCell<RegisterView<GpioRegs>>,
    uart_cluster: OnceCell<RegisterView<UartWindow>>,
    dma: OnceCell<RegisterView<DmaWindow>>,
    pool: OnceCell<Arc<UncachedPool>>,
}

impl Soc {
    pub fn new(config: SocConfig, mapper: Arc<dyn PhysMapper>, mailbox: Arc<dyn Mailbox>) -> Self {
        Self {
            config,
            mapper,
            mailbox,
            systimer: OnceCell::new(),
            gpio: OnceCell::new(),
            uart_cluster: OnceCell::new(),
            dma: OnceCell::new(),
            pool: OnceCell::new(),
        }
    }

    /// Context over the real `/dev/mem` and `/dev/vcio` devices
    ///
    /// Nothing is opened until a driver needs it.
    #[cfg(all(feature = "runtime", unix))]
    pub fn open(config: SocConfig) -> Self {
        Self::new(
            config,
            Arc::new(bcm_platform::DevMemMapper::new()),
            Arc::new(bcm_platform::VcioMailbox::new()),
        )
    }

    pub fn config(&self) -> &SocConfig {
        &self.config
    }

    pub fn mapper(&self) -> &dyn PhysMapper {
        &*self.mapper
    }

    pub fn mailbox(&self) -> &dyn Mailbox {
        &*self.mailbox
    }

    fn map<T>(&self, name: &str, phys: u64) -> Result<RegisterView<T>> {
        let view = RegisterView::map(&*self.mapper, phys).map_err(|err| {
            log::error!("cannot map {} registers at {:#x}: {}", name, phys, err);
            err
        })?;
        log::debug!("{} registers mapped at {:#x}", name, phys);
        Ok(view)
    }

    pub fn systimer(&self) -> Result<RegisterView<SystemTimerRegs>> {
        get_or_try_init(&self.systimer, || self.map("system timer", self.config.systimer_base))
    }

    pub fn gpio(&self) -> Result<RegisterView<GpioRegs>> {
        get_or_try_init(&self.gpio, || self.map("GPIO", self.config.gpio_base))
    }

    pub fn uart_cluster(&self) -> Result<RegisterView<UartWindow>> {
        get_or_try_init(&self.uart_cluster, || self.map("UART", self.config.uart_base))
    }

    /// Registers of DMA channel `index`
    pub fn dma_channel(&self, index: usize) -> Result<RegisterView<DmaChannelRegs>> {
        if index >= self.config.dma_channels {
            return Err(HalError::InvalidDmaChannel(index));
        }
        let block = get_or_try_init(&self.dma, || self.map("DMA", self.config.dma_base))?;
        block.project(index * self.config.dma_channel_stride)
    }

    /// The uncached pool, established on first use
    pub fn uncached_pool(&self) -> Result<Arc<UncachedPool>> {
        get_or_try_init(&self.pool, || {
            UncachedPool::establish(&*self.mapper, &*self.mailbox, self.config.uncached_pool_size)
                .map(Arc::new)
        })
    }
}

impl core::fmt::Debug for Soc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Soc")
            .field("config", &self.config)
            .field("pool", &self.pool.get())
            .finish_non_exhaustive()
    }
}
