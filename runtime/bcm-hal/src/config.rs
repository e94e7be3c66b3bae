//! SoC configuration - peripheral address tables and fixed rates
//!
//! Physical addresses are what the ARM core sees (and what `/dev/mem`
//! takes). Peripherals are also reachable from the DMA engine through the
//! legacy bus window at `0x7E00_0000`; [`SocConfig::peripheral_bus_address`]
//! translates between the two.

/// Per-SoC constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocConfig {
    /// ARM physical base of the main peripheral window
    pub peripheral_base: u64,
    /// Same window as seen from the DMA bus
    pub peripheral_bus_base: u32,
    /// System timer (free-running 64-bit counter)
    pub systimer_base: u64,
    /// Tick frequency of the system timer
    pub systimer_hz: u64,
    /// DMA controller, channel 0
    pub dma_base: u64,
    /// Number of full DMA channels driven by this crate
    pub dma_channels: usize,
    /// DMA channel register stride
    pub dma_channel_stride: usize,
    pub gpio_base: u64,
    /// Highest GPIO pin number
    pub gpio_max_pin: u32,
    /// PL011 cluster, UART0
    pub uart_base: u64,
    /// PL011 reference clock (UARTCLK)
    pub uart_clock_hz: u32,
    /// Size of the uncached pool carved up for DMA control blocks and buffers
    pub uncached_pool_size: usize,
}

impl SocConfig {
    /// BCM2711 (Raspberry Pi 4 / CM4) in low-peripheral mode
    pub const BCM2711: SocConfig = SocConfig {
        peripheral_base: 0xFE00_0000,
        peripheral_bus_base: 0x7E00_0000,
        systimer_base: 0xFE00_3000,
        systimer_hz: 1_000_000,
        dma_base: 0xFE00_7000,
        dma_channels: 7,
        dma_channel_stride: 0x100,
        gpio_base: 0xFE20_0000,
        gpio_max_pin: 57,
        uart_base: 0xFE20_1000,
        uart_clock_hz: 48_000_000,
        uncached_pool_size: 16 * 1024,
    };

    /// Bus address of a peripheral register, as programmed into DMA control blocks
    pub const fn peripheral_bus_address(&self, phys: u64) -> u32 {
        (phys - self.peripheral_base) as u32 + self.peripheral_bus_base
    }
}

impl Default for SocConfig {
    fn default() -> Self {
        Self::BCM2711
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_translation_of_uart_data_register() {
        let cfg = SocConfig::BCM2711;
        assert_eq!(cfg.peripheral_bus_address(cfg.uart_base), 0x7E20_1000);
        assert_eq!(cfg.peripheral_bus_address(cfg.uart_base + 0x400), 0x7E20_1400);
    }

    #[test]
    fn test_default_is_bcm2711() {
        assert_eq!(SocConfig::default(), SocConfig::BCM2711);
    }
}
