//! Benchmarks for hot register paths
//!
//! Runs against the mock platform, so the numbers measure driver overhead
//! (volatile accesses, tear checks, bit packing) rather than bus latency.

use std::hint::black_box;
use std::sync::Arc;

use bcm_hal::uart::baud_divisor;
use bcm_hal::{BcmGpio, Clock, GpioPin, Soc, SocConfig, SystemTimer};
use bcm_platform::{MockMailbox, MockMapper};
use criterion::{criterion_group, criterion_main, Criterion};

fn soc() -> Soc {
    Soc::new(
        SocConfig::BCM2711,
        Arc::new(MockMapper::new()),
        Arc::new(MockMailbox::new()),
    )
}

fn bench_clock_now(c: &mut Criterion) {
    let soc = soc();
    let timer = SystemTimer::new(&soc).expect("map system timer");

    c.bench_function("system_timer_now", |b| b.iter(|| black_box(timer.now())));
}

fn bench_pin_toggle(c: &mut Criterion) {
    let soc = soc();
    let gpio = BcmGpio::new(&soc).expect("map GPIO");
    let pin = gpio.pin(0, 42, false).expect("bind pin");

    c.bench_function("gpio_pin_toggle", |b| b.iter(|| pin.toggle()));
}

fn bench_baud_divisor(c: &mut Criterion) {
    c.bench_function("baud_divisor", |b| {
        b.iter(|| baud_divisor(black_box(48_000_000), black_box(115_200)))
    });
}

criterion_group!(benches, bench_clock_now, bench_pin_toggle, bench_baud_divisor);
criterion_main!(benches);
