//! Time capabilities used by the transmission backends.
//!
//! - [`CycleClock`]: a free-running cycle counter for sub-microsecond bit timing
//!   (ARM DWT `CYCCNT`, RISC-V `mcycle`, Xtensa `CCOUNT`, ...).
//! - [`TimeSource`]: a monotonic microsecond-scale clock for latch waits.
//!
//! Per-platform counters live behind cargo features so the backends stay generic.

use embassy_time::Instant;

use crate::buffer::Mmio;

/// A free-running, wrapping cycle counter.
pub trait CycleClock {
    /// Current counter value.
    fn now(&self) -> u32;

    /// Counter frequency in Hz.
    fn frequency_hz(&self) -> u32;

    /// Cycles since `since`, correct across one counter wraparound.
    fn elapsed(&self, since: u32) -> u32 {
        self.now().wrapping_sub(since)
    }
}

impl<C: CycleClock + ?Sized> CycleClock for &C {
    fn now(&self) -> u32 {
        (**self).now()
    }

    fn frequency_hz(&self) -> u32 {
        (**self).frequency_hz()
    }

    fn elapsed(&self, since: u32) -> u32 {
        (**self).elapsed(since)
    }
}

/// Whether a wrapping counter value `now` has reached `deadline`.
///
/// Valid while the two are less than half the counter range apart.
#[must_use]
pub const fn reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

/// Cycles per microsecond, rounded up.
#[must_use]
pub const fn cycles_per_us(frequency_hz: u32) -> u32 {
    frequency_hz.div_ceil(1_000_000)
}

/// A monotonic clock for frame-level waits.
pub trait TimeSource {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Called on every iteration of a busy-wait on this clock.
    fn pause(&self) {
        core::hint::spin_loop();
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &T {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn pause(&self) {
        (**self).pause();
    }
}

/// The embassy-time system clock.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A free-running up-counter exposed as a memory-mapped register.
#[derive(Debug)]
pub struct MmioCounter {
    register: Mmio<u32>,
    frequency_hz: u32,
}

impl MmioCounter {
    /// Read cycles from `register`, which counts up at `frequency_hz`.
    #[must_use]
    pub const fn new(register: Mmio<u32>, frequency_hz: u32) -> Self {
        Self {
            register,
            frequency_hz,
        }
    }
}

impl CycleClock for MmioCounter {
    fn now(&self) -> u32 {
        self.register.read()
    }

    fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }
}

/// ARM Cortex-M DWT cycle counter.
///
/// The caller must enable tracing and the counter first
/// (`DCB::enable_trace` and `DWT::enable_cycle_counter`).
#[cfg(feature = "arm")]
#[derive(Clone, Copy, Debug)]
pub struct DwtClock {
    frequency_hz: u32,
}

#[cfg(feature = "arm")]
impl DwtClock {
    /// Wrap an already-running DWT counter clocked at the core frequency.
    #[must_use]
    pub const fn new(frequency_hz: u32) -> Self {
        Self { frequency_hz }
    }
}

#[cfg(feature = "arm")]
impl CycleClock for DwtClock {
    fn now(&self) -> u32 {
        cortex_m::peripheral::DWT::cycle_count()
    }

    fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }
}

/// RISC-V `mcycle` counter (low 32 bits).
#[cfg(feature = "riscv")]
#[derive(Clone, Copy, Debug)]
pub struct McycleClock {
    frequency_hz: u32,
}

#[cfg(feature = "riscv")]
impl McycleClock {
    /// Wrap the hart's `mcycle` counter.
    #[must_use]
    pub const fn new(frequency_hz: u32) -> Self {
        Self { frequency_hz }
    }
}

#[cfg(feature = "riscv")]
impl CycleClock for McycleClock {
    #[expect(clippy::cast_possible_truncation, reason = "backends use a 32-bit wrapping counter")]
    fn now(&self) -> u32 {
        riscv::register::mcycle::read() as u32
    }

    fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }
}
