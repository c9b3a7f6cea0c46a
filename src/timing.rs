//! Bit timing for self-clocked LED protocols.
//!
//! A bit period is split into three intervals:
//!
//! ```text
//!        T1      T2        T3
//!     ┌──────┬───────┐
//! "1" │      │       │─────────┐
//!     ┌──────┐
//! "0" │      │─────────────────┐
//! ```
//!
//! - bit `0`: high for `T1`, low for `T2 + T3`
//! - bit `1`: high for `T1 + T2`, low for `T3`
//!
//! See [`TimingSpec`] and the chipset presets such as [`WS2812`].

use embassy_time::Duration;

use crate::{Error, Result};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Default latch (reset) time for generated chipsets, in microseconds.
pub const LATCH_US_DEFAULT: u32 = 280;

/// The three sub-intervals of one bit period, in nanoseconds.
///
/// Created once at configuration time and immutable thereafter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingSpec {
    t1_ns: u32,
    t2_ns: u32,
    t3_ns: u32,
}

impl TimingSpec {
    /// Validate and build a timing spec.
    ///
    /// Every interval must be non-zero.
    pub const fn new(t1_ns: u32, t2_ns: u32, t3_ns: u32) -> Result<Self> {
        if t1_ns == 0 || t2_ns == 0 || t3_ns == 0 {
            return Err(Error::InvalidTiming);
        }
        let Some(high) = t1_ns.checked_add(t2_ns) else {
            return Err(Error::InvalidTiming);
        };
        if high.checked_add(t3_ns).is_none() {
            return Err(Error::InvalidTiming);
        }
        Ok(Self {
            t1_ns,
            t2_ns,
            t3_ns,
        })
    }

    // Presets only; values are known non-zero.
    const fn preset(t1_ns: u32, t2_ns: u32, t3_ns: u32) -> Self {
        Self {
            t1_ns,
            t2_ns,
            t3_ns,
        }
    }

    /// Always-high portion of every bit.
    #[must_use]
    pub const fn t1_ns(&self) -> u32 {
        self.t1_ns
    }

    /// Extra high time of a `1` bit.
    #[must_use]
    pub const fn t2_ns(&self) -> u32 {
        self.t2_ns
    }

    /// Trailing low portion of every bit.
    #[must_use]
    pub const fn t3_ns(&self) -> u32 {
        self.t3_ns
    }

    /// `T1 + T2 + T3`.
    #[must_use]
    #[expect(clippy::arithmetic_side_effects, reason = "sum checked in new()")]
    pub const fn period_ns(&self) -> u32 {
        self.t1_ns + self.t2_ns + self.t3_ns
    }

    /// High and low time of one encoded bit.
    #[must_use]
    #[expect(clippy::arithmetic_side_effects, reason = "sum checked in new()")]
    pub const fn pulse(&self, bit: bool) -> Pulse {
        if bit {
            Pulse {
                high_ns: self.t1_ns + self.t2_ns,
                low_ns: self.t3_ns,
            }
        } else {
            Pulse {
                high_ns: self.t1_ns,
                low_ns: self.t2_ns + self.t3_ns,
            }
        }
    }

    /// Convert to cycles of a counter running at `frequency_hz`.
    ///
    /// Fails with [`Error::InvalidTiming`] if any interval rounds to zero cycles.
    pub fn to_cycles(&self, frequency_hz: u32) -> Result<CycleTiming> {
        let t1 = ns_to_ticks(self.t1_ns, frequency_hz);
        let t2 = ns_to_ticks(self.t2_ns, frequency_hz);
        let t3 = ns_to_ticks(self.t3_ns, frequency_hz);
        if t1 == 0 || t2 == 0 || t3 == 0 {
            return Err(Error::InvalidTiming);
        }
        Ok(CycleTiming { t1, t2, t3 })
    }

    /// Time on the wire for `bits` bits.
    #[must_use]
    pub fn airtime(&self, bits: usize) -> Duration {
        let nanos = u64::from(self.period_ns()).saturating_mul(bits as u64);
        Duration::from_micros(nanos.div_ceil(1_000))
    }
}

/// High/low durations of one encoded bit, independent of backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Pulse {
    /// Time the line is held high, in nanoseconds.
    pub high_ns: u32,
    /// Time the line is held low afterwards, in nanoseconds.
    pub low_ns: u32,
}

impl Pulse {
    /// Total bit period.
    #[must_use]
    pub const fn period_ns(&self) -> u32 {
        self.high_ns.saturating_add(self.low_ns)
    }
}

/// [`TimingSpec`] expressed in cycles of a free-running counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CycleTiming {
    /// Always-high cycles.
    pub t1: u32,
    /// Extra high cycles of a `1` bit.
    pub t2: u32,
    /// Trailing low cycles.
    pub t3: u32,
}

impl CycleTiming {
    /// Cycles in one bit period.
    #[must_use]
    pub const fn period(&self) -> u32 {
        self.t1.wrapping_add(self.t2).wrapping_add(self.t3)
    }

    /// Cycles the line stays high for `bit`.
    #[must_use]
    pub const fn high(&self, bit: bool) -> u32 {
        if bit { self.t1.wrapping_add(self.t2) } else { self.t1 }
    }

    /// Deadline pair for a bit starting at `start`: `(toggle_low_at, next_bit_at)`.
    ///
    /// Both use wrapping arithmetic so a counter overflow mid-frame is harmless.
    #[must_use]
    pub const fn deadlines(&self, start: u32, bit: bool) -> (u32, u32) {
        (
            start.wrapping_add(self.high(bit)),
            start.wrapping_add(self.period()),
        )
    }
}

/// Round-to-nearest conversion of nanoseconds to ticks of a `frequency_hz` clock.
#[must_use]
pub fn ns_to_ticks(ns: u32, frequency_hz: u32) -> u32 {
    let ticks = (u64::from(ns) * u64::from(frequency_hz) + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// Nominal timing and latch time of an LED chipset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Chipset {
    /// Bit timing.
    pub timing: TimingSpec,
    /// Minimum low time between frames, in microseconds.
    pub latch_us: u32,
}

/// WS2812 / WS2812B, 800 kHz.
pub const WS2812: Chipset = Chipset {
    timing: TimingSpec::preset(250, 625, 375),
    latch_us: LATCH_US_DEFAULT,
};

/// WS2811 in high-speed (800 kHz) mode.
pub const WS2811: Chipset = Chipset {
    timing: TimingSpec::preset(320, 320, 640),
    latch_us: 50,
};

/// WS2811 in low-speed (400 kHz) mode.
pub const WS2811_400KHZ: Chipset = Chipset {
    timing: TimingSpec::preset(800, 800, 900),
    latch_us: 50,
};

/// WS2813, 800 kHz with a long reset.
pub const WS2813: Chipset = Chipset {
    timing: TimingSpec::preset(320, 320, 640),
    latch_us: 300,
};

/// SK6812 (RGB and RGBW variants).
pub const SK6812: Chipset = Chipset {
    timing: TimingSpec::preset(300, 600, 300),
    latch_us: 80,
};

/// TM1809 / TM1804, 800 kHz.
pub const TM1809: Chipset = Chipset {
    timing: TimingSpec::preset(350, 350, 450),
    latch_us: 50,
};

/// UCS1903, 400 kHz.
pub const UCS1903: Chipset = Chipset {
    timing: TimingSpec::preset(500, 1500, 500),
    latch_us: 50,
};

/// GE8822, 800 kHz.
pub const GE8822: Chipset = Chipset {
    timing: TimingSpec::preset(350, 660, 350),
    latch_us: 50,
};
