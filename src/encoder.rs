//! Byte → pulse encoding for every backend family.
//!
//! Bytes go out MSB first. Each bit becomes one unit of the backend's timing
//! representation:
//!
//! | backend       | unit per bit                                   |
//! |---------------|------------------------------------------------|
//! | bang          | deadline pair, see [`CycleTiming::deadlines`]  |
//! | PWM sequence  | 16-bit compare code, see [`PwmTiming`]         |
//! | streaming DMA | GPIO lane mask word(s), see [`WordLayout`]     |
//!
//! [`CycleTiming::deadlines`]: crate::timing::CycleTiming::deadlines

use crate::timing::{Pulse, TimingSpec, ns_to_ticks};
use crate::{Error, Result};

/// Bits of one byte, most significant first.
pub fn bits_msb_first(byte: u8) -> impl Iterator<Item = bool> + Clone {
    (0..8u8).rev().map(move |shift| (byte >> shift) & 1 == 1)
}

/// Bits of a byte stream, each byte MSB first.
pub fn encode_bits<I>(bytes: I) -> impl Iterator<Item = bool>
where
    I: IntoIterator<Item = u8>,
{
    bytes.into_iter().flat_map(bits_msb_first)
}

/// Nominal high/low pulse of every bit of a byte stream.
pub fn pulses<I>(timing: TimingSpec, bytes: I) -> impl Iterator<Item = Pulse>
where
    I: IntoIterator<Item = u8>,
{
    encode_bits(bytes).map(move |bit| timing.pulse(bit))
}

/// Bit 15 of a PWM compare code selects the output polarity.
pub const PWM_POLARITY: u16 = 0x8000;

/// Default width of the PWM counter register, in bits.
pub const PWM_COUNTER_BITS_DEFAULT: u8 = 15;

// Bit 15 of a code is the polarity, so high times and the period stay below it.
const PWM_COUNTER_BITS_MAX: u8 = 15;

/// [`TimingSpec`] as PWM counter top and compare codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmTiming {
    top: u16,
    zero: u16,
    one: u16,
}

impl PwmTiming {
    /// Convert `timing` to ticks of a PWM clock.
    ///
    /// # Errors
    ///
    /// - [`Error::PulseWidthOverflow`] if the bit period does not fit a
    ///   `register_bits`-wide counter. Widths above 15 bits are treated as 15,
    ///   since bit 15 of every code is taken by [`PWM_POLARITY`].
    /// - [`Error::InvalidTiming`] if a pulse rounds to zero ticks or to the
    ///   whole period.
    pub fn new(timing: TimingSpec, pwm_clock_hz: u32, register_bits: u8) -> Result<Self> {
        let period_ticks = ns_to_ticks(timing.period_ns(), pwm_clock_hz);
        let register_bits = register_bits.min(PWM_COUNTER_BITS_MAX);
        let register_max = 1u32
            .checked_shl(u32::from(register_bits))
            .map_or(u32::MAX, |limit| limit.saturating_sub(1));
        let Ok(top) = u16::try_from(period_ticks) else {
            return Err(Error::PulseWidthOverflow {
                period_ticks,
                register_bits,
            });
        };
        if period_ticks > register_max {
            return Err(Error::PulseWidthOverflow {
                period_ticks,
                register_bits,
            });
        }

        let zero_ticks = ns_to_ticks(timing.pulse(false).high_ns, pwm_clock_hz);
        let one_ticks = ns_to_ticks(timing.pulse(true).high_ns, pwm_clock_hz);
        if zero_ticks == 0 || one_ticks <= zero_ticks || one_ticks >= period_ticks {
            return Err(Error::InvalidTiming);
        }
        // both < top <= 0x7FFF here, clear of the polarity bit
        let zero = u16::try_from(zero_ticks).map_err(|_| Error::InvalidTiming)?;
        let one = u16::try_from(one_ticks).map_err(|_| Error::InvalidTiming)?;
        Ok(Self {
            top,
            zero: zero | PWM_POLARITY,
            one: one | PWM_POLARITY,
        })
    }

    /// Counter top: ticks per bit period.
    #[must_use]
    pub const fn top(&self) -> u16 {
        self.top
    }

    /// Compare code for `bit`, polarity bit included.
    #[must_use]
    pub const fn code(&self, bit: bool) -> u16 {
        if bit { self.one } else { self.zero }
    }

    /// High time in ticks encoded by `code`.
    #[must_use]
    pub const fn high_ticks(code: u16) -> u16 {
        code & !PWM_POLARITY
    }

    /// Write the 8 codes of `byte` into `out`, returning how many were written.
    pub fn encode_byte(&self, byte: u8, out: &mut [u16]) -> usize {
        let mut written = 0;
        for (slot, bit) in out.iter_mut().zip(bits_msb_first(byte)) {
            *slot = self.code(bit);
            written += 1;
        }
        written
    }
}

/// Most lanes a streaming DMA word can address.
pub const MAX_LANES: usize = 32;

/// How one bit of every lane is laid out in GPIO words.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WordLayout {
    /// One word per bit: the mask of lanes sending `0`.
    ///
    /// Set-all and clear-all come from constant registers; the third DMA
    /// channel clears this mask at T0H.
    #[default]
    Compact,
    /// Four words per bit: `[all lanes, lanes sending 0, all lanes, 0]`
    /// for a set / clear / clear / idle register sequence.
    FourPhase,
}

impl WordLayout {
    /// GPIO words per encoded bit.
    #[must_use]
    pub const fn words_per_bit(self) -> usize {
        match self {
            Self::Compact => 1,
            Self::FourPhase => 4,
        }
    }

    /// Write the words of one bit into `out`, returning how many were written.
    ///
    /// `all` is the mask of every lane; `zeros` the lanes sending `0`.
    pub fn write_bit(self, all: u32, zeros: u32, out: &mut [u32]) -> usize {
        let words = match self {
            Self::Compact => [zeros, 0, 0, 0],
            Self::FourPhase => [all, zeros, all, 0],
        };
        let mut written = 0;
        for (slot, word) in out.iter_mut().zip(words).take(self.words_per_bit()) {
            *slot = word;
            written += 1;
        }
        written
    }

    /// Mask of lanes sending `0` from the words of one bit.
    #[must_use]
    pub fn zeros_of(self, words: &[u32]) -> u32 {
        let index = match self {
            Self::Compact => 0,
            Self::FourPhase => 1,
        };
        words.get(index).copied().unwrap_or(0)
    }
}

/// Mask of the lanes whose `byte` has bit `bit` (7 = MSB) cleared.
///
/// `lanes` pairs each lane's GPIO mask with its current byte.
pub fn zero_lanes<I>(lanes: I, bit: u8) -> u32
where
    I: IntoIterator<Item = (u32, u8)>,
{
    lanes
        .into_iter()
        .filter(|&(_, byte)| (byte >> (bit & 7)) & 1 == 0)
        .fold(0, |mask, (lane_mask, _)| mask | lane_mask)
}
