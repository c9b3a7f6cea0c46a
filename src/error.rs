use derive_more::{Display, Error};

use crate::arbiter::OwnerId;

/// Errors produced while configuring or driving a clockless LED backend.
///
/// Configuration problems ([`Error::Configuration`], [`Error::InvalidTiming`],
/// [`Error::PulseWidthOverflow`], [`Error::LaneMismatch`], [`Error::TooManyLanes`]) are
/// detected before any hardware action. [`Error::TimingOverrun`],
/// [`Error::RefillUnderrun`] and [`Error::ResourceBusy`] are transient: see
/// [`Error::is_transient`].
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The requested pixel count does not fit the backend's output buffer.
    #[display("{requested} pixels requested but the buffer holds {capacity}")]
    Configuration {
        /// Pixels requested by the caller or the configuration.
        requested: usize,
        /// Pixels the buffer can hold.
        capacity: usize,
    },

    /// Interrupt latency exceeded the tolerance during a bit-banged frame.
    #[display("interrupts delayed the frame by {late_cycles} cycles (tolerance {tolerance_cycles})")]
    TimingOverrun {
        /// Cycles past the deadline of the next bit.
        late_cycles: u32,
        /// Largest lateness that would not have latched the strip.
        tolerance_cycles: u32,
    },

    /// Streaming DMA reached a ping-pong half before it was refilled.
    #[display("DMA reached a window half before it was refilled")]
    RefillUnderrun,

    /// The shared peripheral is held by another owner.
    #[display("peripheral is busy (held by {holder})")]
    ResourceBusy {
        /// Current holder of the peripheral.
        holder: OwnerId,
    },

    /// A timing interval is zero, or rounds to zero clock ticks.
    #[display("every timing interval must be at least one tick")]
    InvalidTiming,

    /// The bit period does not fit the pulse-width register.
    #[display("bit period of {period_ticks} ticks does not fit a {register_bits}-bit register")]
    PulseWidthOverflow {
        /// Bit period in ticks of the peripheral clock.
        period_ticks: u32,
        /// Width of the compare register in bits.
        register_bits: u8,
    },

    /// Lanes of a multi-lane transmission have different lengths.
    #[display("lane holds {found} pixels, expected {expected}")]
    LaneMismatch {
        /// Pixel count of the first lane.
        expected: usize,
        /// Pixel count of the offending lane.
        found: usize,
    },

    /// More lanes than the backend supports, or no lanes at all.
    #[display("lane count must be between 1 and the backend maximum")]
    TooManyLanes,

    /// The GPIO driver reported an error.
    #[display("GPIO write failed")]
    Gpio,
}

impl Error {
    /// Whether the caller may simply retry after the latch wait.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TimingOverrun { .. } | Self::RefillUnderrun | Self::ResourceBusy { .. }
        )
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
