//! Cycle-counted bit-bang backend.
//!
//! Each bit is placed against a cumulative absolute deadline on a free-running
//! [`CycleClock`], so small per-bit delays never accumulate. Interrupts are
//! masked for one pixel at a time and may run in the short window between
//! pixels. If they run for so long that the strip would see a latch (reset)
//! pulse, the half-sent frame is abandoned and resent from the first pixel
//! once the latch time has passed.

use embassy_time::Duration;
use embedded_hal::digital::OutputPin;

use crate::arbiter::TransmissionState;
use crate::backend::{
    CriticalSectionGate, InterruptGate, MAX_RETRIES_DEFAULT, TransmissionBackend,
};
use crate::clock::{CycleClock, TimeSource, cycles_per_us, reached};
use crate::encoder::bits_msb_first;
use crate::frame_guard::FrameTimingGuard;
use crate::pixel_source::{ChannelBytes, Channels, PixelSource};
use crate::timing::{CycleTiming, LATCH_US_DEFAULT, TimingSpec, WS2812};
use crate::{Error, Result};

/// Default slack, in microseconds, kept below the latch time when judging lateness.
pub const INTERRUPT_THRESHOLD_US_DEFAULT: u32 = 1;

/// Configuration for [`BangBackend`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BangConfig {
    /// Bit timing.
    pub timing: TimingSpec,
    /// Minimum low time that makes the strip latch, in microseconds.
    pub latch_us: u32,
    /// Let interrupts run between pixels. When `false` the whole frame is masked.
    pub allow_interrupts: bool,
    /// Lateness tolerance is `latch_us - interrupt_threshold_us`.
    pub interrupt_threshold_us: u32,
    /// Whole-frame retries after a [`Error::TimingOverrun`].
    pub max_retries: u8,
    /// RGB or RGBW.
    pub channels: Channels,
}

impl BangConfig {
    /// Defaults for `timing`: interrupts allowed between pixels, one retry.
    #[must_use]
    pub const fn new(timing: TimingSpec) -> Self {
        Self {
            timing,
            latch_us: LATCH_US_DEFAULT,
            allow_interrupts: true,
            interrupt_threshold_us: INTERRUPT_THRESHOLD_US_DEFAULT,
            max_retries: MAX_RETRIES_DEFAULT,
            channels: Channels::Rgb,
        }
    }

    /// Set the latch time.
    #[must_use]
    pub const fn with_latch_us(mut self, latch_us: u32) -> Self {
        self.latch_us = latch_us;
        self
    }

    /// Allow or forbid interrupts between pixels.
    #[must_use]
    pub const fn with_interrupts(mut self, allow_interrupts: bool) -> Self {
        self.allow_interrupts = allow_interrupts;
        self
    }

    /// Set the interrupt threshold.
    #[must_use]
    pub const fn with_interrupt_threshold_us(mut self, interrupt_threshold_us: u32) -> Self {
        self.interrupt_threshold_us = interrupt_threshold_us;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the wire channels.
    #[must_use]
    pub const fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }
}

impl Default for BangConfig {
    fn default() -> Self {
        Self::new(WS2812.timing).with_latch_us(WS2812.latch_us)
    }
}

/// Bit-bangs one strip on a GPIO pin.
///
/// ```text
/// deadline ──▶ set high ──▶ deadline + high(bit) ──▶ set low ──▶ deadline + period
/// ```
pub struct BangBackend<P, C, T, G = CriticalSectionGate> {
    pin: P,
    clock: C,
    time: T,
    gate: G,
    config: BangConfig,
    cycles: CycleTiming,
    tolerance_cycles: u32,
    guard: FrameTimingGuard,
}

impl<P, C, T> BangBackend<P, C, T, CriticalSectionGate>
where
    P: OutputPin,
    C: CycleClock,
    T: TimeSource,
{
    /// A backend masking interrupts with a critical section.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTiming`] if an interval rounds to zero cycles.
    pub fn new(pin: P, clock: C, time: T, config: BangConfig) -> Result<Self> {
        Self::with_gate(pin, clock, time, CriticalSectionGate, config)
    }
}

impl<P, C, T, G> BangBackend<P, C, T, G>
where
    P: OutputPin,
    C: CycleClock,
    T: TimeSource,
    G: InterruptGate,
{
    /// A backend masking interrupts through `gate`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTiming`] if an interval rounds to zero cycles.
    pub fn with_gate(mut pin: P, clock: C, time: T, gate: G, config: BangConfig) -> Result<Self> {
        let cycles = config.timing.to_cycles(clock.frequency_hz())?;
        let tolerance_cycles = config
            .latch_us
            .saturating_sub(config.interrupt_threshold_us)
            .saturating_mul(cycles_per_us(clock.frequency_hz()));
        pin.set_low().map_err(|_| Error::Gpio)?;
        debug!(
            "bang backend: t1={=u32} t2={=u32} t3={=u32} cycles, tolerance {=u32}",
            cycles.t1,
            cycles.t2,
            cycles.t3,
            tolerance_cycles
        );
        Ok(Self {
            pin,
            clock,
            time,
            gate,
            config,
            cycles,
            tolerance_cycles,
            guard: FrameTimingGuard::new(Duration::from_micros(u64::from(config.latch_us))),
        })
    }

    /// Bit timing in cycles of the backend's clock.
    #[must_use]
    pub const fn cycles(&self) -> CycleTiming {
        self.cycles
    }

    /// Largest accepted gap between pixels, in cycles.
    #[must_use]
    pub const fn tolerance_cycles(&self) -> u32 {
        self.tolerance_cycles
    }

    /// Give back the pin.
    pub fn release(self) -> P {
        self.pin
    }

    fn transmit<Px: PixelSource>(&mut self, mut pixels: Px) -> Result<()> {
        let Self {
            pin,
            clock,
            gate,
            config,
            cycles,
            tolerance_cycles,
            ..
        } = self;
        let (cycles, tolerance) = (*cycles, *tolerance_cycles);
        let channels = config.channels;

        if !config.allow_interrupts {
            return gate.run_masked(|| -> Result<()> {
                let mut next = clock.now().wrapping_add(cycles.t3);
                while pixels.has_next() {
                    let bytes = ChannelBytes::next_from(&pixels, channels);
                    next = send_pixel(pin, &*clock, cycles, bytes.as_slice(), next)?;
                    pixels.advance();
                    pixels.step_dithering();
                }
                finish_bit(&*clock, next);
                Ok(())
            });
        }

        let mut next = clock.now().wrapping_add(cycles.t3);
        let mut first = true;
        while pixels.has_next() {
            let bytes = ChannelBytes::next_from(&pixels, channels);
            if !first {
                gate.service_pending();
                next = check_lateness(clock.now(), next, tolerance, cycles.t3)?;
            }
            next = gate.run_masked(|| send_pixel(pin, &*clock, cycles, bytes.as_slice(), next))?;
            pixels.advance();
            pixels.step_dithering();
            first = false;
        }
        finish_bit(&*clock, next);
        Ok(())
    }
}

// A deadline already passed by at most `tolerance` is re-anchored `lead` cycles past
// `now`, so the next pixel is not squeezed to catch up and its first edge still
// lands on a deadline.
const fn check_lateness(now: u32, next: u32, tolerance: u32, lead: u32) -> Result<u32> {
    if !reached(now, next) {
        return Ok(next);
    }
    let late_cycles = now.wrapping_sub(next);
    if late_cycles > tolerance {
        return Err(Error::TimingOverrun {
            late_cycles,
            tolerance_cycles: tolerance,
        });
    }
    Ok(now.wrapping_add(lead))
}

fn wait_until<C: CycleClock>(clock: &C, deadline: u32) {
    while !reached(clock.now(), deadline) {}
}

// The line is already low; let the last bit's low time run out.
fn finish_bit<C: CycleClock>(clock: &C, next: u32) {
    wait_until(clock, next);
}

fn send_pixel<P: OutputPin, C: CycleClock>(
    pin: &mut P,
    clock: &C,
    cycles: CycleTiming,
    bytes: &[u8],
    mut next: u32,
) -> Result<u32> {
    for &byte in bytes {
        for bit in bits_msb_first(byte) {
            let (low_at, bit_end) = cycles.deadlines(next, bit);
            wait_until(clock, next);
            pin.set_high().map_err(|_| Error::Gpio)?;
            wait_until(clock, low_at);
            pin.set_low().map_err(|_| Error::Gpio)?;
            next = bit_end;
        }
    }
    Ok(next)
}

impl<P, C, T, G> TransmissionBackend for BangBackend<P, C, T, G>
where
    P: OutputPin,
    C: CycleClock,
    T: TimeSource,
    G: InterruptGate,
{
    fn max_pixels(&self) -> usize {
        usize::MAX
    }

    fn channels(&self) -> Channels {
        self.config.channels
    }

    fn state(&self) -> TransmissionState {
        if self.guard.is_ready(self.time.now()) {
            TransmissionState::Idle
        } else {
            TransmissionState::Latching
        }
    }

    fn show<Px: PixelSource + Clone>(&mut self, pixels: &Px) -> Result<()> {
        if pixels.size() == 0 {
            return Ok(());
        }
        let mut retries: u8 = 0;
        loop {
            self.guard.wait(&self.time);
            let result = self.transmit(pixels.clone());
            // On an abort the line has been low since the last completed bit.
            self.pin.set_low().map_err(|_| Error::Gpio)?;
            self.guard.mark(self.time.now());
            match result {
                Err(Error::TimingOverrun { late_cycles, .. })
                    if retries < self.config.max_retries =>
                {
                    retries = retries.saturating_add(1);
                    warn!(
                        "frame aborted, {=u32} cycles late; retry {=u8}",
                        late_cycles,
                        retries
                    );
                }
                Err(err) => {
                    error!("frame failed: {}", err);
                    return Err(err);
                }
                Ok(()) => return Ok(()),
            }
        }
    }
}
