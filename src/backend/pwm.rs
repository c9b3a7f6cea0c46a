//! PWM sequence backend.
//!
//! The whole frame is encoded into a compare-code sequence (one 16-bit code per
//! bit) that a PWM peripheral plays through DMA without CPU involvement. One
//! sequence buffer per peripheral is shared by every strip on it, so a strip
//! takes the [`PwmShared`] arbiter before filling the buffer. The lock is only
//! given back by the sequence-end interrupt ([`PwmShared::on_sequence_end`])
//! and the following latch wait.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};

use crate::arbiter::{ArbiterToken, OwnerId, ResourceArbiter, TransmissionState};
use crate::backend::{TransmissionBackend, acquire_after_latch, finish_latch_if_ready};
use crate::buffer::{OutputBuffer, SequenceBuffer};
use crate::clock::TimeSource;
use crate::encoder::{PWM_COUNTER_BITS_DEFAULT, PwmTiming};
use crate::frame_guard::FrameTimingGuard;
use crate::pixel_source::{ChannelBytes, Channels, PixelSource};
use crate::timing::{LATCH_US_DEFAULT, TimingSpec};
use crate::{Error, Result};

/// Producer side of a PWM + DMA sequencer.
pub trait PwmSequencer {
    /// Load the counter top and play `sequence` once.
    ///
    /// The peripheral must raise its sequence-end interrupt when done and leave
    /// the line low.
    fn start(&mut self, top: u16, sequence: &[u16]);
}

impl<S: PwmSequencer + ?Sized> PwmSequencer for &mut S {
    fn start(&mut self, top: u16, sequence: &[u16]) {
        (**self).start(top, sequence);
    }
}

/// Interrupt side of a PWM sequencer.
pub trait PwmCompletionIrq {
    /// Stop the peripheral.
    fn disable(&mut self);

    /// Clear sequence events and shortcuts so the interrupt does not fire again.
    fn clear_events(&mut self);
}

/// State shared by every strip driven through one PWM peripheral.
///
/// ```ignore
/// static PWM0: PwmShared<{ 64 * 24 }> = PwmShared::new(280);
///
/// #[interrupt]
/// fn PWM0() {
///     PWM0.on_sequence_end(&mut Pwm0Irq, Instant::now());
/// }
/// ```
pub struct PwmShared<const CAP: usize> {
    arbiter: ResourceArbiter<SequenceBuffer<CAP>>,
    guard: FrameTimingGuard,
    done: Signal<CriticalSectionRawMutex, ()>,
}

impl<const CAP: usize> PwmShared<CAP> {
    /// Shared state with a `latch_us` wait after every frame.
    #[must_use]
    pub const fn new(latch_us: u32) -> Self {
        Self {
            arbiter: ResourceArbiter::new(OutputBuffer::new(0)),
            guard: FrameTimingGuard::from_micros(latch_us),
            done: Signal::new(),
        }
    }

    /// Sequence codes the shared buffer holds.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Phase of the peripheral.
    #[must_use]
    pub fn state(&self) -> TransmissionState {
        self.arbiter.state()
    }

    /// Strip currently holding the peripheral.
    #[must_use]
    pub fn holder(&self) -> Option<OwnerId> {
        self.arbiter.holder()
    }

    /// The latch guard consulted before every start.
    #[must_use]
    pub const fn guard(&self) -> &FrameTimingGuard {
        &self.guard
    }

    /// Sequence-end interrupt handler.
    ///
    /// Disables the peripheral, clears its events, records the latch start,
    /// moves the arbiter to `Latching` and wakes waiters, in that order.
    pub fn on_sequence_end<I: PwmCompletionIrq + ?Sized>(&self, irq: &mut I, now: Instant) {
        irq.disable();
        irq.clear_events();
        self.guard.mark(now);
        if !self.arbiter.complete() {
            warn!("sequence end with nothing in flight");
        }
        self.done.signal(());
    }

    /// Wait until the frame being filled or played has ended and its latch has passed.
    ///
    /// `time` must be the clock whose instants the interrupt handler passes to
    /// [`on_sequence_end`](Self::on_sequence_end).
    pub async fn wait_complete<T: TimeSource + ?Sized>(&self, time: &T) {
        loop {
            match self.arbiter.state() {
                TransmissionState::Preparing => embassy_futures::yield_now().await,
                TransmissionState::InFlight => self.done.wait().await,
                TransmissionState::Latching | TransmissionState::Idle => break,
            }
        }
        let remaining = self.guard.remaining(time.now());
        if remaining > Duration::from_ticks(0) {
            embassy_time::Timer::after(remaining).await;
        }
        self.guard.wait(time);
        self.arbiter.finish_latch();
    }
}

impl<const CAP: usize> Default for PwmShared<CAP> {
    fn default() -> Self {
        Self::new(LATCH_US_DEFAULT)
    }
}

/// Configuration for [`PwmBackend`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmConfig {
    /// Bit timing.
    pub timing: TimingSpec,
    /// Frequency of the PWM counter clock.
    pub pwm_clock_hz: u32,
    /// Width of the counter/compare register.
    pub counter_bits: u8,
    /// Largest strip, in pixels.
    pub max_pixels: usize,
    /// RGB or RGBW.
    pub channels: Channels,
}

impl PwmConfig {
    /// `max_pixels` RGB pixels on a 15-bit counter.
    #[must_use]
    pub const fn new(timing: TimingSpec, pwm_clock_hz: u32, max_pixels: usize) -> Self {
        Self {
            timing,
            pwm_clock_hz,
            counter_bits: PWM_COUNTER_BITS_DEFAULT,
            max_pixels,
            channels: Channels::Rgb,
        }
    }

    /// Set the counter width.
    #[must_use]
    pub const fn with_counter_bits(mut self, counter_bits: u8) -> Self {
        self.counter_bits = counter_bits;
        self
    }

    /// Set the wire channels.
    #[must_use]
    pub const fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }

    /// Sequence codes needed for a full strip.
    #[must_use]
    pub const fn codes_needed(&self, pixels: usize) -> usize {
        pixels.saturating_mul(self.channels.bits_per_pixel())
    }
}

/// One strip driven by a shared PWM sequencer.
pub struct PwmBackend<'s, S, T, const CAP: usize> {
    shared: &'s PwmShared<CAP>,
    sequencer: S,
    time: T,
    owner: OwnerId,
    config: PwmConfig,
    codes: PwmTiming,
}

impl<'s, S, T, const CAP: usize> PwmBackend<'s, S, T, CAP>
where
    S: PwmSequencer,
    T: TimeSource,
{
    /// Bind a strip to a shared PWM peripheral.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if `config.max_pixels` does not fit the shared buffer.
    /// - [`Error::PulseWidthOverflow`] or [`Error::InvalidTiming`] from [`PwmTiming::new`].
    pub fn new(
        shared: &'s PwmShared<CAP>,
        sequencer: S,
        time: T,
        owner: OwnerId,
        config: PwmConfig,
    ) -> Result<Self> {
        let needed = config.codes_needed(config.max_pixels);
        if needed > CAP {
            return Err(Error::Configuration {
                requested: config.max_pixels,
                capacity: CAP / config.channels.bits_per_pixel(),
            });
        }
        let codes = PwmTiming::new(config.timing, config.pwm_clock_hz, config.counter_bits)?;
        info!(
            "pwm backend {}: top={=u16} codes {=u16}/{=u16}",
            owner,
            codes.top(),
            codes.code(false),
            codes.code(true)
        );
        Ok(Self {
            shared,
            sequencer,
            time,
            owner,
            config,
            codes,
        })
    }

    /// The strip's owner id on the shared peripheral.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Compare codes used for this strip.
    #[must_use]
    pub const fn codes(&self) -> PwmTiming {
        self.codes
    }

    /// Like [`show`](TransmissionBackend::show), but fail instead of waiting for
    /// another strip's frame.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceBusy`] if another strip holds the peripheral, plus the
    /// errors of [`show`](TransmissionBackend::show).
    pub fn try_show<P: PixelSource>(&mut self, pixels: &P) -> Result<()>
    where
        P: Clone,
    {
        if self.check_size(pixels)? == 0 {
            return Ok(());
        }
        finish_latch_if_ready(&self.shared.arbiter, &self.shared.guard, self.time.now());
        let token = self.shared.arbiter.try_acquire(self.owner)?;
        self.fill_and_start(token, pixels.clone())
    }

    fn check_size<P: PixelSource>(&self, pixels: &P) -> Result<usize> {
        let requested = pixels.size();
        if requested > self.config.max_pixels {
            return Err(Error::Configuration {
                requested,
                capacity: self.config.max_pixels,
            });
        }
        Ok(requested)
    }

    fn fill_and_start<P: PixelSource>(
        &mut self,
        mut token: ArbiterToken<'s, SequenceBuffer<CAP>>,
        mut pixels: P,
    ) -> Result<()> {
        let channels = self.config.channels;
        token.clear();
        while pixels.has_next() {
            let bytes = ChannelBytes::next_from(&pixels, channels);
            for &byte in bytes.as_slice() {
                let written = self.codes.encode_byte(byte, token.spare_mut());
                token.commit(written);
            }
            pixels.advance();
            pixels.step_dithering();
        }

        self.shared.guard.wait(&self.time);
        let top = self.codes.top();
        let sequencer = &mut self.sequencer;
        trace!("pwm start {=usize} codes", token.len());
        self.shared.done.reset();
        token.launch_with(|sequence| sequencer.start(top, sequence.as_slice()));
        Ok(())
    }
}

impl<'s, S, T, const CAP: usize> TransmissionBackend for PwmBackend<'s, S, T, CAP>
where
    S: PwmSequencer,
    T: TimeSource,
{
    fn max_pixels(&self) -> usize {
        self.config.max_pixels
    }

    fn channels(&self) -> Channels {
        self.config.channels
    }

    fn state(&self) -> TransmissionState {
        self.shared.state()
    }

    /// Waits for any frame in flight on the peripheral, fills the shared
    /// sequence and starts it. Returns once the hardware has the frame; the
    /// completion interrupt releases the peripheral.
    fn show<P: PixelSource + Clone>(&mut self, pixels: &P) -> Result<()> {
        if self.check_size(pixels)? == 0 {
            return Ok(());
        }
        let token = acquire_after_latch(
            &self.shared.arbiter,
            &self.shared.guard,
            &self.time,
            self.owner,
        );
        self.fill_and_start(token, pixels.clone())
    }
}
