//! Transmission backends and the contract they share.
//!
//! Every backend turns a [`PixelSource`] into pulses on one or more pins:
//!
//! - [`bang`]: busy-waits on a cycle counter and toggles a GPIO.
//! - [`pwm`]: fills a compare-code sequence consumed by a PWM + DMA sequencer.
//! - [`streaming_dma`]: transposes lanes into a ping-pong window of GPIO words.
//!
//! Each family is a cargo feature and is reached through static dispatch on
//! [`TransmissionBackend`].

use crate::arbiter::{ArbiterToken, OwnerId, ResourceArbiter, TransmissionState};
use crate::clock::TimeSource;
use crate::frame_guard::FrameTimingGuard;
use crate::pixel_source::{Channels, PixelSource};
use crate::Result;

#[cfg(feature = "bang")]
pub mod bang;
#[cfg(feature = "pwm")]
pub mod pwm;
#[cfg(feature = "streaming-dma")]
pub mod streaming_dma;

/// Default number of whole-frame retries after a frame is aborted mid-transmission.
pub const MAX_RETRIES_DEFAULT: u8 = 1;

/// A strategy for putting one frame on the wire.
pub trait TransmissionBackend {
    /// Largest frame, in pixels, this backend accepts.
    fn max_pixels(&self) -> usize;

    /// Wire channels per pixel.
    fn channels(&self) -> Channels;

    /// Phase of the backend's peripheral.
    fn state(&self) -> TransmissionState;

    /// Transmit one frame.
    ///
    /// `pixels` is cloned when a frame has to be restarted from its first pixel.
    ///
    /// # Errors
    ///
    /// See [`Error`](crate::Error); configuration errors are reported before any
    /// pin changes.
    fn show<P: PixelSource + Clone>(&mut self, pixels: &P) -> Result<()>;
}

/// Masks interrupts around timing-critical sections.
pub trait InterruptGate {
    /// Run `critical` with interrupts masked.
    fn run_masked<R>(&self, critical: impl FnOnce() -> R) -> R;

    /// Give pending interrupts a chance to run. Called between pixels.
    fn service_pending(&self) {}
}

impl<G: InterruptGate + ?Sized> InterruptGate for &G {
    fn run_masked<R>(&self, critical: impl FnOnce() -> R) -> R {
        (**self).run_masked(critical)
    }

    fn service_pending(&self) {
        (**self).service_pending();
    }
}

/// [`InterruptGate`] backed by `critical_section::with`.
///
/// Interrupts that arrived while masked run as soon as the section ends.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CriticalSectionGate;

impl InterruptGate for CriticalSectionGate {
    fn run_masked<R>(&self, critical: impl FnOnce() -> R) -> R {
        critical_section::with(|_| critical())
    }

    fn service_pending(&self) {
        core::hint::spin_loop();
    }
}

/// Finish a pending latch if the guard allows it. Returns whether the arbiter is idle.
pub fn finish_latch_if_ready<R>(
    arbiter: &ResourceArbiter<R>,
    guard: &FrameTimingGuard,
    now: embassy_time::Instant,
) -> bool {
    match arbiter.state() {
        TransmissionState::Idle => true,
        TransmissionState::Latching if guard.is_ready(now) => arbiter.finish_latch(),
        TransmissionState::Latching | TransmissionState::Preparing | TransmissionState::InFlight => {
            false
        }
    }
}

/// Block until `owner` holds `arbiter`, finishing the previous frame's latch on the way.
pub fn acquire_after_latch<'a, R, T: TimeSource + ?Sized>(
    arbiter: &'a ResourceArbiter<R>,
    guard: &FrameTimingGuard,
    time: &T,
    owner: OwnerId,
) -> ArbiterToken<'a, R> {
    arbiter.acquire(owner, |arbiter| {
        if !finish_latch_if_ready(arbiter, guard, time.now()) {
            time.pause();
        }
    })
}
