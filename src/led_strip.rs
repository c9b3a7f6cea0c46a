//! A device abstraction for one NeoPixel-style (WS2812) LED strip.
//!
//! [`LedStrip`] owns a [`TransmissionBackend`] and turns `RGB8` frames into
//! [`FramePixels`] with the strip's color order, brightness, color correction,
//! white mode and temporal dithering applied on the fly.
//!
//! # Example: Budget Current
//!
//! A 16-LED strip draws up to 960 mA at full white. A 250 mA budget caps the
//! brightness at about a quarter:
//!
//! ```
//! use clockless_kit::led_strip::Current;
//!
//! assert_eq!(Current::Milliamps(250).max_brightness_for(16), 66);
//! assert_eq!(Current::Unlimited.max_brightness_for(16), 255);
//! ```

/// Predefined RGB color constants from the `smart_leds` crate.
///
/// Common colors include `RED`, `GREEN`, `BLUE`, `YELLOW`, `WHITE`, `BLACK`, `CYAN`, `MAGENTA`, `ORANGE`, `PURPLE`.
#[doc(inline)]
pub use smart_leds::colors;

use core::ops::{Deref, DerefMut};

use smart_leds::RGB8;

use crate::Result;
use crate::arbiter::TransmissionState;
use crate::backend::TransmissionBackend;
use crate::pixel_source::{ColorOrder, FramePixels, SCALE_FULL, WhiteMode, scale8};

/// RGB color representation re-exported from the `smart_leds` crate.
pub type Rgb = RGB8;

/// Worst-case draw of one LED at full white.
pub const MILLIAMPS_PER_LED: u32 = 60;

/// [`Rgb`] pixel data for an LED strip.
///
/// Frames deref to `[Rgb; N]`, so you can mutate pixels directly before passing them to [`LedStrip::write_frame`].
#[derive(Clone, Copy, Debug)]
pub struct Frame1d<const N: usize>(pub [Rgb; N]);

impl<const N: usize> Frame1d<N> {
    /// Number of LEDs in this frame.
    pub const LEN: usize = N;

    /// Create a new blank (all black) frame.
    #[must_use]
    pub const fn new() -> Self {
        Self([Rgb::new(0, 0, 0); N])
    }

    /// Create a frame filled with a single color.
    #[must_use]
    pub const fn filled(color: Rgb) -> Self {
        Self([color; N])
    }
}

impl<const N: usize> Deref for Frame1d<N> {
    type Target = [Rgb; N];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> DerefMut for Frame1d<N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<const N: usize> From<[Rgb; N]> for Frame1d<N> {
    fn from(array: [Rgb; N]) -> Self {
        Self(array)
    }
}

impl<const N: usize> Default for Frame1d<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Power budget for a strip, turned into a brightness cap.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Current {
    /// Limit brightness so that every LED at full white stays within this many milliamps.
    Milliamps(u16),
    /// No limit.
    Unlimited,
}

impl Default for Current {
    fn default() -> Self {
        Self::Milliamps(250)
    }
}

impl Current {
    /// Brightness cap for a worst-case draw of `worst_case_ma`.
    #[must_use]
    pub const fn max_brightness(self, worst_case_ma: u32) -> u8 {
        match self {
            Self::Milliamps(_) if worst_case_ma == 0 => u8::MAX,
            Self::Milliamps(ma) => {
                let scale = (ma as u32).saturating_mul(255) / worst_case_ma;
                if scale > 255 { u8::MAX } else { scale as u8 }
            }
            Self::Unlimited => u8::MAX,
        }
    }

    /// Brightness cap for `len` LEDs at [`MILLIAMPS_PER_LED`].
    #[must_use]
    pub const fn max_brightness_for(self, len: usize) -> u8 {
        let len = if len > u32::MAX as usize { u32::MAX } else { len as u32 };
        self.max_brightness(len.saturating_mul(MILLIAMPS_PER_LED))
    }
}

/// One strip and the backend that drives it.
///
/// ```ignore
/// let backend = BangBackend::new(pin, DwtClock::new(64_000_000), SystemClock, BangConfig::default())?;
/// let mut strip = LedStrip::new(backend)
///     .with_current_limit(Current::Milliamps(500), 30)
///     .with_dithering(true);
/// strip.write_frame(&Frame1d::<30>::filled(colors::ORANGE)[..])?;
/// ```
pub struct LedStrip<B> {
    backend: B,
    order: ColorOrder,
    brightness: u8,
    correction: [u8; 3],
    white: WhiteMode,
    dithering: bool,
    frame_counter: u8,
}

impl<B: TransmissionBackend> LedStrip<B> {
    /// A GRB strip at full brightness, without dithering.
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            order: ColorOrder::Grb,
            brightness: u8::MAX,
            correction: SCALE_FULL,
            white: WhiteMode::ExactColors,
            dithering: false,
            frame_counter: 0,
        }
    }

    /// Set the wire color order.
    #[must_use]
    pub const fn with_order(mut self, order: ColorOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the global brightness.
    #[must_use]
    pub const fn with_brightness(mut self, brightness: u8) -> Self {
        self.brightness = brightness;
        self
    }

    /// Cap brightness so `len` LEDs stay within `current`.
    #[must_use]
    pub const fn with_current_limit(mut self, current: Current, len: usize) -> Self {
        let cap = current.max_brightness_for(len);
        if cap < self.brightness {
            self.brightness = cap;
        }
        self
    }

    /// Per-channel color correction in RGB order.
    #[must_use]
    pub const fn with_correction(mut self, correction: [u8; 3]) -> Self {
        self.correction = correction;
        self
    }

    /// How RGBW strips derive their white channel.
    #[must_use]
    pub const fn with_white_mode(mut self, white: WhiteMode) -> Self {
        self.white = white;
        self
    }

    /// Spread the rounding error of dim channels over successive frames.
    #[must_use]
    pub const fn with_dithering(mut self, dithering: bool) -> Self {
        self.dithering = dithering;
        self
    }

    /// Combined brightness and correction, per channel in RGB order.
    #[must_use]
    pub const fn scale(&self) -> [u8; 3] {
        let [red, green, blue] = self.correction;
        [
            scale8(red, self.brightness),
            scale8(green, self.brightness),
            scale8(blue, self.brightness),
        ]
    }

    /// Frames written with dithering so far, modulo 256.
    #[must_use]
    pub const fn frame_counter(&self) -> u8 {
        self.frame_counter
    }

    /// Phase of the backend.
    #[must_use]
    pub fn state(&self) -> TransmissionState {
        self.backend.state()
    }

    /// The backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably.
    pub const fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Give back the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Whatever the backend's [`show`](TransmissionBackend::show) reports. A
    /// [`TimingOverrun`](crate::Error::TimingOverrun) only arrives once the
    /// backend's retries are used up.
    pub fn write_frame(&mut self, colors: &[Rgb]) -> Result<()> {
        let mut pixels = FramePixels::new(colors, self.order)
            .with_scale(self.scale())
            .with_white_mode(self.white);
        if self.dithering {
            pixels = pixels.with_dithering(self.frame_counter);
            self.frame_counter = self.frame_counter.wrapping_add(1);
        }
        self.backend.show(&pixels)
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::pixel_source::{Channels, PixelBytes, PixelSource};

    #[derive(Default)]
    struct CapturingBackend {
        frames: Vec<Vec<u8>>,
    }

    impl TransmissionBackend for CapturingBackend {
        fn max_pixels(&self) -> usize {
            usize::MAX
        }

        fn channels(&self) -> Channels {
            Channels::Rgb
        }

        fn state(&self) -> TransmissionState {
            TransmissionState::Idle
        }

        fn show<P: PixelSource + Clone>(&mut self, pixels: &P) -> Result<()> {
            self.frames
                .push(PixelBytes::new(pixels.clone(), Channels::Rgb).collect());
            Ok(())
        }
    }

    #[test]
    fn frame_is_sent_in_wire_order() {
        let mut strip = LedStrip::new(CapturingBackend::default());
        strip.write_frame(&[Rgb::new(1, 2, 3), Rgb::new(4, 5, 6)]).unwrap();
        assert_eq!(strip.backend().frames, [[2, 1, 3, 5, 4, 6]]);
    }

    #[test]
    fn brightness_and_correction_combine() {
        let strip = LedStrip::new(CapturingBackend::default())
            .with_brightness(128)
            .with_correction([255, 128, 0]);
        assert_eq!(strip.scale(), [128, 64, 0]);
    }

    #[test]
    fn current_limit_only_lowers_brightness() {
        let strip = LedStrip::new(CapturingBackend::default())
            .with_brightness(10)
            .with_current_limit(Current::Milliamps(250), 16);
        assert_eq!(strip.scale(), [10, 10, 10]);

        let strip = LedStrip::new(CapturingBackend::default())
            .with_current_limit(Current::Milliamps(250), 16);
        assert_eq!(strip.scale(), [66, 66, 66]);
    }

    #[test]
    fn current_budget_math() {
        assert_eq!(Current::Milliamps(960).max_brightness(960), 255);
        assert_eq!(Current::Milliamps(2_000).max_brightness(960), 255);
        assert_eq!(Current::Milliamps(480).max_brightness(960), 127);
        assert_eq!(Current::Milliamps(100).max_brightness(0), 255);
        assert_eq!(Current::default(), Current::Milliamps(250));
    }

    #[test]
    fn dithering_counts_frames() {
        let mut strip = LedStrip::new(CapturingBackend::default())
            .with_order(ColorOrder::Rgb)
            .with_brightness(100)
            .with_dithering(true);
        let frame = Frame1d::<4>::filled(Rgb::new(1, 1, 1));
        for _ in 0..4 {
            strip.write_frame(&frame[..]).unwrap();
        }
        assert_eq!(strip.frame_counter(), 4);
        assert_eq!(strip.backend().frames.len(), 4);
    }

    #[test]
    fn frame1d_helpers() {
        let mut frame = Frame1d::<3>::new();
        frame[1] = colors::RED;
        assert_eq!(Frame1d::<3>::LEN, 3);
        assert_eq!(frame[1], Rgb::new(255, 0, 0));
        assert_eq!(Frame1d::from([colors::BLUE; 2])[0], colors::BLUE);
    }
}
