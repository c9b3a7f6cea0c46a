//! The byte stream a backend transmits.
//!
//! Color correction, brightness and dithering belong to whoever implements
//! [`PixelSource`]. Backends only pull 3 or 4 ready-to-send bytes per pixel, one
//! pixel at a time, so a frame is never materialized as a full color array.
//!
//! Two implementations ship with the crate:
//! - [`FramePixels`]: `RGB8` colors with color order, per-channel scale, temporal
//!   dithering and RGB → RGBW white derivation.
//! - [`RawBytes`]: bytes that are already in wire order and scaled.

use smart_leds::RGB8;

/// Lazily yields per-channel scaled bytes for a strip of pixels.
pub trait PixelSource {
    /// Number of pixels in the frame.
    fn size(&self) -> usize;

    /// Whether a pixel remains at the cursor.
    fn has_next(&self) -> bool;

    /// The pixel at the cursor as three bytes in wire order.
    fn next_scaled_rgb(&self) -> [u8; 3];

    /// The pixel at the cursor as four bytes in wire order (white last).
    fn next_scaled_rgbw(&self) -> [u8; 4];

    /// Move the cursor to the next pixel.
    fn advance(&mut self);

    /// Advance the temporal dither pattern. Called once per pixel.
    fn step_dithering(&mut self) {}
}

/// Number of channels on the wire per pixel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Channels {
    /// Three channels.
    #[default]
    Rgb,
    /// Four channels; the white byte is just a fourth 8-bit group.
    Rgbw,
}

impl Channels {
    /// Channels per pixel.
    #[must_use]
    pub const fn count(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgbw => 4,
        }
    }

    /// Encoded bits per pixel.
    #[must_use]
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            Self::Rgb => 24,
            Self::Rgbw => 32,
        }
    }
}

/// The bytes of one pixel in wire order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelBytes {
    bytes: [u8; 4],
    channels: Channels,
}

impl ChannelBytes {
    /// Read the pixel at the cursor of `pixels`.
    pub fn next_from<P: PixelSource + ?Sized>(pixels: &P, channels: Channels) -> Self {
        let bytes = match channels {
            Channels::Rgb => {
                let [c0, c1, c2] = pixels.next_scaled_rgb();
                [c0, c1, c2, 0]
            }
            Channels::Rgbw => pixels.next_scaled_rgbw(),
        };
        Self { bytes, channels }
    }

    /// The 3 or 4 bytes to transmit.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.bytes
            .get(..self.channels.count())
            .unwrap_or(&self.bytes)
    }
}

/// Order of the color channels on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ColorOrder {
    /// Red, green, blue.
    Rgb,
    /// Red, blue, green.
    Rbg,
    /// Green, red, blue (WS2812 native).
    #[default]
    Grb,
    /// Green, blue, red.
    Gbr,
    /// Blue, red, green.
    Brg,
    /// Blue, green, red.
    Bgr,
}

impl ColorOrder {
    /// Rearrange `[r, g, b]` into wire order.
    #[must_use]
    pub const fn arrange(self, [red, green, blue]: [u8; 3]) -> [u8; 3] {
        match self {
            Self::Rgb => [red, green, blue],
            Self::Rbg => [red, blue, green],
            Self::Grb => [green, red, blue],
            Self::Gbr => [green, blue, red],
            Self::Brg => [blue, red, green],
            Self::Bgr => [blue, green, red],
        }
    }
}

/// How the white channel of an RGBW pixel is derived from RGB.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WhiteMode {
    /// Move the common part of R, G and B into W. Color is preserved.
    #[default]
    ExactColors,
    /// Copy the common part into W and keep R, G and B. Brightest output.
    MaxBrightness,
    /// Leave W dark.
    NullWhite,
}

impl WhiteMode {
    /// Convert an RGB triple into RGBW.
    #[must_use]
    #[expect(clippy::arithmetic_side_effects, reason = "white <= every channel")]
    pub fn derive(self, [red, green, blue]: [u8; 3]) -> [u8; 4] {
        let white = red.min(green).min(blue);
        match self {
            Self::ExactColors => [red - white, green - white, blue - white, white],
            Self::MaxBrightness => [red, green, blue, white],
            Self::NullWhite => [red, green, blue, 0],
        }
    }
}

/// `i * (1 + scale) / 256`: full scale (255) is the identity.
#[must_use]
#[expect(clippy::arithmetic_side_effects, reason = "255 * 256 fits in u16")]
pub const fn scale8(value: u8, scale: u8) -> u8 {
    let scaled = (value as u16 * (1 + scale as u16)) >> 8;
    #[expect(clippy::cast_possible_truncation, reason = "scaled <= value")]
    let scaled_u8 = scaled as u8;
    scaled_u8
}

/// Full scale; brightness and color correction leave values untouched.
pub const SCALE_FULL: [u8; 3] = [255, 255, 255];

// Per-channel binary dither: `offset` is added to non-zero values before scaling
// and alternates between `offset` and `span - offset` from pixel to pixel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Dither {
    offset: [u8; 3],
    span: [u8; 3],
}

impl Dither {
    fn for_frame(frame_counter: u8, scale: [u8; 3]) -> Self {
        // Bit-reverse the low 3 bits of the counter into the top of the byte.
        let mut pattern = 0u8;
        if frame_counter & 0x01 != 0 {
            pattern |= 0x80;
        }
        if frame_counter & 0x02 != 0 {
            pattern |= 0x40;
        }
        if frame_counter & 0x04 != 0 {
            pattern |= 0x20;
        }

        let mut dither = Self::default();
        for ((offset, span), channel_scale) in dither
            .offset
            .iter_mut()
            .zip(dither.span.iter_mut())
            .zip(scale)
        {
            if channel_scale == 0 || channel_scale == u8::MAX {
                continue;
            }
            let full_span = (256 / u16::from(channel_scale)).saturating_add(1);
            let full_span = u8::try_from(full_span).unwrap_or(u8::MAX);
            *offset = scale8(pattern, full_span);
            *span = full_span.saturating_sub(1);
        }
        dither
    }

    fn step(&mut self) {
        for (offset, span) in self.offset.iter_mut().zip(self.span) {
            *offset = span.saturating_sub(*offset);
        }
    }
}

/// [`PixelSource`] over a slice of [`RGB8`] colors.
///
/// ```
/// use clockless_kit::pixel_source::{ColorOrder, FramePixels, PixelSource};
/// use smart_leds::RGB8;
///
/// let colors = [RGB8::new(1, 2, 3)];
/// let pixels = FramePixels::new(&colors, ColorOrder::Grb);
/// assert_eq!(pixels.next_scaled_rgb(), [2, 1, 3]);
/// ```
#[derive(Clone, Debug)]
pub struct FramePixels<'a> {
    colors: &'a [RGB8],
    index: usize,
    order: ColorOrder,
    scale: [u8; 3],
    dither: Dither,
    white: WhiteMode,
}

impl<'a> FramePixels<'a> {
    /// Unscaled, undithered pixels in `order`.
    #[must_use]
    pub const fn new(colors: &'a [RGB8], order: ColorOrder) -> Self {
        Self {
            colors,
            index: 0,
            order,
            scale: SCALE_FULL,
            dither: Dither {
                offset: [0; 3],
                span: [0; 3],
            },
            white: WhiteMode::ExactColors,
        }
    }

    /// Per-channel scale in RGB order (brightness × color correction).
    #[must_use]
    pub const fn with_scale(mut self, scale: [u8; 3]) -> Self {
        self.scale = scale;
        self
    }

    /// Enable temporal dithering for frame number `frame_counter`.
    ///
    /// Call after [`with_scale`](Self::with_scale). Full-scale channels are never dithered.
    #[must_use]
    pub fn with_dithering(mut self, frame_counter: u8) -> Self {
        self.dither = Dither::for_frame(frame_counter, self.scale);
        self
    }

    /// How [`PixelSource::next_scaled_rgbw`] derives the white channel.
    #[must_use]
    pub const fn with_white_mode(mut self, white: WhiteMode) -> Self {
        self.white = white;
        self
    }

    fn scaled(&self) -> [u8; 3] {
        let Some(color) = self.colors.get(self.index) else {
            return [0; 3];
        };
        let mut scaled = [color.r, color.g, color.b];
        for ((value, offset), channel_scale) in
            scaled.iter_mut().zip(self.dither.offset).zip(self.scale)
        {
            let dithered = if *value == 0 {
                0
            } else {
                value.saturating_add(offset)
            };
            *value = scale8(dithered, channel_scale);
        }
        scaled
    }
}

impl PixelSource for FramePixels<'_> {
    fn size(&self) -> usize {
        self.colors.len()
    }

    fn has_next(&self) -> bool {
        self.index < self.colors.len()
    }

    fn next_scaled_rgb(&self) -> [u8; 3] {
        self.order.arrange(self.scaled())
    }

    fn next_scaled_rgbw(&self) -> [u8; 4] {
        let [red, green, blue, white] = self.white.derive(self.scaled());
        let [c0, c1, c2] = self.order.arrange([red, green, blue]);
        [c0, c1, c2, white]
    }

    fn advance(&mut self) {
        self.index = self.index.saturating_add(1);
    }

    fn step_dithering(&mut self) {
        self.dither.step();
    }
}

/// [`PixelSource`] over bytes that are already scaled and in wire order.
#[derive(Clone, Debug)]
pub struct RawBytes<'a> {
    bytes: &'a [u8],
    channels: Channels,
    index: usize,
}

impl<'a> RawBytes<'a> {
    /// A trailing partial pixel is ignored.
    #[must_use]
    pub const fn new(bytes: &'a [u8], channels: Channels) -> Self {
        Self {
            bytes,
            channels,
            index: 0,
        }
    }

    fn byte(&self, channel: usize) -> u8 {
        self.index
            .checked_mul(self.channels.count())
            .and_then(|start| start.checked_add(channel))
            .and_then(|offset| self.bytes.get(offset))
            .copied()
            .unwrap_or(0)
    }
}

impl PixelSource for RawBytes<'_> {
    fn size(&self) -> usize {
        self.bytes.len() / self.channels.count()
    }

    fn has_next(&self) -> bool {
        self.index < self.size()
    }

    fn next_scaled_rgb(&self) -> [u8; 3] {
        [self.byte(0), self.byte(1), self.byte(2)]
    }

    fn next_scaled_rgbw(&self) -> [u8; 4] {
        [self.byte(0), self.byte(1), self.byte(2), self.byte(3)]
    }

    fn advance(&mut self) {
        self.index = self.index.saturating_add(1);
    }
}

/// Iterator over every byte a [`PixelSource`] yields, pixel by pixel.
#[derive(Clone, Debug)]
pub struct PixelBytes<P> {
    pixels: P,
    channels: Channels,
    current: Option<ChannelBytes>,
    channel: usize,
}

impl<P: PixelSource> PixelBytes<P> {
    /// Iterate the bytes of `pixels`.
    pub const fn new(pixels: P, channels: Channels) -> Self {
        Self {
            pixels,
            channels,
            current: None,
            channel: 0,
        }
    }

    /// Total bytes the source will yield.
    pub fn byte_count(&self) -> usize {
        self.pixels.size().saturating_mul(self.channels.count())
    }
}

impl<P: PixelSource> Iterator for PixelBytes<P> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        loop {
            if let Some(current) = &self.current {
                if let Some(&byte) = current.as_slice().get(self.channel) {
                    self.channel = self.channel.saturating_add(1);
                    return Some(byte);
                }
                self.current = None;
                self.pixels.advance();
                self.pixels.step_dithering();
            }
            if !self.pixels.has_next() {
                return None;
            }
            self.current = Some(ChannelBytes::next_from(&self.pixels, self.channels));
            self.channel = 0;
        }
    }
}
