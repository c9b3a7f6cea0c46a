//! Streaming (chained) DMA backend for parallel lanes.
//!
//! Strips too long to encode whole are sent through a bounded ping-pong window.
//! Each half holds the next `window_bytes` bytes of every lane, transposed into
//! GPIO words (see [`WordLayout`]). Two timers generate the bit-start, T0H and
//! T1H edges, and a third DMA channel writes the words to the port's set/clear
//! registers. When the hardware has drained a half, its interrupt handler calls
//! [`DmaShared::on_half_drained`], and the transmit loop transposes the next
//! window into that half while the hardware drains the other one.
//!
//! If the hardware comes back to a half that was not refilled in time, the
//! handler halts the channel before the stale words go out. The frame is then
//! abandoned and resent from its first byte once the latch time has passed.
//!
//! The timers and descriptors hold one [`StreamContext`] at a time. A backend
//! reprograms them only when its context differs from the cached one.

use embassy_time::{Duration, Instant};
use heapless::Vec;
use portable_atomic::{AtomicU8, Ordering};

use crate::arbiter::{ArbiterToken, OwnerId, ResourceArbiter, TransmissionState};
use crate::backend::{MAX_RETRIES_DEFAULT, TransmissionBackend, acquire_after_latch};
use crate::buffer::{Half, PingPong, WordBuffer};
use crate::clock::TimeSource;
use crate::encoder::{MAX_LANES, WordLayout, zero_lanes};
use crate::frame_guard::FrameTimingGuard;
use crate::pixel_source::{Channels, PixelBytes, PixelSource};
use crate::timing::{TimingSpec, ns_to_ticks};
use crate::{Error, Result};

/// Timer compare values, in ticks of the timer clock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamTiming {
    /// Lanes sending `0` are cleared at this tick.
    pub t0h: u16,
    /// Every lane is cleared at this tick.
    pub t1h: u16,
    /// Bit period; every lane is set at tick 0.
    pub period: u16,
}

impl StreamTiming {
    /// Convert `timing` to ticks of a `timer_clock_hz` timer.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidTiming`] if an edge rounds to zero ticks or the edges are not ordered.
    /// - [`Error::PulseWidthOverflow`] if the period does not fit a 16-bit timer.
    pub fn new(timing: TimingSpec, timer_clock_hz: u32) -> Result<Self> {
        let t0h = ns_to_ticks(timing.pulse(false).high_ns, timer_clock_hz);
        let t1h = ns_to_ticks(timing.pulse(true).high_ns, timer_clock_hz);
        let period_ticks = ns_to_ticks(timing.period_ns(), timer_clock_hz);
        let Ok(period) = u16::try_from(period_ticks) else {
            return Err(Error::PulseWidthOverflow {
                period_ticks,
                register_bits: 16,
            });
        };
        if t0h == 0 || t1h <= t0h || t1h >= period_ticks {
            return Err(Error::InvalidTiming);
        }
        Ok(Self {
            t0h: u16::try_from(t0h).map_err(|_| Error::InvalidTiming)?,
            t1h: u16::try_from(t1h).map_err(|_| Error::InvalidTiming)?,
            period,
        })
    }
}

/// What the shared timers and DMA descriptors are programmed for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamContext {
    /// GPIO mask of every lane.
    pub pin_mask: u32,
    /// Number of lanes.
    pub lanes: u8,
    /// Address of the first ping-pong half.
    pub buffer: usize,
    /// Bytes per lane in the frame.
    pub byte_count: usize,
    /// GPIO words per encoded bit.
    pub words_per_bit: u8,
    /// Timer compare values.
    pub timer: StreamTiming,
}

/// Driver for the timers and chained DMA channels.
pub trait DmaStreamer {
    /// Program timers, pin list and descriptors for `context`.
    fn reprogram(&mut self, context: &StreamContext);

    /// Queue `words` as the next contents of `half`. With `last`, the chain
    /// ends after this half instead of linking to the other one.
    fn arm(&mut self, half: Half, words: &[u32], last: bool);

    /// Start the timers and the chain at half A.
    fn start(&mut self);

    /// Halt the timers and channels, leaving every lane low.
    fn stop(&mut self);

    /// Wait for the next DMA event. Called by the refill loop when nothing is pending.
    fn wait_event(&mut self) {
        core::hint::spin_loop();
    }
}

impl<S: DmaStreamer + ?Sized> DmaStreamer for &mut S {
    fn reprogram(&mut self, context: &StreamContext) {
        (**self).reprogram(context);
    }

    fn arm(&mut self, half: Half, words: &[u32], last: bool) {
        (**self).arm(half, words, last);
    }

    fn start(&mut self) {
        (**self).start();
    }

    fn stop(&mut self) {
        (**self).stop();
    }

    fn wait_event(&mut self) {
        (**self).wait_event();
    }
}

/// Arbiter-guarded state of a streaming DMA peripheral.
#[derive(Debug)]
pub struct DmaSlot<const WORDS: usize> {
    window: PingPong<WORDS>,
    context: Option<StreamContext>,
    previous_airtime: Duration,
}

impl<const WORDS: usize> DmaSlot<WORDS> {
    const fn new() -> Self {
        Self {
            window: PingPong::new(),
            context: None,
            previous_airtime: Duration::from_ticks(0),
        }
    }
}

const CHAIN_END: u8 = 1 << 0;
const UNDERRUN: u8 = 1 << 1;

// Per-half event bits.
#[derive(Clone, Copy)]
struct HalfEvents {
    // released by the hardware, not yet refilled
    drained: u8,
    // refilled since the hardware last sent it
    armed: u8,
    // the chain ends after this half
    last: u8,
}

impl HalfEvents {
    const fn of(half: Half) -> Self {
        match half {
            Half::A => Self {
                drained: 1 << 2,
                armed: 1 << 3,
                last: 1 << 4,
            },
            Half::B => Self {
                drained: 1 << 5,
                armed: 1 << 6,
                last: 1 << 7,
            },
        }
    }
}

// Events after the hardware has sent `half` and moves on to the other one.
const fn after_drain(events: u8, half: Half) -> u8 {
    let own = HalfEvents::of(half);
    let other = HalfEvents::of(half.other());
    let sent_fresh = events & own.armed != 0;
    let next_ready = events & own.last != 0 || events & other.armed != 0;
    let next = (events & !own.armed) | own.drained;
    if sent_fresh && next_ready {
        next
    } else {
        next | UNDERRUN
    }
}

/// State shared by every lane group driven through one streaming DMA peripheral.
///
/// `WORDS` is the capacity of each ping-pong half in GPIO words.
pub struct DmaShared<const WORDS: usize> {
    arbiter: ResourceArbiter<DmaSlot<WORDS>>,
    latch: FrameTimingGuard,
    starts: FrameTimingGuard,
    events: AtomicU8,
}

impl<const WORDS: usize> DmaShared<WORDS> {
    /// Shared state with a `latch_us` wait after every frame.
    #[must_use]
    pub const fn new(latch_us: u32) -> Self {
        Self {
            arbiter: ResourceArbiter::new(DmaSlot::new()),
            latch: FrameTimingGuard::from_micros(latch_us),
            starts: FrameTimingGuard::new(Duration::from_ticks(0)),
            events: AtomicU8::new(0),
        }
    }

    /// Phase of the peripheral.
    #[must_use]
    pub fn state(&self) -> TransmissionState {
        self.arbiter.state()
    }

    /// Lane group currently holding the peripheral.
    #[must_use]
    pub fn holder(&self) -> Option<OwnerId> {
        self.arbiter.holder()
    }

    /// Half-transfer interrupt: the hardware released `half`.
    ///
    /// Returns `false` when the half just sent, or the one the hardware moves
    /// on to, was not refilled in time. The handler must then halt the channel;
    /// the transmitting side abandons the frame.
    #[must_use = "halt the channel when this returns false"]
    pub fn on_half_drained(&self, half: Half) -> bool {
        let previous = match self.events.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |events| Some(after_drain(events, half)),
        ) {
            Ok(events) | Err(events) => events,
        };
        after_drain(previous, half) & UNDERRUN == 0
    }

    /// Transfer-complete interrupt: the final half has been sent.
    pub fn on_chain_end(&self, now: Instant) {
        self.latch.mark(now);
        self.arbiter.complete();
        self.events.fetch_or(CHAIN_END, Ordering::AcqRel);
    }

    fn reset_events(&self) {
        self.events.store(0, Ordering::Release);
    }

    fn mark_armed(&self, half: Half, last: bool) {
        let own = HalfEvents::of(half);
        let flags = if last { own.armed | own.last } else { own.armed };
        self.events.fetch_or(flags, Ordering::AcqRel);
    }

    fn take_drained(&self) -> Option<Half> {
        let events = self.events.load(Ordering::Acquire);
        let half = [Half::A, Half::B]
            .into_iter()
            .find(|&half| events & HalfEvents::of(half).drained != 0)?;
        self.events
            .fetch_and(!HalfEvents::of(half).drained, Ordering::AcqRel);
        Some(half)
    }

    fn chain_ended(&self) -> bool {
        self.events.load(Ordering::Acquire) & CHAIN_END != 0
    }

    fn underrun(&self) -> bool {
        self.events.load(Ordering::Acquire) & UNDERRUN != 0
    }
}

/// Configuration for [`StreamingDmaBackend`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamConfig {
    /// Bit timing.
    pub timing: TimingSpec,
    /// Frequency of the edge timers.
    pub timer_clock_hz: u32,
    /// GPIO word layout.
    pub layout: WordLayout,
    /// Largest lane, in pixels.
    pub max_pixels: usize,
    /// RGB or RGBW.
    pub channels: Channels,
    /// Whole-frame retries after a [`Error::RefillUnderrun`].
    pub max_retries: u8,
}

impl StreamConfig {
    /// Compact layout, RGB, one retry.
    #[must_use]
    pub const fn new(timing: TimingSpec, timer_clock_hz: u32, max_pixels: usize) -> Self {
        Self {
            timing,
            timer_clock_hz,
            layout: WordLayout::Compact,
            max_pixels,
            channels: Channels::Rgb,
            max_retries: MAX_RETRIES_DEFAULT,
        }
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the word layout.
    #[must_use]
    pub const fn with_layout(mut self, layout: WordLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the wire channels.
    #[must_use]
    pub const fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }
}

/// A group of up to 32 equally long lanes sent through a shared streaming DMA peripheral.
pub struct StreamingDmaBackend<'s, S, T, const WORDS: usize> {
    shared: &'s DmaShared<WORDS>,
    streamer: S,
    time: T,
    owner: OwnerId,
    config: StreamConfig,
    pins: Vec<u32, MAX_LANES>,
    timer: StreamTiming,
    window_bytes: usize,
}

impl<'s, S, T, const WORDS: usize> StreamingDmaBackend<'s, S, T, WORDS>
where
    S: DmaStreamer,
    T: TimeSource,
{
    /// Bind a lane group (one GPIO mask per lane) to a shared peripheral.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyLanes`] for zero or more than 32 pins.
    /// - [`Error::Configuration`] if a half cannot hold one byte of every lane.
    /// - [`Error::InvalidTiming`] or [`Error::PulseWidthOverflow`] from [`StreamTiming::new`].
    pub fn new(
        shared: &'s DmaShared<WORDS>,
        streamer: S,
        time: T,
        owner: OwnerId,
        pins: &[u32],
        config: StreamConfig,
    ) -> Result<Self> {
        if pins.is_empty() {
            return Err(Error::TooManyLanes);
        }
        let pins = Vec::from_slice(pins).map_err(|()| Error::TooManyLanes)?;
        let words_per_byte = config.layout.words_per_bit().saturating_mul(8);
        let window_bytes = WORDS / words_per_byte;
        if window_bytes == 0 {
            return Err(Error::Configuration {
                requested: words_per_byte,
                capacity: WORDS,
            });
        }
        let timer = StreamTiming::new(config.timing, config.timer_clock_hz)?;
        info!(
            "streaming dma {}: {=usize} lanes, window {=usize} bytes",
            owner,
            pins.len(),
            window_bytes
        );
        Ok(Self {
            shared,
            streamer,
            time,
            owner,
            config,
            pins,
            timer,
            window_bytes,
        })
    }

    /// Bytes of every lane held by one ping-pong half.
    #[must_use]
    pub const fn window_bytes(&self) -> usize {
        self.window_bytes
    }

    /// Timer compare values.
    #[must_use]
    pub const fn timer(&self) -> StreamTiming {
        self.timer
    }

    /// Send one frame on each lane; `lanes[i]` goes to the `i`-th pin.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyLanes`] for zero lanes or more lanes than pins.
    /// - [`Error::LaneMismatch`] if lanes differ in length.
    /// - [`Error::Configuration`] if a lane is longer than `max_pixels`.
    /// - [`Error::RefillUnderrun`] if every attempt let the hardware reach a
    ///   half before it was refilled.
    pub fn show_lanes<P: PixelSource + Clone>(&mut self, lanes: &[P]) -> Result<()> {
        let Some(first) = lanes.first() else {
            return Err(Error::TooManyLanes);
        };
        if lanes.len() > self.pins.len() {
            return Err(Error::TooManyLanes);
        }
        let pixels = first.size();
        if let Some(other) = lanes.iter().find(|lane| lane.size() != pixels) {
            return Err(Error::LaneMismatch {
                expected: pixels,
                found: other.size(),
            });
        }
        if pixels > self.config.max_pixels {
            return Err(Error::Configuration {
                requested: pixels,
                capacity: self.config.max_pixels,
            });
        }
        if pixels == 0 {
            return Ok(());
        }

        let lane_pins: Vec<u32, MAX_LANES> = self.pins.iter().copied().take(lanes.len()).collect();
        let all = lane_pins.iter().fold(0, |mask, pin| mask | pin);
        let layout = self.config.layout;
        let byte_count = pixels.saturating_mul(self.config.channels.count());

        let mut token = acquire_after_latch(
            &self.shared.arbiter,
            &self.shared.latch,
            &self.time,
            self.owner,
        );

        let context = StreamContext {
            pin_mask: all,
            lanes: u8::try_from(lane_pins.len()).map_err(|_| Error::TooManyLanes)?,
            buffer: token.window.half(Half::A).address(),
            byte_count,
            words_per_bit: u8::try_from(layout.words_per_bit()).unwrap_or(u8::MAX),
            timer: self.timer,
        };
        if token.context != Some(context) {
            debug!("streaming dma {}: reprogram", self.owner);
            self.streamer.reprogram(&context);
            token.context = Some(context);
        }

        let mut retries: u8 = 0;
        loop {
            match self.stream_frame(&mut token, lanes, &lane_pins, byte_count) {
                Err(Error::RefillUnderrun) if retries < self.config.max_retries => {
                    retries = retries.saturating_add(1);
                    warn!("streaming dma {}: refill underrun; retry {=u8}", self.owner, retries);
                    self.shared.latch.wait(&self.time);
                }
                Err(err) => {
                    error!("streaming dma {}: frame failed: {}", self.owner, err);
                    return Err(err);
                }
                Ok(()) => return Ok(()),
            }
        }
    }

    // One attempt at the whole frame. On an underrun the hardware is already
    // halted; the arbiter is left latching.
    fn stream_frame<P: PixelSource + Clone>(
        &mut self,
        token: &mut ArbiterToken<'s, DmaSlot<WORDS>>,
        lanes: &[P],
        lane_pins: &[u32],
        byte_count: usize,
    ) -> Result<()> {
        let channels = self.config.channels;
        let mut readers: Vec<PixelBytes<P>, MAX_LANES> = lanes
            .iter()
            .map(|lane| PixelBytes::new(lane.clone(), channels))
            .collect();
        let airtime = self
            .config
            .timing
            .airtime(byte_count.saturating_mul(8));

        self.shared.reset_events();
        let mut remaining = byte_count;
        let mut chain_closed = false;
        for half in [Half::A, Half::B] {
            if chain_closed {
                break;
            }
            chain_closed = self.refill(token, half, &mut readers, lane_pins, &mut remaining);
        }

        // The shared peripheral may just have finished another group's frame.
        self.shared
            .starts
            .wait_for(&self.time, token.previous_airtime);
        token.previous_airtime = airtime;
        token.mark_in_flight();
        self.shared.starts.mark(self.time.now());
        self.streamer.start();

        loop {
            if self.shared.underrun() {
                self.streamer.stop();
                self.shared.latch.mark(self.time.now());
                self.shared.arbiter.complete();
                return Err(Error::RefillUnderrun);
            }
            if self.shared.chain_ended() {
                trace!("streaming dma {}: chain end", self.owner);
                return Ok(());
            }
            let Some(half) = self.shared.take_drained() else {
                self.streamer.wait_event();
                continue;
            };
            if !chain_closed {
                chain_closed = self.refill(token, half, &mut readers, lane_pins, &mut remaining);
            }
        }
    }

    // Transpose the next window into `half` and hand it to the hardware.
    // Returns whether this closed the chain.
    fn refill<P: PixelSource>(
        &mut self,
        token: &mut ArbiterToken<'s, DmaSlot<WORDS>>,
        half: Half,
        readers: &mut [PixelBytes<P>],
        lane_pins: &[u32],
        remaining: &mut usize,
    ) -> bool {
        let take = (*remaining).min(self.window_bytes);
        *remaining = remaining.saturating_sub(take);
        let last = *remaining == 0;
        let all = lane_pins.iter().fold(0, |mask, pin| mask | pin);
        let words = token.window.half_mut(half);
        fill_half(words, readers, lane_pins, all, self.config.layout, take);
        let (shared, streamer) = (self.shared, &mut self.streamer);
        // The handler must never see the half armed before its descriptor is.
        critical_section::with(|_| {
            shared.mark_armed(half, last);
            streamer.arm(half, words.as_slice(), last);
        });
        last
    }
}

// Transpose the next `bytes` bytes of every lane into GPIO words.
fn fill_half<P: PixelSource, const WORDS: usize>(
    words: &mut WordBuffer<WORDS>,
    readers: &mut [PixelBytes<P>],
    pins: &[u32],
    all: u32,
    layout: WordLayout,
    bytes: usize,
) {
    words.clear();
    let mut column: Vec<u8, MAX_LANES> = Vec::new();
    for _ in 0..bytes {
        column.clear();
        for reader in readers.iter_mut() {
            // capacity equals MAX_LANES and readers.len() <= MAX_LANES
            let _ = column.push(reader.next().unwrap_or(0));
        }
        for bit in (0..8u8).rev() {
            let zeros = zero_lanes(pins.iter().copied().zip(column.iter().copied()), bit);
            let written = layout.write_bit(all, zeros, words.spare_mut());
            words.commit(written);
        }
    }
}

impl<'s, S, T, const WORDS: usize> TransmissionBackend for StreamingDmaBackend<'s, S, T, WORDS>
where
    S: DmaStreamer,
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

    /// Send `pixels` on the first lane.
    fn show<P: PixelSource + Clone>(&mut self, pixels: &P) -> Result<()> {
        self.show_lanes(core::slice::from_ref(pixels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel_source::{Channels, RawBytes};

    #[test]
    fn stream_timing_at_16_mhz() {
        let timing = TimingSpec::new(350, 350, 550).unwrap();
        assert_eq!(
            StreamTiming::new(timing, 16_000_000),
            Ok(StreamTiming {
                t0h: 6,
                t1h: 11,
                period: 20
            })
        );
        // 90 us at 1 GHz needs more than 16 bits
        let slow = TimingSpec::new(30_000, 30_000, 30_000).unwrap();
        assert!(matches!(
            StreamTiming::new(slow, 1_000_000_000),
            Err(Error::PulseWidthOverflow { .. })
        ));
    }

    #[test]
    fn fill_half_transposes_lanes() {
        let lane_a = RawBytes::new(&[0x80, 0, 0], Channels::Rgb);
        let lane_b = RawBytes::new(&[0x01, 0, 0], Channels::Rgb);
        let mut readers = [
            PixelBytes::new(lane_a, Channels::Rgb),
            PixelBytes::new(lane_b, Channels::Rgb),
        ];
        let pins = [1 << 2, 1 << 5];
        let mut words: WordBuffer<16> = WordBuffer::new(0);
        fill_half(&mut words, &mut readers, &pins, 0b100100, WordLayout::Compact, 1);
        assert_eq!(words.len(), 8);
        // MSB: lane a sends 1, lane b sends 0
        assert_eq!(words.as_slice()[0], 1 << 5);
        assert_eq!(words.as_slice()[1], (1 << 2) | (1 << 5));
        // LSB: lane a sends 0, lane b sends 1
        assert_eq!(words.as_slice()[7], 1 << 2);
    }

    #[test]
    fn drained_halves_are_taken_once() {
        let shared: DmaShared<8> = DmaShared::new(50);
        shared.mark_armed(Half::A, false);
        shared.mark_armed(Half::B, false);
        assert_eq!(shared.take_drained(), None);
        assert!(shared.on_half_drained(Half::A));
        shared.mark_armed(Half::A, true);
        assert!(shared.on_half_drained(Half::B));
        assert_eq!(shared.take_drained(), Some(Half::A));
        assert_eq!(shared.take_drained(), Some(Half::B));
        assert_eq!(shared.take_drained(), None);
        assert!(!shared.underrun());
        assert!(!shared.chain_ended());
        shared.on_chain_end(Instant::from_micros(0));
        assert!(shared.chain_ended());
    }

    #[test]
    fn unrefilled_half_is_an_underrun() {
        let shared: DmaShared<8> = DmaShared::new(50);
        shared.mark_armed(Half::A, false);
        shared.mark_armed(Half::B, false);
        assert!(shared.on_half_drained(Half::A));
        // A was not refilled before B finished.
        assert!(!shared.on_half_drained(Half::B));
        assert!(shared.underrun());

        shared.reset_events();
        shared.mark_armed(Half::A, false);
        shared.mark_armed(Half::B, true);
        assert!(shared.on_half_drained(Half::A));
        // B ends the chain, so A is not needed again.
        assert!(shared.on_half_drained(Half::B));
        assert!(!shared.underrun());
    }

    #[test]
    fn stale_half_is_an_underrun() {
        let shared: DmaShared<8> = DmaShared::new(50);
        shared.mark_armed(Half::B, false);
        assert!(!shared.on_half_drained(Half::A));
    }
}
