//! Simulated hardware for running the backends on the host.
//!
//! Everything here is driven by one [`SimClock`]: a cycle counter that moves
//! forward a little every time it is read. Busy-waits therefore terminate, and
//! every recorded edge carries an exact cycle timestamp.
//!
//! - [`RecordingPin`]: an `OutputPin` that records edges and decodes them back
//!   into bytes.
//! - [`StallingGate`]: an [`InterruptGate`] that simulates a long interrupt
//!   between pixels.
//! - [`SimPwm`]: a PWM sequencer whose sequence-end interrupt fires once the
//!   sequence's airtime has passed.
//! - [`SimDma`]: a chained DMA engine that drains its ping-pong halves
//!   alternately and can fall behind a slow producer.

use core::cell::{Cell, RefCell};
use core::convert::Infallible;
use std::vec::Vec;

use embassy_time::Instant;
use embedded_hal::digital::{ErrorType, OutputPin};

use crate::backend::InterruptGate;
use crate::clock::{CycleClock, TimeSource, cycles_per_us};
use crate::timing::CycleTiming;

#[cfg(feature = "pwm")]
use crate::backend::pwm::{PwmCompletionIrq, PwmSequencer, PwmShared};
#[cfg(feature = "streaming-dma")]
use crate::backend::streaming_dma::{DmaShared, DmaStreamer, StreamContext};
#[cfg(feature = "streaming-dma")]
use crate::buffer::Half;
#[cfg(feature = "streaming-dma")]
use crate::encoder::WordLayout;

/// A simulated free-running cycle counter.
///
/// Each read through [`CycleClock::now`] or [`TimeSource::now`] first advances
/// the counter by `step` cycles.
#[derive(Debug)]
pub struct SimClock {
    cycles: Cell<u64>,
    step: u64,
    frequency_hz: u32,
}

impl SimClock {
    /// A counter at zero, advancing one cycle per read.
    #[must_use]
    pub const fn new(frequency_hz: u32) -> Self {
        Self {
            cycles: Cell::new(0),
            step: 1,
            frequency_hz,
        }
    }

    /// A counter starting at `start`, to exercise 32-bit wraparound.
    #[must_use]
    pub const fn starting_at(frequency_hz: u32, start: u64) -> Self {
        Self {
            cycles: Cell::new(start),
            step: 1,
            frequency_hz,
        }
    }

    /// Advance `step` cycles per read instead of one.
    #[must_use]
    pub const fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Current count, without advancing.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.cycles.get()
    }

    /// Jump forward.
    pub fn advance(&self, cycles: u64) {
        self.cycles.set(self.cycles.get().saturating_add(cycles));
    }

    /// Current count as an [`Instant`], without advancing.
    #[must_use]
    pub fn instant(&self) -> Instant {
        let per_us = u64::from(cycles_per_us(self.frequency_hz).max(1));
        Instant::from_micros(self.peek() / per_us)
    }

    /// Cycles in `ns` nanoseconds.
    #[must_use]
    pub fn cycles_in_ns(&self, ns: u64) -> u64 {
        ns.saturating_mul(u64::from(self.frequency_hz)) / 1_000_000_000
    }

    fn tick(&self) -> u64 {
        self.advance(self.step);
        self.peek()
    }
}

impl CycleClock for SimClock {
    #[expect(clippy::cast_possible_truncation, reason = "the hardware counter is 32 bits")]
    fn now(&self) -> u32 {
        self.tick() as u32
    }

    fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }
}

impl TimeSource for SimClock {
    fn now(&self) -> Instant {
        self.tick();
        self.instant()
    }

    fn pause(&self) {
        self.advance(u64::from(cycles_per_us(self.frequency_hz)));
    }
}

/// One level change on a [`RecordingPin`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Edge {
    /// Cycle count at the change.
    pub at: u64,
    /// New level.
    pub high: bool,
}

/// An output pin that records every level change with its cycle timestamp.
#[derive(Debug)]
pub struct RecordingPin<'c> {
    clock: &'c SimClock,
    level: Cell<bool>,
    edges: RefCell<Vec<Edge>>,
}

impl<'c> RecordingPin<'c> {
    /// A low pin timestamped by `clock`.
    #[must_use]
    pub const fn new(clock: &'c SimClock) -> Self {
        Self {
            clock,
            level: Cell::new(false),
            edges: RefCell::new(Vec::new()),
        }
    }

    /// Every recorded level change.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        self.edges.borrow().clone()
    }

    /// Forget recorded edges.
    pub fn clear(&self) {
        self.edges.borrow_mut().clear();
    }

    /// Current level.
    #[must_use]
    pub fn is_high(&self) -> bool {
        self.level.get()
    }

    fn set(&self, high: bool) {
        if self.level.replace(high) != high {
            self.edges.borrow_mut().push(Edge {
                at: self.clock.peek(),
                high,
            });
        }
    }

    /// Length of every high pulse, in cycles.
    #[must_use]
    pub fn high_times(&self) -> Vec<u64> {
        self.edges
            .borrow()
            .windows(2)
            .filter(|pair| pair[0].high && !pair[1].high)
            .map(|pair| pair[1].at - pair[0].at)
            .collect()
    }

    /// Low time between consecutive pulses, in cycles.
    #[must_use]
    pub fn low_gaps(&self) -> Vec<u64> {
        self.edges
            .borrow()
            .windows(2)
            .filter(|pair| !pair[0].high && pair[1].high)
            .map(|pair| pair[1].at - pair[0].at)
            .collect()
    }

    /// Rising-edge timestamps.
    #[must_use]
    pub fn rising_edges(&self) -> Vec<u64> {
        self.edges
            .borrow()
            .iter()
            .filter(|edge| edge.high)
            .map(|edge| edge.at)
            .collect()
    }

    /// Level at cycle `at`.
    #[must_use]
    pub fn level_at(&self, at: u64) -> bool {
        self.edges
            .borrow()
            .iter()
            .take_while(|edge| edge.at <= at)
            .last()
            .is_some_and(|edge| edge.high)
    }

    /// Decode bits by sampling every pulse between the `0` and `1` high times.
    ///
    /// Panics if a pulse is low at its `T1 / 2` sample point.
    #[must_use]
    pub fn decode_bits(&self, cycles: CycleTiming) -> Vec<bool> {
        let threshold = u64::from(cycles.t1) + u64::from(cycles.t2) / 2;
        self.rising_edges()
            .into_iter()
            .map(|rise| {
                assert!(
                    self.level_at(rise + u64::from(cycles.t1) / 2),
                    "pulse at {rise} is low at T1/2"
                );
                self.level_at(rise + threshold)
            })
            .collect()
    }

    /// Decode bytes, MSB first.
    #[must_use]
    pub fn decode_bytes(&self, cycles: CycleTiming) -> Vec<u8> {
        pack_bits(&self.decode_bits(cycles))
    }
}

impl ErrorType for &RecordingPin<'_> {
    type Error = Infallible;
}

impl OutputPin for &RecordingPin<'_> {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }
}

/// Pack bits into bytes, MSB first. A trailing partial byte is dropped.
#[must_use]
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks_exact(8)
        .map(|chunk| chunk.iter().fold(0u8, |byte, &bit| (byte << 1) | u8::from(bit)))
        .collect()
}

/// An [`InterruptGate`] that simulates interrupt latency between pixels.
#[derive(Debug)]
pub struct StallingGate<'c> {
    clock: &'c SimClock,
    windows: Cell<usize>,
    masked: Cell<usize>,
    stalls: RefCell<Vec<(usize, u64)>>,
    stall_every: Cell<Option<u64>>,
}

impl<'c> StallingGate<'c> {
    /// A gate that never stalls.
    #[must_use]
    pub const fn new(clock: &'c SimClock) -> Self {
        Self {
            clock,
            windows: Cell::new(0),
            masked: Cell::new(0),
            stalls: RefCell::new(Vec::new()),
            stall_every: Cell::new(None),
        }
    }

    /// Stall for `cycles` in the `window`-th interrupt window (0-based, counted
    /// across frames).
    #[must_use]
    pub fn stall_once(self, window: usize, cycles: u64) -> Self {
        self.stalls.borrow_mut().push((window, cycles));
        self
    }

    /// Stall for `cycles` in every interrupt window.
    #[must_use]
    pub fn stall_always(self, cycles: u64) -> Self {
        self.stall_every.set(Some(cycles));
        self
    }

    /// Interrupt windows opened so far.
    #[must_use]
    pub fn windows(&self) -> usize {
        self.windows.get()
    }

    /// Masked sections entered so far.
    #[must_use]
    pub fn masked_sections(&self) -> usize {
        self.masked.get()
    }
}

impl InterruptGate for StallingGate<'_> {
    fn run_masked<R>(&self, critical: impl FnOnce() -> R) -> R {
        self.masked.set(self.masked.get() + 1);
        critical()
    }

    fn service_pending(&self) {
        let window = self.windows.get();
        self.windows.set(window + 1);
        if let Some(cycles) = self.stall_every.get() {
            self.clock.advance(cycles);
        }
        let stall: u64 = self
            .stalls
            .borrow()
            .iter()
            .filter(|(at, _)| *at == window)
            .map(|(_, cycles)| cycles)
            .sum();
        self.clock.advance(stall);
    }
}

/// A PWM sequencer whose sequence-end interrupt fires when the simulated
/// sequence airtime has passed.
///
/// Hand `&SimPwm` to the backend both as its [`PwmSequencer`] and as its
/// [`TimeSource`]: waiting on the time source is what lets the sequence finish.
#[cfg(feature = "pwm")]
pub struct SimPwm<'a, const CAP: usize> {
    shared: &'a PwmShared<CAP>,
    clock: &'a SimClock,
    cycles_per_tick: u64,
    sequences: RefCell<Vec<(u16, Vec<u16>)>>,
    starts: RefCell<Vec<u64>>,
    ends_at: Cell<Option<u64>>,
    irq: RefCell<Vec<&'static str>>,
}

#[cfg(feature = "pwm")]
impl<'a, const CAP: usize> SimPwm<'a, CAP> {
    /// A sequencer clocked at `pwm_clock_hz`.
    #[must_use]
    pub fn new(shared: &'a PwmShared<CAP>, clock: &'a SimClock, pwm_clock_hz: u32) -> Self {
        Self {
            shared,
            clock,
            cycles_per_tick: u64::from(clock.frequency_hz() / pwm_clock_hz.max(1)).max(1),
            sequences: RefCell::new(Vec::new()),
            starts: RefCell::new(Vec::new()),
            ends_at: Cell::new(None),
            irq: RefCell::new(Vec::new()),
        }
    }

    /// Every played sequence with its counter top.
    #[must_use]
    pub fn sequences(&self) -> Vec<(u16, Vec<u16>)> {
        self.sequences.borrow().clone()
    }

    /// Cycle count at every start.
    #[must_use]
    pub fn starts(&self) -> Vec<u64> {
        self.starts.borrow().clone()
    }

    /// Interrupt-side calls in order.
    #[must_use]
    pub fn irq_log(&self) -> Vec<&'static str> {
        self.irq.borrow().clone()
    }

    /// Whether a sequence is playing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ends_at.get().is_some()
    }

    /// Jump to the end of the running sequence and fire its interrupt.
    pub fn run_to_completion(&self) {
        if let Some(end) = self.ends_at.get() {
            let now = self.clock.peek();
            self.clock.advance(end.saturating_sub(now));
            self.poll();
        }
    }

    fn poll(&self) {
        let Some(end) = self.ends_at.get() else {
            return;
        };
        if self.clock.peek() >= end {
            self.ends_at.set(None);
            let mut irq = SimPwmIrq { log: &self.irq };
            self.shared.on_sequence_end(&mut irq, self.clock.instant());
        }
    }
}

#[cfg(feature = "pwm")]
struct SimPwmIrq<'l> {
    log: &'l RefCell<Vec<&'static str>>,
}

#[cfg(feature = "pwm")]
impl PwmCompletionIrq for SimPwmIrq<'_> {
    fn disable(&mut self) {
        self.log.borrow_mut().push("disable");
    }

    fn clear_events(&mut self) {
        self.log.borrow_mut().push("clear_events");
    }
}

#[cfg(feature = "pwm")]
impl<const CAP: usize> PwmSequencer for &SimPwm<'_, CAP> {
    fn start(&mut self, top: u16, sequence: &[u16]) {
        assert!(!self.is_running(), "sequencer restarted while playing");
        let now = self.clock.peek();
        let airtime = (sequence.len() as u64)
            .saturating_mul(u64::from(top))
            .saturating_mul(self.cycles_per_tick);
        self.sequences.borrow_mut().push((top, sequence.to_vec()));
        self.starts.borrow_mut().push(now);
        self.ends_at.set(Some(now.saturating_add(airtime)));
    }
}

#[cfg(feature = "pwm")]
impl<const CAP: usize> TimeSource for SimPwm<'_, CAP> {
    fn now(&self) -> Instant {
        let now = TimeSource::now(self.clock);
        self.poll();
        now
    }

    fn pause(&self) {
        TimeSource::pause(self.clock);
        self.poll();
    }
}

#[cfg(feature = "streaming-dma")]
#[derive(Debug, Default)]
struct SimHalf {
    words: Vec<u32>,
    last: bool,
    fresh: bool,
}

#[cfg(feature = "streaming-dma")]
#[derive(Debug, Default)]
struct SimDmaState {
    context: Option<StreamContext>,
    reprograms: usize,
    halves: [SimHalf; 2],
    next: usize,
    running: bool,
    runs: Vec<Vec<u32>>,
    starts: Vec<u64>,
    violations: usize,
    stale: usize,
    halts: usize,
    burst_once: Option<usize>,
    burst_always: Option<usize>,
}

/// A chained DMA engine that drains its two halves alternately, A first,
/// advancing the clock by each half's airtime.
///
/// Each [`DmaStreamer::wait_event`] drains one half, or more to simulate a
/// producer that was preempted. A half that was not re-armed since it was last
/// sent is sent again, unless the drain interrupt asked for a halt.
#[cfg(feature = "streaming-dma")]
pub struct SimDma<'a, const WORDS: usize> {
    shared: &'a DmaShared<WORDS>,
    clock: &'a SimClock,
    bit_cycles: u64,
    state: RefCell<SimDmaState>,
}

#[cfg(feature = "streaming-dma")]
impl<'a, const WORDS: usize> SimDma<'a, WORDS> {
    /// An engine sending one bit every `bit_cycles` cycles of `clock`.
    #[must_use]
    pub fn new(shared: &'a DmaShared<WORDS>, clock: &'a SimClock, bit_cycles: u64) -> Self {
        Self {
            shared,
            clock,
            bit_cycles,
            state: RefCell::new(SimDmaState::default()),
        }
    }

    /// Drain `halves` halves back to back at the next event.
    pub fn preempt_once(&self, halves: usize) {
        self.state.borrow_mut().burst_once = Some(halves);
    }

    /// Drain `halves` halves back to back at every event.
    pub fn preempt_always(&self, halves: usize) {
        self.state.borrow_mut().burst_always = Some(halves);
    }

    /// Times the timers and descriptors were reprogrammed.
    #[must_use]
    pub fn reprograms(&self) -> usize {
        self.state.borrow().reprograms
    }

    /// The programmed context.
    #[must_use]
    pub fn context(&self) -> Option<StreamContext> {
        self.state.borrow().context
    }

    /// Halves re-armed before the hardware had sent them.
    #[must_use]
    pub fn violations(&self) -> usize {
        self.state.borrow().violations
    }

    /// Halves sent again without being re-armed.
    #[must_use]
    pub fn stale_sends(&self) -> usize {
        self.state.borrow().stale
    }

    /// Halts requested by the drain interrupt.
    #[must_use]
    pub fn halts(&self) -> usize {
        self.state.borrow().halts
    }

    /// Cycle count at every start.
    #[must_use]
    pub fn starts(&self) -> Vec<u64> {
        self.state.borrow().starts.clone()
    }

    /// Words sent after each start.
    #[must_use]
    pub fn runs(&self) -> Vec<Vec<u32>> {
        self.state.borrow().runs.clone()
    }

    /// Every word sent, in order.
    #[must_use]
    pub fn played(&self) -> Vec<u32> {
        self.state.borrow().runs.concat()
    }

    /// Forget sent words.
    pub fn clear_played(&self) {
        self.state.borrow_mut().runs.clear();
    }

    /// Bytes received by the lane on `pin_mask` in the latest run.
    #[must_use]
    pub fn lane_bytes(&self, pin_mask: u32) -> Vec<u8> {
        let state = self.state.borrow();
        let layout = match state.context.map(|context| context.words_per_bit) {
            Some(4) => WordLayout::FourPhase,
            _ => WordLayout::Compact,
        };
        let Some(run) = state.runs.last() else {
            return Vec::new();
        };
        let bits: Vec<bool> = run
            .chunks_exact(layout.words_per_bit())
            .map(|words| layout.zeros_of(words) & pin_mask == 0)
            .collect();
        pack_bits(&bits)
    }

    const fn slot(half: Half) -> usize {
        match half {
            Half::A => 0,
            Half::B => 1,
        }
    }

    const fn half(slot: usize) -> Half {
        if slot == 0 { Half::A } else { Half::B }
    }

    // Send the next half. Returns it with whether it ended the chain, or
    // `None` when the engine is idle.
    fn send_next(&self) -> Option<(Half, bool)> {
        let mut state = self.state.borrow_mut();
        if !state.running {
            return None;
        }
        let slot = state.next;
        let words_per_bit = state
            .context
            .map_or(1, |context| usize::from(context.words_per_bit.max(1)));
        let half = &mut state.halves[slot];
        let stale = !half.fresh;
        half.fresh = false;
        let last = half.last;
        let words = half.words.clone();
        if stale {
            state.stale += 1;
        }
        let bits = (words.len() / words_per_bit) as u64;
        self.clock.advance(bits * self.bit_cycles);
        if let Some(run) = state.runs.last_mut() {
            run.extend_from_slice(&words);
        }
        if last {
            state.running = false;
        } else {
            state.next = 1 - slot;
        }
        Some((Self::half(slot), last))
    }
}

#[cfg(feature = "streaming-dma")]
impl<const WORDS: usize> DmaStreamer for &SimDma<'_, WORDS> {
    fn reprogram(&mut self, context: &StreamContext) {
        let mut state = self.state.borrow_mut();
        assert!(!state.running, "reprogrammed while running");
        state.context = Some(*context);
        state.reprograms += 1;
    }

    fn arm(&mut self, half: Half, words: &[u32], last: bool) {
        let mut state = self.state.borrow_mut();
        let slot = &mut state.halves[SimDma::<WORDS>::slot(half)];
        let overwrite = slot.fresh;
        *slot = SimHalf {
            words: words.to_vec(),
            last,
            fresh: true,
        };
        if overwrite {
            state.violations += 1;
        }
    }

    fn start(&mut self) {
        let mut state = self.state.borrow_mut();
        state.running = true;
        state.next = 0;
        state.runs.push(Vec::new());
        state.starts.push(self.clock.peek());
    }

    fn stop(&mut self) {
        self.state.borrow_mut().running = false;
    }

    fn wait_event(&mut self) {
        let burst = {
            let mut state = self.state.borrow_mut();
            let once = state.burst_once.take();
            once.or(state.burst_always).unwrap_or(1)
        };
        for _ in 0..burst {
            match self.send_next() {
                None => return,
                Some((_, true)) => {
                    self.shared.on_chain_end(self.clock.instant());
                    return;
                }
                Some((half, false)) => {
                    if !self.shared.on_half_drained(half) {
                        let mut state = self.state.borrow_mut();
                        state.running = false;
                        state.halts += 1;
                        return;
                    }
                }
            }
        }
    }
}
