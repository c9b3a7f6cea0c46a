#![allow(missing_docs)]
//! Streaming DMA backend on a simulated chained DMA engine.

use clockless_kit::arbiter::{OwnerId, TransmissionState};
use clockless_kit::backend::TransmissionBackend;
use clockless_kit::backend::streaming_dma::{DmaShared, StreamConfig, StreamingDmaBackend};
use clockless_kit::encoder::WordLayout;
use clockless_kit::pixel_source::{Channels, RawBytes};
use clockless_kit::sim::{SimClock, SimDma};
use clockless_kit::timing::TimingSpec;
use clockless_kit::Error;

const CPU_HZ: u32 = 64_000_000;
const TIMER_HZ: u32 = 16_000_000;
const LATCH_US: u32 = 280;
// 1250 ns per bit at 64 MHz
const BIT_CYCLES: u64 = 80;
// 8 bytes of every lane per half with the compact layout
const WORDS: usize = 64;
const PINS: [u32; 3] = [1 << 2, 1 << 5, 1 << 9];

fn config(max_pixels: usize) -> StreamConfig {
    StreamConfig::new(TimingSpec::new(350, 350, 550).unwrap(), TIMER_HZ, max_pixels)
}

fn lane(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|index| seed.wrapping_mul(31).wrapping_add(u8::try_from(index).unwrap()))
        .collect()
}

#[test]
fn three_lanes_stream_through_the_window() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS, config(10)).unwrap();
    assert_eq!(backend.window_bytes(), 8);

    // 30 bytes per lane: four refills of an 8-byte window
    let bytes = [lane(1, 30), lane(2, 30), lane(3, 30)];
    let lanes = bytes.each_ref().map(|lane| RawBytes::new(lane, Channels::Rgb));
    backend.show_lanes(&lanes).unwrap();

    for (pin, expected) in PINS.iter().zip(&bytes) {
        assert_eq!(&sim.lane_bytes(*pin), expected);
    }
    assert_eq!(sim.played().len(), 30 * 8);
    assert_eq!(sim.violations(), 0);
    assert_eq!(sim.reprograms(), 1);
    assert_eq!(shared.state(), TransmissionState::Latching);

    let context = sim.context().unwrap();
    assert_eq!(context.pin_mask, PINS[0] | PINS[1] | PINS[2]);
    assert_eq!(context.lanes, 3);
    assert_eq!(context.byte_count, 30);
    assert_eq!(context.timer.period, 20);
}

#[test]
fn unchanged_context_is_not_reprogrammed() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS, config(10)).unwrap();
    let bytes = [lane(4, 12), lane(5, 12)];
    let lanes = bytes.each_ref().map(|lane| RawBytes::new(lane, Channels::Rgb));

    backend.show_lanes(&lanes).unwrap();
    backend.show_lanes(&lanes).unwrap();
    assert_eq!(sim.reprograms(), 1);

    // Dropping a lane changes the pin mask.
    backend.show_lanes(&lanes[..1]).unwrap();
    assert_eq!(sim.reprograms(), 2);
    assert_eq!(sim.context().unwrap().pin_mask, PINS[0]);
}

#[test]
fn frames_are_spaced_by_airtime_and_latch() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS, config(10)).unwrap();
    let bytes = lane(6, 30);
    let frame = RawBytes::new(&bytes, Channels::Rgb);

    backend.show(&frame).unwrap();
    backend.show(&frame).unwrap();

    let starts = sim.starts();
    let airtime = 30 * 8 * BIT_CYCLES;
    let latch = u64::from(LATCH_US) * u64::from(CPU_HZ / 1_000_000);
    assert!(starts[1] - starts[0] >= airtime + latch);
}

#[test]
fn show_after_the_latch_starts_at_once() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS, config(10)).unwrap();
    let bytes = lane(6, 30);
    let frame = RawBytes::new(&bytes, Channels::Rgb);

    backend.show(&frame).unwrap();
    clock.advance(u64::from(LATCH_US + 1) * u64::from(CPU_HZ / 1_000_000));
    let requested_at = clock.peek();
    backend.show(&frame).unwrap();

    // well under a microsecond of bookkeeping, no second latch wait
    assert!(sim.starts()[1] - requested_at < u64::from(CPU_HZ / 1_000_000));
    assert_eq!(sim.lane_bytes(PINS[0]), bytes);
}

#[test]
fn late_refill_halts_and_resends_the_frame() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS[..1], config(10))
            .unwrap();
    let bytes = lane(13, 30);
    // The transmit loop misses A's refill: the engine finishes A and B, and
    // would come back to A's old window.
    sim.preempt_once(3);

    backend.show(&RawBytes::new(&bytes, Channels::Rgb)).unwrap();

    let runs = sim.runs();
    assert_eq!(runs.len(), 2);
    // The aborted run stopped after two windows, before any stale word.
    assert_eq!(runs[0].len(), 16 * 8);
    assert_eq!(sim.stale_sends(), 0);
    assert_eq!(sim.halts(), 1);
    assert_eq!(sim.lane_bytes(PINS[0]), bytes);
    assert_eq!(sim.violations(), 0);

    // The resent frame started after a full latch.
    let starts = sim.starts();
    let sent = 16 * 8 * BIT_CYCLES;
    let latch = u64::from(LATCH_US) * u64::from(CPU_HZ / 1_000_000);
    assert!(starts[1] - starts[0] >= sent + latch);
    assert_eq!(shared.state(), TransmissionState::Latching);
}

#[test]
fn underrun_surfaces_once_retries_are_exhausted() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let config = config(10).with_max_retries(2);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS[..1], config).unwrap();
    let bytes = lane(14, 30);
    sim.preempt_always(2);

    let result = backend.show(&RawBytes::new(&bytes, Channels::Rgb));

    assert_eq!(result, Err(Error::RefillUnderrun));
    assert!(Error::RefillUnderrun.is_transient());
    assert_eq!(sim.starts().len(), 3);
    assert_eq!(sim.halts(), 3);
    assert_eq!(sim.stale_sends(), 0);
    // The peripheral is released through the normal latch.
    assert_eq!(shared.state(), TransmissionState::Latching);
    assert_eq!(shared.holder(), Some(OwnerId(1)));
}

#[test]
fn frames_within_two_windows_survive_a_burst() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS[..1], config(10))
            .unwrap();
    let bytes = lane(15, 12);
    sim.preempt_once(2);

    backend.show(&RawBytes::new(&bytes, Channels::Rgb)).unwrap();

    assert_eq!(sim.runs().len(), 1);
    assert_eq!(sim.lane_bytes(PINS[0]), bytes);
    assert_eq!(sim.halts(), 0);
}

#[test]
fn two_groups_share_one_peripheral() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut left =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS[..1], config(4))
            .unwrap();
    let mut right =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(2), &PINS[1..], config(4))
            .unwrap();
    let left_bytes = lane(7, 9);
    let right_bytes = [lane(8, 9), lane(9, 9)];

    left.show(&RawBytes::new(&left_bytes, Channels::Rgb)).unwrap();
    assert_eq!(sim.lane_bytes(PINS[0]), left_bytes);
    sim.clear_played();

    let lanes = right_bytes.each_ref().map(|lane| RawBytes::new(lane, Channels::Rgb));
    right.show_lanes(&lanes).unwrap();
    assert_eq!(sim.lane_bytes(PINS[1]), right_bytes[0]);
    assert_eq!(sim.lane_bytes(PINS[2]), right_bytes[1]);
    assert_eq!(shared.holder(), Some(OwnerId(2)));
    assert_eq!(sim.reprograms(), 2);
    assert_eq!(sim.violations(), 0);
}

#[test]
fn four_phase_layout() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let config = config(4).with_layout(WordLayout::FourPhase);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS[..2], config).unwrap();
    assert_eq!(backend.window_bytes(), 2);

    let bytes = [lane(10, 6), lane(11, 6)];
    let lanes = bytes.each_ref().map(|lane| RawBytes::new(lane, Channels::Rgb));
    backend.show_lanes(&lanes).unwrap();

    assert_eq!(sim.played().len(), 6 * 8 * 4);
    assert_eq!(sim.lane_bytes(PINS[0]), bytes[0]);
    assert_eq!(sim.lane_bytes(PINS[1]), bytes[1]);
    assert_eq!(sim.violations(), 0);
}

#[test]
fn rgbw_lanes() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let config = config(4).with_channels(Channels::Rgbw);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS[..1], config).unwrap();

    let bytes = lane(12, 12);
    backend.show(&RawBytes::new(&bytes, Channels::Rgbw)).unwrap();

    assert_eq!(sim.lane_bytes(PINS[0]), bytes);
}

#[test]
fn lane_errors_are_reported_before_hardware() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let mut backend =
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &PINS, config(4)).unwrap();
    let short = [0u8; 6];
    let long = [0u8; 9];
    let too_long = [0u8; 15];

    assert_eq!(
        backend.show_lanes(&[
            RawBytes::new(&short, Channels::Rgb),
            RawBytes::new(&long, Channels::Rgb),
        ]),
        Err(Error::LaneMismatch {
            expected: 2,
            found: 3
        })
    );
    assert_eq!(
        backend.show_lanes(&vec![RawBytes::new(&short, Channels::Rgb); 4]),
        Err(Error::TooManyLanes)
    );
    assert_eq!(
        backend.show_lanes::<RawBytes<'_>>(&[]),
        Err(Error::TooManyLanes)
    );
    assert_eq!(
        backend.show(&RawBytes::new(&too_long, Channels::Rgb)),
        Err(Error::Configuration {
            requested: 5,
            capacity: 4
        })
    );
    assert_eq!(backend.show(&RawBytes::new(&[], Channels::Rgb)), Ok(()));

    assert_eq!(sim.reprograms(), 0);
    assert!(sim.starts().is_empty());
    assert_eq!(shared.state(), TransmissionState::Idle);
}

#[test]
fn construction_limits() {
    let shared: DmaShared<WORDS> = DmaShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimDma::new(&shared, &clock, BIT_CYCLES);
    let pins: Vec<u32> = (0..33).map(|bit| 1u32.rotate_left(bit)).collect();

    assert!(matches!(
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &pins, config(4)),
        Err(Error::TooManyLanes)
    ));
    assert!(matches!(
        StreamingDmaBackend::new(&shared, &sim, &clock, OwnerId(1), &[], config(4)),
        Err(Error::TooManyLanes)
    ));

    let tiny: DmaShared<4> = DmaShared::new(LATCH_US);
    let tiny_sim = SimDma::new(&tiny, &clock, BIT_CYCLES);
    assert!(matches!(
        StreamingDmaBackend::new(&tiny, &tiny_sim, &clock, OwnerId(1), &PINS, config(4)),
        Err(Error::Configuration {
            requested: 8,
            capacity: 4
        })
    ));
}
