#![allow(missing_docs)]
//! PWM sequence backend on a simulated sequencer.

use core::cell::RefCell;

use clockless_kit::arbiter::{OwnerId, TransmissionState};
use clockless_kit::backend::TransmissionBackend;
use clockless_kit::backend::pwm::{PwmBackend, PwmCompletionIrq, PwmConfig, PwmShared};
use clockless_kit::encoder::PwmTiming;
use clockless_kit::pixel_source::{Channels, RawBytes};
use clockless_kit::sim::{SimClock, SimPwm, pack_bits};
use clockless_kit::timing::TimingSpec;
use clockless_kit::Error;
use embassy_time::{Duration, Instant};

const CPU_HZ: u32 = 64_000_000;
const PWM_HZ: u32 = 16_000_000;
const LATCH_US: u32 = 280;
const MAX_PIXELS: usize = 4;
const CAP: usize = MAX_PIXELS * 24;

fn timing() -> TimingSpec {
    TimingSpec::new(350, 350, 550).unwrap()
}

fn config() -> PwmConfig {
    PwmConfig::new(timing(), PWM_HZ, MAX_PIXELS)
}

fn decode(codes: PwmTiming, sequence: &[u16]) -> Vec<u8> {
    let bits: Vec<bool> = sequence
        .iter()
        .map(|&code| {
            assert!(code == codes.code(true) || code == codes.code(false));
            code == codes.code(true)
        })
        .collect();
    pack_bits(&bits)
}

#[test]
fn frame_becomes_one_code_per_bit() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();
    assert_eq!(backend.codes().top(), 20);

    let frame = [0xFF, 0x00, 0x80, 0x12, 0x34, 0x56];
    backend.show(&RawBytes::new(&frame, Channels::Rgb)).unwrap();

    let sequences = sim.sequences();
    assert_eq!(sequences.len(), 1);
    let (top, sequence) = &sequences[0];
    assert_eq!(*top, 20);
    assert_eq!(sequence.len(), 48);
    assert_eq!(PwmTiming::high_ticks(sequence[0]), 11);
    assert_eq!(PwmTiming::high_ticks(sequence[47]), 6);
    assert_eq!(decode(backend.codes(), sequence), frame);
    assert_eq!(shared.state(), TransmissionState::InFlight);
    assert_eq!(shared.holder(), Some(OwnerId(1)));
}

#[test]
fn buffer_sizing() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);

    for pixels in 1..=MAX_PIXELS {
        let config = PwmConfig::new(timing(), PWM_HZ, pixels);
        assert!(PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config).is_ok());
    }
    let too_long = PwmConfig::new(timing(), PWM_HZ, MAX_PIXELS + 1);
    assert_eq!(
        PwmBackend::new(&shared, &sim, &sim, OwnerId(1), too_long).err(),
        Some(Error::Configuration {
            requested: MAX_PIXELS + 1,
            capacity: MAX_PIXELS
        })
    );
    // RGBW needs 32 codes per pixel: 96 codes hold 3 pixels.
    let rgbw = config().with_channels(Channels::Rgbw);
    assert_eq!(
        PwmBackend::new(&shared, &sim, &sim, OwnerId(1), rgbw).err(),
        Some(Error::Configuration {
            requested: MAX_PIXELS,
            capacity: 3
        })
    );
}

#[test]
fn oversized_frame_is_rejected_before_hardware() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();

    let result = backend.show(&RawBytes::new(&[0; 15], Channels::Rgb));

    assert_eq!(
        result,
        Err(Error::Configuration {
            requested: 5,
            capacity: MAX_PIXELS
        })
    );
    assert!(sim.sequences().is_empty());
    assert_eq!(shared.state(), TransmissionState::Idle);
}

#[test]
fn period_must_fit_the_counter() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let narrow = config().with_counter_bits(4);
    assert_eq!(
        PwmBackend::new(&shared, &sim, &sim, OwnerId(1), narrow).err(),
        Some(Error::PulseWidthOverflow {
            period_ticks: 20,
            register_bits: 4
        })
    );
}

#[test]
fn second_strip_is_busy_then_deferred_past_the_latch() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut first = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();
    let mut second = PwmBackend::new(&shared, &sim, &sim, OwnerId(2), config()).unwrap();
    let frame = RawBytes::new(&[0xAA; 12], Channels::Rgb);

    first.show(&frame).unwrap();
    assert_eq!(
        second.try_show(&frame),
        Err(Error::ResourceBusy {
            holder: OwnerId(1)
        })
    );

    second.show(&frame).unwrap();

    let starts = sim.starts();
    assert_eq!(starts.len(), 2);
    // 96 codes of 20 ticks, 4 CPU cycles per tick
    let airtime = 96 * 20 * 4;
    let latch = u64::from(LATCH_US) * u64::from(CPU_HZ / 1_000_000);
    assert!(starts[1] - starts[0] >= airtime + latch);
    assert_eq!(sim.irq_log(), ["disable", "clear_events"]);
    assert_eq!(shared.holder(), Some(OwnerId(2)));
}

#[test]
fn try_show_succeeds_once_the_latch_has_passed() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();
    let frame = RawBytes::new(&[0x0F; 3], Channels::Rgb);

    backend.show(&frame).unwrap();
    sim.run_to_completion();
    assert_eq!(shared.state(), TransmissionState::Latching);
    assert!(backend.try_show(&frame).is_err());

    clock.advance(u64::from(LATCH_US + 1) * u64::from(CPU_HZ / 1_000_000));
    backend.try_show(&frame).unwrap();
    assert_eq!(sim.sequences().len(), 2);
}

#[test]
fn show_after_the_latch_starts_at_once() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();
    let frame = RawBytes::new(&[0x3C; 6], Channels::Rgb);

    backend.show(&frame).unwrap();
    sim.run_to_completion();
    clock.advance(u64::from(LATCH_US + 1) * u64::from(CPU_HZ / 1_000_000));
    let requested_at = clock.peek();
    backend.show(&frame).unwrap();

    assert!(sim.starts()[1] - requested_at < u64::from(CPU_HZ / 1_000_000));
}

#[test]
fn in_flight_frame_can_be_awaited() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();

    backend.show(&RawBytes::new(&[4, 5, 6], Channels::Rgb)).unwrap();
    assert_eq!(shared.state(), TransmissionState::InFlight);
    embassy_futures::block_on(embassy_futures::join::join(
        shared.wait_complete(&clock),
        async {
            embassy_futures::yield_now().await;
            sim.run_to_completion();
        },
    ));

    assert_eq!(shared.state(), TransmissionState::Idle);
    let ended = shared.guard().last().unwrap();
    assert!(clock.instant() >= ended + Duration::from_micros(u64::from(LATCH_US)));
}

#[test]
fn completion_can_be_awaited() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();

    backend.show(&RawBytes::new(&[1, 2, 3], Channels::Rgb)).unwrap();
    sim.run_to_completion();
    embassy_futures::block_on(shared.wait_complete(&clock));

    assert_eq!(shared.state(), TransmissionState::Idle);
    assert_eq!(shared.holder(), None);
}

struct OrderCheckingIrq<'a> {
    shared: &'a PwmShared<CAP>,
    seen: RefCell<Vec<(&'static str, TransmissionState, bool)>>,
}

impl OrderCheckingIrq<'_> {
    fn record(&self, call: &'static str) {
        let marked = self.shared.guard().last().is_some();
        self.seen
            .borrow_mut()
            .push((call, self.shared.state(), marked));
    }
}

impl PwmCompletionIrq for OrderCheckingIrq<'_> {
    fn disable(&mut self) {
        self.record("disable");
    }

    fn clear_events(&mut self) {
        self.record("clear_events");
    }
}

#[test]
fn sequence_end_handler_runs_in_order() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();
    backend.show(&RawBytes::new(&[9, 9, 9], Channels::Rgb)).unwrap();

    let mut irq = OrderCheckingIrq {
        shared: &shared,
        seen: RefCell::new(Vec::new()),
    };
    shared.on_sequence_end(&mut irq, Instant::from_micros(500));

    assert_eq!(
        irq.seen.into_inner(),
        [
            ("disable", TransmissionState::InFlight, false),
            ("clear_events", TransmissionState::InFlight, false),
        ]
    );
    assert_eq!(shared.state(), TransmissionState::Latching);
    assert_eq!(shared.guard().last(), Some(Instant::from_micros(500)));
}

#[test]
fn empty_frame_is_a_no_op() {
    let shared: PwmShared<CAP> = PwmShared::new(LATCH_US);
    let clock = SimClock::new(CPU_HZ);
    let sim = SimPwm::new(&shared, &clock, PWM_HZ);
    let mut backend = PwmBackend::new(&shared, &sim, &sim, OwnerId(1), config()).unwrap();

    backend.show(&RawBytes::new(&[], Channels::Rgb)).unwrap();

    assert!(sim.sequences().is_empty());
    assert_eq!(backend.state(), TransmissionState::Idle);
}
