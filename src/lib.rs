//! Timing-exact transmission engine for self-clocked (WS2812-style) LED strips.
//!
//! Every data bit on a clockless strip is one high pulse followed by a low
//! time, with no clock line. The receiver tolerates roughly ±150 ns, so the
//! driver has to keep pulse widths right while interrupts, RTOS preemption or
//! radio stacks compete for the core. The crate provides three ways to do it,
//! each behind a cargo feature:
//!
//! - [`backend::bang`] (`bang`): toggles a GPIO against a free-running cycle
//!   counter. Interrupts may run between pixels; an interrupt long enough to
//!   latch the strip aborts the frame, which is resent once.
//! - [`backend::pwm`] (`pwm`): encodes the frame as PWM compare codes that a
//!   sequencer plays through DMA.
//! - [`backend::streaming_dma`] (`streaming-dma`): drives up to 32 strips in
//!   parallel by streaming transposed GPIO set/clear words through a ping-pong
//!   DMA window that the CPU refills.
//!
//! All three implement [`TransmissionBackend`](backend::TransmissionBackend)
//! and keep the same contract: frames on one peripheral never overlap, and a
//! new frame never starts before the previous one's latch time has passed.
//!
//! # Glossary
//!
//! - **T1 / T2 / T3:** the three intervals of a bit. A `0` is high for T1 and
//!   low for T2 + T3. A `1` is high for T1 + T2 and low for T3.
//! - **Latch (reset):** a low time of at least `latch_us` that makes the strip
//!   display what it received.
//! - **Arbiter:** the single owner lock of a shared peripheral, see [`arbiter`].
//! - **Ping-pong window:** two DMA buffer halves; the hardware drains one while
//!   the CPU refills the other.
//! - **Lane:** one strip of a parallel streaming backend, bound to one GPIO bit.
#![cfg_attr(not(any(test, feature = "host")), no_std)]

// Must stay first so the logging macros are visible to every module.
#[macro_use]
mod fmt;

pub mod arbiter;
pub mod backend;
pub mod buffer;
pub mod clock;
pub mod encoder;
mod error;
pub mod frame_guard;
pub mod led_strip;
pub mod pixel_source;
#[cfg(any(test, feature = "host"))]
pub mod sim;
pub mod timing;

// Re-export error types and result (used throughout)
pub use crate::error::{Error, Result};
