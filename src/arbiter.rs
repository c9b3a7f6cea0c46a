//! Single-owner arbitration of a shared transmission peripheral.
//!
//! One atomic word holds the [`TransmissionState`], the owning [`OwnerId`] and
//! whether an [`ArbiterToken`] is alive, so a single compare-and-swap decides
//! who gets the peripheral.
//!
//! ```text
//! Idle ──try_acquire──▶ Preparing ──launch──▶ InFlight ──complete──▶ Latching ──finish_latch──▶ Idle
//!   ▲                       │                   (ISR)
//!   └──────── drop ─────────┘
//! ```
//!
//! The arbiter optionally guards a resource `R` (a shared sequence buffer, a
//! ping-pong window and its cached DMA context). Only a live token reaches it,
//! and a latch cannot finish while a token is alive.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use derive_more::Display;
use portable_atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

/// Names one logical output (strip) contending for a peripheral.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[display("owner#{_0}")]
pub struct OwnerId(pub u16);

/// Phase of a frame on a shared peripheral.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransmissionState {
    /// Free. The only state that admits a new owner.
    Idle = 0,
    /// Owned; the output buffer is being filled.
    Preparing = 1,
    /// Hardware is consuming the output buffer.
    InFlight = 2,
    /// Transmission done; the line is held low for the latch time.
    Latching = 3,
}

impl TransmissionState {
    const fn from_word(word: u32) -> Self {
        match word & STATE_MASK {
            1 => Self::Preparing,
            2 => Self::InFlight,
            3 => Self::Latching,
            _ => Self::Idle,
        }
    }
}

// word layout: [31..24 unused | 23..8 owner | 7 token alive | 6..0 state]
const STATE_MASK: u32 = 0x7F;
const TOKEN_ALIVE: u32 = 0x80;
const OWNER_SHIFT: u32 = 8;
const IDLE: u32 = 0;

const fn pack(state: TransmissionState, owner: OwnerId) -> u32 {
    ((owner.0 as u32) << OWNER_SHIFT) | state as u32
}

#[expect(clippy::cast_possible_truncation, reason = "owner occupies 16 bits")]
const fn owner_of(word: u32) -> OwnerId {
    OwnerId((word >> OWNER_SHIFT) as u16)
}

const fn with_state(word: u32, state: TransmissionState) -> u32 {
    (word & !STATE_MASK) | state as u32
}

/// Compare-and-swap arbiter over an optional shared resource `R`.
///
/// Place it in a `static` (its constructor is `const`) and hand `&'static`
/// references to every backend sharing the peripheral.
pub struct ResourceArbiter<R = ()> {
    word: AtomicU32,
    resource: UnsafeCell<R>,
}

// `resource` is only reached through a token, and `word` admits one token at a time.
#[expect(unsafe_code, reason = "access to `resource` is serialized by the CAS on `word`")]
unsafe impl<R: Send> Sync for ResourceArbiter<R> {}

impl<R> ResourceArbiter<R> {
    /// An idle arbiter guarding `resource`.
    #[must_use]
    pub const fn new(resource: R) -> Self {
        Self {
            word: AtomicU32::new(IDLE),
            resource: UnsafeCell::new(resource),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> TransmissionState {
        TransmissionState::from_word(self.word.load(Ordering::Acquire))
    }

    /// Current owner, if any.
    #[must_use]
    pub fn holder(&self) -> Option<OwnerId> {
        let word = self.word.load(Ordering::Acquire);
        (TransmissionState::from_word(word) != TransmissionState::Idle).then(|| owner_of(word))
    }

    /// Take the peripheral if it is idle.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceBusy`] naming the current holder.
    pub fn try_acquire(&self, owner: OwnerId) -> Result<ArbiterToken<'_, R>> {
        match self.word.compare_exchange(
            IDLE,
            pack(TransmissionState::Preparing, owner) | TOKEN_ALIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(ArbiterToken {
                arbiter: self,
                owner,
                launched: false,
            }),
            Err(word) => Err(Error::ResourceBusy {
                holder: owner_of(word),
            }),
        }
    }

    /// Spin until the peripheral is free, then take it.
    ///
    /// `pause` runs on every failed attempt; use it to finish a pending latch
    /// or to yield. See [`acquire_after_latch`](crate::backend::acquire_after_latch).
    pub fn acquire(&self, owner: OwnerId, mut pause: impl FnMut(&Self)) -> ArbiterToken<'_, R> {
        loop {
            match self.try_acquire(owner) {
                Ok(token) => return token,
                Err(_) => pause(self),
            }
        }
    }

    /// Hardware finished consuming the buffer: `InFlight` → `Latching`.
    ///
    /// Called from the completion interrupt. Returns `false` if nothing was in flight.
    pub fn complete(&self) -> bool {
        self.transition(
            |word| TransmissionState::from_word(word) == TransmissionState::InFlight,
            |word| with_state(word, TransmissionState::Latching),
        )
    }

    /// Latch time has passed: `Latching` → `Idle`.
    ///
    /// Refused while the frame's token is still alive.
    pub fn finish_latch(&self) -> bool {
        self.transition(
            |word| {
                TransmissionState::from_word(word) == TransmissionState::Latching
                    && word & TOKEN_ALIVE == 0
            },
            |_| IDLE,
        )
    }

    /// Return the peripheral to `Idle` from a launched phase.
    ///
    /// A no-op (returning `false`) unless `owner` is the current holder and its
    /// token is gone. Dropping an unlaunched token releases on its own.
    pub fn release(&self, owner: OwnerId) -> bool {
        self.transition(
            |word| {
                TransmissionState::from_word(word) != TransmissionState::Idle
                    && word & TOKEN_ALIVE == 0
                    && owner_of(word) == owner
            },
            |_| IDLE,
        )
    }

    fn transition(&self, allowed: impl Fn(u32) -> bool, next: impl Fn(u32) -> u32) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if !allowed(word) {
                return false;
            }
            match self
                .word
                .compare_exchange_weak(word, next(word), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }
}

impl<R: Default> Default for ResourceArbiter<R> {
    fn default() -> Self {
        Self::new(R::default())
    }
}

impl<R> core::fmt::Debug for ResourceArbiter<R> {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("ResourceArbiter")
            .field("state", &self.state())
            .field("holder", &self.holder())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to a shared peripheral and its guarded resource.
///
/// Dropping the token before it is launched returns the arbiter to `Idle`.
/// After [`mark_in_flight`](Self::mark_in_flight), dropping it only lets the
/// latch finish.
#[must_use = "dropping the token releases the peripheral"]
pub struct ArbiterToken<'a, R> {
    arbiter: &'a ResourceArbiter<R>,
    owner: OwnerId,
    launched: bool,
}

impl<R> ArbiterToken<'_, R> {
    /// The owner this token was issued to.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Hand the resource to hardware: `Preparing` → `InFlight`.
    ///
    /// The arbiter stays owned until the completion handler calls
    /// [`ResourceArbiter::complete`] and the latch is finished.
    pub fn launch(self) {
        self.launch_with(|_| ());
    }

    /// Enter `InFlight`, run `start` with read access to the resource, then
    /// give up the token.
    ///
    /// The state is published before `start` runs, so a completion interrupt
    /// that fires as soon as the hardware starts always finds `InFlight`.
    pub fn launch_with<T>(mut self, start: impl FnOnce(&R) -> T) -> T {
        self.mark_in_flight();
        start(&*self)
    }

    /// Enter `InFlight` but keep the token, for producers that keep feeding
    /// hardware-released parts of the resource (ping-pong refills).
    pub fn mark_in_flight(&mut self) {
        self.arbiter.word.store(
            pack(TransmissionState::InFlight, self.owner) | TOKEN_ALIVE,
            Ordering::Release,
        );
        self.launched = true;
    }
}

impl<R> Deref for ArbiterToken<'_, R> {
    type Target = R;

    #[expect(unsafe_code, reason = "the token is the only accessor while alive")]
    fn deref(&self) -> &R {
        // SAFETY: `try_acquire` admitted exactly this token, and the arbiter cannot
        // return to Idle (and admit another) while the alive bit is set.
        unsafe { &*self.arbiter.resource.get() }
    }
}

impl<R> DerefMut for ArbiterToken<'_, R> {
    #[expect(unsafe_code, reason = "the token is the only accessor while alive")]
    fn deref_mut(&mut self) -> &mut R {
        // SAFETY: as in `deref`, plus `&mut self` rules out aliasing through this token.
        unsafe { &mut *self.arbiter.resource.get() }
    }
}

impl<R> Drop for ArbiterToken<'_, R> {
    fn drop(&mut self) {
        if self.launched {
            self.arbiter.word.fetch_and(!TOKEN_ALIVE, Ordering::AcqRel);
        } else {
            self.arbiter.word.store(IDLE, Ordering::Release);
        }
    }
}

impl<R> core::fmt::Debug for ArbiterToken<'_, R> {
    fn fmt(&self, formatter: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        formatter
            .debug_struct("ArbiterToken")
            .field("owner", &self.owner)
            .field("launched", &self.launched)
            .finish_non_exhaustive()
    }
}
