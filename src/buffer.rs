//! Fixed-capacity, word-aligned buffers handed to DMA engines, and volatile
//! register access.

use core::marker::PhantomData;

use crate::{Error, Result};

/// A backend-owned buffer of timing codes, allocated once and reused per frame.
///
/// Aligned to 4 bytes so DMA engines can read it directly. Only the first
/// [`len`](Self::len) entries belong to the current frame.
#[repr(C, align(4))]
#[derive(Clone, Debug)]
pub struct OutputBuffer<T, const CAP: usize> {
    items: [T; CAP],
    len: usize,
}

/// PWM compare-code buffer.
pub type SequenceBuffer<const CAP: usize> = OutputBuffer<u16, CAP>;

/// GPIO word buffer for one half of a streaming window.
pub type WordBuffer<const CAP: usize> = OutputBuffer<u32, CAP>;

impl<T: Copy, const CAP: usize> OutputBuffer<T, CAP> {
    /// An empty buffer with every slot set to `fill`.
    #[must_use]
    pub const fn new(fill: T) -> Self {
        Self {
            items: [fill; CAP],
            len: 0,
        }
    }

    /// Slots available.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Slots used by the current frame.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is used.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start a new frame.
    pub const fn clear(&mut self) {
        self.len = 0;
    }

    /// Append one item.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if the buffer is full.
    pub fn push(&mut self, item: T) -> Result<()> {
        let Some(slot) = self.items.get_mut(self.len) else {
            return Err(Error::Configuration {
                requested: self.len.saturating_add(1),
                capacity: CAP,
            });
        };
        *slot = item;
        self.len = self.len.saturating_add(1);
        Ok(())
    }

    /// Unused slots after the current frame, to be filled then [`commit`](Self::commit)ted.
    pub fn spare_mut(&mut self) -> &mut [T] {
        self.items.get_mut(self.len..).unwrap_or_default()
    }

    /// Mark `count` spare slots as used.
    pub fn commit(&mut self, count: usize) {
        self.len = self.len.saturating_add(count).min(CAP);
    }

    /// The current frame.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.items.get(..self.len).unwrap_or_default()
    }

    /// Address of the first slot, as programmed into a DMA descriptor.
    #[must_use]
    pub fn address(&self) -> usize {
        self.items.as_ptr() as usize
    }
}

/// One half of a ping-pong buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Half {
    /// First half.
    A,
    /// Second half.
    B,
}

impl Half {
    /// The half that is not `self`.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Two word buffers the hardware drains alternately while the producer refills
/// the idle one.
#[derive(Clone, Debug)]
pub struct PingPong<const WORDS: usize> {
    first: WordBuffer<WORDS>,
    second: WordBuffer<WORDS>,
}

impl<const WORDS: usize> PingPong<WORDS> {
    /// Both halves empty.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            first: OutputBuffer::new(0),
            second: OutputBuffer::new(0),
        }
    }

    /// Read access to one half.
    #[must_use]
    pub const fn half(&self, half: Half) -> &WordBuffer<WORDS> {
        match half {
            Half::A => &self.first,
            Half::B => &self.second,
        }
    }

    /// Write access to one half.
    pub const fn half_mut(&mut self, half: Half) -> &mut WordBuffer<WORDS> {
        match half {
            Half::A => &mut self.first,
            Half::B => &mut self.second,
        }
    }
}

impl<const WORDS: usize> Default for PingPong<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

/// A memory-mapped register accessed with volatile reads and writes.
#[derive(Debug)]
pub struct Mmio<T> {
    address: *mut T,
    _register: PhantomData<T>,
}

impl<T: Copy> Mmio<T> {
    /// Wrap the register at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be valid, aligned for `T` and readable (and writable, if
    /// [`write`](Self::write) is used) for the lifetime of the returned value.
    #[expect(unsafe_code, reason = "caller vouches for the register address")]
    #[must_use]
    pub const unsafe fn new(address: *mut T) -> Self {
        Self {
            address,
            _register: PhantomData,
        }
    }

    /// Volatile read.
    #[expect(unsafe_code, reason = "address validated at construction")]
    #[must_use]
    pub fn read(&self) -> T {
        // SAFETY: `new` requires a valid, aligned, readable address.
        unsafe { self.address.read_volatile() }
    }

    /// Volatile write.
    #[expect(unsafe_code, reason = "address validated at construction")]
    pub fn write(&self, value: T) {
        // SAFETY: `new` requires a valid, aligned, writable address for writers.
        unsafe { self.address.write_volatile(value) }
    }

    /// Read, transform, write back.
    pub fn modify(&self, change: impl FnOnce(T) -> T) {
        self.write(change(self.read()));
    }
}
