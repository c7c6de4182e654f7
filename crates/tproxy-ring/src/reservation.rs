//! Zero-copy write handle into a [`crate::Ring`].

use crate::invariants::debug_assert_valid_ring_ptr;
use crate::Ring;
use std::mem::MaybeUninit;

/// A contiguous, uninitialized slice reserved for writing.
///
/// Dropping a `Reservation` without calling [`commit`](Reservation::commit)
/// abandons the slots: they are never published to the consumer and the
/// capacity they occupied is leaked until the ring wraps past them. Callers
/// should always commit (or explicitly discard by calling `commit_n(0)`).
pub struct Reservation<'a, T> {
    slice: &'a mut [MaybeUninit<T>],
    ring_ptr: *const Ring<T>,
}

impl<'a, T> Reservation<'a, T> {
    pub(crate) fn new(slice: &'a mut [MaybeUninit<T>], ring_ptr: *const Ring<T>) -> Self {
        Self { slice, ring_ptr }
    }

    /// The reserved, writable slice. Its length may be smaller than what was
    /// requested if the reservation wrapped around the ring.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [MaybeUninit<T>] {
        self.slice
    }

    /// Publishes every slot in the reservation to the consumer.
    #[inline]
    pub fn commit(self) {
        let n = self.slice.len();
        self.commit_n_unchecked(n);
    }

    /// Publishes only the first `n` slots; the remainder is left unwritten
    /// and its capacity is abandoned (not reused until the ring wraps).
    #[inline]
    pub fn commit_n(self, n: usize) {
        let n = n.min(self.slice.len());
        self.commit_n_unchecked(n);
    }

    fn commit_n_unchecked(&self, n: usize) {
        // SAFETY: ring_ptr was derived from `&Ring<T>` in `Ring::make_reservation`
        // and outlives this reservation (the reservation borrows from the ring).
        debug_assert_valid_ring_ptr!(self.ring_ptr);
        unsafe {
            (*self.ring_ptr).commit_internal(n);
        }
    }
}
