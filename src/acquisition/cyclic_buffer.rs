//! Single-producer / multi-consumer ring buffer with absolute 64-bit
//! indices.
//!
//! The writer is the only thread that ever calls [`CyclicBuffer::push`]; any
//! number of readers call [`CyclicBuffer::read_into`] concurrently. `size()`
//! is published with `Release` ordering only after the corresponding sample
//! has been written into the backing slab, and readers `Acquire`-load it
//! before touching the slab, which gives every reader a happens-before edge
//! on the data it is about to read. No raw pointer ever crosses the
//! producer/consumer boundary; access is mediated entirely by this type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Wrapper establishing that concurrent reads of disjoint, already-published
/// slots are race-free even though the backing storage has interior
/// mutability from the writer's point of view.
struct Slab<T> {
    cells: Box<[std::cell::UnsafeCell<T>]>,
}

// SAFETY: readers only ever touch indices below the writer's last published
// `size()`, and the writer never revisits a slot until it has wrapped all
// the way around and that slot has fallen below `min_index()`. The atomic
// cursors in `CyclicBuffer` are the only synchronization and are documented
// at each use site.
unsafe impl<T: Send> Sync for Slab<T> {}

impl<T: Copy + Default> Slab<T> {
    fn new(capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| std::cell::UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells }
    }

    /// Writer-only: store `value` at physical slot `slot`.
    ///
    /// # Safety
    /// Caller (the single writer) must guarantee no reader observes this
    /// slot as valid (i.e. has not yet published the corresponding index
    /// via `size`) while the write is in progress.
    unsafe fn write(&self, slot: usize, value: T) {
        *self.cells[slot].get() = value;
    }

    /// Reader: load the value at physical slot `slot`.
    ///
    /// # Safety
    /// Caller must have already `Acquire`-loaded a `size()` greater than
    /// the absolute index this slot corresponds to.
    unsafe fn read(&self, slot: usize) -> T {
        *self.cells[slot].get()
    }
}

/// A cyclic buffer of `T` addressed by absolute, ever-increasing 64-bit
/// indices; the physical slot for index `i` is `i mod capacity`.
pub struct CyclicBuffer<T> {
    slab: Slab<T>,
    capacity: u64,
    /// Total number of elements ever written (monotonic).
    size: AtomicU64,
    /// Samples near the write cursor that are not yet guaranteed durable to
    /// a reader racing the very latest `push`.
    write_margin: u64,
    /// Guards reconfiguration (resize/reset), not the steady-state hot path.
    reconfigure: Mutex<()>,
}

impl<T: Copy + Default> CyclicBuffer<T> {
    pub fn new(capacity: usize, write_margin: u64) -> Self {
        assert!(capacity > 0, "cyclic buffer capacity must be nonzero");
        Self {
            slab: Slab::new(capacity),
            capacity: capacity as u64,
            size: AtomicU64::new(0),
            write_margin: write_margin.min(capacity as u64),
            reconfigure: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total samples written since the last [`CyclicBuffer::reset`].
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Oldest index a reader may still validly read.
    pub fn min_index(&self) -> u64 {
        let size = self.size();
        size.saturating_sub(self.capacity.saturating_sub(self.write_margin))
    }

    /// Writer-only. Appends `values` and publishes the new `size()`.
    pub fn push(&self, values: &[T]) {
        let mut size = self.size.load(Ordering::Relaxed);
        for &v in values {
            let slot = (size % self.capacity) as usize;
            // SAFETY: single writer; `size` has not yet been published past
            // this index so no reader may be touching `slot`.
            unsafe { self.slab.write(slot, v) };
            size += 1;
        }
        self.size.store(size, Ordering::Release);
    }

    /// Reads the absolute range `[from, to)` into `out`. Returns the number
    /// of elements actually copied (clamped to `[min_index(), size())`).
    ///
    /// Returns `0` if `from >= to` or the range has fully fallen out of the
    /// live window.
    pub fn read_into(&self, from: u64, to: u64, out: &mut Vec<T>) -> u64 {
        let size = self.size();
        let min_index = self.min_index();
        let from = from.max(min_index);
        let to = to.min(size);
        if from >= to {
            return 0;
        }
        out.reserve((to - from) as usize);
        for idx in from..to {
            let slot = (idx % self.capacity) as usize;
            // SAFETY: `idx < size` which we just `Acquire`-loaded, so the
            // writer's store to this slot happened-before this read.
            out.push(unsafe { self.slab.read(slot) });
        }
        to - from
    }

    /// Writer-only: clears all cursors. Concurrent readers will observe
    /// `size() == 0` and harmlessly read nothing until new data arrives.
    pub fn reset(&self) {
        let _guard = self.reconfigure.lock().unwrap();
        self.size.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_back() {
        let buf = CyclicBuffer::<f32>::new(8, 0);
        buf.push(&[1.0, 2.0, 3.0]);
        assert_eq!(buf.size(), 3);
        let mut out = Vec::new();
        let n = buf.read_into(0, 3, &mut out);
        assert_eq!(n, 3);
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn wrap_exactly_at_capacity() {
        let buf = CyclicBuffer::<f32>::new(4, 0);
        buf.push(&[10.0, 11.0, 12.0, 13.0]);
        // one more sample forces a wrap; slot 0 is overwritten
        buf.push(&[14.0]);
        assert_eq!(buf.size(), 5);
        assert_eq!(buf.min_index(), 1);
        let mut out = Vec::new();
        buf.read_into(1, 5, &mut out);
        assert_eq!(out, vec![11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn min_index_tracks_capacity() {
        let buf = CyclicBuffer::<f32>::new(4, 0);
        for i in 0..10u32 {
            buf.push(&[i as f32]);
        }
        assert_eq!(buf.size(), 10);
        assert_eq!(buf.min_index(), 6);
    }

    #[test]
    fn reset_clears_size() {
        let buf = CyclicBuffer::<f32>::new(4, 0);
        buf.push(&[1.0, 2.0]);
        buf.reset();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.min_index(), 0);
    }
}
