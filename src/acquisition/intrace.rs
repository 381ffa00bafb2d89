//! `InTrace`: a cyclic input buffer with per-signal indexing.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::cyclic_buffer::CyclicBuffer;
use crate::types::{ReferenceMode, Sample};

/// Parameters that may change across a reconfiguration (gain activation,
/// reset) but are stable within a tick; guarded by a coarse read/write lock
/// so reconfiguration never tears a concurrent read.
#[derive(Debug, Clone)]
pub struct TraceParams {
    pub stepsize: f64,
    pub gain_index: u32,
    pub min_value: f32,
    pub max_value: f32,
    pub scale: f32,
    pub unit: String,
}

/// Static identity and wiring of an input trace; set at construction and
/// never mutated.
#[derive(Debug, Clone)]
pub struct TraceIdentity {
    pub trace_id: u32,
    pub channel: u32,
    pub device_id: u32,
    pub reference: ReferenceMode,
    pub unipolar: bool,
    pub mode: u32,
    pub ident: String,
    /// Whether the trace runs as one continuous sweep rather than discrete
    /// triggered trials.
    pub continuous: bool,
    /// Whether this trace may preempt others for buffer/bus bandwidth under
    /// device contention.
    pub priority: bool,
}

/// A cyclic input buffer exclusively owned by the [`crate::acquisition::AcquisitionEngine`]
/// and handed out as a shared, read-only, cursor-tracking view to any number
/// of consumers.
pub struct InTrace {
    pub identity: TraceIdentity,
    buffer: CyclicBuffer<Sample>,
    /// Index of the most recent stimulus-onset sample; -1 if none.
    signal_index: AtomicI64,
    /// Index at which timing was last restarted after stop/reset.
    restart_index: AtomicU64,
    params: RwLock<TraceParams>,
    armed_at: RwLock<Option<Instant>>,
}

impl InTrace {
    pub fn new(identity: TraceIdentity, capacity: usize, params: TraceParams) -> Self {
        assert!(
            params.stepsize > 0.0,
            "stepsize must be positive once a trace is armed"
        );
        // write_margin: a small safety margin of recent samples treated as
        // "not yet guaranteed durable" against a reader racing the very
        // latest push; 1/64th of capacity, at least one sample.
        let write_margin = (capacity as u64 / 64).max(1);
        Self {
            identity,
            buffer: CyclicBuffer::new(capacity, write_margin),
            signal_index: AtomicI64::new(-1),
            restart_index: AtomicU64::new(0),
            params: RwLock::new(params),
            armed_at: RwLock::new(None),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.buffer.capacity()
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn min_index(&self) -> u64 {
        self.buffer.min_index()
    }

    pub fn signal_index(&self) -> i64 {
        self.signal_index.load(Ordering::Acquire)
    }

    pub fn restart_index(&self) -> u64 {
        self.restart_index.load(Ordering::Acquire)
    }

    pub fn params(&self) -> TraceParams {
        self.params.read().unwrap().clone()
    }

    pub fn read_into(&self, from: u64, to: u64, out: &mut Vec<Sample>) -> u64 {
        self.buffer.read_into(from, to, out)
    }

    /// Engine-only: append newly acquired, already-converted samples.
    pub(crate) fn append(&self, samples: &[Sample]) {
        self.buffer.push(samples);
    }

    /// Engine-only: stamp the onset sample index for a just-started timed
    /// write. Must be called *after* the onset sample has been appended, so
    /// any reader that observes a new signalIndex is guaranteed to also see
    /// the trace samples up to that index.
    pub(crate) fn stamp_signal_index(&self, index: u64) {
        self.signal_index.store(index as i64, Ordering::Release);
    }

    /// Engine-only: record a timing restart, e.g. after a gain activation
    /// gap.
    pub(crate) fn mark_restart(&self, index: u64) {
        self.restart_index.store(index, Ordering::Release);
    }

    /// Engine-only: apply new reconfiguration parameters. Takes the coarse
    /// write lock, so concurrent reconfiguration and reads never tear.
    pub(crate) fn reconfigure(&self, params: TraceParams) {
        let mut guard = self.params.write().unwrap();
        *guard = params;
    }

    pub(crate) fn reset(&self) {
        self.buffer.reset();
        self.signal_index.store(-1, Ordering::Release);
        self.restart_index.store(0, Ordering::Release);
        *self.armed_at.write().unwrap() = Some(Instant::now());
    }

    /// Blocks the calling thread until `size() >= min_index` or `timeout`
    /// elapses. Implemented by polling with a short sleep; acquisition
    /// workers additionally use a condition variable (see
    /// [`crate::acquisition::AcquisitionEngine::wait_for_samples`]) to avoid
    /// busy-waiting in the common case.
    pub fn wait_for_samples(&self, min_index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.size() >= min_index {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(capacity: usize) -> InTrace {
        InTrace::new(
            TraceIdentity {
                trace_id: 0,
                channel: 0,
                device_id: 0,
                reference: ReferenceMode::Differential,
                unipolar: false,
                mode: 0,
                ident: "V-1".into(),
                continuous: true,
                priority: false,
            },
            capacity,
            TraceParams {
                stepsize: 1e-4,
                gain_index: 0,
                min_value: -10.0,
                max_value: 10.0,
                scale: 1.0,
                unit: "V".into(),
            },
        )
    }

    #[test]
    fn signal_index_sentinel_is_minus_one() {
        let t = trace(64);
        assert_eq!(t.signal_index(), -1);
    }

    #[test]
    fn invariant_min_le_signal_le_size() {
        let t = trace(64);
        t.append(&[0.0; 10]);
        t.stamp_signal_index(5);
        assert!(t.min_index() <= t.signal_index() as u64);
        assert!((t.signal_index() as u64) <= t.size());
    }

    #[test]
    fn reset_is_idempotent() {
        let t = trace(64);
        t.append(&[1.0, 2.0, 3.0]);
        t.stamp_signal_index(1);
        t.reset();
        let state1 = (t.size(), t.signal_index(), t.restart_index());
        t.reset();
        let state2 = (t.size(), t.signal_index(), t.restart_index());
        assert_eq!(state1, state2);
    }
}
