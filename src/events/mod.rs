//! Events and `EventStream`: a cyclic, cursor-tracked log of detected
//! events, published by the filter-graph thread and consumed by any
//! number of readers.

pub mod detector;

pub use detector::{DetectorConfig, DetectorOutcome, PeakTroughDetector, TimingMethod};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A single detected event. `size` and `width` are in the trace's native
/// units/seconds, not raw samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: f64,
    pub index: u64,
    pub size: f32,
    pub width: f64,
}

/// A cyclic log of events with a monotonic cursor, mirroring `InTrace`'s
/// single-writer/many-reader discipline but at event, not sample, rate.
/// Event time is strictly increasing within one stream.
pub struct EventStream {
    ident: String,
    ring: RwLock<VecDeque<Event>>,
    capacity: usize,
    count: AtomicU64,
    min_index: AtomicU64,
}

impl EventStream {
    pub fn new(ident: impl Into<String>, capacity: usize) -> Self {
        Self {
            ident: ident.into(),
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            count: AtomicU64::new(0),
            min_index: AtomicU64::new(0),
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Number of events ever published; the live cursor readers track.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Lowest event index still retained in the ring.
    pub fn min_index(&self) -> u64 {
        self.min_index.load(Ordering::Acquire)
    }

    pub(crate) fn push(&self, event: Event) {
        let mut ring = self.ring.write().unwrap();
        if ring.len() == self.capacity {
            ring.pop_front();
            self.min_index.fetch_add(1, Ordering::Release);
        }
        ring.push_back(event);
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Events published since `from_index` (inclusive), skipping any
    /// already evicted past `min_index()`.
    pub fn events_since(&self, from_index: u64) -> Vec<Event> {
        let ring = self.ring.read().unwrap();
        let min = self.min_index.load(Ordering::Acquire);
        let skip = from_index.saturating_sub(min) as usize;
        ring.iter().skip(skip).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    pub(crate) fn reset(&self) {
        let mut ring = self.ring.write().unwrap();
        ring.clear();
        self.count.store(0, Ordering::Release);
        self.min_index.store(0, Ordering::Release);
    }
}
