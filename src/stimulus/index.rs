//! `StimulusIndex`: per-trial stimulus metadata capture bound to a
//! signal-time cursor.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Persisted per-stimulus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StimulusDescriptor {
    pub signal_index: i64,
    pub start_time: f64,
    pub trace: String,
    pub intensity: f64,
    pub waveform: String,
    pub duration: f64,
    pub ident: String,
    pub channel: u32,
    pub device: String,
}

/// A small ring of recent descriptors so after-the-fact consumers can align
/// trace windows with stimulus metadata. Reset on session start; descriptors
/// older than the last trial boundary may be flushed on session stop.
pub struct StimulusIndex {
    ring: VecDeque<StimulusDescriptor>,
    capacity: usize,
}

impl StimulusIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, descriptor: StimulusDescriptor) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(descriptor);
    }

    pub fn recent(&self) -> impl Iterator<Item = &StimulusDescriptor> {
        self.ring.iter()
    }

    pub fn by_signal_index(&self, signal_index: i64) -> Option<&StimulusDescriptor> {
        self.ring.iter().find(|d| d.signal_index == signal_index)
    }

    /// Session start: clears the ring entirely.
    pub fn reset(&mut self) {
        self.ring.clear();
    }

    /// Session stop: flushes descriptors older than `trial_boundary`.
    pub fn flush_before(&mut self, trial_boundary: i64) {
        while let Some(front) = self.ring.front() {
            if front.signal_index < trial_boundary {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(signal_index: i64) -> StimulusDescriptor {
        StimulusDescriptor {
            signal_index,
            start_time: signal_index as f64,
            trace: "V-1".into(),
            intensity: 1.0,
            waveform: "sine".into(),
            duration: 1.0,
            ident: "stim".into(),
            channel: 0,
            device: "ao-0".into(),
        }
    }

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let mut index = StimulusIndex::new(2);
        index.record(descriptor(1));
        index.record(descriptor(2));
        index.record(descriptor(3));
        assert_eq!(index.len(), 2);
        assert!(index.by_signal_index(1).is_none());
        assert!(index.by_signal_index(3).is_some());
    }

    #[test]
    fn flush_before_keeps_recent_trial() {
        let mut index = StimulusIndex::new(10);
        for i in 1..=5 {
            index.record(descriptor(i));
        }
        index.flush_before(3);
        assert_eq!(index.len(), 3);
        assert!(index.by_signal_index(1).is_none());
        assert!(index.by_signal_index(3).is_some());
    }
}
