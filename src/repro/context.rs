//! `ReProContext`: the read-only trace/event views, stimulus write handle,
//! and cooperative cancellation a running RePro sees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::acquisition::InTrace;
use crate::device::registry::{DeviceId, DeviceRegistry};
use crate::error::StimulusError;
use crate::events::EventStream;
use crate::stimulus::{OutSignal, StimulusEngine, WriteOutcome};

/// Polling granularity for `sleep_for`/`sleep_until_index`/`wait_samples`;
/// coarser than `InTrace::wait_for_samples`'s own poll since a RePro's
/// sleeps are measured in milliseconds, not microseconds.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A RePro's view onto the runtime: live trace/event cursors, a write
/// handle to the [`StimulusEngine`], and a cooperative interrupt flag.
/// Constructed fresh by [`super::RunControl::start`] for each run.
pub struct ReProContext {
    traces: HashMap<String, Arc<InTrace>>,
    events: HashMap<String, Arc<EventStream>>,
    stimulus: Arc<StimulusEngine>,
    registry: Arc<Mutex<DeviceRegistry>>,
    interrupt: Arc<AtomicBool>,
}

impl ReProContext {
    pub(crate) fn new(
        traces: HashMap<String, Arc<InTrace>>,
        events: HashMap<String, Arc<EventStream>>,
        stimulus: Arc<StimulusEngine>,
        registry: Arc<Mutex<DeviceRegistry>>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            traces,
            events,
            stimulus,
            registry,
            interrupt,
        }
    }

    pub fn trace(&self, ident: &str) -> Option<&Arc<InTrace>> {
        self.traces.get(ident)
    }

    pub fn event_stream(&self, ident: &str) -> Option<&Arc<EventStream>> {
        self.events.get(ident)
    }

    /// Cooperative cancellation predicate; a RePro should check this at
    /// every natural suspension point.
    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Sleeps up to `duration`, waking early (returning `false`) if
    /// interrupted.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Sleeps until `trace` reaches `index` samples, waking early
    /// (returning `false`) if interrupted.
    pub fn sleep_until_index(&self, trace: &str, index: u64) -> bool {
        let Some(trace) = self.trace(trace) else {
            return false;
        };
        loop {
            if self.interrupted() {
                return false;
            }
            if trace.size() >= index {
                return true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocks until `trace` has at least `count` new samples past its
    /// current size when called, or `timeout` elapses, or interrupted.
    pub fn wait_samples(&self, trace: &str, count: u64, timeout: Duration) -> bool {
        let Some(trace) = self.trace(trace) else {
            return false;
        };
        let target = trace.size() + count;
        let deadline = Instant::now() + timeout;
        loop {
            if self.interrupted() {
                return false;
            }
            if trace.size() >= target {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Takes `signal` by mutable reference so a RePro keeps the signal's
    /// `error_flags` after the call — attenuation can set `OVERFLOW`/
    /// `UNDERFLOW` even when the write itself succeeds.
    pub fn direct_write(
        &self,
        device_id: DeviceId,
        channel: u32,
        signal: &mut OutSignal,
    ) -> Result<(), StimulusError> {
        let mut registry = self.registry.lock().unwrap();
        self.stimulus
            .direct_write(&mut registry, device_id, channel, signal, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn timed_write(
        &self,
        device_id: DeviceId,
        channel: u32,
        signal: &mut OutSignal,
        co_acquiring: &[Arc<InTrace>],
        co_start_outputs: &[DeviceId],
    ) -> Result<WriteOutcome, StimulusError> {
        let mut registry = self.registry.lock().unwrap();
        self.stimulus.timed_write(
            &mut registry,
            device_id,
            channel,
            signal,
            co_acquiring,
            co_start_outputs,
            None,
        )
    }
}
