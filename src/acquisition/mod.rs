//! `AcquisitionEngine`: arms analog inputs, drives one worker thread per
//! input device, publishes cyclic buffers to readers, restarts
//! synchronously on error.

pub mod cyclic_buffer;
pub mod intrace;

pub use intrace::{InTrace, TraceIdentity, TraceParams};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::device::registry::{DeviceHandle, DeviceId, DeviceRegistry};
use crate::device::CoStartToken;
use crate::error::AcquisitionError;
use crate::types::ReferenceMode;

/// Configuration for one input trace, as a device-configuration frontend
/// would supply it.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub trace_id: u32,
    pub device_id: DeviceId,
    pub channel: u32,
    pub rate: f64,
    pub gain_index: u32,
    pub reference: ReferenceMode,
    pub unipolar: bool,
    pub capacity: usize,
    pub ident: String,
    pub continuous: bool,
    pub priority: bool,
    pub start_source: u32,
    pub delay: f64,
}

enum GainRequest {
    Apply {
        changes: HashMap<u32, u32>, // channel -> gain index
        ack: Sender<Result<(), AcquisitionError>>,
    },
}

struct DeviceWorker {
    device_id: DeviceId,
    channel_trace_ids: Vec<(u32, u32)>, // (channel, trace_id), in device channel order
    join: std::thread::JoinHandle<DeviceHandle>,
    gain_tx: Sender<GainRequest>,
}

/// Shared condition used by [`AcquisitionEngine::wait_for_samples`] to avoid
/// busy-polling; workers notify it once per pump tick.
#[derive(Default)]
struct Notifier {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Notifier {
    fn notify(&self) {
        self.condvar.notify_all();
    }

    fn wait_while<F: Fn() -> bool>(&self, predicate: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let guard = self.mutex.lock().unwrap();
        let mut guard = guard;
        loop {
            if predicate() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return predicate();
            }
            let (g, result) = self.condvar.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && !predicate() {
                return false;
            }
        }
    }
}

/// Input threads, cyclic buffers, co-start, and gain activation.
pub struct AcquisitionEngine {
    traces: HashMap<u32, Arc<InTrace>>,
    trace_rates: HashMap<u32, f64>,
    device_for_trace: HashMap<u32, DeviceId>,
    workers: HashMap<DeviceId, DeviceWorker>,
    running: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
    co_start_counter: Arc<AtomicU64>,
}

impl Default for AcquisitionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionEngine {
    pub fn new() -> Self {
        Self {
            traces: HashMap::new(),
            trace_rates: HashMap::new(),
            device_for_trace: HashMap::new(),
            workers: HashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            notifier: Arc::new(Notifier::default()),
            co_start_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn trace(&self, trace_id: u32) -> Option<&Arc<InTrace>> {
        self.traces.get(&trace_id)
    }

    pub fn traces(&self) -> impl Iterator<Item = &Arc<InTrace>> {
        self.traces.values()
    }

    /// Validates each trace against its device and builds the `InTrace`
    /// set. Fails as a whole if any trace is fatal.
    pub fn prepare(
        &mut self,
        registry: &DeviceRegistry,
        configs: Vec<TraceConfig>,
    ) -> Result<(), AcquisitionError> {
        // Single start-source and consistent delay/rate per device.
        let mut by_device: HashMap<DeviceId, Vec<&TraceConfig>> = HashMap::new();
        for cfg in &configs {
            by_device.entry(cfg.device_id).or_default().push(cfg);
        }
        for (device_id, cfgs) in &by_device {
            let first = cfgs[0];
            for other in cfgs.iter().skip(1) {
                if other.start_source != first.start_source {
                    return Err(AcquisitionError::MultipleStartSources {
                        first: first.start_source,
                        second: other.start_source,
                    });
                }
                if (other.delay - first.delay).abs() > f64::EPSILON
                    || (other.rate - first.rate).abs() > f64::EPSILON
                {
                    return Err(AcquisitionError::InconsistentDeviceTiming {
                        device: format!("{device_id:?}"),
                    });
                }
            }
            let handle = registry.handle(*device_id).ok_or(AcquisitionError::Device(
                crate::error::DeviceError::InvalidDevice {
                    group: "AnalogInput",
                    ident: format!("{device_id:?}"),
                },
            ))?;
            let DeviceHandle::AnalogInput(device) = handle else {
                return Err(AcquisitionError::Device(
                    crate::error::DeviceError::InvalidDevice {
                        group: "AnalogInput",
                        ident: format!("{device_id:?}"),
                    },
                ));
            };
            for cfg in cfgs {
                if cfg.rate > device.max_rate() {
                    return Err(AcquisitionError::InvalidSampleRate {
                        trace_id: cfg.trace_id,
                        requested: cfg.rate,
                        max: device.max_rate(),
                    });
                }
                if cfg.channel >= device.channels() {
                    return Err(AcquisitionError::InvalidChannel {
                        trace_id: cfg.trace_id,
                        channel: cfg.channel,
                    });
                }
            }
        }

        self.traces.clear();
        self.trace_rates.clear();
        self.device_for_trace.clear();
        for cfg in configs {
            let handle = registry.handle(cfg.device_id).unwrap();
            let DeviceHandle::AnalogInput(device) = handle else {
                unreachable!("validated above");
            };
            let range = if cfg.unipolar {
                device.unipolar_range(0)
            } else {
                device.bipolar_range(0)
            }
            .unwrap_or(10.0) as f32;
            let trace = InTrace::new(
                TraceIdentity {
                    trace_id: cfg.trace_id,
                    channel: cfg.channel,
                    device_id: cfg.device_id.raw(),
                    reference: cfg.reference,
                    unipolar: cfg.unipolar,
                    mode: 0,
                    ident: cfg.ident.clone(),
                    continuous: cfg.continuous,
                    priority: cfg.priority,
                },
                cfg.capacity,
                TraceParams {
                    stepsize: 1.0 / cfg.rate,
                    gain_index: cfg.gain_index,
                    min_value: -range,
                    max_value: range,
                    scale: 1.0,
                    unit: "V".into(),
                },
            );
            self.trace_rates.insert(cfg.trace_id, cfg.rate);
            self.device_for_trace.insert(cfg.trace_id, cfg.device_id);
            self.traces.insert(cfg.trace_id, Arc::new(trace));
        }
        Ok(())
    }

    /// Begins acquisition on `primary`, then co-starts every device in
    /// `secondaries` against the primary's shared trigger. The primary's
    /// first sample index is 0 on every device;
    /// downstream code must never infer alignment from wall-clock time.
    pub fn start(
        &mut self,
        registry: &mut DeviceRegistry,
        primary: DeviceId,
        secondaries: &[DeviceId],
    ) -> Result<(), AcquisitionError> {
        self.running.store(true, Ordering::SeqCst);
        let token = CoStartToken(self.co_start_counter.fetch_add(1, Ordering::SeqCst));

        log::debug!("starting acquisition: primary {primary:?}, {} secondaries co-started on token {token:?}", secondaries.len());
        self.spawn_worker(registry, primary, None)?;
        for &secondary in secondaries {
            self.spawn_worker(registry, secondary, Some(token))?;
        }
        Ok(())
    }

    fn spawn_worker(
        &mut self,
        registry: &mut DeviceRegistry,
        device_id: DeviceId,
        co_start: Option<CoStartToken>,
    ) -> Result<(), AcquisitionError> {
        let (path, handle) = registry.take_handle(device_id).ok_or(AcquisitionError::Device(
            crate::error::DeviceError::InvalidDevice {
                group: "AnalogInput",
                ident: format!("{device_id:?}"),
            },
        ))?;
        let DeviceHandle::AnalogInput(mut device) = handle else {
            registry.return_handle(device_id, path, handle);
            return Err(AcquisitionError::Device(
                crate::error::DeviceError::InvalidDevice {
                    group: "AnalogInput",
                    ident: format!("{device_id:?}"),
                },
            ));
        };

        let mut channel_trace_ids: Vec<(u32, u32)> = self
            .traces
            .values()
            .filter(|t| self.device_for_trace.get(&t.identity.trace_id) == Some(&device_id))
            .map(|t| (t.identity.channel, t.identity.trace_id))
            .collect();
        channel_trace_ids.sort_by_key(|(ch, _)| *ch);
        let channels: Vec<u32> = channel_trace_ids.iter().map(|(ch, _)| *ch).collect();
        let rate = channels
            .first()
            .and_then(|_| {
                channel_trace_ids
                    .first()
                    .map(|(_, tid)| self.trace_rates[tid])
            })
            .unwrap_or(0.0);

        device
            .prepare_read(rate, &channels)
            .map_err(AcquisitionError::Device)?;
        device
            .start_read(co_start)
            .map_err(AcquisitionError::Device)?;
        log::debug!(
            "armed {:?} on {} channel(s) at {rate} Hz, co_start={co_start:?}",
            device_id,
            channels.len()
        );

        let traces: Vec<Arc<InTrace>> = channel_trace_ids
            .iter()
            .map(|(_, tid)| self.traces[tid].clone())
            .collect();

        let running = self.running.clone();
        let notifier = self.notifier.clone();
        let (gain_tx, gain_rx): (Sender<GainRequest>, Receiver<GainRequest>) = bounded(4);

        let join = std::thread::Builder::new()
            .name(format!("ai-worker-{}", device_id.raw()))
            .spawn(move || pump_loop(device, traces, running, notifier, gain_rx))
            .expect("spawn AI worker thread");

        self.workers.insert(
            device_id,
            DeviceWorker {
                device_id,
                channel_trace_ids,
                join,
                gain_tx,
            },
        );
        Ok(())
    }

    /// Blocks until `trace_id`'s `size() >= min_index` or `timeout` elapses.
    pub fn wait_for_samples(&self, trace_id: u32, min_index: u64, timeout: Duration) -> bool {
        let Some(trace) = self.traces.get(&trace_id) else {
            return false;
        };
        let trace = trace.clone();
        self.notifier
            .wait_while(|| trace.size() >= min_index, timeout)
    }

    /// Applies pending per-channel gain changes at the next safe boundary:
    /// stops hardware, rearms with new gains, and sets `restartIndex =
    /// size()` after the gap.
    pub fn activate_gains(
        &self,
        device_id: DeviceId,
        changes: HashMap<u32, u32>,
    ) -> Result<(), AcquisitionError> {
        log::debug!("activate_gains: {device_id:?} <- {changes:?}");
        let worker = self
            .workers
            .get(&device_id)
            .ok_or(AcquisitionError::NotRunning)?;
        let (ack_tx, ack_rx) = bounded(1);
        worker
            .gain_tx
            .send(GainRequest::Apply {
                changes,
                ack: ack_tx,
            })
            .map_err(|_| AcquisitionError::NotRunning)?;
        let result = ack_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| AcquisitionError::WaitTimeout { index: 0 })?;
        if let Err(e) = &result {
            log::warn!("activate_gains on {device_id:?} failed: {e}");
        }
        result
    }

    /// Stops every worker and returns its device to `registry`.
    pub fn stop(&mut self, registry: &mut DeviceRegistry) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.notify();
        for (device_id, worker) in self.workers.drain() {
            let handle = worker.join.join().unwrap_or_else(|_| {
                panic!("AI worker thread for {device_id:?} panicked")
            });
            registry.return_handle(device_id, String::new(), handle);
        }
    }

    pub fn reset(&mut self) {
        for trace in self.traces.values() {
            trace.reset();
        }
    }
}

/// Worker body: read from driver, convert, append, publish, repeat. Owns
/// the device for its whole lifetime and hands it back in its return value
/// when `running` goes false.
fn pump_loop(
    mut device: Box<dyn crate::device::AnalogInput>,
    traces: Vec<Arc<InTrace>>,
    running: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
    gain_rx: Receiver<GainRequest>,
) -> DeviceHandle {
    let n_channels = traces.len().max(1);
    let mut raw = Vec::new();
    let mut converted = Vec::new();

    while running.load(Ordering::SeqCst) {
        if let Ok(GainRequest::Apply { changes, ack }) = gain_rx.try_recv() {
            let result = apply_gain_change(device.as_mut(), &traces, &changes);
            let _ = ack.send(result);
        }

        raw.clear();
        match device.read_data(&mut raw) {
            Ok(0) => {
                std::thread::sleep(Duration::from_micros(500));
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("AI worker for {:?}: fatal read error: {e}", device.ident());
                break;
            }
        }

        converted.clear();
        device.convert_data(&raw, &mut converted);

        for (ch, trace) in traces.iter().enumerate() {
            let channel_samples: Vec<f32> = converted
                .iter()
                .skip(ch)
                .step_by(n_channels)
                .copied()
                .collect();
            trace.append(&channel_samples);
        }
        notifier.notify();
    }

    device.stop().ok();
    DeviceHandle::AnalogInput(device)
}

fn apply_gain_change(
    device: &mut dyn crate::device::AnalogInput,
    traces: &[Arc<InTrace>],
    changes: &HashMap<u32, u32>,
) -> Result<(), AcquisitionError> {
    device.stop().map_err(AcquisitionError::Device)?;
    for trace in traces {
        if let Some(&gain_index) = changes.get(&trace.identity.channel) {
            let (scale, min_value, max_value) = device
                .set_gain(trace.identity.channel, gain_index)
                .map_err(AcquisitionError::Device)?;
            let mut params = trace.params();
            params.gain_index = gain_index;
            params.scale = scale;
            params.min_value = min_value;
            params.max_value = max_value;
            trace.reconfigure(params);
            trace.mark_restart(trace.size());
        }
    }
    let channels: Vec<u32> = traces.iter().map(|t| t.identity.channel).collect();
    let rate = traces
        .first()
        .map(|t| 1.0 / t.params().stepsize)
        .unwrap_or(0.0);
    device
        .prepare_read(rate, &channels)
        .map_err(AcquisitionError::Device)?;
    device
        .start_read(None)
        .map_err(AcquisitionError::Device)?;
    Ok(())
}
