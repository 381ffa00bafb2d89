//! End-to-end demo: simulated sine input, an IIR low-pass + peak detector
//! filter graph, a timed stimulus write looped back into a second input
//! channel, and a RePro run under `RunControl`. No real hardware involved;
//! every device here is one of the simulated ones in `ephys_rt::device::sim`.
//!
//! Run with `RUST_LOG=debug` to see the arm/co-start/gain/RePro log lines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ephys_rt::acquisition::{AcquisitionEngine, InTrace, TraceConfig};
use ephys_rt::device::registry::{DeviceHandle, DeviceRegistry};
use ephys_rt::device::sim::{Generator, SimAnalogInput, SimAnalogOutput};
use ephys_rt::device::DeviceGroup;
use ephys_rt::events::{DetectorConfig, EventStream};
use ephys_rt::filter::{FilterGraph, FilterGraphConfig, NodeConfig, NodeKind};
use ephys_rt::repro::{OptionTree, ReProContext, ReProOutcome, RunControl};
use ephys_rt::stimulus::{OutSignal, StimulusEngine, StimulusEngineConfig};
use ephys_rt::types::ReferenceMode;

fn main() {
    env_logger::init();

    let mut registry = DeviceRegistry::new();
    let loopback_queue = Arc::new(Mutex::new(std::collections::VecDeque::new()));

    let ai = SimAnalogInput::new("ai-0", 2, 100_000.0)
        .with_generator(0, Generator::Sine { freq_hz: 50.0, amplitude: 1.0 })
        .with_generator(1, Generator::Loopback(loopback_queue.clone()));
    let ai_id = registry.open(
        DeviceGroup::AnalogInput,
        "/dev/sim-ai0",
        DeviceHandle::AnalogInput(Box::new(ai)),
    );

    let ao = SimAnalogOutput::new("ao-0", 1, 100_000.0).with_loopback(loopback_queue);
    let ao_id = registry.open(
        DeviceGroup::AnalogOutput,
        "/dev/sim-ao0",
        DeviceHandle::AnalogOutput(Box::new(ao)),
    );

    let mut engine = AcquisitionEngine::new();
    engine
        .prepare(
            &registry,
            vec![
                TraceConfig {
                    trace_id: 0,
                    device_id: ai_id,
                    channel: 0,
                    rate: 10_000.0,
                    gain_index: 0,
                    reference: ReferenceMode::Differential,
                    unipolar: false,
                    capacity: 1 << 16,
                    ident: "V-raw".into(),
                    continuous: true,
                    priority: false,
                    start_source: 0,
                    delay: 0.0,
                },
                TraceConfig {
                    trace_id: 1,
                    device_id: ai_id,
                    channel: 1,
                    rate: 10_000.0,
                    gain_index: 0,
                    reference: ReferenceMode::Differential,
                    unipolar: false,
                    capacity: 1 << 16,
                    ident: "V-loopback".into(),
                    continuous: true,
                    priority: false,
                    start_source: 0,
                    delay: 0.0,
                },
            ],
        )
        .expect("trace configuration accepted");

    engine
        .start(&mut registry, ai_id, &[])
        .expect("acquisition starts");

    let raw = engine.trace(0).unwrap().clone();
    let loopback = engine.trace(1).unwrap().clone();

    let mut base_traces: HashMap<String, Arc<InTrace>> = HashMap::new();
    base_traces.insert("V-raw".to_string(), raw.clone());
    base_traces.insert("V-loopback".to_string(), loopback.clone());

    let filter_config = FilterGraphConfig {
        nodes: vec![
            NodeConfig {
                id: "lowpass".into(),
                input: "V-raw".into(),
                kind: NodeKind::Iir {
                    // single-pole low-pass around 200 Hz at a 10 kHz sample rate
                    biquads: vec![[0.06, 0.06, 0.0, -0.88, 0.0]],
                    output_capacity: 1 << 16,
                },
            },
            NodeConfig {
                id: "peaks".into(),
                input: "lowpass".into(),
                kind: NodeKind::PeakDetector {
                    config: DetectorConfig {
                        initial_thresh: 0.2,
                        ..Default::default()
                    },
                    output_capacity: 256,
                },
            },
        ],
    };

    let graph = FilterGraph::build(
        &filter_config,
        &base_traces,
        |id, cap| Arc::new(InTrace::new(
            ephys_rt::acquisition::TraceIdentity {
                trace_id: 0,
                channel: 0,
                device_id: 0,
                reference: ReferenceMode::Differential,
                unipolar: false,
                mode: 0,
                ident: id.to_string(),
                continuous: true,
                priority: false,
            },
            cap,
            ephys_rt::acquisition::TraceParams {
                stepsize: 1.0 / 10_000.0,
                gain_index: 0,
                min_value: -10.0,
                max_value: 10.0,
                scale: 1.0,
                unit: "V".into(),
            },
        )),
        |id, cap| Arc::new(EventStream::new(id, cap)),
    )
    .expect("filter graph wires up cleanly");
    let graph = Arc::new(graph);

    let tick_graph = graph.clone();
    let tick_running = std::thread::spawn(move || {
        for _ in 0..50 {
            tick_graph.tick().expect("graph tick never errors in this demo");
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let stimulus = Arc::new(StimulusEngine::new(StimulusEngineConfig::default()));
    let registry = Arc::new(Mutex::new(registry));
    let run_control = RunControl::new(stimulus, registry.clone(), Duration::from_millis(500));

    run_control.register(
        "pulse-and-wait",
        Arc::new(move |ctx: &mut ReProContext, _params: &OptionTree| {
            if !ctx.sleep_for(Duration::from_millis(100)) {
                return ReProOutcome::Aborted;
            }
            let mut signal = OutSignal::new(1, 1e-4, vec![0.5; 20]).with_delay(0.01);
            let co_acquiring = [loopback.clone()];
            match ctx.timed_write(ao_id, 0, &mut signal, &co_acquiring, &[]) {
                Ok(outcome) => {
                    log::info!("stimulus onset published at sample {}", outcome.signal_index);
                    if !signal.error_flags.is_empty() {
                        log::warn!("stimulus onset reported flags {:?}", signal.error_flags);
                    }
                }
                Err(e) => {
                    log::warn!("timed write failed: {e}");
                    return ReProOutcome::Failed;
                }
            }
            if !ctx.wait_samples("V-loopback", 50, Duration::from_secs(1)) {
                return ReProOutcome::Aborted;
            }
            ReProOutcome::Completed
        }),
    );

    run_control
        .start(
            "pulse-and-wait",
            OptionTree::new(),
            base_traces.clone(),
            HashMap::new(),
        )
        .expect("known RePro starts");

    std::thread::sleep(Duration::from_millis(800));
    run_control.stop();
    tick_running.join().ok();

    println!(
        "raw samples acquired: {}, peaks detected: {}",
        raw.size(),
        graph.output_stream("peaks").unwrap().count()
    );

    drop(run_control);
    engine.stop(&mut *registry.lock().unwrap());
}
