//! End-to-end scenarios exercising the public API the way a RePro author
//! would: device registry, acquisition, the stimulus write protocol, the
//! filter/detector pipeline, and RePro scheduling together rather than each
//! component in isolation (see each module's own `#[cfg(test)]` block for
//! that level).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ephys_rt::acquisition::{AcquisitionEngine, TraceConfig};
use ephys_rt::device::registry::{DeviceHandle, DeviceRegistry};
use ephys_rt::device::sim::{Generator, SimAnalogInput, SimAnalogOutput};
use ephys_rt::device::DeviceGroup;
use ephys_rt::events::{DetectorConfig, EventStream};
use ephys_rt::repro::{MacroAction, OptionTree, ReProContext, ReProOutcome, RunControl};
use ephys_rt::stimulus::{OutSignal, StimulusEngine, StimulusEngineConfig};
use ephys_rt::types::ReferenceMode;

fn trace_config(trace_id: u32, device_id: ephys_rt::device::registry::DeviceId, channel: u32, rate: f64, ident: &str) -> TraceConfig {
    TraceConfig {
        trace_id,
        device_id,
        channel,
        rate,
        gain_index: 0,
        reference: ReferenceMode::Differential,
        unipolar: false,
        capacity: 1 << 16,
        ident: ident.to_string(),
        continuous: true,
        priority: false,
        start_source: 0,
        delay: 0.0,
    }
}

/// Naive DFT magnitude at `freq_hz`, normalised to amplitude (so a unit-
/// amplitude sine returns ~1.0, not ~N/2).
fn dft_magnitude(samples: &[f32], stepsize: f64, freq_hz: f64) -> f64 {
    let n = samples.len();
    let (mut re, mut im) = (0.0, 0.0);
    for (k, &s) in samples.iter().enumerate() {
        let angle = 2.0 * std::f64::consts::PI * freq_hz * (k as f64) * stepsize;
        re += s as f64 * angle.cos();
        im -= s as f64 * angle.sin();
    }
    2.0 * (re * re + im * im).sqrt() / n as f64
}

#[test]
fn sine_round_trip_recovers_amplitude_in_the_dft() {
    let mut registry = DeviceRegistry::new();
    let loopback = Arc::new(Mutex::new(VecDeque::new()));

    let ai = SimAnalogInput::new("ai-0", 1, 20_000.0)
        .with_generator(0, Generator::Loopback(loopback.clone()));
    let ai_id = registry.open(
        DeviceGroup::AnalogInput,
        "/dev/ai0",
        DeviceHandle::AnalogInput(Box::new(ai)),
    );
    let ao = SimAnalogOutput::new("ao-0", 1, 20_000.0).with_loopback(loopback);
    let ao_id = registry.open(
        DeviceGroup::AnalogOutput,
        "/dev/ao0",
        DeviceHandle::AnalogOutput(Box::new(ao)),
    );

    let mut engine = AcquisitionEngine::new();
    let rate = 10_000.0;
    engine
        .prepare(&registry, vec![trace_config(0, ai_id, 0, rate, "V-loop")])
        .unwrap();
    engine.start(&mut registry, ai_id, &[]).unwrap();
    let trace = engine.trace(0).unwrap().clone();

    let stepsize = 1.0 / rate;
    let n = rate as usize; // 1 second
    let samples: Vec<f32> = (0..n)
        .map(|i| (0.5 * (2.0 * std::f64::consts::PI * 1000.0 * i as f64 * stepsize).sin()) as f32)
        .collect();
    let mut signal = OutSignal::new(0, stepsize, samples);

    let stimulus = StimulusEngine::new(StimulusEngineConfig::default());
    let outcome = stimulus
        .timed_write(&mut registry, ao_id, 0, &mut signal, &[trace.clone()], &[], None)
        .expect("timed write succeeds against a live loopback input");

    assert!(trace.wait_for_samples(outcome.signal_index + n as u64, Duration::from_secs(2)));

    let mut window = Vec::new();
    trace.read_into(outcome.signal_index, outcome.signal_index + n as u64, &mut window);
    let magnitude = dft_magnitude(&window, stepsize, 1000.0);
    assert!(
        (magnitude - 0.5).abs() < 0.05,
        "expected DFT magnitude near 0.5, got {magnitude}"
    );

    engine.stop(&mut registry);
}

#[test]
fn hundred_synthetic_peaks_are_all_detected() {
    use ephys_rt::acquisition::{InTrace, TraceIdentity, TraceParams};
    use ephys_rt::events::PeakTroughDetector;
    use rand_core::{RngCore, SeedableRng};
    use rand_xorshift::XorShiftRng;

    let stepsize = 1e-4;
    let gap = 50usize;
    let peak_width = 5usize;
    let mut samples = Vec::new();
    let mut rng = XorShiftRng::seed_from_u64(42);
    let mut expected_peak_indices = Vec::new();

    for _ in 0..100 {
        samples.extend(std::iter::repeat(0.0f32).take(gap));
        let amplitude = 0.6 + 0.4 * (rng.next_u32() as f32 / u32::MAX as f32);
        let peak_index = samples.len() + peak_width / 2;
        expected_peak_indices.push(peak_index as u64);
        samples.extend(std::iter::repeat(amplitude).take(peak_width));
    }
    samples.extend(std::iter::repeat(0.0f32).take(gap));
    // One spurious sub-threshold bump.
    samples.extend(std::iter::repeat(0.2f32).take(peak_width));
    samples.extend(std::iter::repeat(0.0f32).take(gap));

    let trace = InTrace::new(
        TraceIdentity {
            trace_id: 0,
            channel: 0,
            device_id: 0,
            reference: ReferenceMode::Differential,
            unipolar: false,
            mode: 0,
            ident: "V-synthetic".into(),
            continuous: true,
            priority: false,
        },
        samples.len() + 1,
        TraceParams {
            stepsize,
            gain_index: 0,
            min_value: -10.0,
            max_value: 10.0,
            scale: 1.0,
            unit: "V".into(),
        },
    );
    trace.append(&samples);

    let stream = EventStream::new("spikes", 256);
    let mut detector = PeakTroughDetector::new(DetectorConfig {
        initial_thresh: 0.5,
        min_thresh: 0.5,
        max_thresh: 1.0,
        adapt: true,
        ratio: 0.5,
        baseline_tau: 1.0,
        refractory: 0.0,
        ..Default::default()
    });
    detector.process(&trace, &stream, 0, samples.len() as u64);

    assert_eq!(stream.count(), 100, "exactly 100 real peaks should be accepted");
    for event in stream.events_since(0) {
        let nearest = expected_peak_indices
            .iter()
            .min_by_key(|&&idx| (idx as i64 - event.index as i64).abs())
            .unwrap();
        assert!((*nearest as i64 - event.index as i64).abs() <= 1);
    }
    assert!((0.6..=1.0).contains(&detector.threshold()));
}

#[test]
fn mid_stream_gain_change_moves_restart_index_and_updates_params() {
    let mut registry = DeviceRegistry::new();
    let ai = SimAnalogInput::new("ai-0", 1, 20_000.0).with_generator(0, Generator::Constant(1.0));
    let ai_id = registry.open(
        DeviceGroup::AnalogInput,
        "/dev/ai0",
        DeviceHandle::AnalogInput(Box::new(ai)),
    );

    let mut engine = AcquisitionEngine::new();
    let rate = 10_000.0;
    engine
        .prepare(&registry, vec![trace_config(0, ai_id, 0, rate, "V-0")])
        .unwrap();
    engine.start(&mut registry, ai_id, &[]).unwrap();
    let trace = engine.trace(0).unwrap().clone();

    assert!(trace.wait_for_samples(10_000, Duration::from_secs(2)));
    let before = trace.params();
    let size_before_gain_change = trace.size();

    let mut changes = HashMap::new();
    changes.insert(0u32, 1u32);
    engine.activate_gains(ai_id, changes).unwrap();

    // The simulated device has no real-time pacing, so a fixed sample-count
    // window tied to wall-clock time would be flaky here. Assert the
    // underlying invariant instead: restartIndex never lands before the
    // sample count already seen at the moment the change was requested,
    // and the new params are actually in effect.
    let restart = trace.restart_index();
    assert!(
        restart >= size_before_gain_change,
        "restart index {restart} precedes the size {size_before_gain_change} already seen before the request"
    );

    let after = trace.params();
    assert_ne!(before.gain_index, after.gain_index);
    assert_ne!(before.scale, after.scale);

    assert!(trace.wait_for_samples(restart + 10_000, Duration::from_secs(2)));
    engine.stop(&mut registry);
}

#[test]
fn repro_handoff_starts_fallback_with_the_expected_dc_level() {
    let mut registry = DeviceRegistry::new();
    let loopback = Arc::new(Mutex::new(VecDeque::new()));
    let ao = SimAnalogOutput::new("ao-0", 1, 1_000.0).with_loopback(loopback.clone());
    let ao_id = registry.open(
        DeviceGroup::AnalogOutput,
        "/dev/ao0",
        DeviceHandle::AnalogOutput(Box::new(ao)),
    );

    let stimulus = Arc::new(StimulusEngine::new(StimulusEngineConfig::default()));
    let registry = Arc::new(Mutex::new(registry));
    let rc = RunControl::new(stimulus, registry, Duration::from_millis(200));

    rc.register(
        "A",
        Arc::new(move |ctx: &mut ReProContext, _: &OptionTree| {
            ctx.sleep_for(Duration::from_millis(50));
            ReProOutcome::Completed
        }),
    );
    rc.register(
        "B",
        Arc::new(move |ctx: &mut ReProContext, _: &OptionTree| {
            let mut signal = OutSignal::direct(0, 0.75);
            ctx.direct_write(ao_id, 0, &mut signal).unwrap();
            ReProOutcome::Completed
        }),
    );

    rc.handoff(MacroAction::ExplicitFallBack("B".to_string()));
    rc.start("A", OptionTree::new(), HashMap::new(), HashMap::new())
        .unwrap();

    // "A" completes on its own after ~50ms; RunControl must start "B" as
    // its designated fallback without this test calling `start` again.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if loopback.lock().unwrap().back().copied() == Some(0.75) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "fallback \"B\" never wrote the expected DC level"
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    let written = loopback.lock().unwrap();
    assert_eq!(written.back().copied(), Some(0.75));
}
