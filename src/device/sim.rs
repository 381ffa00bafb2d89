//! Deterministic simulated devices used for this crate's own test suite.
//!
//! These are the only waveform generators this crate ships; they are
//! seeded with `rand_xorshift` so tests are reproducible.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand_core::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::{AnalogInput, AnalogOutput, Attenuator, CoStartToken, Device, DeviceSettings, DigitalIo};
use crate::error::DeviceError;

/// A per-channel waveform a [`SimAnalogInput`] feeds into its acquisition.
pub enum Generator {
    Silence,
    Constant(f32),
    Sine { freq_hz: f64, amplitude: f32 },
    /// Seeded pseudo-random noise, amplitude-bounded.
    Noise { seed: u64, amplitude: f32 },
    /// Reads back whatever a paired [`SimAnalogOutput`] most recently wrote,
    /// for stimulus round-trip tests.
    Loopback(Arc<Mutex<VecDeque<f32>>>),
}

impl Generator {
    fn sample(&mut self, index: u64, dt: f64) -> f32 {
        match self {
            Generator::Silence => 0.0,
            Generator::Constant(v) => *v,
            Generator::Sine { freq_hz, amplitude } => {
                (*amplitude as f64 * (2.0 * std::f64::consts::PI * *freq_hz * index as f64 * dt).sin())
                    as f32
            }
            Generator::Noise { seed, amplitude } => {
                let mut rng = XorShiftRng::seed_from_u64(seed.wrapping_add(index));
                let unit = (rng.next_u32() as f32 / u32::MAX as f32) * 2.0 - 1.0;
                unit * *amplitude
            }
            Generator::Loopback(queue) => queue.lock().unwrap().pop_front().unwrap_or(0.0),
        }
    }
}

/// A simulated analog-input device driven by per-channel [`Generator`]s.
pub struct SimAnalogInput {
    ident: String,
    channels: u32,
    max_rate: f64,
    rate: f64,
    generators: Vec<Generator>,
    sample_counter: u64,
    running: bool,
}

impl SimAnalogInput {
    pub fn new(ident: &str, channels: u32, max_rate: f64) -> Self {
        Self {
            ident: ident.to_string(),
            channels,
            max_rate,
            rate: 0.0,
            generators: (0..channels).map(|_| Generator::Silence).collect(),
            sample_counter: 0,
            running: false,
        }
    }

    pub fn with_generator(mut self, channel: u32, generator: Generator) -> Self {
        self.generators[channel as usize] = generator;
        self
    }

    pub fn set_generator(&mut self, channel: u32, generator: Generator) {
        self.generators[channel as usize] = generator;
    }
}

impl Device for SimAnalogInput {
    fn ident(&self) -> &str {
        &self.ident
    }
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        self.sample_counter = 0;
        Ok(())
    }
    fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            ident: self.ident.clone(),
            path: "sim".into(),
            fields: Default::default(),
        }
    }
}

impl AnalogInput for SimAnalogInput {
    fn channels(&self) -> u32 {
        self.channels
    }
    fn bits(&self) -> u32 {
        16
    }
    fn max_rate(&self) -> f64 {
        self.max_rate
    }
    fn max_ranges(&self) -> u32 {
        1
    }
    fn unipolar_range(&self, index: u32) -> Option<f64> {
        (index == 0).then_some(10.0)
    }
    fn bipolar_range(&self, index: u32) -> Option<f64> {
        (index == 0).then_some(10.0)
    }

    fn test_read(&self, rate: f64, channel: u32, _gain_index: u32) -> Result<(), DeviceError> {
        if rate > self.max_rate {
            return Err(DeviceError::WriteError {
                ident: self.ident.clone(),
                reason: format!("rate {rate} exceeds max {}", self.max_rate),
            });
        }
        if channel >= self.channels {
            return Err(DeviceError::InvalidDevice {
                group: "AnalogInput",
                ident: self.ident.clone(),
            });
        }
        Ok(())
    }

    fn prepare_read(&mut self, rate: f64, channels: &[u32]) -> Result<(), DeviceError> {
        for &c in channels {
            self.test_read(rate, c, 0)?;
        }
        self.rate = rate;
        Ok(())
    }

    fn start_read(&mut self, _co_start: Option<CoStartToken>) -> Result<(), DeviceError> {
        self.running = true;
        Ok(())
    }

    fn read_data(&mut self, raw_out: &mut Vec<i32>) -> Result<usize, DeviceError> {
        if !self.running {
            return Ok(0);
        }
        // Simulate one "hardware block" of 32 frames per poll.
        const BLOCK: usize = 32;
        let dt = if self.rate > 0.0 { 1.0 / self.rate } else { 0.0 };
        for _ in 0..BLOCK {
            for ch in 0..self.generators.len() {
                let value = self.generators[ch].sample(self.sample_counter, dt);
                raw_out.push((value * i16::MAX as f32) as i32);
            }
            self.sample_counter += 1;
        }
        Ok(BLOCK)
    }

    fn convert_data(&self, raw: &[i32], converted: &mut Vec<f32>) -> usize {
        let before = converted.len();
        converted.extend(raw.iter().map(|&v| v as f32 / i16::MAX as f32));
        converted.len() - before
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        Ok(())
    }

    fn set_gain(&mut self, channel: u32, gain_index: u32) -> Result<(f32, f32, f32), DeviceError> {
        if channel >= self.channels {
            return Err(DeviceError::InvalidDevice {
                group: "AnalogInput",
                ident: self.ident.clone(),
            });
        }
        // Each gain step halves the range and doubles the scale, a simple
        // stand-in for a real PGA's gain table.
        let range = 10.0 / 2f32.powi(gain_index as i32);
        Ok((2f32.powi(gain_index as i32), -range, range))
    }
}

/// A simulated analog-output device; optionally mirrors every write into a
/// shared queue so a [`SimAnalogInput`] configured with
/// [`Generator::Loopback`] can read it back.
pub struct SimAnalogOutput {
    ident: String,
    channels: u32,
    max_rate: f64,
    loopback: Option<Arc<Mutex<VecDeque<f32>>>>,
}

impl SimAnalogOutput {
    pub fn new(ident: &str, channels: u32, max_rate: f64) -> Self {
        Self {
            ident: ident.to_string(),
            channels,
            max_rate,
            loopback: None,
        }
    }

    pub fn with_loopback(mut self, queue: Arc<Mutex<VecDeque<f32>>>) -> Self {
        self.loopback = Some(queue);
        self
    }
}

impl Device for SimAnalogOutput {
    fn ident(&self) -> &str {
        &self.ident
    }
    fn reset(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            ident: self.ident.clone(),
            path: "sim".into(),
            fields: Default::default(),
        }
    }
}

impl AnalogOutput for SimAnalogOutput {
    fn channels(&self) -> u32 {
        self.channels
    }
    fn max_rate(&self) -> f64 {
        self.max_rate
    }
    fn test_write(&self, rate: f64, _channel: u32) -> Result<(), DeviceError> {
        if rate > self.max_rate {
            return Err(DeviceError::WriteError {
                ident: self.ident.clone(),
                reason: format!("rate {rate} exceeds max {}", self.max_rate),
            });
        }
        Ok(())
    }

    fn prepare_write(&mut self, rate: f64, channel: u32, buffer: &[f32]) -> Result<(), DeviceError> {
        self.test_write(rate, channel)?;
        if let Some(queue) = &self.loopback {
            let mut q = queue.lock().unwrap();
            q.extend(buffer.iter().copied());
        }
        Ok(())
    }

    fn start_write(&mut self, _co_start: Option<CoStartToken>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn direct_write(&mut self, _channel: u32, value: f32) -> Result<(), DeviceError> {
        if let Some(queue) = &self.loopback {
            queue.lock().unwrap().push_back(value);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// A simulated digital-IO device: fixed line count, per-line ownership and
/// direction, and synchronous read/write. Pulses armed by `set_sync_pulse`
/// are recorded (line, duration, mode) but never fire on their own — there
/// is no wall-clock timer driving this device — so tests observe them via
/// `pulse(line)` rather than by polling `read_line`.
pub struct SimDigitalIo {
    ident: String,
    lines: u32,
    owner: Vec<Option<u32>>,
    output: Vec<bool>,
    value: Vec<bool>,
    pulses: std::collections::HashMap<u32, (f64, u32)>,
}

impl SimDigitalIo {
    pub fn new(ident: &str, lines: u32) -> Self {
        Self {
            ident: ident.to_string(),
            lines,
            owner: vec![None; lines as usize],
            output: vec![false; lines as usize],
            value: vec![false; lines as usize],
            pulses: std::collections::HashMap::new(),
        }
    }

    /// The `(duration, mode)` most recently armed on `line` via
    /// `set_sync_pulse`, or `None` if never armed or since cleared.
    pub fn pulse(&self, line: u32) -> Option<(f64, u32)> {
        self.pulses.get(&line).copied()
    }

    fn check_line(&self, line: u32) -> Result<(), DeviceError> {
        if line >= self.lines {
            return Err(DeviceError::InvalidDevice {
                group: "DigitalIo",
                ident: self.ident.clone(),
            });
        }
        Ok(())
    }
}

impl Device for SimDigitalIo {
    fn ident(&self) -> &str {
        &self.ident
    }
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.owner.iter_mut().for_each(|o| *o = None);
        self.output.iter_mut().for_each(|o| *o = false);
        self.value.iter_mut().for_each(|v| *v = false);
        self.pulses.clear();
        Ok(())
    }
    fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            ident: self.ident.clone(),
            path: "sim".into(),
            fields: Default::default(),
        }
    }
}

impl DigitalIo for SimDigitalIo {
    fn allocate_line(&mut self, line: u32) -> Result<(), DeviceError> {
        self.check_line(line)?;
        if self.owner[line as usize].is_some() {
            return Err(DeviceError::Busy {
                ident: self.ident.clone(),
            });
        }
        self.owner[line as usize] = Some(line);
        Ok(())
    }

    fn free_lines(&mut self, owner: u32) -> Result<(), DeviceError> {
        for slot in self.owner.iter_mut() {
            if *slot == Some(owner) {
                *slot = None;
            }
        }
        Ok(())
    }

    fn configure_line(&mut self, line: u32, output: bool) -> Result<(), DeviceError> {
        self.check_line(line)?;
        self.output[line as usize] = output;
        Ok(())
    }

    fn write_line(&mut self, line: u32, value: bool) -> Result<(), DeviceError> {
        self.check_line(line)?;
        if !self.output[line as usize] {
            return Err(DeviceError::WriteError {
                ident: self.ident.clone(),
                reason: format!("line {line} is not configured as output"),
            });
        }
        self.value[line as usize] = value;
        Ok(())
    }

    fn read_line(&self, line: u32) -> Result<bool, DeviceError> {
        self.check_line(line)?;
        Ok(self.value[line as usize])
    }

    fn write_lines(&mut self, mask: u32, value: u32) -> Result<(), DeviceError> {
        for line in 0..self.lines {
            if mask & (1 << line) != 0 {
                self.write_line(line, value & (1 << line) != 0)?;
            }
        }
        Ok(())
    }

    fn read_lines(&self, mask: u32) -> Result<u32, DeviceError> {
        let mut bits = 0u32;
        for line in 0..self.lines {
            if mask & (1 << line) != 0 && self.read_line(line)? {
                bits |= 1 << line;
            }
        }
        Ok(bits)
    }

    fn set_sync_pulse(
        &mut self,
        mode_mask: u32,
        mode_bits: u32,
        line: u32,
        duration: f64,
        mode: u32,
    ) -> Result<(), DeviceError> {
        self.check_line(line)?;
        if duration < 0.0 {
            return Err(DeviceError::WriteError {
                ident: self.ident.clone(),
                reason: format!("pulse duration {duration} is negative"),
            });
        }
        let resolved = (mode & mode_mask) | (mode_bits & !mode_mask);
        self.pulses.insert(line, (duration, resolved));
        Ok(())
    }

    fn clear_sync_pulse(&mut self, line: u32) -> Result<(), DeviceError> {
        self.check_line(line)?;
        self.pulses.remove(&line);
        Ok(())
    }
}

/// A simulated digital attenuator bank with a configurable maximum.
pub struct SimAttenuator {
    ident: String,
    max_db: f64,
    lines: u32,
    muted: bool,
}

impl SimAttenuator {
    pub fn new(ident: &str, lines: u32, max_db: f64) -> Self {
        Self {
            ident: ident.to_string(),
            max_db,
            lines,
            muted: false,
        }
    }
}

impl Device for SimAttenuator {
    fn ident(&self) -> &str {
        &self.ident
    }
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.muted = false;
        Ok(())
    }
    fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            ident: self.ident.clone(),
            path: "sim".into(),
            fields: Default::default(),
        }
    }
}

impl Attenuator for SimAttenuator {
    fn lines(&self) -> u32 {
        self.lines
    }
    fn attenuate(&mut self, _channel: u32, db: f64) -> Result<f64, DeviceError> {
        Ok(db.clamp(0.0, self.max_db))
    }
    fn test_attenuate(&self, _channel: u32, db: f64) -> Result<(), DeviceError> {
        if (0.0..=self.max_db).contains(&db) {
            Ok(())
        } else {
            Err(DeviceError::WriteError {
                ident: self.ident.clone(),
                reason: "attenuation out of range".into(),
            })
        }
    }
    fn set_mute(&mut self, muted: bool) -> Result<(), DeviceError> {
        self.muted = muted;
        Ok(())
    }
    fn calibrate(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn max_attenuation_db(&self) -> f64 {
        self.max_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_line_requires_output_configuration() {
        let mut dio = SimDigitalIo::new("dio-0", 4);
        let err = dio.write_line(0, true).unwrap_err();
        assert!(matches!(err, DeviceError::WriteError { .. }));
        dio.configure_line(0, true).unwrap();
        dio.write_line(0, true).unwrap();
        assert!(dio.read_line(0).unwrap());
    }

    #[test]
    fn write_lines_respects_mask() {
        let mut dio = SimDigitalIo::new("dio-0", 4);
        for line in 0..4 {
            dio.configure_line(line, true).unwrap();
        }
        dio.write_lines(0b0101, 0b1111).unwrap();
        assert_eq!(dio.read_lines(0b1111).unwrap(), 0b0101);
    }

    #[test]
    fn allocate_line_rejects_double_allocation() {
        let mut dio = SimDigitalIo::new("dio-0", 2);
        dio.allocate_line(0).unwrap();
        assert!(matches!(dio.allocate_line(0), Err(DeviceError::Busy { .. })));
        dio.free_lines(0).unwrap();
        dio.allocate_line(0).unwrap();
    }

    #[test]
    fn set_sync_pulse_records_resolved_mode_and_clear_removes_it() {
        let mut dio = SimDigitalIo::new("dio-0", 2);
        dio.set_sync_pulse(0b01, 0b10, 0, 0.002, 0b01).unwrap();
        assert_eq!(dio.pulse(0), Some((0.002, 0b01)));
        dio.clear_sync_pulse(0).unwrap();
        assert_eq!(dio.pulse(0), None);
    }

    #[test]
    fn set_sync_pulse_rejects_negative_duration() {
        let mut dio = SimDigitalIo::new("dio-0", 1);
        assert!(dio.set_sync_pulse(0, 0, 0, -1.0, 0).is_err());
    }
}
