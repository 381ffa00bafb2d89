//! `StimulusEngine`: accepts `OutSignal`s, applies attenuation, and drives
//! analog output devices in direct or timed mode.

pub mod index;
pub mod outsignal;

pub use index::{StimulusDescriptor, StimulusIndex};
pub use outsignal::OutSignal;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::acquisition::InTrace;
use crate::device::attenuator::AttenuatorInterface;
use crate::device::registry::{DeviceId, DeviceRegistry};
use crate::device::CoStartToken;
use crate::error::{DaqErrorFlags, StimulusError};

#[derive(Debug, Clone)]
pub struct StimulusEngineConfig {
    /// Bound on attenuator retry attempts; see DESIGN.md "Open Question
    /// Decisions" for the rationale.
    pub max_attenuation_attempts: u8,
    /// How long a timed write waits for its onset sample to actually be
    /// acquired before giving up with `OverflowUnderrun`.
    pub onset_timeout: Duration,
}

impl Default for StimulusEngineConfig {
    fn default() -> Self {
        Self {
            max_attenuation_attempts: 3,
            onset_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of a completed timed write, returned to the caller (typically a
/// RePro) for bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub signal_index: u64,
}

pub struct StimulusEngine {
    config: StimulusEngineConfig,
    index: Mutex<StimulusIndex>,
}

impl StimulusEngine {
    pub fn new(config: StimulusEngineConfig) -> Self {
        Self {
            config,
            index: Mutex::new(StimulusIndex::new(256)),
        }
    }

    pub fn index(&self) -> std::sync::MutexGuard<'_, StimulusIndex> {
        self.index.lock().unwrap()
    }

    /// A single value pushed immediately, with no timing relation to
    /// acquisition — intended for bias currents and resting potentials.
    ///
    /// Takes `signal` by mutable reference rather than by value: attenuation
    /// retries set `OVERFLOW`/`UNDERFLOW` on `signal.error_flags`, and the
    /// caller needs that bitset back alongside the `Result` on every path,
    /// not just the ones that happen to keep their own copy around.
    pub fn direct_write(
        &self,
        registry: &mut DeviceRegistry,
        device_id: DeviceId,
        channel: u32,
        signal: &mut OutSignal,
        attenuator: Option<&mut dyn AttenuatorInterface>,
    ) -> Result<(), StimulusError> {
        signal.validate()?;
        if let Some(iface) = attenuator {
            self.apply_attenuation(iface, channel, signal)?;
        }
        let value = signal.samples.first().copied().unwrap_or(0.0);
        let device = registry
            .analog_output_mut(device_id)
            .ok_or(StimulusError::Device(crate::error::DeviceError::NotOpen {
                group: "AnalogOutput",
                ident: format!("{device_id:?}"),
            }))?;
        device.direct_write(channel, value).map_err(StimulusError::Device)
    }

    /// A waveform with a well-defined onset: arms the output, stamps
    /// `signalIndex` on every co-acquiring `InTrace` at the exact sample
    /// index of the onset, and begins output.
    #[allow(clippy::too_many_arguments)]
    pub fn timed_write(
        &self,
        registry: &mut DeviceRegistry,
        device_id: DeviceId,
        channel: u32,
        signal: &mut OutSignal,
        co_acquiring: &[Arc<InTrace>],
        co_start_outputs: &[DeviceId],
        attenuator: Option<&mut dyn AttenuatorInterface>,
    ) -> Result<WriteOutcome, StimulusError> {
        signal.validate()?;
        if let Some(iface) = attenuator {
            self.apply_attenuation(iface, channel, signal)?;
        }

        let onset_index = self.try_timed_write(
            registry,
            device_id,
            channel,
            signal,
            co_acquiring,
            co_start_outputs,
        );

        let onset_index = match onset_index {
            Ok(idx) => idx,
            Err(StimulusError::OverflowUnderrun) => {
                // Restore the previous DC level, then retry once.
                if let Some(device) = registry.analog_output_mut(device_id) {
                    let _ = device.direct_write(channel, 0.0);
                }
                self.try_timed_write(
                    registry,
                    device_id,
                    channel,
                    signal,
                    co_acquiring,
                    co_start_outputs,
                )?
            }
            Err(e) => return Err(e),
        };

        self.index.lock().unwrap().record(StimulusDescriptor {
            signal_index: onset_index as i64,
            start_time: onset_index as f64
                * co_acquiring
                    .first()
                    .map(|t| t.params().stepsize)
                    .unwrap_or(0.0),
            trace: co_acquiring
                .first()
                .map(|t| t.identity.ident.clone())
                .unwrap_or_default(),
            intensity: signal.intensity,
            waveform: signal.description.clone(),
            duration: signal.samples.len() as f64 * signal.sample_interval,
            ident: signal.ident.clone(),
            channel,
            device: format!("{device_id:?}"),
        });

        Ok(WriteOutcome {
            signal_index: onset_index,
        })
    }

    fn try_timed_write(
        &self,
        registry: &mut DeviceRegistry,
        device_id: DeviceId,
        channel: u32,
        signal: &OutSignal,
        co_acquiring: &[Arc<InTrace>],
        co_start_outputs: &[DeviceId],
    ) -> Result<u64, StimulusError> {
        let rate = if signal.sample_interval > 0.0 {
            1.0 / signal.sample_interval
        } else {
            0.0
        };

        // Step 1: arm the output device. Checked against the device's own
        // max rate before `prepare_write` so a rejection surfaces as the
        // dedicated `InvalidSampleRate` variant rather than a generic
        // device write error.
        {
            let device = registry.analog_output_mut(device_id).ok_or(
                StimulusError::Device(crate::error::DeviceError::NotOpen {
                    group: "AnalogOutput",
                    ident: format!("{device_id:?}"),
                }),
            )?;
            let max = device.max_rate();
            if rate > max {
                return Err(StimulusError::InvalidSampleRate { requested: rate, max });
            }
            device
                .prepare_write(rate, channel, &signal.samples)
                .map_err(StimulusError::Device)?;
        }

        // Step 2: register the expected onset. We compute it as a fixed
        // offset of `delay` seconds from "now" on the primary co-acquiring
        // trace's own clock, then wait for acquisition to actually reach
        // that index before publishing it, so signalIndex is only ever
        // stamped once the onset sample has actually been appended — a
        // host-side approximation of hardware onset timestamping.
        let Some(primary_trace) = co_acquiring.first() else {
            return Err(StimulusError::InvalidStartSource(signal.start_source));
        };
        let stepsize = primary_trace.params().stepsize;
        let delay_samples = (signal.delay / stepsize).round() as u64;
        let onset_index = primary_trace.size() + delay_samples;

        // Step 3: bind co-starting outputs to the same start source.
        let token = CoStartToken(onset_index);
        for &out_id in co_start_outputs {
            if let Some(device) = registry.analog_output_mut(out_id) {
                device
                    .start_write(Some(token))
                    .map_err(StimulusError::Device)?;
            }
        }
        log::trace!(
            "{device_id:?} ch{channel}: armed, onset_index={onset_index}, {} co-start output(s)",
            co_start_outputs.len()
        );

        // Step 4: begin output.
        {
            let device = registry.analog_output_mut(device_id).ok_or(
                StimulusError::Device(crate::error::DeviceError::NotOpen {
                    group: "AnalogOutput",
                    ident: format!("{device_id:?}"),
                }),
            )?;
            device.start_write(None).map_err(StimulusError::Device)?;
        }

        if !primary_trace.wait_for_samples(onset_index + 1, self.config.onset_timeout) {
            log::warn!(
                "{device_id:?} ch{channel}: onset sample {onset_index} not acquired within {:?}",
                self.config.onset_timeout
            );
            return Err(StimulusError::OverflowUnderrun);
        }

        for trace in co_acquiring {
            trace.stamp_signal_index(onset_index);
        }
        log::debug!("{device_id:?} ch{channel}: signalIndex {onset_index} stamped on {} trace(s)", co_acquiring.len());

        Ok(onset_index)
    }

    /// Attenuator stack: translate the requested intensity through the
    /// interface, retrying up to `max_attenuation_attempts` times,
    /// accumulating `Overflow`/`Underflow` flags on the signal. The final
    /// realised intensity is written back into `signal.intensity` even on
    /// exhaustion, per the Open Question decision recorded in DESIGN.md.
    fn apply_attenuation(
        &self,
        iface: &mut dyn AttenuatorInterface,
        channel: u32,
        signal: &mut OutSignal,
    ) -> Result<(), StimulusError> {
        let mut requested = signal.intensity;
        let mut attempts = 0u8;
        loop {
            attempts += 1;
            let realised = iface
                .set_intensity(channel, requested)
                .map_err(StimulusError::Device)?;
            if realised.overflow {
                signal.error_flags |= DaqErrorFlags::OVERFLOW;
            }
            if realised.underflow {
                signal.error_flags |= DaqErrorFlags::UNDERFLOW;
            }
            signal.intensity = realised.intensity;
            if !realised.overflow && !realised.underflow {
                return Ok(());
            }
            if attempts >= self.config.max_attenuation_attempts {
                log::warn!(
                    "attenuator on channel {channel} still out of range after {attempts} attempts, reporting clamped intensity {}",
                    realised.intensity
                );
                return Err(StimulusError::AttenuatorExhausted { attempts });
            }
            requested = realised.intensity;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimAttenuator;
    use crate::device::Device;

    struct OneToOne {
        att: SimAttenuator,
    }

    impl AttenuatorInterface for OneToOne {
        fn intensity_to_db(&self, _channel: u32, intensity: f64) -> f64 {
            intensity
        }
        fn db_to_intensity(&self, _channel: u32, db: f64) -> f64 {
            db
        }
        fn attenuator_mut(&mut self) -> &mut dyn crate::device::attenuator::Attenuator {
            &mut self.att
        }
    }

    #[test]
    fn overflow_retries_and_reports_clamped_intensity() {
        let engine = StimulusEngine::new(StimulusEngineConfig::default());
        let mut iface = OneToOne {
            att: SimAttenuator::new("att-0", 4, 100.0),
        };
        let mut signal = OutSignal::new(0, 1e-4, vec![0.0; 10]).with_intensity(200.0);
        engine.apply_attenuation(&mut iface, 0, &mut signal).unwrap();
        assert_eq!(signal.intensity, 100.0);
        assert!(signal.error_flags.contains(DaqErrorFlags::OVERFLOW));
        let _ = iface.att.ident();
    }

    #[test]
    fn timed_write_rejects_rate_above_device_max() {
        use crate::device::registry::DeviceHandle;
        use crate::device::sim::SimAnalogOutput;
        use crate::device::DeviceGroup;

        let mut registry = DeviceRegistry::new();
        let ao_id = registry.open(
            DeviceGroup::AnalogOutput,
            "/dev/ao0",
            DeviceHandle::AnalogOutput(Box::new(SimAnalogOutput::new("ao-0", 1, 1_000.0))),
        );

        let engine = StimulusEngine::new(StimulusEngineConfig::default());
        let mut signal = OutSignal::new(0, 1e-5, vec![0.0; 4]); // 100 kHz, above the 1 kHz max

        let err = engine
            .timed_write(&mut registry, ao_id, 0, &mut signal, &[], &[], None)
            .unwrap_err();
        assert!(matches!(
            err,
            StimulusError::InvalidSampleRate { requested, max } if requested > max
        ));
    }

    #[test]
    fn direct_write_surfaces_attenuation_flags_on_the_owned_signal() {
        let engine = StimulusEngine::new(StimulusEngineConfig::default());
        let mut registry = DeviceRegistry::new();
        let ao_id = registry.open(
            crate::device::DeviceGroup::AnalogOutput,
            "/dev/ao0",
            crate::device::registry::DeviceHandle::AnalogOutput(Box::new(
                crate::device::sim::SimAnalogOutput::new("ao-0", 1, 1_000.0),
            )),
        );
        let mut iface = OneToOne {
            att: SimAttenuator::new("att-0", 4, 100.0),
        };
        let mut signal = OutSignal::direct(0, 0.0).with_intensity(200.0);

        engine
            .direct_write(&mut registry, ao_id, 0, &mut signal, Some(&mut iface))
            .unwrap();

        // The caller kept ownership of `signal`, so the bits attenuation set
        // are visible here even though the call itself returned `Ok(())`.
        assert!(signal.error_flags.contains(DaqErrorFlags::OVERFLOW));
        assert_eq!(signal.intensity, 100.0);
    }
}
