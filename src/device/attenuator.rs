//! Attenuator and attenuator-interface contracts.
//!
//! `AttenuatorInterface` bounds-checks, translates, and reports back what
//! was actually realised, since attenuators are step-quantised and may
//! clip against their range.

use crate::error::DeviceError;

use super::Device;

/// A physical attenuator bank, addressed in dB.
pub trait Attenuator: Device {
    /// Number of independently attenuated lines this device exposes.
    fn lines(&self) -> u32;

    /// Attenuate `channel` by `db`. Returns the dB value actually latched,
    /// which may differ from the request due to step quantisation or
    /// clipping to `[0, max_attenuation_db()]`.
    fn attenuate(&mut self, channel: u32, db: f64) -> Result<f64, DeviceError>;

    /// Validate `db` against this device's bounds without latching it.
    fn test_attenuate(&self, channel: u32, db: f64) -> Result<(), DeviceError>;

    fn set_mute(&mut self, muted: bool) -> Result<(), DeviceError>;

    fn calibrate(&mut self) -> Result<(), DeviceError>;

    fn max_attenuation_db(&self) -> f64;
}

/// Outcome of realising a logical intensity through an attenuator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealisedIntensity {
    pub intensity: f64,
    pub overflow: bool,
    pub underflow: bool,
}

/// Translates a logical intensity level (e.g. dB-SPL for an auditory
/// stimulus) through a physical [`Attenuator`]'s discrete step table to a
/// device-level amplitude. The interface owns the intensity-to-dB mapping;
/// the physical attenuator only ever sees dB.
pub trait AttenuatorInterface: Send {
    /// Convert a logical intensity to attenuation in dB for `channel`.
    fn intensity_to_db(&self, channel: u32, intensity: f64) -> f64;

    /// Convert realised attenuation in dB back to a logical intensity.
    fn db_to_intensity(&self, channel: u32, db: f64) -> f64;

    fn attenuator_mut(&mut self) -> &mut dyn Attenuator;

    /// Request `intensity` on `channel`: bounds-check, translate, latch,
    /// and report back what was actually realised (clamped into range,
    /// flagged as overflow/underflow rather than erroring outright — the
    /// caller, i.e. [`crate::stimulus::StimulusEngine`], decides whether
    /// and how to retry).
    fn set_intensity(
        &mut self,
        channel: u32,
        intensity: f64,
    ) -> Result<RealisedIntensity, DeviceError> {
        let max_db = self.attenuator_mut().max_attenuation_db();
        let requested_db = self.intensity_to_db(channel, intensity);
        let (clamped_db, overflow, underflow) = if requested_db > max_db {
            (max_db, true, false)
        } else if requested_db < 0.0 {
            (0.0, false, true)
        } else {
            (requested_db, false, false)
        };
        let realised_db = self.attenuator_mut().attenuate(channel, clamped_db)?;
        Ok(RealisedIntensity {
            intensity: self.db_to_intensity(channel, realised_db),
            overflow,
            underflow,
        })
    }
}
