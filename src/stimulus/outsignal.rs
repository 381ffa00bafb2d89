//! `OutSignal`: an output waveform submitted to the [`super::StimulusEngine`].

use crate::error::DaqErrorFlags;
use crate::types::{DC_SAMPLE_INTERVAL, MUTE_INTENSITY};

/// An analog output waveform.
#[derive(Debug, Clone)]
pub struct OutSignal {
    pub trace_id: u32,
    /// Sample interval in seconds, or [`DC_SAMPLE_INTERVAL`] for a
    /// single-sample/DC write.
    pub sample_interval: f64,
    /// Nonnegative delay, in seconds, from submission to onset.
    pub delay: f64,
    /// `0` = software start; `>0` names a hardware trigger line.
    pub start_source: u32,
    /// Logical level passed to the attenuator interface;
    /// [`MUTE_INTENSITY`] means "mute".
    pub intensity: f64,
    pub ident: String,
    pub description: String,
    pub error_flags: DaqErrorFlags,
    pub samples: Vec<f32>,
    /// Whether the signal runs as one continuous sweep rather than a
    /// single bounded trial.
    pub continuous: bool,
    /// Number of times to automatically re-arm after completion; `0` means
    /// infinite (only meaningful when `continuous` is true).
    pub repeat: u32,
}

impl OutSignal {
    pub fn new(trace_id: u32, sample_interval: f64, samples: Vec<f32>) -> Self {
        Self {
            trace_id,
            sample_interval,
            delay: 0.0,
            start_source: 0,
            intensity: 0.0,
            ident: String::new(),
            description: String::new(),
            error_flags: DaqErrorFlags::empty(),
            samples,
            continuous: false,
            repeat: 0,
        }
    }

    /// A single-sample/DC write holding `value` on `trace_id`.
    pub fn direct(trace_id: u32, value: f32) -> Self {
        Self::new(trace_id, DC_SAMPLE_INTERVAL, vec![value])
    }

    pub fn is_dc(&self) -> bool {
        self.sample_interval == DC_SAMPLE_INTERVAL
    }

    pub fn is_muted(&self) -> bool {
        self.intensity == MUTE_INTENSITY
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_intensity(mut self, intensity: f64) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_start_source(mut self, start_source: u32) -> Self {
        self.start_source = start_source;
        self
    }

    pub fn validate(&self) -> Result<(), crate::error::StimulusError> {
        if self.delay < 0.0 {
            return Err(crate::error::StimulusError::InvalidDelay(self.delay));
        }
        Ok(())
    }
}
