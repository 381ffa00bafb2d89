//! Stable, bit-combinable device error vocabulary plus the structured,
//! per-component error enums that sit above it.

use bitflags::bitflags;

bitflags! {
    /// Stable, bit-combinable device-boundary error codes.
    ///
    /// This is the wire-level vocabulary every device contract in
    /// [`crate::device`] reports through. Structured errors above the
    /// device boundary (`DeviceError`, `AcquisitionError`, ...) carry a
    /// `DaqErrorFlags` for interop with persistence/telemetry, but callers
    /// within this crate should match on the structured enum, not the bits.
    #[derive(Default)]
    pub struct DaqErrorFlags: u32 {
        const NOT_OPEN              = 1 << 0;
        const INVALID_DEVICE        = 1 << 1;
        const WRITE_ERROR           = 1 << 2;
        const READ_ERROR            = 1 << 3;
        const OVERFLOW              = 1 << 4;
        const UNDERFLOW             = 1 << 5;
        const OVERFLOW_UNDERRUN     = 1 << 6;
        const BUSY                  = 1 << 7;
        const NO_DATA               = 1 << 8;
        const INVALID_START_SOURCE  = 1 << 9;
        const INVALID_DELAY         = 1 << 10;
        const INVALID_SAMPLE_RATE   = 1 << 11;
        const INVALID_CHANNEL       = 1 << 12;
        const INVALID_REFERENCE     = 1 << 13;
        const INVALID_GAIN          = 1 << 14;
        const INVALID_BUFFER_TIME   = 1 << 15;
        const INVALID_UPDATE_TIME   = 1 << 16;
    }
}

/// Errors raised opening, configuring, or tearing down a device through
/// [`crate::device::DeviceRegistry`].
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device {ident:?} of group {group:?} is not open")]
    NotOpen { group: &'static str, ident: String },

    #[error("no device named {ident:?} in group {group:?}")]
    InvalidDevice { group: &'static str, ident: String },

    #[error("write to device {ident:?} failed: {reason}")]
    WriteError { ident: String, reason: String },

    #[error("read from device {ident:?} failed: {reason}")]
    ReadError { ident: String, reason: String },

    #[error("device {ident:?} is busy")]
    Busy { ident: String },
}

impl DeviceError {
    pub fn flags(&self) -> DaqErrorFlags {
        match self {
            DeviceError::NotOpen { .. } => DaqErrorFlags::NOT_OPEN,
            DeviceError::InvalidDevice { .. } => DaqErrorFlags::INVALID_DEVICE,
            DeviceError::WriteError { .. } => DaqErrorFlags::WRITE_ERROR,
            DeviceError::ReadError { .. } => DaqErrorFlags::READ_ERROR,
            DeviceError::Busy { .. } => DaqErrorFlags::BUSY,
        }
    }
}

/// Errors raised while arming or running the [`crate::acquisition::AcquisitionEngine`].
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("trace {trace_id} requests rate {requested} Hz above device max {max} Hz")]
    InvalidSampleRate {
        trace_id: u32,
        requested: f64,
        max: f64,
    },

    #[error("trace {trace_id} requests channel {channel} out of range")]
    InvalidChannel { trace_id: u32, channel: u32 },

    #[error("trace {trace_id} requests an unsupported reference mode")]
    InvalidReference { trace_id: u32 },

    #[error("trace {trace_id} requests gain index {gain_index} out of range")]
    InvalidGain { trace_id: u32, gain_index: u32 },

    #[error("co-start set mixes start sources: {first} and {second}")]
    MultipleStartSources { first: u32, second: u32 },

    #[error("device {device} has inconsistent delay/rate across its traces")]
    InconsistentDeviceTiming { device: String },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("acquisition is not running")]
    NotRunning,

    #[error("timed out waiting for sample index {index}")]
    WaitTimeout { index: u64 },
}

impl AcquisitionError {
    pub fn flags(&self) -> DaqErrorFlags {
        match self {
            AcquisitionError::InvalidSampleRate { .. } => DaqErrorFlags::INVALID_SAMPLE_RATE,
            AcquisitionError::InvalidChannel { .. } => DaqErrorFlags::INVALID_CHANNEL,
            AcquisitionError::InvalidReference { .. } => DaqErrorFlags::INVALID_REFERENCE,
            AcquisitionError::InvalidGain { .. } => DaqErrorFlags::INVALID_GAIN,
            AcquisitionError::MultipleStartSources { .. } => DaqErrorFlags::INVALID_START_SOURCE,
            AcquisitionError::InconsistentDeviceTiming { .. } => DaqErrorFlags::INVALID_BUFFER_TIME,
            AcquisitionError::Device(e) => e.flags(),
            AcquisitionError::NotRunning => DaqErrorFlags::NOT_OPEN,
            AcquisitionError::WaitTimeout { .. } => DaqErrorFlags::NO_DATA,
        }
    }
}

/// Errors raised submitting or running an [`crate::stimulus::OutSignal`]
/// through the [`crate::stimulus::StimulusEngine`].
#[derive(Debug, thiserror::Error)]
pub enum StimulusError {
    #[error("signal delay {0} is negative")]
    InvalidDelay(f64),

    #[error("device rejected sample rate {requested} Hz (max {max} Hz)")]
    InvalidSampleRate { requested: f64, max: f64 },

    #[error("start source {0} is not recognised")]
    InvalidStartSource(u32),

    #[error("attenuator could not realise intensity after {attempts} attempts")]
    AttenuatorExhausted { attempts: u8 },

    #[error("output device stalled or started late (overflow/underrun)")]
    OverflowUnderrun,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl StimulusError {
    pub fn flags(&self) -> DaqErrorFlags {
        match self {
            StimulusError::InvalidDelay(_) => DaqErrorFlags::INVALID_DELAY,
            StimulusError::InvalidSampleRate { .. } => DaqErrorFlags::INVALID_SAMPLE_RATE,
            StimulusError::InvalidStartSource(_) => DaqErrorFlags::INVALID_START_SOURCE,
            StimulusError::AttenuatorExhausted { .. } => DaqErrorFlags::OVERFLOW,
            StimulusError::OverflowUnderrun => DaqErrorFlags::OVERFLOW_UNDERRUN,
            StimulusError::Device(e) => e.flags(),
        }
    }
}

/// Errors raised building or ticking the [`crate::filter::FilterGraph`].
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter graph has a cycle involving node {node}")]
    Cycle { node: String },

    #[error("node {node} references unknown input {input}")]
    UnknownInput { node: String, input: String },

    #[error("node {node} does not support capability {capability:?}")]
    UnsupportedCapability {
        node: String,
        capability: crate::filter::Capability,
    },
}

/// Errors raised by [`crate::repro::RunControl`].
#[derive(Debug, thiserror::Error)]
pub enum RunControlError {
    #[error("no RePro registered under name {0:?}")]
    UnknownRepro(String),

    #[error("a RePro is already running")]
    AlreadyRunning,

    #[error("RePro {0:?} did not return within the cancellation grace period")]
    GraceTimeout(String),
}
