//! External device contracts. Each plugin implements the subset of
//! capabilities it supports; there is no deep inheritance hierarchy, only
//! a flat "each device implements the slices it supports" model.

pub mod attenuator;
pub mod registry;
pub mod sim;
pub mod trigger;

use crate::error::DeviceError;

/// Capability groups a plugin class may be catalogued under
/// ([`registry::DeviceRegistry`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, enum_iterator::Sequence)]
pub enum DeviceGroup {
    AnalogInput,
    AnalogOutput,
    DigitalIo,
    Trigger,
    Attenuator,
    AttenuatorInterface,
    Miscellaneous,
}

impl DeviceGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceGroup::AnalogInput => "AnalogInput",
            DeviceGroup::AnalogOutput => "AnalogOutput",
            DeviceGroup::DigitalIo => "DigitalIo",
            DeviceGroup::Trigger => "Trigger",
            DeviceGroup::Attenuator => "Attenuator",
            DeviceGroup::AttenuatorInterface => "AttenuatorInterface",
            DeviceGroup::Miscellaneous => "Miscellaneous",
        }
    }
}

/// Common lifecycle every device, regardless of capability group, exposes.
pub trait Device: Send {
    /// A free-form identifier used for lookup (`DeviceRegistry::lookup`).
    fn ident(&self) -> &str;

    /// Stops activity and zeros internal buffers. Idempotent.
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// A snapshot of configured parameters, for persistence by the Config
    /// collaborator. Plain data, no further meaning to the core.
    fn settings(&self) -> DeviceSettings;
}

/// Opaque, serializable snapshot of a device's configured parameters.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DeviceSettings {
    pub ident: String,
    pub path: String,
    pub fields: std::collections::BTreeMap<String, String>,
}

/// One physical or simulated analog-input channel's acquisition contract.
///
/// Mirrors `relacs::AnalogInput` (see `daq/include/relacs/analoginput.h`):
/// `prepare_read`/`start_read` arm the device, then `read_data`/`convert_data`
/// are polled periodically by the owning [`crate::acquisition::AcquisitionEngine`]
/// worker.
pub trait AnalogInput: Device {
    fn channels(&self) -> u32;
    fn bits(&self) -> u32;
    fn max_rate(&self) -> f64;
    fn max_ranges(&self) -> u32;
    fn unipolar_range(&self, index: u32) -> Option<f64>;
    fn bipolar_range(&self, index: u32) -> Option<f64>;

    /// Validate `rate`/`channel`/`gain_index` without committing hardware
    /// state.
    fn test_read(&self, rate: f64, channel: u32, gain_index: u32) -> Result<(), DeviceError>;

    /// Arm the device for the given channels/rate. Must be called before
    /// `start_read`.
    fn prepare_read(&mut self, rate: f64, channels: &[u32]) -> Result<(), DeviceError>;

    /// Begin non-blocking acquisition. `co_start` is `Some` when this device
    /// is a secondary in a co-start group and should latch its clock to the
    /// shared trigger rather than free-running.
    fn start_read(&mut self, co_start: Option<CoStartToken>) -> Result<(), DeviceError>;

    /// Pull newly available raw samples from the driver into `raw_out`,
    /// interleaved per channel. Returns the number of frames read, `0` if
    /// none yet available.
    fn read_data(&mut self, raw_out: &mut Vec<i32>) -> Result<usize, DeviceError>;

    /// Convert raw counts in `raw` (as produced by `read_data`) to secondary
    /// units using this channel's scale/gain, appending to `converted`.
    /// Returns the number of converted samples.
    fn convert_data(&self, raw: &[i32], converted: &mut Vec<f32>) -> usize;

    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Applies a new gain index to `channel`, returning the
    /// `(scale, min_value, max_value)` the owning [`crate::acquisition::InTrace`]
    /// should adopt. Only called while the device is stopped
    /// ([`crate::acquisition::AcquisitionEngine::activate_gains`]).
    fn set_gain(&mut self, channel: u32, gain_index: u32) -> Result<(f32, f32, f32), DeviceError>;
}

/// Mirrors `relacs::AnalogOutput`: the write-side analog device contract.
pub trait AnalogOutput: Device {
    fn channels(&self) -> u32;
    fn max_rate(&self) -> f64;

    fn test_write(&self, rate: f64, channel: u32) -> Result<(), DeviceError>;

    fn prepare_write(&mut self, rate: f64, channel: u32, buffer: &[f32]) -> Result<(), DeviceError>;

    fn start_write(&mut self, co_start: Option<CoStartToken>) -> Result<(), DeviceError>;

    /// Push a single value (or single-sample vector) immediately; used for
    /// DC/bias levels.
    fn direct_write(&mut self, channel: u32, value: f32) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;
}

/// A handle describing the shared trigger a co-start group latches onto.
/// Opaque to callers outside [`crate::acquisition`]/[`crate::stimulus`].
#[derive(Debug, Clone, Copy)]
pub struct CoStartToken(pub u64);

/// Mirrors `relacs::DigitalIO`.
pub trait DigitalIo: Device {
    fn allocate_line(&mut self, line: u32) -> Result<(), DeviceError>;
    fn free_lines(&mut self, owner: u32) -> Result<(), DeviceError>;
    fn configure_line(&mut self, line: u32, output: bool) -> Result<(), DeviceError>;
    fn write_line(&mut self, line: u32, value: bool) -> Result<(), DeviceError>;
    fn read_line(&self, line: u32) -> Result<bool, DeviceError>;
    fn write_lines(&mut self, mask: u32, value: u32) -> Result<(), DeviceError>;
    fn read_lines(&self, mask: u32) -> Result<u32, DeviceError>;

    /// Arms a one-shot pulse on `line`: `mode_mask`/`mode_bits` select which
    /// edge/polarity bits `mode` sets versus leaves alone, mirroring
    /// `relacs::DigitalIO::setSyncPulse`. `duration` is in seconds.
    fn set_sync_pulse(
        &mut self,
        mode_mask: u32,
        mode_bits: u32,
        line: u32,
        duration: f64,
        mode: u32,
    ) -> Result<(), DeviceError>;

    /// Cancels a pulse previously armed by `set_sync_pulse` on `line`.
    fn clear_sync_pulse(&mut self, line: u32) -> Result<(), DeviceError>;
}
