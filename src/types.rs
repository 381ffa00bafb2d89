//! Shared data-model primitives used across components.

use serde::{Deserialize, Serialize};

/// One analog-domain value, in the secondary (calibrated) unit. Scale and
/// offset live on the owning trace, not the sample.
pub type Sample = f32;

/// How an input channel is referenced against the amplifier's ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, enum_iterator::Sequence)]
pub enum ReferenceMode {
    Differential,
    Common,
    Ground,
    Other,
}

/// Sentinel intensity meaning "mute" on an [`crate::stimulus::OutSignal`].
pub const MUTE_INTENSITY: f64 = f64::NEG_INFINITY;

/// `0` start source means software-triggered; any other value names a
/// hardware-specific trigger line.
pub const SOFTWARE_START_SOURCE: u32 = 0;

/// The special sample-interval value meaning "single-sample/DC" on an
/// [`crate::stimulus::OutSignal`].
pub const DC_SAMPLE_INTERVAL: f64 = 0.0;
