//! Soft-real-time acquisition and signal-plane runtime for closed-loop
//! electrophysiology experiments: analog-front-end gain control, IIR filter
//! cascades, a peak/trough event detector, timed/direct stimulus output
//! through an attenuator stack, and RePro scheduling over a fixed set of
//! worker threads.
//!
//! See the module-level docs on [`device`], [`acquisition`], [`stimulus`],
//! [`filter`], [`events`], and [`repro`] for each collaborator's contract.

pub mod acquisition;
pub mod device;
pub mod error;
pub mod events;
pub mod filter;
pub mod repro;
pub mod stimulus;
pub mod types;

pub use error::{AcquisitionError, DaqErrorFlags, DeviceError, FilterError, RunControlError, StimulusError};
