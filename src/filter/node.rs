//! Concrete filter-graph node kinds.
//!
//! The IIR node runs a biquad cascade (`idsp::iir::IIR<f32>` + a
//! `Vec5<f32>` state per biquad, updated with `IIR::update(&mut state, x0,
//! hold)`) of arbitrary length operating on an `InTrace`.

use std::sync::Arc;

use idsp::iir;

use crate::acquisition::InTrace;
use crate::error::FilterError;
use crate::events::{DetectorConfig, EventStream, PeakTroughDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SingleAnalog,
    MultipleAnalog,
    SingleEvent,
    MultipleEvent,
    Detector,
}

/// A node in the [`super::FilterGraph`]: advances its own output(s)
/// monotonically over the newly available range of its input(s).
pub trait FilterNode: Send {
    fn id(&self) -> &str;
    fn capability(&self) -> Capability;
    /// Ids this node depends on: either another node's id, or a base trace
    /// ident supplied directly to [`super::FilterGraph::build`].
    fn input_ids(&self) -> &[String];
    /// Called before the next `tick` whenever an upstream gain changed, so
    /// e.g. a detector can rescale its threshold.
    fn adjust(&mut self, range: (u64, u64));
    fn tick(&mut self) -> Result<(), FilterError>;
}

/// A cascade of biquad IIR sections applied sample-by-sample, InTrace to
/// InTrace (`Capability::SingleAnalog`).
pub struct IirFilterNode {
    id: String,
    input_id: String,
    input: Arc<InTrace>,
    output: Arc<InTrace>,
    biquads: Vec<(iir::IIR<f32>, iir::Vec5<f32>)>,
    last_processed: u64,
}

impl IirFilterNode {
    pub fn new(
        id: impl Into<String>,
        input_id: impl Into<String>,
        input: Arc<InTrace>,
        output: Arc<InTrace>,
        biquads: Vec<iir::IIR<f32>>,
    ) -> Self {
        let last_processed = input.size();
        Self {
            id: id.into(),
            input_id: input_id.into(),
            input,
            output,
            biquads: biquads.into_iter().map(|b| (b, [0.0; 5])).collect(),
            last_processed,
        }
    }
}

impl FilterNode for IirFilterNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> Capability {
        Capability::SingleAnalog
    }

    fn input_ids(&self) -> &[String] {
        std::slice::from_ref(&self.input_id)
    }

    fn adjust(&mut self, _range: (u64, u64)) {
        // A gain change upstream invalidates the filter's running state —
        // restart the biquads cold rather than filter a discontinuity.
        for (_, state) in &mut self.biquads {
            *state = [0.0; 5];
        }
    }

    fn tick(&mut self) -> Result<(), FilterError> {
        let size = self.input.size();
        if size <= self.last_processed {
            return Ok(());
        }
        let mut samples = Vec::new();
        self.input.read_into(self.last_processed, size, &mut samples);
        let mut out = Vec::with_capacity(samples.len());
        for x in samples {
            let mut y = x;
            for (coeffs, state) in &mut self.biquads {
                y = coeffs.update(state, y, false);
            }
            out.push(y);
        }
        self.output.append(&out);
        self.last_processed = size;
        Ok(())
    }
}

/// Wraps a [`PeakTroughDetector`] as a graph node, InTrace to EventStream
/// (`Capability::Detector`).
pub struct PeakDetectorNode {
    id: String,
    input_id: String,
    input: Arc<InTrace>,
    output: Arc<EventStream>,
    detector: PeakTroughDetector,
    last_processed: u64,
}

impl PeakDetectorNode {
    pub fn new(
        id: impl Into<String>,
        input_id: impl Into<String>,
        input: Arc<InTrace>,
        output: Arc<EventStream>,
        config: DetectorConfig,
    ) -> Self {
        let last_processed = input.size();
        Self {
            id: id.into(),
            input_id: input_id.into(),
            input,
            output,
            detector: PeakTroughDetector::new(config),
            last_processed,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.detector.threshold()
    }
}

impl FilterNode for PeakDetectorNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> Capability {
        Capability::Detector
    }

    fn input_ids(&self) -> &[String] {
        std::slice::from_ref(&self.input_id)
    }

    fn adjust(&mut self, _range: (u64, u64)) {
        self.detector.reset();
    }

    fn tick(&mut self) -> Result<(), FilterError> {
        let size = self.input.size();
        if size <= self.last_processed {
            return Ok(());
        }
        self.detector
            .process(&self.input, &self.output, self.last_processed, size);
        self.last_processed = size;
        Ok(())
    }
}
