//! Trigger state machine over per-threshold crossing/peak/trough actions.

use serde::{Deserialize, Serialize};

/// Action taken when a hoop's condition is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoopAction {
    Ignore,
    SetHigh,
    SetLow,
}

/// One stage in a multi-stage trigger state machine: wait `width` seconds
/// past a `delay`-second offset for the configured crossing condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Hoop {
    pub delay: f64,
    pub width: f64,
    pub on_crossing: HoopAction,
    pub on_peak: HoopAction,
    pub on_trough: HoopAction,
}

/// Up to 5 sequential hoops.
pub const MAX_HOOPS: usize = 5;

pub trait Trigger: super::Device {
    fn hoops(&self) -> &[Hoop];
    fn set_hoops(&mut self, hoops: &[Hoop]) -> Result<(), crate::error::DeviceError>;
    /// Current stage index into `hoops()`, or `None` if idle/reset.
    fn stage(&self) -> Option<usize>;
}

/// A free-standing, device-independent hoop-sequence evaluator; a `Trigger`
/// implementation may delegate to this for the pure state-machine logic.
#[derive(Debug, Default)]
pub struct HoopSequencer {
    hoops: Vec<Hoop>,
    stage: usize,
    stage_entered_at: f64,
}

impl HoopSequencer {
    pub fn new(hoops: Vec<Hoop>) -> Self {
        assert!(hoops.len() <= MAX_HOOPS, "at most {MAX_HOOPS} hoops");
        Self {
            hoops,
            stage: 0,
            stage_entered_at: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.stage = 0;
        self.stage_entered_at = 0.0;
    }

    pub fn current(&self) -> Option<&Hoop> {
        self.hoops.get(self.stage)
    }

    /// Advances the sequencer given a crossing event at time `t`, applying
    /// the current hoop's `on_crossing` action. Returns the action taken,
    /// or `None` if the sequence has already completed.
    pub fn on_crossing(&mut self, t: f64) -> Option<HoopAction> {
        self.advance(t, |hoop| hoop.on_crossing)
    }

    /// Advances the sequencer given a detected peak at time `t`, applying
    /// the current hoop's `on_peak` action.
    pub fn on_peak(&mut self, t: f64) -> Option<HoopAction> {
        self.advance(t, |hoop| hoop.on_peak)
    }

    /// Advances the sequencer given a detected trough at time `t`, applying
    /// the current hoop's `on_trough` action.
    pub fn on_trough(&mut self, t: f64) -> Option<HoopAction> {
        self.advance(t, |hoop| hoop.on_trough)
    }

    fn advance(&mut self, t: f64, action_for: impl FnOnce(&Hoop) -> HoopAction) -> Option<HoopAction> {
        let hoop = *self.current()?;
        if t - self.stage_entered_at < hoop.delay {
            return Some(HoopAction::Ignore);
        }
        if t - self.stage_entered_at > hoop.delay + hoop.width {
            // missed the window: back to stage 0
            self.reset();
            return Some(HoopAction::Ignore);
        }
        self.stage += 1;
        self.stage_entered_at = t;
        Some(action_for(&hoop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_through_hoops_in_window() {
        let mut seq = HoopSequencer::new(vec![
            Hoop {
                delay: 0.0,
                width: 1.0,
                on_crossing: HoopAction::SetHigh,
                on_peak: HoopAction::Ignore,
                on_trough: HoopAction::Ignore,
            },
            Hoop {
                delay: 0.0,
                width: 1.0,
                on_crossing: HoopAction::SetLow,
                on_peak: HoopAction::Ignore,
                on_trough: HoopAction::Ignore,
            },
        ]);
        assert_eq!(seq.on_crossing(0.1), Some(HoopAction::SetHigh));
        assert_eq!(seq.on_crossing(0.5), Some(HoopAction::SetLow));
        assert!(seq.current().is_none());
    }

    #[test]
    fn missing_window_resets_to_first_stage() {
        let mut seq = HoopSequencer::new(vec![Hoop {
            delay: 0.0,
            width: 0.1,
            on_crossing: HoopAction::SetHigh,
            on_peak: HoopAction::Ignore,
            on_trough: HoopAction::Ignore,
        }]);
        assert_eq!(seq.on_crossing(1.0), Some(HoopAction::Ignore));
        assert_eq!(seq.stage, 0);
    }

    #[test]
    fn on_peak_and_on_trough_apply_their_own_action() {
        let mut seq = HoopSequencer::new(vec![
            Hoop {
                delay: 0.0,
                width: 1.0,
                on_crossing: HoopAction::Ignore,
                on_peak: HoopAction::SetHigh,
                on_trough: HoopAction::Ignore,
            },
            Hoop {
                delay: 0.0,
                width: 1.0,
                on_crossing: HoopAction::Ignore,
                on_peak: HoopAction::Ignore,
                on_trough: HoopAction::SetLow,
            },
        ]);
        assert_eq!(seq.on_peak(0.1), Some(HoopAction::SetHigh));
        assert_eq!(seq.on_trough(0.5), Some(HoopAction::SetLow));
        assert!(seq.current().is_none());
    }
}
