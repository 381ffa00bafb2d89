//! `RunControl`: RePro/session lifecycle. A RePro is modeled as a plain
//! function run on a dedicated `std::thread`, cancelled cooperatively via
//! an `Arc<AtomicBool>` plus a grace-period join timeout.

pub mod context;

pub use context::ReProContext;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::acquisition::InTrace;
use crate::device::registry::DeviceRegistry;
use crate::error::RunControlError;
use crate::events::EventStream;
use crate::stimulus::StimulusEngine;

/// A dynamically-typed parameter tree handed to a RePro alongside its
/// [`ReProContext`]. The core only ever reads from it; configuration
/// loading owns parsing/persistence.
pub type OptionTree = BTreeMap<String, OptionValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Number(f64),
    Text(String),
    Bool(bool),
    List(Vec<OptionValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReProOutcome {
    Completed,
    Aborted,
    Failed,
}

/// What `RunControl` does when the current RePro returns `Completed` or
/// `Failed` and a fallback has been designated via `handoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroAction {
    /// Proceed to whatever the macro sequence names next (no special
    /// handling here; RunControl simply stops running anything).
    Continue,
    /// Switch to the previously designated fallback RePro.
    FallBack,
    /// Switch to a specific, explicitly named RePro regardless of any
    /// previously designated fallback.
    ExplicitFallBack(String),
}

pub type ReProFn = dyn Fn(&mut ReProContext, &OptionTree) -> ReProOutcome + Send + Sync;

/// Broadcast to filters, detectors, and RePros around session boundaries.
pub type SessionHook = dyn Fn(SessionEvent) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    Stopped { saved: bool },
}

struct RunningRepro {
    name: String,
    /// Disambiguates this run from a later one under the same name, so the
    /// reaper thread (below) and an explicit `stop_and_join_current` never
    /// both act on the same completion.
    generation: u64,
    interrupt: Arc<AtomicBool>,
    /// The RePro thread's own outcome, sent just before it returns.
    /// `stop_and_join_current` waits on this; the actual `JoinHandle` is
    /// owned exclusively by the reaper thread spawned alongside it, since a
    /// `JoinHandle` can only ever be joined once.
    done: std::sync::mpsc::Receiver<ReProOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Stopped,
    Running,
}

/// Exactly one RePro Running or none; a Session gates persistence.
pub struct RunControl {
    repros: Mutex<HashMap<String, Arc<ReProFn>>>,
    current: Mutex<Option<RunningRepro>>,
    fallback: Mutex<Option<String>>,
    grace_period: Duration,
    session: Mutex<SessionState>,
    hooks: Mutex<Vec<Arc<SessionHook>>>,
    stimulus: Arc<StimulusEngine>,
    registry: Arc<Mutex<DeviceRegistry>>,
    generation: AtomicU64,
    /// Lets a spawned RePro's reaper thread call back into `start` for an
    /// automatic fallback handoff without `RunControl` needing an external
    /// owner to hand it an `Arc` explicitly.
    self_ref: Weak<RunControl>,
}

impl RunControl {
    pub fn new(
        stimulus: Arc<StimulusEngine>,
        registry: Arc<Mutex<DeviceRegistry>>,
        grace_period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            repros: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            fallback: Mutex::new(None),
            grace_period,
            session: Mutex::new(SessionState::Stopped),
            hooks: Mutex::new(Vec::new()),
            stimulus,
            registry,
            generation: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }

    pub fn register(&self, name: impl Into<String>, repro: Arc<ReProFn>) {
        self.repros.lock().unwrap().insert(name.into(), repro);
    }

    pub fn add_session_hook(&self, hook: Arc<SessionHook>) {
        self.hooks.lock().unwrap().push(hook);
    }

    /// Starts `name` with `params`. If another RePro is Running, it is
    /// transitioned to Stopping and joined (with a grace period) before the
    /// new one starts.
    pub fn start(
        &self,
        name: &str,
        params: OptionTree,
        traces: HashMap<String, Arc<InTrace>>,
        events: HashMap<String, Arc<EventStream>>,
    ) -> Result<(), RunControlError> {
        let repro = self
            .repros
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| RunControlError::UnknownRepro(name.to_string()))?;

        self.stop_and_join_current(name)?;

        let interrupt = Arc::new(AtomicBool::new(false));
        let ctx_interrupt = interrupt.clone();
        let stimulus = self.stimulus.clone();
        let registry = self.registry.clone();
        let params = Arc::new(params);
        let name_owned = name.to_string();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // Kept aside for the automatic fallback handoff below: if this run
        // completes on its own, the reaper thread restarts the fallback
        // RePro against the same trace/event set, not an empty one.
        let reap_traces = traces.clone();
        let reap_events = events.clone();

        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(format!("repro-{name_owned}"))
            .spawn(move || {
                let mut ctx =
                    ReProContext::new(traces, events, stimulus, registry, ctx_interrupt);
                let outcome = repro(&mut ctx, params.as_ref());
                let _ = done_tx.send(outcome);
                outcome
            })
            .expect("spawning RePro worker thread");

        *self.current.lock().unwrap() = Some(RunningRepro {
            name: name_owned.clone(),
            generation,
            interrupt,
            done: done_rx,
        });

        // The repro thread's own `JoinHandle` can only be joined once, so it
        // is owned exclusively by this reaper: it is the sole path by which
        // a RePro that completes with nobody else calling `start`/`stop`
        // still drives its own fallback handoff (it cannot do so from
        // inside its own thread without joining itself).
        if let Some(strong_self) = self.self_ref.upgrade() {
            std::thread::Builder::new()
                .name(format!("repro-reap-{name_owned}"))
                .spawn(move || {
                    let outcome = handle.join().unwrap_or(ReProOutcome::Failed);
                    strong_self.reap(&name_owned, generation, outcome, reap_traces, reap_events);
                })
                .expect("spawning RePro reaper thread");
        }
        Ok(())
    }

    /// Signals the current RePro's cancellation flag; returns immediately.
    /// The RePro is expected to return at its next cooperative check.
    pub fn stop(&self) {
        if let Some(running) = self.current.lock().unwrap().as_ref() {
            running.interrupt.store(true, Ordering::Release);
        }
    }

    fn stop_and_join_current(&self, incoming: &str) -> Result<(), RunControlError> {
        let Some(running) = self.current.lock().unwrap().take() else {
            return Ok(());
        };
        running.interrupt.store(true, Ordering::Release);
        let name = running.name.clone();
        match running.done.recv_timeout(self.grace_period) {
            Ok(outcome) => {
                // An explicit start already picked the next RePro (`incoming`),
                // so this is just bookkeeping, not the spot to also fall back.
                self.log_superseded(&name, outcome);
                Ok(())
            }
            Err(_) => {
                error!(
                    "RePro {name:?} did not return within {:?}; proceeding to start {incoming:?} regardless",
                    self.grace_period
                );
                Err(RunControlError::GraceTimeout(name))
            }
        }
    }

    fn log_superseded(&self, name: &str, outcome: ReProOutcome) {
        if matches!(outcome, ReProOutcome::Completed | ReProOutcome::Failed) {
            if self.fallback.lock().unwrap().is_some() {
                warn!("RePro {name:?} returned {outcome:?} but is being superseded by an explicit start before its fallback could run");
            }
        }
    }

    /// Runs once the reaper thread spawned in `start` observes its RePro's
    /// thread actually exit. `generation` guards against acting on a run
    /// that `stop_and_join_current` already took ownership of and reported
    /// itself (see [`RunningRepro::generation`]).
    fn reap(
        &self,
        name: &str,
        generation: u64,
        outcome: ReProOutcome,
        traces: HashMap<String, Arc<InTrace>>,
        events: HashMap<String, Arc<EventStream>>,
    ) {
        let still_current = {
            let mut current = self.current.lock().unwrap();
            match current.as_ref() {
                Some(running) if running.generation == generation => {
                    *current = None;
                    true
                }
                _ => false,
            }
        };
        if !still_current {
            return;
        }
        if !matches!(outcome, ReProOutcome::Completed | ReProOutcome::Failed) {
            return;
        }
        let Some(fallback) = self.fallback.lock().unwrap().clone() else {
            return;
        };
        info!("RePro {name:?} returned {outcome:?}; starting fallback {fallback:?}");
        if let Err(e) = self.start(&fallback, OptionTree::new(), traces, events) {
            error!("failed to start fallback RePro {fallback:?} after {name:?} returned {outcome:?}: {e}");
        }
    }

    /// Designates the fallback RePro consulted by [`MacroAction::FallBack`].
    pub fn handoff(&self, action: MacroAction) -> Option<String> {
        match action {
            MacroAction::Continue => None,
            MacroAction::FallBack => self.fallback.lock().unwrap().clone(),
            MacroAction::ExplicitFallBack(name) => {
                *self.fallback.lock().unwrap() = Some(name.clone());
                Some(name)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    pub fn session_started(&self) {
        *self.session.lock().unwrap() = SessionState::Running;
        for hook in self.hooks.lock().unwrap().iter() {
            hook(SessionEvent::Started);
        }
    }

    pub fn session_stopped(&self, saved: bool) {
        *self.session.lock().unwrap() = SessionState::Stopped;
        for hook in self.hooks.lock().unwrap().iter() {
            hook(SessionEvent::Stopped { saved });
        }
    }

    pub fn session_running(&self) -> bool {
        *self.session.lock().unwrap() == SessionState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::StimulusEngineConfig;

    fn run_control() -> Arc<RunControl> {
        let stimulus = Arc::new(StimulusEngine::new(StimulusEngineConfig::default()));
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        RunControl::new(stimulus, registry, Duration::from_millis(200))
    }

    #[test]
    fn starting_unknown_repro_errors() {
        let rc = run_control();
        let err = rc.start("missing", OptionTree::new(), HashMap::new(), HashMap::new());
        assert!(matches!(err, Err(RunControlError::UnknownRepro(_))));
    }

    #[test]
    fn cooperative_stop_lets_repro_return_completed() {
        let rc = run_control();
        rc.register(
            "sleeper",
            Arc::new(|ctx: &mut ReProContext, _params: &OptionTree| {
                while !ctx.interrupted() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                ReProOutcome::Aborted
            }),
        );
        rc.start("sleeper", OptionTree::new(), HashMap::new(), HashMap::new())
            .unwrap();
        assert!(rc.is_running());
        rc.stop();
        // Starting a fresh no-op RePro forces RunControl to join the
        // previous one under the grace period.
        rc.register(
            "noop",
            Arc::new(|_: &mut ReProContext, _: &OptionTree| ReProOutcome::Completed),
        );
        rc.start("noop", OptionTree::new(), HashMap::new(), HashMap::new())
            .unwrap();
    }

    #[test]
    fn handoff_designates_and_reports_fallback() {
        let rc = run_control();
        assert_eq!(rc.handoff(MacroAction::Continue), None);
        assert_eq!(
            rc.handoff(MacroAction::ExplicitFallBack("baseline".into())),
            Some("baseline".to_string())
        );
        assert_eq!(rc.handoff(MacroAction::FallBack), Some("baseline".to_string()));
    }

    #[test]
    fn completing_repro_starts_its_own_fallback_with_no_further_caller_action() {
        let rc = run_control();
        let fallback_ran = Arc::new(Mutex::new(false));
        let fallback_ran2 = fallback_ran.clone();
        rc.register(
            "a",
            Arc::new(|_: &mut ReProContext, _: &OptionTree| ReProOutcome::Completed),
        );
        rc.register(
            "b",
            Arc::new(move |_: &mut ReProContext, _: &OptionTree| {
                *fallback_ran2.lock().unwrap() = true;
                ReProOutcome::Completed
            }),
        );
        rc.handoff(MacroAction::ExplicitFallBack("b".to_string()));
        rc.start("a", OptionTree::new(), HashMap::new(), HashMap::new())
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !*fallback_ran.lock().unwrap() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(
            *fallback_ran.lock().unwrap(),
            "fallback \"b\" should have started on its own once \"a\" completed"
        );
    }

    #[test]
    fn session_hooks_fire_on_start_and_stop() {
        let rc = run_control();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        rc.add_session_hook(Arc::new(move |event| seen2.lock().unwrap().push(event)));
        rc.session_started();
        rc.session_stopped(true);
        let log = seen.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], SessionEvent::Started);
        assert_eq!(log[1], SessionEvent::Stopped { saved: true });
    }
}
