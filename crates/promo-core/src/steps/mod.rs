//! Step runners
//!
//! Each runner drives one kernel state machine to a terminal state. Every
//! transition is validated against the transition table and reported to a
//! `TransitionObserver` before work for the new state begins.

mod promotion;
mod update;
mod verify;

pub use promotion::{PromotionOutcome, PromotionStep};
pub use update::{UpdateOutcome, UpdateStep};
pub use verify::verify_primary;

use promo_kernel::{MachineState, StateTracker, StepError, StepResult, Transition};

/// Receives every transition of a step's state machine
pub trait TransitionObserver<S: MachineState>: Send + Sync {
    /// Called after `transition` has been validated and applied
    fn on_transition(&self, transition: &Transition<S>);
}

impl<S, F> TransitionObserver<S> for F
where
    S: MachineState,
    F: Fn(&Transition<S>) + Send + Sync,
{
    fn on_transition(&self, transition: &Transition<S>) {
        self(transition)
    }
}

/// Tracker plus observer
pub(crate) struct Machine<'o, S: MachineState> {
    tracker: StateTracker<S>,
    observer: &'o dyn TransitionObserver<S>,
}

impl<'o, S: MachineState> Machine<'o, S> {
    pub(crate) fn new(initial: S, observer: &'o dyn TransitionObserver<S>) -> Self {
        Self {
            tracker: StateTracker::new(initial),
            observer,
        }
    }

    pub(crate) fn current(&self) -> S {
        self.tracker.current()
    }

    pub(crate) fn advance(&mut self, to: S) -> StepResult<()> {
        match self.tracker.transition(to) {
            Ok(transition) => {
                tracing::debug!(
                    machine = S::MACHINE,
                    from = transition.from.name(),
                    to = transition.to.name(),
                    "state transition"
                );
                self.observer.on_transition(&transition);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "state machine refused transition");
                Err(StepError::Configuration(err.to_string()))
            }
        }
    }

    /// Move to `failed` unless already terminal
    pub(crate) fn fail(&mut self, failed: S, cause: &StepError) {
        if self.tracker.is_terminal() {
            return;
        }
        tracing::warn!(
            machine = S::MACHINE,
            state = self.current().name(),
            kind = %cause.kind(),
            error = %cause,
            "step failed"
        );
        // A non-terminal state always has an edge to its failure state.
        let _ = self.advance(failed);
    }
}
