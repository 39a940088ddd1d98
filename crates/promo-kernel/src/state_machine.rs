//! Transition tables for the promotion state machines
//!
//! ```text
//! Update:     FetchCurrent ──▶ MergePolicy ──▶ ApplyUpdate ──▶ Succeeded
//!                  │                │               │
//!                  └────────────────┴───────────────┴──▶ Failed
//!
//! Promotion:  ValidateSnapshot ──▶ ApplyPromotion ──▶ Succeeded
//!                  │                     │
//!                  └─────────────────────┴──▶ Failed
//!
//! Gate:       Blocked ──▶ AwaitingDecision ──▶ Approved | Rejected
//!                │               │
//!                └───────────────┴──▶ Cancelled
//! ```
//!
//! Terminal states have no outgoing transitions, so an execution is never
//! resumed once it has finished.

use crate::error::StateMachineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A state of one of the promotion machines
pub trait MachineState: Copy + Eq + Debug + Send + Sync + 'static {
    /// Machine name for error messages
    const MACHINE: &'static str;

    /// Stable state name
    fn name(self) -> &'static str;

    /// States reachable in one step
    fn allowed_transitions(self) -> &'static [Self];

    /// No outgoing transitions
    fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

/// Validates a state transition.
///
/// Illegal transitions panic when the `strict-debug` feature is enabled and
/// are returned as errors otherwise.
pub fn validate_transition<S: MachineState>(from: S, to: S) -> Result<(), StateMachineError> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!(
            "Illegal {} transition attempted: {:?} -> {:?}",
            S::MACHINE,
            from,
            to
        );

        #[allow(unreachable_code)]
        Err(StateMachineError::IllegalTransition {
            machine: S::MACHINE,
            from: from.name(),
            to: to.name(),
        })
    }
}

/// Update Step states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateState {
    /// Reading the live primary configuration
    FetchCurrent,
    /// Overwriting the policy field on the fetched snapshot
    MergePolicy,
    /// Writing the merged configuration with a version check
    ApplyUpdate,
    /// Primary carries the new policy
    Succeeded,
    /// Stopped with an error
    Failed,
}

impl MachineState for UpdateState {
    const MACHINE: &'static str = "update";

    fn name(self) -> &'static str {
        match self {
            UpdateState::FetchCurrent => "FetchCurrent",
            UpdateState::MergePolicy => "MergePolicy",
            UpdateState::ApplyUpdate => "ApplyUpdate",
            UpdateState::Succeeded => "Succeeded",
            UpdateState::Failed => "Failed",
        }
    }

    fn allowed_transitions(self) -> &'static [Self] {
        use UpdateState::*;
        match self {
            FetchCurrent => &[MergePolicy, Failed],
            MergePolicy => &[ApplyUpdate, Failed],
            ApplyUpdate => &[Succeeded, Failed],
            Succeeded | Failed => &[],
        }
    }
}

/// Promotion Step states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromotionState {
    /// Checking the snapshot against the configuration schema
    ValidateSnapshot,
    /// Replacing the primary configuration
    ApplyPromotion,
    /// Primary equals the snapshot
    Succeeded,
    /// Stopped with an error
    Failed,
}

impl MachineState for PromotionState {
    const MACHINE: &'static str = "promotion";

    fn name(self) -> &'static str {
        match self {
            PromotionState::ValidateSnapshot => "ValidateSnapshot",
            PromotionState::ApplyPromotion => "ApplyPromotion",
            PromotionState::Succeeded => "Succeeded",
            PromotionState::Failed => "Failed",
        }
    }

    fn allowed_transitions(self) -> &'static [Self] {
        use PromotionState::*;
        match self {
            ValidateSnapshot => &[ApplyPromotion, Failed],
            ApplyPromotion => &[Succeeded, Failed],
            Succeeded | Failed => &[],
        }
    }
}

/// Approval Gate states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateState {
    /// Upstream step has not succeeded; reported as pending
    Blocked,
    /// Waiting for an operator decision
    AwaitingDecision,
    /// Operator accepted the change
    Approved,
    /// Operator rejected the change
    Rejected,
    /// Withdrawn before a decision
    Cancelled,
}

impl GateState {
    /// Blocked or awaiting a decision
    #[inline]
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, GateState::Blocked | GateState::AwaitingDecision)
    }
}

impl MachineState for GateState {
    const MACHINE: &'static str = "approval";

    fn name(self) -> &'static str {
        match self {
            GateState::Blocked => "Blocked",
            GateState::AwaitingDecision => "AwaitingDecision",
            GateState::Approved => "Approved",
            GateState::Rejected => "Rejected",
            GateState::Cancelled => "Cancelled",
        }
    }

    fn allowed_transitions(self) -> &'static [Self] {
        use GateState::*;
        match self {
            Blocked => &[AwaitingDecision, Cancelled],
            AwaitingDecision => &[Approved, Rejected, Cancelled],
            Approved | Rejected | Cancelled => &[],
        }
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition<S> {
    /// State left
    pub from: S,
    /// State entered
    pub to: S,
    /// When the change happened
    pub at: DateTime<Utc>,
}

/// Current state plus validated history
#[derive(Debug, Clone)]
pub struct StateTracker<S: MachineState> {
    current: S,
    history: Vec<Transition<S>>,
}

impl<S: MachineState> StateTracker<S> {
    /// Start in `initial`
    #[must_use]
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            history: Vec::new(),
        }
    }

    /// Current state
    #[inline]
    pub fn current(&self) -> S {
        self.current
    }

    /// Transitions taken so far, oldest first
    #[inline]
    pub fn history(&self) -> &[Transition<S>] {
        &self.history
    }

    /// Whether the machine has finished
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Move to `to` if the table allows it
    pub fn transition(&mut self, to: S) -> Result<Transition<S>, StateMachineError> {
        validate_transition(self.current, to)?;
        let step = Transition {
            from: self.current,
            to,
            at: Utc::now(),
        };
        self.current = to;
        self.history.push(step.clone());
        Ok(step)
    }
}
