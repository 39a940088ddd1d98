//! Manual approval gate
//!
//! The gate is a suspend point: the wave scheduler awaits its outcome while
//! operators decide through `approve`, `reject` or `cancel` from any task.
//! State lives in a `tokio::sync::watch` channel so waiters wake on every
//! change and a transition is applied atomically under the channel's lock.

use crate::config::ApprovalConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use promo_kernel::{AuditLog, ExecutionToken, GateState, MachineState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Operator decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Accept the staged change
    Approve,
    /// Refuse the staged change
    Reject,
}

impl Decision {
    fn target(self) -> GateState {
        match self {
            Decision::Approve => GateState::Approved,
            Decision::Reject => GateState::Rejected,
        }
    }
}

/// Who decided what, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Decision taken
    pub decision: Decision,
    /// Operator that decided
    pub actor: String,
    /// Free-text reason
    pub justification: Option<String>,
    /// When the decision was recorded
    pub decided_at: DateTime<Utc>,
}

/// Refused gate operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// Upstream step has not succeeded yet
    #[error("approval gate is not ready: the update step has not succeeded")]
    NotReady,

    /// Upstream step failed; the gate stays blocked until the run is re-triggered
    #[error("approval gate is held: the update step failed")]
    Held,

    /// Gate has already reached a terminal state
    #[error("approval gate already decided: {}", .0.name())]
    AlreadyDecided(GateState),

    /// Actor is not on the approver list
    #[error("{0} is not an authorized approver")]
    Unauthorized(String),

    /// Decision without an actor
    #[error("a decision requires a named actor")]
    MissingActor,
}

/// Approval checkpoint of one pipeline run
#[derive(Debug)]
pub struct ApprovalGate {
    run: ExecutionToken,
    name: String,
    config: ApprovalConfig,
    state: watch::Sender<GateState>,
    record: Mutex<Option<ApprovalRecord>>,
    held: AtomicBool,
    audit: Arc<AuditLog>,
}

impl ApprovalGate {
    /// New gate in `Blocked`
    pub fn new(
        run: ExecutionToken,
        name: impl Into<String>,
        config: ApprovalConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        let (state, _) = watch::channel(GateState::Blocked);
        Self {
            run,
            name: name.into(),
            config,
            state,
            record: Mutex::new(None),
            held: AtomicBool::new(false),
            audit,
        }
    }

    #[inline]
    pub fn run(&self) -> ExecutionToken {
        self.run
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Text shown to the operator
    #[inline]
    pub fn comment(&self) -> &str {
        &self.config.comment
    }

    #[inline]
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Decision, once one has been taken
    pub fn record(&self) -> Option<ApprovalRecord> {
        self.record.lock().clone()
    }

    /// Whether the upstream failure pinned the gate in `Blocked`
    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    /// Upstream step succeeded; start accepting decisions.
    ///
    /// Opening an already open gate is a no-op.
    pub fn open(&self) -> Result<(), GateError> {
        if self.state() == GateState::AwaitingDecision {
            return Ok(());
        }
        self.transition(GateState::AwaitingDecision)?;
        tracing::info!(run = %self.run, gate = %self.name, comment = %self.config.comment, "awaiting approval");
        Ok(())
    }

    pub fn approve(&self, actor: &str, justification: Option<String>) -> Result<(), GateError> {
        self.decide(Decision::Approve, actor, justification)
    }

    pub fn reject(&self, actor: &str, justification: Option<String>) -> Result<(), GateError> {
        self.decide(Decision::Reject, actor, justification)
    }

    /// Record an operator decision.
    ///
    /// # Errors
    /// - `MissingActor` / `Unauthorized` if `actor` may not decide
    /// - `NotReady` while the gate is `Blocked`
    /// - `AlreadyDecided` once the gate is terminal
    pub fn decide(
        &self,
        decision: Decision,
        actor: &str,
        justification: Option<String>,
    ) -> Result<(), GateError> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(GateError::MissingActor);
        }
        if !self.config.is_authorized(actor) {
            tracing::warn!(run = %self.run, actor, "unauthorized approval attempt");
            return Err(GateError::Unauthorized(actor.to_string()));
        }

        self.transition(decision.target())?;

        let record = ApprovalRecord {
            decision,
            actor: actor.to_string(),
            justification,
            decided_at: Utc::now(),
        };
        self.audit.record(
            self.run,
            format!("gate.{}", decision.target().name().to_lowercase()),
            format!(
                "gate={} actor={} justification={}",
                self.name,
                record.actor,
                record.justification.as_deref().unwrap_or("")
            ),
        );
        tracing::info!(run = %self.run, actor, ?decision, "approval decision recorded");
        *self.record.lock() = Some(record);
        Ok(())
    }

    /// Pin a `Blocked` gate after its upstream step failed.
    ///
    /// A held gate refuses every transition, cancellation included. Returns
    /// `false` when the gate had already left `Blocked`.
    pub fn hold(&self, cause: &str) -> bool {
        let mut pinned = false;
        // Runs under the channel lock so it orders against `transition`.
        self.state.send_if_modified(|current| {
            if *current == GateState::Blocked {
                self.held.store(true, Ordering::SeqCst);
                pinned = true;
            }
            false
        });
        if pinned {
            self.audit.record(
                self.run,
                "gate.held",
                format!("gate={} cause={}", self.name, cause),
            );
            tracing::warn!(run = %self.run, gate = %self.name, cause, "approval gate held");
        }
        pinned
    }

    /// Withdraw a pending gate
    pub fn cancel(&self, reason: &str) -> Result<(), GateError> {
        self.transition(GateState::Cancelled)?;
        self.audit.record(
            self.run,
            "gate.cancelled",
            format!("gate={} reason={}", self.name, reason),
        );
        tracing::warn!(run = %self.run, reason, "approval gate cancelled");
        Ok(())
    }

    /// Wait until the gate leaves `Blocked`
    pub async fn wait_until_open(&self) -> GateState {
        let mut rx = self.state.subscribe();
        let opened = rx.wait_for(|s| *s != GateState::Blocked).await.map(|s| *s);
        opened.unwrap_or_else(|_| self.state())
    }

    /// Wait for a terminal state.
    ///
    /// With `timeout` set, a gate still pending when it elapses is cancelled.
    pub async fn wait_for_outcome(&self, timeout: Option<Duration>) -> GateState {
        let mut rx = self.state.subscribe();
        let settled = async move { rx.wait_for(|s| s.is_terminal()).await.map(|s| *s).ok() };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = self.cancel(&format!("no decision within {}s", limit.as_secs()));
                    None
                }
            },
            None => settled.await,
        };
        outcome.unwrap_or_else(|| self.state())
    }

    fn transition(&self, to: GateState) -> Result<GateState, GateError> {
        let mut refused = None;
        let mut from = GateState::Blocked;
        // Operator input can be out of order, so refusals are errors even
        // under `strict-debug`.
        let mut held = false;
        self.state.send_if_modified(|current| {
            if *current == GateState::Blocked && self.held.load(Ordering::SeqCst) {
                held = true;
                false
            } else if current.allowed_transitions().contains(&to) {
                from = *current;
                *current = to;
                true
            } else {
                refused = Some(*current);
                false
            }
        });

        if held {
            return Err(GateError::Held);
        }
        match refused {
            None => {
                tracing::debug!(run = %self.run, from = from.name(), to = to.name(), "gate transition");
                Ok(from)
            }
            Some(GateState::Blocked) => Err(GateError::NotReady),
            Some(current) => Err(GateError::AlreadyDecided(current)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with(config: ApprovalConfig) -> ApprovalGate {
        ApprovalGate::new(
            ExecutionToken::new(),
            "Approve-Promote-StagingDistribution",
            config,
            Arc::new(AuditLog::new()),
        )
    }

    fn gate() -> ApprovalGate {
        gate_with(ApprovalConfig::default())
    }

    #[test]
    fn blocked_gate_refuses_decisions() {
        let gate = gate();
        assert_eq!(gate.approve("alice", None), Err(GateError::NotReady));
        assert_eq!(gate.state(), GateState::Blocked);
        assert!(gate.record().is_none());
    }

    #[test]
    fn decision_is_final() {
        let gate = gate();
        gate.open().unwrap();
        gate.reject("bob", Some("too risky".into())).unwrap();

        assert_eq!(
            gate.approve("alice", None),
            Err(GateError::AlreadyDecided(GateState::Rejected))
        );
        assert_eq!(gate.cancel("late"), Err(GateError::AlreadyDecided(GateState::Rejected)));
        let record = gate.record().unwrap();
        assert_eq!(record.decision, Decision::Reject);
        assert_eq!(record.justification.as_deref(), Some("too risky"));
    }

    #[test]
    fn decisions_are_audited() {
        let gate = gate();
        gate.open().unwrap();
        gate.approve("alice", Some("looks good".into())).unwrap();

        let events = gate.audit.events_for(gate.run());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "gate.approved");
        assert!(events[0].detail.contains("actor=alice"));
        assert!(events[0].detail.contains("looks good"));
    }

    #[test]
    fn approver_list_is_enforced() {
        let gate = gate_with(ApprovalConfig {
            approvers: vec!["alice".into()],
            ..ApprovalConfig::default()
        });
        gate.open().unwrap();

        assert_eq!(
            gate.approve("mallory", None),
            Err(GateError::Unauthorized("mallory".into()))
        );
        assert_eq!(gate.approve("  ", None), Err(GateError::MissingActor));
        assert_eq!(gate.state(), GateState::AwaitingDecision);
        gate.approve("alice", None).unwrap();
        assert_eq!(gate.state(), GateState::Approved);
    }

    #[test]
    fn open_is_idempotent() {
        let gate = gate();
        gate.open().unwrap();
        gate.open().unwrap();
        assert_eq!(gate.state(), GateState::AwaitingDecision);
    }

    #[test]
    fn blocked_gate_can_be_cancelled() {
        let gate = gate();
        gate.cancel("operator abort").unwrap();
        assert_eq!(gate.state(), GateState::Cancelled);
        assert_eq!(gate.open(), Err(GateError::AlreadyDecided(GateState::Cancelled)));
    }

    #[test]
    fn held_gate_refuses_everything() {
        let gate = gate();
        assert!(gate.hold("update failed: conflict"));

        assert_eq!(gate.cancel("operator abort"), Err(GateError::Held));
        assert_eq!(gate.open(), Err(GateError::Held));
        assert_eq!(gate.approve("alice", None), Err(GateError::Held));
        assert_eq!(gate.state(), GateState::Blocked);
        assert!(gate.is_held());

        let actions: Vec<String> = gate
            .audit
            .events_for(gate.run())
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["gate.held"]);
    }

    #[test]
    fn open_gate_cannot_be_held() {
        let gate = gate();
        gate.open().unwrap();
        assert!(!gate.hold("late failure"));
        assert!(!gate.is_held());
        gate.cancel("operator abort").unwrap();
    }

    #[tokio::test]
    async fn waiter_wakes_on_decision() {
        let gate = Arc::new(gate());
        gate.open().unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_for_outcome(None).await })
        };
        tokio::task::yield_now().await;
        gate.approve("alice", None).unwrap();

        assert_eq!(waiter.await.unwrap(), GateState::Approved);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_pending_gate() {
        let gate = gate_with(ApprovalConfig {
            timeout_secs: Some(60),
            ..ApprovalConfig::default()
        });
        gate.open().unwrap();

        let outcome = gate.wait_for_outcome(gate.config.timeout()).await;
        assert_eq!(outcome, GateState::Cancelled);
        assert_eq!(gate.audit.events_for(gate.run())[0].action, "gate.cancelled");
    }

    #[tokio::test]
    async fn already_decided_gate_returns_immediately() {
        let gate = gate();
        gate.open().unwrap();
        gate.reject("bob", None).unwrap();
        assert_eq!(gate.wait_for_outcome(None).await, GateState::Rejected);
        assert_eq!(gate.wait_until_open().await, GateState::Rejected);
    }
}
