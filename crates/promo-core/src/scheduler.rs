//! Wave Scheduler
//!
//! A `WavePlan` is an ordered list of waves; each wave is a small DAG of
//! steps. Waves are separated by a strict barrier: wave N+1 starts only after
//! every step of wave N has an outcome, and only if every outcome lets
//! dependents proceed. Inside a wave all steps are started together and each
//! one first waits for the outcomes of its dependencies.

use async_trait::async_trait;
use futures::future::join_all;
use promo_kernel::{ErrorDetail, ExecutionToken, GraphError, StepGraph, StepId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::sync::watch;

/// What a planned step does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Update execution attaching the staging policy
    UpdatePolicy,
    /// Approval gate
    ManualApproval,
    /// Promotion execution copying the staging snapshot
    Promote,
    /// Bootstrap smoke check of the primary
    VerifyPrimary,
}

impl StepKind {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            StepKind::UpdatePolicy => "update_policy",
            StepKind::ManualApproval => "manual_approval",
            StepKind::Promote => "promote",
            StepKind::VerifyPrimary => "verify_primary",
        }
    }
}

/// One node of a wave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Node id
    pub id: StepId,
    /// Display name
    pub name: String,
    /// Work to perform
    pub kind: StepKind,
    /// Steps that must succeed first
    pub depends_on: Vec<StepId>,
}

/// Terminal result of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Step finished its work
    Succeeded {
        /// Backing execution, if any
        execution: Option<ExecutionToken>,
    },
    /// Step ended in error
    Failed {
        /// Backing execution, if any
        execution: Option<ExecutionToken>,
        /// Cause
        error: ErrorDetail,
    },
    /// Gate accepted
    Approved,
    /// Gate refused
    Rejected,
    /// Gate withdrawn
    Cancelled,
    /// A dependency did not succeed; the step never ran
    Blocked,
}

impl StepOutcome {
    /// Whether dependents and later waves may run
    #[inline]
    #[must_use]
    pub fn allows_dependents(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. } | StepOutcome::Approved)
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded { .. } => "succeeded",
            StepOutcome::Failed { .. } => "failed",
            StepOutcome::Approved => "approved",
            StepOutcome::Rejected => "rejected",
            StepOutcome::Cancelled => "cancelled",
            StepOutcome::Blocked => "blocked",
        }
    }
}

/// A group of steps with dependency edges
#[derive(Debug)]
pub struct Wave {
    name: String,
    steps: Vec<PlannedStep>,
    graph: StepGraph,
}

impl Wave {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_named(&self, name: &str) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps in dependency order
    pub fn execution_order(&self) -> Result<Vec<&PlannedStep>, GraphError> {
        self.graph
            .topological_order()?
            .into_iter()
            .map(|id| self.step(id).ok_or(GraphError::StepNotFound(id)))
            .collect()
    }
}

/// Builds one `Wave`
#[derive(Debug)]
pub struct WaveBuilder {
    name: String,
    steps: Vec<PlannedStep>,
    graph: StepGraph,
}

impl WaveBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            graph: StepGraph::new(),
        }
    }

    pub fn add_step(&mut self, name: impl Into<String>, kind: StepKind) -> StepId {
        let id = StepId::new();
        self.graph.add_step(id);
        self.steps.push(PlannedStep {
            id,
            name: name.into(),
            kind,
            depends_on: Vec::new(),
        });
        id
    }

    /// `dependent` waits for `dependency`; both must belong to this wave
    pub fn add_dependency(&mut self, dependency: StepId, dependent: StepId) -> Result<(), GraphError> {
        for id in [dependency, dependent] {
            if !self.graph.contains(id) {
                return Err(GraphError::StepNotFound(id));
            }
        }
        self.graph.add_dependency(dependency, dependent)?;
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == dependent) {
            step.depends_on.push(dependency);
        }
        Ok(())
    }

    pub fn build(self) -> Wave {
        Wave {
            name: self.name,
            steps: self.steps,
            graph: self.graph,
        }
    }
}

/// Ordered waves
#[derive(Debug, Default)]
pub struct WavePlan {
    waves: Vec<Wave>,
}

impl WavePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a wave after the existing ones
    pub fn push(&mut self, wave: Wave) {
        self.waves.push(wave);
    }

    #[inline]
    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    pub fn wave(&self, name: &str) -> Option<&Wave> {
        self.waves.iter().find(|w| w.name == name)
    }

    pub fn step_count(&self) -> usize {
        self.waves.iter().map(|w| w.steps.len()).sum()
    }

    /// Human-readable outline
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, wave) in self.waves.iter().enumerate() {
            let _ = writeln!(out, "wave {}: {}", index + 1, wave.name);
            let ordered = wave
                .execution_order()
                .unwrap_or_else(|_| wave.steps.iter().collect());
            for step in ordered {
                let deps: Vec<&str> = step
                    .depends_on
                    .iter()
                    .filter_map(|d| wave.step(*d).map(|s| s.name.as_str()))
                    .collect();
                if deps.is_empty() {
                    let _ = writeln!(out, "  - {} [{}]", step.name, step.kind.as_str());
                } else {
                    let _ = writeln!(
                        out,
                        "  - {} [{}] after {}",
                        step.name,
                        step.kind.as_str(),
                        deps.join(", ")
                    );
                }
            }
        }
        out
    }
}

/// Performs the work of a single step
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run `step` of `wave` to a terminal outcome
    async fn run_step(&self, wave: &str, step: &PlannedStep) -> StepOutcome;
}

/// Outcome of one step within a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name
    pub step: String,
    /// Step kind
    pub kind: StepKind,
    /// Terminal outcome
    pub outcome: StepOutcome,
}

/// Outcomes of one wave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveReport {
    /// Wave name
    pub wave: String,
    /// Per-step outcomes in dependency order
    pub steps: Vec<StepReport>,
}

impl WaveReport {
    /// Every step lets later waves run
    pub fn completed(&self) -> bool {
        self.steps.iter().all(|s| s.outcome.allows_dependents())
    }

    pub fn outcome_of(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step).map(|s| &s.outcome)
    }
}

/// Outcomes of a whole plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReport {
    /// Waves that ran, in order
    pub waves: Vec<WaveReport>,
    /// Wave whose outcomes stopped the plan
    pub halted_at: Option<String>,
}

/// Runs a `WavePlan` against a `StepRunner`
#[derive(Debug, Default, Clone, Copy)]
pub struct WaveScheduler;

impl WaveScheduler {
    pub async fn run<R: StepRunner + ?Sized>(&self, plan: &WavePlan, runner: &R) -> ScheduleReport {
        let mut waves = Vec::with_capacity(plan.waves.len());
        for wave in &plan.waves {
            tracing::info!(wave = %wave.name, steps = wave.steps.len(), "starting wave");
            let report = run_wave(wave, runner).await;
            let completed = report.completed();
            waves.push(report);
            if !completed {
                tracing::warn!(wave = %wave.name, "wave did not complete, halting plan");
                return ScheduleReport {
                    waves,
                    halted_at: Some(wave.name.clone()),
                };
            }
            tracing::info!(wave = %wave.name, "wave completed");
        }
        ScheduleReport {
            waves,
            halted_at: None,
        }
    }
}

async fn run_wave<R: StepRunner + ?Sized>(wave: &Wave, runner: &R) -> WaveReport {
    let ordered = wave
        .execution_order()
        .unwrap_or_else(|_| wave.steps.iter().collect());

    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for step in &ordered {
        let (tx, rx) = watch::channel(None::<StepOutcome>);
        senders.insert(step.id, tx);
        receivers.insert(step.id, rx);
    }

    let tasks = ordered.iter().filter_map(|step| {
        let tx = senders.remove(&step.id)?;
        let deps: Vec<watch::Receiver<Option<StepOutcome>>> = step
            .depends_on
            .iter()
            .filter_map(|d| receivers.get(d).cloned())
            .collect();

        Some(async move {
            let mut ready = true;
            for mut rx in deps {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|o| (*o).clone());
                if !outcome.is_some_and(|o| o.allows_dependents()) {
                    ready = false;
                }
            }

            let outcome = if ready {
                runner.run_step(&wave.name, step).await
            } else {
                tracing::info!(wave = %wave.name, step = %step.name, "dependency did not succeed, step blocked");
                StepOutcome::Blocked
            };
            tracing::debug!(wave = %wave.name, step = %step.name, outcome = outcome.as_str(), "step finished");
            tx.send_replace(Some(outcome.clone()));

            StepReport {
                step: step.name.clone(),
                kind: step.kind,
                outcome,
            }
        })
    });

    WaveReport {
        wave: wave.name.clone(),
        steps: join_all(tasks).await,
    }
}
