//! Promotion pipeline
//!
//! With continuous deployment enabled the plan is:
//!
//! ```text
//! wave 1  Update-DeploymentPolicy
//!           Update-PrimaryDistribution ──▶ Approve-Promote-StagingDistribution
//! wave 2  Promote-StagingDistribution
//!           Promote-StagingDistribution
//! ```
//!
//! Without it the pipeline only bootstraps: a single
//! `Verify-PrimaryDistribution` wave checks that the primary resolves.

use crate::config::PipelineConfig;
use crate::control::DistributionControl;
use crate::error::PipelineError;
use crate::exports::ExportRegistry;
use crate::gate::{ApprovalGate, ApprovalRecord, Decision};
use crate::model::{PromotionRequest, ResourceIdentifier, StagingOutputs, UpdateRequest};
use crate::scheduler::{
    PlannedStep, ScheduleReport, StepKind, StepOutcome, StepRunner, WaveBuilder, WavePlan,
    WaveReport, WaveScheduler,
};
use crate::service::{ExecutionPhase, ExecutionStatus, StateMachineService};
use crate::steps::verify_primary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use promo_kernel::{ErrorDetail, ExecutionContext, ExecutionToken, GateState, StepError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// First wave: attach the policy, then wait for approval
pub const UPDATE_WAVE: &str = "Update-DeploymentPolicy";
/// Second wave: copy staging onto primary
pub const PROMOTE_WAVE: &str = "Promote-StagingDistribution";
/// Only wave in bootstrap mode
pub const VERIFY_WAVE: &str = "Verify-PrimaryDistribution";

/// Update execution inside `UPDATE_WAVE`
pub const UPDATE_STEP: &str = "Update-PrimaryDistribution";
/// Approval gate inside `UPDATE_WAVE`
pub const APPROVAL_STEP: &str = "Approve-Promote-StagingDistribution";
/// Promotion execution inside `PROMOTE_WAVE`
pub const PROMOTE_STEP: &str = "Promote-StagingDistribution";
/// Smoke check inside `VERIFY_WAVE`
pub const VERIFY_STEP: &str = "Test-PrimaryDistribution";

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Still executing
    Running,
    /// Every wave completed
    Completed,
    /// Operator rejected the change
    Rejected,
    /// Gate was cancelled or timed out
    Aborted,
    /// A step failed
    Failed,
}

impl PipelineStatus {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Rejected => "rejected",
            PipelineStatus::Aborted => "aborted",
            PipelineStatus::Failed => "failed",
        }
    }

    fn from_schedule(report: &ScheduleReport) -> Self {
        let Some(halted) = &report.halted_at else {
            return PipelineStatus::Completed;
        };
        let outcomes: Vec<&StepOutcome> = report
            .waves
            .iter()
            .filter(|w| &w.wave == halted)
            .flat_map(|w| w.steps.iter().map(|s| &s.outcome))
            .collect();

        if outcomes.iter().any(|o| matches!(o, StepOutcome::Failed { .. })) {
            PipelineStatus::Failed
        } else if outcomes.iter().any(|o| matches!(o, StepOutcome::Rejected)) {
            PipelineStatus::Rejected
        } else if outcomes.iter().any(|o| matches!(o, StepOutcome::Cancelled)) {
            PipelineStatus::Aborted
        } else {
            PipelineStatus::Failed
        }
    }
}

/// Waves for `config`: update/approve/promote, or the bootstrap check
pub fn build_plan(config: &PipelineConfig) -> Result<WavePlan, PipelineError> {
    let mut plan = WavePlan::new();
    if config.continuous_deployment {
        let mut update = WaveBuilder::new(UPDATE_WAVE);
        let step = update.add_step(UPDATE_STEP, StepKind::UpdatePolicy);
        let gate = update.add_step(APPROVAL_STEP, StepKind::ManualApproval);
        update.add_dependency(step, gate)?;
        plan.push(update.build());

        let mut promote = WaveBuilder::new(PROMOTE_WAVE);
        promote.add_step(PROMOTE_STEP, StepKind::Promote);
        plan.push(promote.build());
    } else {
        let mut verify = WaveBuilder::new(VERIFY_WAVE);
        verify.add_step(VERIFY_STEP, StepKind::VerifyPrimary);
        plan.push(verify.build());
    }
    Ok(plan)
}

/// Result of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Run token
    pub run: ExecutionToken,
    /// Pipeline name
    pub pipeline: String,
    /// Final status
    pub status: PipelineStatus,
    /// Waves that ran
    pub waves: Vec<WaveReport>,
    /// Operator decision, if one was taken
    pub approval: Option<ApprovalRecord>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    /// Outcome of a step by name across all waves
    pub fn outcome_of(&self, step: &str) -> Option<&StepOutcome> {
        self.waves.iter().find_map(|w| w.outcome_of(step))
    }
}

struct RunEntry {
    gate: Option<Arc<ApprovalGate>>,
    report: watch::Receiver<Option<PipelineReport>>,
}

/// Staged, gated promotion of staging onto primary.
///
/// Run records are kept until `evict_finished` drops them.
pub struct PromotionPipeline<C: ?Sized> {
    config: PipelineConfig,
    primary_id: ResourceIdentifier,
    context: Option<ExecutionContext>,
    service: StateMachineService<C>,
    runs: DashMap<ExecutionToken, RunEntry>,
}

impl<C: ?Sized> std::fmt::Debug for PromotionPipeline<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionPipeline")
            .field("pipeline", &self.config.pipeline_name)
            .field("primary_id", &self.primary_id)
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

impl<C: DistributionControl + ?Sized + 'static> PromotionPipeline<C> {
    /// Build a pipeline; the primary identifier is imported here, once.
    ///
    /// # Errors
    /// Configuration errors for an invalid config, a missing primary export,
    /// or a missing execution context while continuous deployment is on.
    pub fn new(
        config: PipelineConfig,
        exports: &ExportRegistry,
        service: StateMachineService<C>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let names = config.export_names();
        let primary_id = exports.import_resource(&names.primary_distribution_id)?;

        let context = match (&config.execution_context, config.continuous_deployment) {
            (Some(context), _) => {
                context.validate()?;
                Some(context.clone())
            }
            (None, true) => {
                return Err(PipelineError::Configuration(
                    "account and region are required when continuous deployment is enabled"
                        .to_string(),
                ))
            }
            (None, false) => None,
        };

        tracing::info!(
            pipeline = %config.pipeline_name,
            primary = %primary_id,
            continuous_deployment = config.continuous_deployment,
            "pipeline constructed"
        );
        Ok(Self {
            config,
            primary_id,
            context,
            service,
            runs: DashMap::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    pub fn primary_id(&self) -> &ResourceIdentifier {
        &self.primary_id
    }

    #[inline]
    pub fn service(&self) -> &StateMachineService<C> {
        &self.service
    }

    /// Waves for the configured mode
    pub fn plan(&self) -> Result<WavePlan, PipelineError> {
        build_plan(&self.config)
    }

    /// Read what staging hands over: its policy export and its live config
    pub async fn collect_staging_outputs(
        &self,
        exports: &ExportRegistry,
    ) -> Result<StagingOutputs, PipelineError> {
        let names = self.config.export_names();
        let staging_id = exports.import_resource(&names.staging_distribution_id)?;
        let deployment_policy_id = exports.import_policy(&names.deployment_policy_id)?;

        let control = self.service.control();
        let staging = self
            .service
            .retry()
            .run("staging.fetch", || control.get_config(&staging_id))
            .await?;
        let snapshot = serde_json::to_value(&staging.config)
            .map_err(|e| StepError::SchemaMismatch(e.to_string()))?;

        Ok(StagingOutputs {
            deployment_policy_id,
            snapshot,
        })
    }

    /// Start a run in the background
    pub fn start(self: &Arc<Self>, outputs: StagingOutputs) -> Result<ExecutionToken, PipelineError> {
        let run = ExecutionToken::new();
        let plan = self.plan()?;
        let gate = self.config.continuous_deployment.then(|| {
            Arc::new(ApprovalGate::new(
                run,
                APPROVAL_STEP,
                self.config.approval.clone(),
                Arc::clone(self.service.audit()),
            ))
        });
        let (report_tx, report_rx) = watch::channel(None);
        self.runs.insert(
            run,
            RunEntry {
                gate: gate.clone(),
                report: report_rx,
            },
        );

        let runner = PipelineStepRunner {
            pipeline: Arc::clone(self),
            run,
            outputs,
            gate,
        };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let report = pipeline.execute(run, plan, runner).await;
            report_tx.send_replace(Some(report));
        });
        Ok(run)
    }

    /// Start a run and wait for its report
    pub async fn run(self: &Arc<Self>, outputs: StagingOutputs) -> Result<PipelineReport, PipelineError> {
        let run = self.start(outputs)?;
        self.wait(run).await
    }

    /// Wait for the report of `run`
    pub async fn wait(&self, run: ExecutionToken) -> Result<PipelineReport, PipelineError> {
        let mut rx = self
            .runs
            .get(&run)
            .map(|entry| entry.report.clone())
            .ok_or(PipelineError::UnknownExecution(run))?;
        let report = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|r| (*r).clone());
        report.ok_or(PipelineError::Abandoned(run))
    }

    /// Status of `run`
    pub fn status(&self, run: ExecutionToken) -> Result<PipelineStatus, PipelineError> {
        let entry = self
            .runs
            .get(&run)
            .ok_or(PipelineError::UnknownExecution(run))?;
        let status = match &*entry.report.borrow() {
            Some(report) => report.status,
            None => PipelineStatus::Running,
        };
        Ok(status)
    }

    /// Approval gate of `run`
    pub fn gate(&self, run: ExecutionToken) -> Result<Arc<ApprovalGate>, PipelineError> {
        let entry = self
            .runs
            .get(&run)
            .ok_or(PipelineError::UnknownExecution(run))?;
        entry.gate.clone().ok_or_else(|| {
            PipelineError::Configuration(format!("run {run} has no approval gate"))
        })
    }

    pub fn approve(
        &self,
        run: ExecutionToken,
        actor: &str,
        justification: Option<String>,
    ) -> Result<(), PipelineError> {
        Ok(self.gate(run)?.decide(Decision::Approve, actor, justification)?)
    }

    pub fn reject(
        &self,
        run: ExecutionToken,
        actor: &str,
        justification: Option<String>,
    ) -> Result<(), PipelineError> {
        Ok(self.gate(run)?.decide(Decision::Reject, actor, justification)?)
    }

    /// Cancel the pending gate of `run`; the run ends `Aborted`
    pub fn cancel(&self, run: ExecutionToken, actor: &str) -> Result<(), PipelineError> {
        Ok(self.gate(run)?.cancel(&format!("cancelled by {actor}"))?)
    }

    /// Drop runs, and service executions, that finished before `cutoff`.
    ///
    /// Returns the number of runs evicted. Runs still in flight are kept.
    pub fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.runs.len();
        self.runs.retain(|_, entry| {
            !matches!(&*entry.report.borrow(), Some(report) if report.finished_at < cutoff)
        });
        self.service.evict_finished(cutoff);
        before.saturating_sub(self.runs.len())
    }

    /// Execution statuses belonging to the service, oldest first
    pub fn executions(&self) -> Vec<ExecutionStatus> {
        self.service.list_executions()
    }

    async fn execute(&self, run: ExecutionToken, plan: WavePlan, runner: PipelineStepRunner<C>) -> PipelineReport {
        let started_at = Utc::now();
        let audit = self.service.audit();
        audit.record(
            run,
            "pipeline.started",
            format!("pipeline={} primary={}", self.config.pipeline_name, self.primary_id),
        );
        tracing::info!(run = %run, pipeline = %self.config.pipeline_name, "pipeline run started");

        let schedule = WaveScheduler.run(&plan, &runner).await;
        let status = PipelineStatus::from_schedule(&schedule);

        audit.record(run, "pipeline.finished", format!("status={}", status.as_str()));
        metrics::counter!("promo_pipeline_runs_total", "status" => status.as_str()).increment(1);
        tracing::info!(run = %run, status = status.as_str(), "pipeline run finished");

        PipelineReport {
            run,
            pipeline: self.config.pipeline_name.clone(),
            status,
            waves: schedule.waves,
            approval: runner.gate.as_ref().and_then(|g| g.record()),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Binds plan steps to executions of one run
struct PipelineStepRunner<C: ?Sized> {
    pipeline: Arc<PromotionPipeline<C>>,
    run: ExecutionToken,
    outputs: StagingOutputs,
    gate: Option<Arc<ApprovalGate>>,
}

impl<C: DistributionControl + ?Sized + 'static> PipelineStepRunner<C> {
    fn context(&self) -> Result<ExecutionContext, StepOutcome> {
        self.pipeline.context.clone().ok_or_else(|| StepOutcome::Failed {
            execution: None,
            error: StepError::Configuration("execution context is not configured".into()).detail(),
        })
    }

    fn gate(&self) -> Result<&Arc<ApprovalGate>, StepOutcome> {
        self.gate.as_ref().ok_or_else(|| StepOutcome::Failed {
            execution: None,
            error: StepError::Configuration("run has no approval gate".into()).detail(),
        })
    }

    async fn update(&self) -> StepOutcome {
        let context = match self.context() {
            Ok(context) => context,
            Err(outcome) => return outcome,
        };
        let token = self.pipeline.service.start_update(UpdateRequest {
            primary_id: self.pipeline.primary_id.clone(),
            deployment_policy_id: self.outputs.deployment_policy_id.clone(),
            context,
        });
        tracing::info!(run = %self.run, execution = %token, "update execution triggered");
        let outcome = self.await_execution(token).await;
        // The gate must stay pending for good once its upstream failed.
        if let (StepOutcome::Failed { error, .. }, Some(gate)) = (&outcome, &self.gate) {
            gate.hold(&error.message);
        }
        outcome
    }

    async fn approval(&self) -> StepOutcome {
        let gate = match self.gate() {
            Ok(gate) => gate,
            Err(outcome) => return outcome,
        };
        if let Err(err) = gate.open() {
            tracing::info!(run = %self.run, error = %err, "gate could not be opened");
        }
        match gate.wait_for_outcome(self.pipeline.config.approval.timeout()).await {
            GateState::Approved => StepOutcome::Approved,
            GateState::Rejected => StepOutcome::Rejected,
            _ => StepOutcome::Cancelled,
        }
    }

    async fn promote(&self) -> StepOutcome {
        let gate = match self.gate() {
            Ok(gate) => gate,
            Err(outcome) => return outcome,
        };
        if gate.state() != GateState::Approved {
            tracing::error!(run = %self.run, gate = ?gate.state(), "promotion requested without approval");
            return StepOutcome::Blocked;
        }
        let context = match self.context() {
            Ok(context) => context,
            Err(outcome) => return outcome,
        };
        let token = self.pipeline.service.start_promotion(PromotionRequest {
            primary_id: self.pipeline.primary_id.clone(),
            snapshot: self.outputs.snapshot.clone(),
            context,
        });
        tracing::info!(run = %self.run, execution = %token, "promotion execution triggered");
        self.await_execution(token).await
    }

    async fn verify(&self) -> StepOutcome {
        let service = &self.pipeline.service;
        match verify_primary(&**service.control(), service.retry(), &self.pipeline.primary_id).await {
            Ok(_) => StepOutcome::Succeeded { execution: None },
            Err(err) => StepOutcome::Failed {
                execution: None,
                error: err.detail(),
            },
        }
    }

    async fn await_execution(&self, token: ExecutionToken) -> StepOutcome {
        match self.pipeline.service.wait_for_completion(token).await {
            Ok(status) if status.phase == ExecutionPhase::Succeeded => StepOutcome::Succeeded {
                execution: Some(token),
            },
            Ok(status) => StepOutcome::Failed {
                execution: Some(token),
                error: status.error.unwrap_or_else(|| ErrorDetail {
                    kind: promo_kernel::ErrorKind::TransientInfra,
                    message: format!("execution ended in {}", status.state),
                }),
            },
            Err(err) => StepOutcome::Failed {
                execution: Some(token),
                error: ErrorDetail {
                    kind: promo_kernel::ErrorKind::TransientInfra,
                    message: err.to_string(),
                },
            },
        }
    }
}

#[async_trait]
impl<C: DistributionControl + ?Sized + 'static> StepRunner for PipelineStepRunner<C> {
    async fn run_step(&self, wave: &str, step: &PlannedStep) -> StepOutcome {
        tracing::debug!(run = %self.run, wave, step = %step.name, kind = step.kind.as_str(), "running step");
        match step.kind {
            StepKind::UpdatePolicy => self.update().await,
            StepKind::ManualApproval => self.approval().await,
            StepKind::Promote => self.promote().await,
            StepKind::VerifyPrimary => self.verify().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryControl;
    use crate::model::{DeploymentPolicyId, DistributionConfig};
    use promo_kernel::{AuditLog, BackoffConfig, RetryPolicy};

    fn exports(config: &PipelineConfig) -> ExportRegistry {
        let names = config.export_names();
        let exports = ExportRegistry::new();
        exports.publish(names.primary_distribution_id, "primary-1").unwrap();
        exports.publish(names.staging_distribution_id, "staging-1").unwrap();
        exports.publish(names.deployment_policy_id, "policy-42").unwrap();
        exports
    }

    fn service(control: Arc<InMemoryControl>) -> StateMachineService<InMemoryControl> {
        StateMachineService::new(
            "unit-state-machine",
            control,
            RetryPolicy::new(BackoffConfig::immediate(2)),
            Arc::new(AuditLog::new()),
        )
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new("unit")
            .with_execution_context(ExecutionContext::new("123456789012", "us-east-1"))
            .with_retry(BackoffConfig::immediate(2))
    }

    fn control() -> Arc<InMemoryControl> {
        let control = Arc::new(InMemoryControl::new());
        control.insert(
            DistributionConfig::new(ResourceIdentifier::new("primary-1"))
                .with_policy(DeploymentPolicyId::new("old"))
                .with_field("region", "us-east-1"),
        );
        control.insert(
            DistributionConfig::new(ResourceIdentifier::new("staging-1"))
                .with_policy(DeploymentPolicyId::new("policy-42"))
                .with_field("region", "us-east-1")
                .with_field("price_class", "PriceClass_100"),
        );
        control
    }

    #[test]
    fn continuous_plan_has_two_waves() {
        let config = config();
        let pipeline = PromotionPipeline::new(config.clone(), &exports(&config), service(control())).unwrap();
        let plan = pipeline.plan().unwrap();

        let names: Vec<&str> = plan.waves().iter().map(|w| w.name()).collect();
        assert_eq!(names, vec![UPDATE_WAVE, PROMOTE_WAVE]);
        let update = plan.wave(UPDATE_WAVE).unwrap();
        let gate = update.step_named(APPROVAL_STEP).unwrap();
        assert_eq!(gate.depends_on, vec![update.step_named(UPDATE_STEP).unwrap().id]);
    }

    #[test]
    fn bootstrap_plan_only_verifies() {
        let config = config().with_continuous_deployment(false);
        let pipeline = PromotionPipeline::new(config.clone(), &exports(&config), service(control())).unwrap();
        let plan = pipeline.plan().unwrap();
        assert_eq!(plan.waves().len(), 1);
        assert_eq!(plan.waves()[0].name(), VERIFY_WAVE);
    }

    #[test]
    fn missing_context_fails_construction() {
        let mut config = config();
        config.execution_context = None;
        let err = PromotionPipeline::new(config.clone(), &exports(&config), service(control())).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn missing_primary_export_fails_construction() {
        let config = config();
        let err = PromotionPipeline::new(config, &ExportRegistry::new(), service(control())).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn approved_run_promotes_staging() {
        let config = config();
        let exports = exports(&config);
        let control = control();
        let pipeline = Arc::new(
            PromotionPipeline::new(config, &exports, service(Arc::clone(&control))).unwrap(),
        );
        let outputs = pipeline.collect_staging_outputs(&exports).await.unwrap();

        let run = pipeline.start(outputs).unwrap();
        let gate = pipeline.gate(run).unwrap();
        assert_eq!(gate.wait_until_open().await, GateState::AwaitingDecision);
        pipeline.approve(run, "alice", Some("staging verified".into())).unwrap();

        let report = pipeline.wait(run).await.unwrap();
        assert_eq!(report.status, PipelineStatus::Completed);
        assert_eq!(report.approval.unwrap().actor, "alice");

        let live = control.current(&ResourceIdentifier::new("primary-1")).unwrap();
        assert_eq!(live.config.field("price_class"), Some(&"PriceClass_100".into()));
        assert_eq!(pipeline.status(run).unwrap(), PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn finished_runs_can_be_evicted() {
        let config = config().with_continuous_deployment(false);
        let exports = exports(&config);
        let pipeline = Arc::new(PromotionPipeline::new(config, &exports, service(control())).unwrap());
        let outputs = pipeline.collect_staging_outputs(&exports).await.unwrap();
        let report = pipeline.run(outputs).await.unwrap();

        assert_eq!(pipeline.evict_finished(report.started_at), 0);
        assert_eq!(pipeline.status(report.run).unwrap(), PipelineStatus::Completed);

        let later = report.finished_at + chrono::Duration::seconds(1);
        assert_eq!(pipeline.evict_finished(later), 1);
        assert!(matches!(
            pipeline.status(report.run),
            Err(PipelineError::UnknownExecution(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_run_completes_without_gate() {
        let config = config().with_continuous_deployment(false);
        let exports = exports(&config);
        let control = control();
        let pipeline = Arc::new(
            PromotionPipeline::new(config, &exports, service(Arc::clone(&control))).unwrap(),
        );
        let outputs = pipeline.collect_staging_outputs(&exports).await.unwrap();

        let run = pipeline.start(outputs).unwrap();
        assert!(pipeline.gate(run).unwrap_err().is_configuration());
        let report = pipeline.wait(run).await.unwrap();

        assert_eq!(report.status, PipelineStatus::Completed);
        assert!(control.journal().is_empty());
    }
}
