//! State-machine execution service
//!
//! Trigger interface: `start_update` / `start_promotion` spawn the execution
//! and return its token immediately. Status interface: `execution_status`
//! reports `Pending | Succeeded | Failed` with the current state and, on
//! failure, the error kind and cause.

use crate::control::DistributionControl;
use crate::error::PipelineError;
use crate::model::{DistributionConfig, PromotionRequest, ResourceIdentifier, UpdateRequest};
use crate::steps::{PromotionStep, UpdateStep};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use promo_kernel::{
    AuditLog, ErrorDetail, ExecutionToken, MachineKind, MachineState, PromotionState,
    RetryPolicy, StepError, StepResult, Transition, UpdateState,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Coarse execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Not yet terminal
    Pending,
    /// Reached `Succeeded`
    Succeeded,
    /// Reached `Failed`
    Failed,
}

impl ExecutionPhase {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Pending => "pending",
            ExecutionPhase::Succeeded => "succeeded",
            ExecutionPhase::Failed => "failed",
        }
    }
}

/// Snapshot of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// Execution token
    pub token: ExecutionToken,
    /// Which machine runs
    pub machine: MachineKind,
    /// Service the execution belongs to
    pub state_machine: String,
    /// Resource the execution targets
    pub resource: ResourceIdentifier,
    /// Coarse phase
    pub phase: ExecutionPhase,
    /// Current state name
    pub state: String,
    /// Failure cause
    pub error: Option<ErrorDetail>,
    /// Configuration left on the primary after success
    pub result: Option<DistributionConfig>,
    /// When the execution was triggered
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ExecutionEntry {
    seq: u64,
    status: RwLock<ExecutionStatus>,
    done: watch::Receiver<bool>,
}

/// Owned by the spawned task; finishes the execution as `Failed` if the task
/// unwinds or is dropped before reporting.
struct Completion<C: ?Sized> {
    inner: Arc<ServiceInner<C>>,
    token: ExecutionToken,
    entry: Arc<ExecutionEntry>,
    done: Option<watch::Sender<bool>>,
}

impl<C: ?Sized> Completion<C> {
    fn complete(mut self, result: StepResult<DistributionConfig>) {
        if let Some(done) = self.done.take() {
            finish(&self.inner, self.token, &self.entry, result);
            done.send_replace(true);
        }
    }
}

impl<C: ?Sized> Drop for Completion<C> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        tracing::error!(execution = %self.token, "execution task ended without a result");
        self.entry.status.write().state = "Failed".to_string();
        finish(
            &self.inner,
            self.token,
            &self.entry,
            Err(StepError::TransientInfra(
                "execution task ended before reaching a terminal state".into(),
            )),
        );
        done.send_replace(true);
    }
}

struct ServiceInner<C: ?Sized> {
    name: String,
    control: Arc<C>,
    retry: RetryPolicy,
    audit: Arc<AuditLog>,
    executions: DashMap<ExecutionToken, Arc<ExecutionEntry>>,
    sequence: AtomicU64,
}

/// Runs Update and Promotion executions in the background.
///
/// Execution records are kept until `evict_finished` drops them.
pub struct StateMachineService<C: ?Sized> {
    inner: Arc<ServiceInner<C>>,
}

impl<C: ?Sized> Clone for StateMachineService<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ?Sized> std::fmt::Debug for StateMachineService<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineService")
            .field("name", &self.inner.name)
            .field("executions", &self.inner.executions.len())
            .finish_non_exhaustive()
    }
}

impl<C: DistributionControl + ?Sized + 'static> StateMachineService<C> {
    pub fn new(
        name: impl Into<String>,
        control: Arc<C>,
        retry: RetryPolicy,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                control,
                retry,
                audit,
                executions: DashMap::new(),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn control(&self) -> &Arc<C> {
        &self.inner.control
    }

    #[inline]
    pub fn retry(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    #[inline]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    /// Trigger an Update execution
    pub fn start_update(&self, request: UpdateRequest) -> ExecutionToken {
        let completion = self.register(
            MachineKind::Update,
            request.primary_id.clone(),
            UpdateState::FetchCurrent,
        );
        let token = completion.token;

        tokio::spawn(async move {
            let inner = Arc::clone(&completion.inner);
            let observer = observer_for::<UpdateState>(
                token,
                Arc::clone(&completion.entry),
                Arc::clone(&inner.audit),
            );
            let result = UpdateStep::new(&*inner.control, &inner.retry)
                .run(&request, &observer)
                .await
                .map(|outcome| outcome.config);
            completion.complete(result);
        });
        token
    }

    /// Trigger a Promotion execution
    pub fn start_promotion(&self, request: PromotionRequest) -> ExecutionToken {
        let completion = self.register(
            MachineKind::Promotion,
            request.primary_id.clone(),
            PromotionState::ValidateSnapshot,
        );
        let token = completion.token;

        tokio::spawn(async move {
            let inner = Arc::clone(&completion.inner);
            let observer = observer_for::<PromotionState>(
                token,
                Arc::clone(&completion.entry),
                Arc::clone(&inner.audit),
            );
            let result = PromotionStep::new(&*inner.control, &inner.retry)
                .run(&request, &observer)
                .await
                .map(|outcome| outcome.config);
            completion.complete(result);
        });
        token
    }

    /// Current status of `token`
    pub fn execution_status(&self, token: ExecutionToken) -> Result<ExecutionStatus, PipelineError> {
        self.entry(token).map(|entry| entry.status.read().clone())
    }

    /// Wait until `token` is terminal
    pub async fn wait_for_completion(
        &self,
        token: ExecutionToken,
    ) -> Result<ExecutionStatus, PipelineError> {
        let entry = self.entry(token)?;
        let mut done = entry.done.clone();
        let finished = done.wait_for(|finished| *finished).await.is_ok();
        if !finished {
            return Err(PipelineError::Abandoned(token));
        }
        let status = entry.status.read().clone();
        Ok(status)
    }

    /// Every execution, oldest first
    pub fn list_executions(&self) -> Vec<ExecutionStatus> {
        let mut all: Vec<(u64, ExecutionStatus)> = self
            .inner
            .executions
            .iter()
            .map(|e| (e.value().seq, e.value().status.read().clone()))
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, status)| status).collect()
    }

    /// Drop terminal executions that finished before `cutoff`; returns how many
    pub fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.inner.executions.len();
        self.inner.executions.retain(|_, entry| {
            let status = entry.status.read();
            !matches!(status.finished_at, Some(at) if at < cutoff)
        });
        let evicted = before.saturating_sub(self.inner.executions.len());
        if evicted > 0 {
            tracing::debug!(state_machine = %self.inner.name, evicted, "finished executions evicted");
        }
        evicted
    }

    fn entry(&self, token: ExecutionToken) -> Result<Arc<ExecutionEntry>, PipelineError> {
        self.inner
            .executions
            .get(&token)
            .map(|e| Arc::clone(e.value()))
            .ok_or(PipelineError::UnknownExecution(token))
    }

    fn register<S: MachineState>(
        &self,
        machine: MachineKind,
        resource: ResourceIdentifier,
        initial: S,
    ) -> Completion<C> {
        let token = ExecutionToken::new();
        let status = ExecutionStatus {
            token,
            machine,
            state_machine: self.inner.name.clone(),
            resource: resource.clone(),
            phase: ExecutionPhase::Pending,
            state: initial.name().to_string(),
            error: None,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        let (done, done_rx) = watch::channel(false);
        let entry = Arc::new(ExecutionEntry {
            seq: self.inner.sequence.fetch_add(1, Ordering::Relaxed),
            status: RwLock::new(status),
            done: done_rx,
        });
        self.inner.executions.insert(token, Arc::clone(&entry));
        self.inner.audit.record(
            token,
            format!("{}.started", machine.as_str()),
            format!("state_machine={} resource={}", self.inner.name, resource),
        );
        tracing::info!(
            execution = %token,
            state_machine = %self.inner.name,
            machine = machine.as_str(),
            resource = %resource,
            "execution started"
        );
        Completion {
            inner: Arc::clone(&self.inner),
            token,
            entry,
            done: Some(done),
        }
    }
}

fn observer_for<S: MachineState>(
    token: ExecutionToken,
    entry: Arc<ExecutionEntry>,
    audit: Arc<AuditLog>,
) -> impl Fn(&Transition<S>) + Send + Sync + 'static {
    move |transition: &Transition<S>| {
        entry.status.write().state = transition.to.name().to_string();
        audit.record(
            token,
            format!("{}.transition", S::MACHINE),
            format!("{} -> {}", transition.from.name(), transition.to.name()),
        );
    }
}

fn finish<C: ?Sized>(
    inner: &ServiceInner<C>,
    token: ExecutionToken,
    entry: &ExecutionEntry,
    result: StepResult<DistributionConfig>,
) {
    let phase = {
        let mut status = entry.status.write();
        status.finished_at = Some(Utc::now());
        match result {
            Ok(config) => {
                status.phase = ExecutionPhase::Succeeded;
                status.result = Some(config);
            }
            Err(err) => {
                status.phase = ExecutionPhase::Failed;
                status.error = Some(err.detail());
            }
        }
        status.phase
    };

    let machine = entry.status.read().machine;
    metrics::counter!(
        "promo_executions_total",
        "machine" => machine.as_str(),
        "phase" => phase.as_str()
    )
    .increment(1);
    inner.audit.record(
        token,
        format!("{}.{}", machine.as_str(), phase.as_str()),
        entry
            .status
            .read()
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    );
    tracing::info!(execution = %token, machine = machine.as_str(), phase = phase.as_str(), "execution finished");
}
