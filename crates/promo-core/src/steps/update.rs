use super::{Machine, TransitionObserver};
use crate::control::DistributionControl;
use crate::model::{DistributionConfig, ETag, Precondition, UpdateRequest};
use promo_kernel::{RetryPolicy, StepResult, UpdateState};

/// Result of a successful Update execution
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    /// Configuration now live on the primary
    pub config: DistributionConfig,
    /// Version of the live configuration
    pub etag: ETag,
    /// Whether the merge differed from the fetched configuration
    pub changed: bool,
}

/// Attach a deployment policy to the primary configuration.
///
/// `FetchCurrent` takes the only snapshot, `MergePolicy` works on that
/// snapshot without re-reading, and `ApplyUpdate` writes with `IfMatch` on
/// the fetched version. A concurrent writer therefore turns into
/// `StepError::Conflict` instead of being overwritten, and a conflict is not
/// retried. The conditional write is issued even when the merge leaves the
/// snapshot unchanged, so the version check always runs.
pub struct UpdateStep<'a, C: ?Sized> {
    control: &'a C,
    retry: &'a RetryPolicy,
}

impl<'a, C: DistributionControl + ?Sized> UpdateStep<'a, C> {
    pub fn new(control: &'a C, retry: &'a RetryPolicy) -> Self {
        Self { control, retry }
    }

    /// Run the machine from `FetchCurrent` to a terminal state.
    ///
    /// # Errors
    /// - `NotFound` if the primary does not resolve
    /// - `Conflict` if the primary changed after it was fetched
    /// - `RetriesExhausted` if transient errors outlast the backoff budget
    /// - `Configuration` if the execution context is incomplete
    #[tracing::instrument(
        name = "update_step",
        skip_all,
        fields(resource = %request.primary_id, policy = %request.deployment_policy_id)
    )]
    pub async fn run(
        &self,
        request: &UpdateRequest,
        observer: &dyn TransitionObserver<UpdateState>,
    ) -> StepResult<UpdateOutcome> {
        let mut machine = Machine::new(UpdateState::FetchCurrent, observer);
        match self.execute(request, &mut machine).await {
            Ok(outcome) => {
                machine.advance(UpdateState::Succeeded)?;
                tracing::info!(etag = %outcome.etag, changed = outcome.changed, "policy attached");
                Ok(outcome)
            }
            Err(err) => {
                machine.fail(UpdateState::Failed, &err);
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &UpdateRequest,
        machine: &mut Machine<'_, UpdateState>,
    ) -> StepResult<UpdateOutcome> {
        request.context.validate()?;

        let current = self
            .retry
            .run("update.fetch_current", || self.control.get_config(&request.primary_id))
            .await?;

        machine.advance(UpdateState::MergePolicy)?;
        let merged = current.config.merge_policy(&request.deployment_policy_id);

        let changed = merged != current.config;

        machine.advance(UpdateState::ApplyUpdate)?;
        if !changed {
            tracing::debug!("policy already attached, confirming version");
        }
        let precondition = Precondition::IfMatch(current.etag);
        let etag = self
            .retry
            .run("update.apply", || {
                self.control
                    .put_config(&request.primary_id, merged.clone(), precondition.clone())
            })
            .await?;

        Ok(UpdateOutcome {
            config: merged,
            etag,
            changed,
        })
    }
}
