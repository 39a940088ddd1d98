use super::{Machine, TransitionObserver};
use crate::control::DistributionControl;
use crate::model::{DistributionConfig, ETag, Precondition, PromotionRequest};
use crate::schema::SnapshotValidator;
use promo_kernel::{PromotionState, RetryPolicy, StepResult};

/// Result of a successful Promotion execution
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionOutcome {
    /// Configuration now live on the primary
    pub config: DistributionConfig,
    /// Version of the live configuration
    pub etag: ETag,
}

/// Replace the primary configuration with a validated staging snapshot.
///
/// The write is unconditional: staging wins over whatever the primary holds,
/// including the policy the Update Step attached. Only the identifier is kept.
pub struct PromotionStep<'a, C: ?Sized> {
    control: &'a C,
    retry: &'a RetryPolicy,
}

impl<'a, C: DistributionControl + ?Sized> PromotionStep<'a, C> {
    pub fn new(control: &'a C, retry: &'a RetryPolicy) -> Self {
        Self { control, retry }
    }

    #[tracing::instrument(name = "promotion_step", skip_all, fields(resource = %request.primary_id))]
    pub async fn run(
        &self,
        request: &PromotionRequest,
        observer: &dyn TransitionObserver<PromotionState>,
    ) -> StepResult<PromotionOutcome> {
        let mut machine = Machine::new(PromotionState::ValidateSnapshot, observer);
        match self.execute(request, &mut machine).await {
            Ok(outcome) => {
                machine.advance(PromotionState::Succeeded)?;
                tracing::info!(etag = %outcome.etag, "staging configuration promoted");
                Ok(outcome)
            }
            Err(err) => {
                machine.fail(PromotionState::Failed, &err);
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &PromotionRequest,
        machine: &mut Machine<'_, PromotionState>,
    ) -> StepResult<PromotionOutcome> {
        request.context.validate()?;
        let snapshot = SnapshotValidator::new()?.validate(&request.snapshot)?;

        machine.advance(PromotionState::ApplyPromotion)?;
        let promoted = snapshot.promoted_onto(&request.primary_id);
        let etag = self
            .retry
            .run("promotion.apply", || {
                self.control.put_config(
                    &request.primary_id,
                    promoted.clone(),
                    Precondition::Unconditional,
                )
            })
            .await?;

        Ok(PromotionOutcome {
            config: promoted,
            etag,
        })
    }
}
