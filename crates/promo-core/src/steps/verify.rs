use crate::control::DistributionControl;
use crate::model::{ResourceIdentifier, VersionedConfig};
use promo_kernel::{RetryPolicy, StepError, StepResult};

/// Smoke check run in bootstrap mode: the primary resolves and reports its
/// own identifier.
#[tracing::instrument(name = "verify_primary", skip(control, retry), fields(resource = %primary_id))]
pub async fn verify_primary<C: DistributionControl + ?Sized>(
    control: &C,
    retry: &RetryPolicy,
    primary_id: &ResourceIdentifier,
) -> StepResult<VersionedConfig> {
    let current = retry
        .run("verify.fetch_primary", || control.get_config(primary_id))
        .await?;

    if &current.config.id != primary_id {
        return Err(StepError::Configuration(format!(
            "primary {} resolved to a configuration for {}",
            primary_id, current.config.id
        )));
    }

    tracing::info!(etag = %current.etag, "primary distribution verified");
    Ok(current)
}
