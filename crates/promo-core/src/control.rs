//! Control API of the distribution service

use crate::model::{DistributionConfig, ETag, Precondition, ResourceIdentifier, VersionedConfig};
use async_trait::async_trait;
use promo_kernel::StepResult;
use std::sync::Arc;

/// Read and write distribution configurations.
///
/// Implementations map throttling and timeouts to `StepError::TransientInfra`
/// so the retry loop can absorb them; an unknown identifier is
/// `StepError::NotFound` and a failed `IfMatch` is `StepError::Conflict`.
#[async_trait]
pub trait DistributionControl: Send + Sync {
    /// Read the live configuration and its version
    async fn get_config(&self, id: &ResourceIdentifier) -> StepResult<VersionedConfig>;

    /// Write `config` under `precondition`, returning the new version
    async fn put_config(
        &self,
        id: &ResourceIdentifier,
        config: DistributionConfig,
        precondition: Precondition,
    ) -> StepResult<ETag>;
}

#[async_trait]
impl<T: DistributionControl + ?Sized> DistributionControl for Arc<T> {
    async fn get_config(&self, id: &ResourceIdentifier) -> StepResult<VersionedConfig> {
        (**self).get_config(id).await
    }

    async fn put_config(
        &self,
        id: &ResourceIdentifier,
        config: DistributionConfig,
        precondition: Precondition,
    ) -> StepResult<ETag> {
        (**self).put_config(id, config, precondition).await
    }
}
