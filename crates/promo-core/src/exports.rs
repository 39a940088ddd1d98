//! Cross-environment exports
//!
//! The primary environment publishes its resource identifier once; the
//! promotion pipeline imports it by name when it is constructed. Exports are
//! write-once so a consumer can never observe two different values.

use crate::model::{DeploymentPolicyId, ResourceIdentifier};
use parking_lot::RwLock;
use promo_kernel::{StepError, StepResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Export names derived from a pipeline name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportNames {
    /// Identifier of the primary distribution
    pub primary_distribution_id: String,
    /// Identifier of the staging distribution
    pub staging_distribution_id: String,
    /// Deployment policy produced by staging
    pub deployment_policy_id: String,
}

impl ExportNames {
    pub fn for_pipeline(pipeline: &str) -> Self {
        Self {
            primary_distribution_id: format!("{pipeline}-primary-distribution-id"),
            staging_distribution_id: format!("{pipeline}-staging-distribution-id"),
            deployment_policy_id: format!("{pipeline}-staging-deployment-policy-id"),
        }
    }
}

/// Write-once named values
#[derive(Debug, Default)]
pub struct ExportRegistry {
    exports: RwLock<BTreeMap<String, String>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `value` under `name`.
    ///
    /// # Errors
    /// `StepError::Configuration` when `name` already holds a different value
    /// or either argument is blank.
    pub fn publish(&self, name: impl Into<String>, value: impl Into<String>) -> StepResult<()> {
        let name = name.into();
        let value = value.into();
        if name.trim().is_empty() || value.trim().is_empty() {
            return Err(StepError::Configuration(
                "export name and value must not be empty".to_string(),
            ));
        }

        let mut exports = self.exports.write();
        match exports.get(&name) {
            Some(existing) if *existing == value => Ok(()),
            Some(existing) => Err(StepError::Configuration(format!(
                "export {name} is already published as {existing}"
            ))),
            None => {
                tracing::info!(export = %name, %value, "export published");
                exports.insert(name, value);
                Ok(())
            }
        }
    }

    /// Look up `name`.
    ///
    /// # Errors
    /// `StepError::Configuration` when nothing is published under `name`.
    pub fn import(&self, name: &str) -> StepResult<String> {
        self.exports
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StepError::Configuration(format!("export {name} is not published")))
    }

    pub fn import_resource(&self, name: &str) -> StepResult<ResourceIdentifier> {
        self.import(name).map(ResourceIdentifier::new)
    }

    pub fn import_policy(&self, name: &str) -> StepResult<DeploymentPolicyId> {
        self.import(name).map(DeploymentPolicyId::new)
    }

    /// Published names, sorted
    pub fn names(&self) -> Vec<String> {
        self.exports.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_pipeline() {
        let names = ExportNames::for_pipeline("shop");
        assert_eq!(names.primary_distribution_id, "shop-primary-distribution-id");
        assert_eq!(names.staging_distribution_id, "shop-staging-distribution-id");
        assert_eq!(names.deployment_policy_id, "shop-staging-deployment-policy-id");
    }

    #[test]
    fn publish_is_write_once() {
        let registry = ExportRegistry::new();
        registry.publish("shop-primary-distribution-id", "primary-1").unwrap();
        registry.publish("shop-primary-distribution-id", "primary-1").unwrap();

        let err = registry
            .publish("shop-primary-distribution-id", "primary-2")
            .unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
        assert_eq!(
            registry.import_resource("shop-primary-distribution-id").unwrap(),
            ResourceIdentifier::new("primary-1")
        );
    }

    #[test]
    fn missing_export_is_a_configuration_error() {
        let registry = ExportRegistry::new();
        let err = registry.import("shop-primary-distribution-id").unwrap_err();
        assert_eq!(err.kind(), promo_kernel::ErrorKind::Configuration);
        assert!(registry.names().is_empty());
    }

    #[test]
    fn blank_values_are_refused() {
        let registry = ExportRegistry::new();
        assert!(registry.publish("shop-primary-distribution-id", " ").is_err());
    }
}
