//! Distribution configuration model
//!
//! A `DistributionConfig` carries the two fields the promotion workflow owns
//! (`id` and `deployment_policy_id`) and keeps every other field verbatim in
//! `fields`, so a merge never drops data it does not understand.

use promo_kernel::ExecutionContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque name of a distribution resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIdentifier(String);

impl ResourceIdentifier {
    /// Wrap an identifier
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a deployment policy produced by staging
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentPolicyId(String);

impl DeploymentPolicyId {
    /// Wrap a policy identifier
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentPolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version tag returned by the control API
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wrap a version tag
    #[inline]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Borrow the raw tag
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration of one distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionConfig {
    /// Resource the configuration belongs to
    pub id: ResourceIdentifier,

    /// Attached deployment policy, if any
    #[serde(default)]
    pub deployment_policy_id: Option<DeploymentPolicyId>,

    /// Fields not owned by the promotion workflow
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl DistributionConfig {
    /// Empty configuration for `id`
    pub fn new(id: ResourceIdentifier) -> Self {
        Self {
            id,
            deployment_policy_id: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder: attach a policy
    #[must_use]
    pub fn with_policy(mut self, policy: DeploymentPolicyId) -> Self {
        self.deployment_policy_id = Some(policy);
        self
    }

    /// Builder: set an unowned field
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up an unowned field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Copy of `self` with the policy overwritten and nothing else touched.
    #[must_use]
    pub fn merge_policy(&self, policy: &DeploymentPolicyId) -> Self {
        Self {
            deployment_policy_id: Some(policy.clone()),
            ..self.clone()
        }
    }

    /// Copy of `self` addressed to `target`.
    ///
    /// Every field except the identifier comes from `self`.
    #[must_use]
    pub fn promoted_onto(&self, target: &ResourceIdentifier) -> Self {
        Self {
            id: target.clone(),
            ..self.clone()
        }
    }

    /// Whether every field except the identifier matches
    pub fn same_owned_fields(&self, other: &Self) -> bool {
        self.deployment_policy_id == other.deployment_policy_id && self.fields == other.fields
    }
}

/// Configuration plus the version it was read at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedConfig {
    /// Configuration as read
    pub config: DistributionConfig,
    /// Version tag for conditional writes
    pub etag: ETag,
}

/// Write precondition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    /// Write only if the stored version still matches
    IfMatch(ETag),
    /// Replace whatever is stored
    Unconditional,
}

/// Payload of an Update execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Primary resource to update
    pub primary_id: ResourceIdentifier,
    /// Policy to attach
    pub deployment_policy_id: DeploymentPolicyId,
    /// Account and region
    pub context: ExecutionContext,
}

/// Payload of a Promotion execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionRequest {
    /// Primary resource to overwrite
    pub primary_id: ResourceIdentifier,
    /// Staging configuration, unvalidated
    pub snapshot: Value,
    /// Account and region
    pub context: ExecutionContext,
}

/// What the staging environment hands the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingOutputs {
    /// Policy reference for the Update Step
    pub deployment_policy_id: DeploymentPolicyId,
    /// Configuration snapshot for the Promotion Step
    pub snapshot: Value,
}
