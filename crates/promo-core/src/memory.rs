use crate::control::DistributionControl;
use crate::model::{DistributionConfig, ETag, Precondition, ResourceIdentifier, VersionedConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use promo_kernel::{StepError, StepResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a journaled write was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// `put_config` with `IfMatch`
    Conditional,
    /// `put_config` with `Unconditional`
    Unconditional,
    /// Change made outside the workflow
    OutOfBand,
}

/// One accepted write
#[derive(Debug, Clone, Serialize)]
pub struct WriteRecord {
    /// Resource written
    pub id: ResourceIdentifier,
    /// Version produced
    pub etag: ETag,
    /// Configuration stored
    pub config: DistributionConfig,
    /// How it was written
    pub kind: WriteKind,
    /// When it was accepted
    pub at: DateTime<Utc>,
}

/// In-process control API with optimistic concurrency.
///
/// Versions are `v1`, `v2`, ... and increase on every write, including
/// out-of-band ones.
#[derive(Debug, Default)]
pub struct InMemoryControl {
    resources: RwLock<HashMap<ResourceIdentifier, VersionedConfig>>,
    version: AtomicU64,
    journal: Mutex<Vec<WriteRecord>>,
}

impl InMemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a resource without journaling it
    pub fn insert(&self, config: DistributionConfig) -> ETag {
        let etag = self.next_etag();
        self.resources.write().insert(
            config.id.clone(),
            VersionedConfig {
                config,
                etag: etag.clone(),
            },
        );
        etag
    }

    /// Modify a stored configuration as an external writer would
    pub fn external_write(
        &self,
        id: &ResourceIdentifier,
        change: impl FnOnce(&mut DistributionConfig),
    ) -> StepResult<ETag> {
        let mut resources = self.resources.write();
        let entry = resources
            .get_mut(id)
            .ok_or_else(|| StepError::NotFound(id.to_string()))?;
        change(&mut entry.config);
        entry.config.id = id.clone();
        entry.etag = self.next_etag();
        self.journal_write(id, entry, WriteKind::OutOfBand);
        Ok(entry.etag.clone())
    }

    /// Current value, if the resource exists
    pub fn current(&self, id: &ResourceIdentifier) -> Option<VersionedConfig> {
        self.resources.read().get(id).cloned()
    }

    /// All journaled writes, oldest first
    pub fn journal(&self) -> Vec<WriteRecord> {
        self.journal.lock().clone()
    }

    /// Journaled writes to `id`
    pub fn writes_to(&self, id: &ResourceIdentifier) -> Vec<WriteRecord> {
        self.journal
            .lock()
            .iter()
            .filter(|w| &w.id == id)
            .cloned()
            .collect()
    }

    fn next_etag(&self) -> ETag {
        ETag::new(format!("v{}", self.version.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn journal_write(&self, id: &ResourceIdentifier, entry: &VersionedConfig, kind: WriteKind) {
        self.journal.lock().push(WriteRecord {
            id: id.clone(),
            etag: entry.etag.clone(),
            config: entry.config.clone(),
            kind,
            at: Utc::now(),
        });
    }
}

#[async_trait]
impl DistributionControl for InMemoryControl {
    async fn get_config(&self, id: &ResourceIdentifier) -> StepResult<VersionedConfig> {
        self.current(id)
            .ok_or_else(|| StepError::NotFound(id.to_string()))
    }

    async fn put_config(
        &self,
        id: &ResourceIdentifier,
        config: DistributionConfig,
        precondition: Precondition,
    ) -> StepResult<ETag> {
        if &config.id != id {
            return Err(StepError::Configuration(format!(
                "configuration for {} cannot be written to {}",
                config.id, id
            )));
        }

        let mut resources = self.resources.write();
        let entry = resources
            .get_mut(id)
            .ok_or_else(|| StepError::NotFound(id.to_string()))?;

        let kind = match &precondition {
            Precondition::IfMatch(expected) => {
                if *expected != entry.etag {
                    return Err(StepError::Conflict {
                        resource: id.to_string(),
                        expected: expected.to_string(),
                        actual: entry.etag.to_string(),
                    });
                }
                WriteKind::Conditional
            }
            Precondition::Unconditional => WriteKind::Unconditional,
        };

        entry.config = config;
        entry.etag = self.next_etag();
        self.journal_write(id, entry, kind);
        tracing::debug!(resource = %id, etag = %entry.etag, ?kind, "configuration written");
        Ok(entry.etag.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeploymentPolicyId;

    fn seeded() -> (InMemoryControl, ResourceIdentifier, ETag) {
        let control = InMemoryControl::new();
        let id = ResourceIdentifier::new("primary-1");
        let etag = control.insert(
            DistributionConfig::new(id.clone()).with_policy(DeploymentPolicyId::new("old")),
        );
        (control, id, etag)
    }

    #[tokio::test]
    async fn conditional_write_bumps_version() {
        let (control, id, etag) = seeded();
        let current = control.get_config(&id).await.unwrap();
        let merged = current.config.merge_policy(&DeploymentPolicyId::new("policy-42"));

        let next = control
            .put_config(&id, merged.clone(), Precondition::IfMatch(etag.clone()))
            .await
            .unwrap();

        assert_ne!(next, etag);
        assert_eq!(control.current(&id).unwrap().config, merged);
        assert_eq!(control.journal()[0].kind, WriteKind::Conditional);
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let (control, id, etag) = seeded();
        control
            .external_write(&id, |c| {
                c.fields.insert("comment".into(), "hotfix".into());
            })
            .unwrap();

        let err = control
            .put_config(
                &id,
                DistributionConfig::new(id.clone()),
                Precondition::IfMatch(etag),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Conflict { .. }));
        assert_eq!(
            control.current(&id).unwrap().config.field("comment"),
            Some(&"hotfix".into())
        );
    }

    #[tokio::test]
    async fn unknown_resource_is_not_found() {
        let control = InMemoryControl::new();
        let id = ResourceIdentifier::new("missing");
        assert_eq!(
            control.get_config(&id).await.unwrap_err(),
            StepError::NotFound("missing".into())
        );
        let err = control
            .put_config(&id, DistributionConfig::new(id.clone()), Precondition::Unconditional)
            .await
            .unwrap_err();
        assert_eq!(err, StepError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn identifier_mismatch_is_refused() {
        let (control, id, _) = seeded();
        let other = DistributionConfig::new(ResourceIdentifier::new("staging-1"));
        let err = control
            .put_config(&id, other, Precondition::Unconditional)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Configuration(_)));
        assert!(control.journal().is_empty());
    }
}
