//! Testing utilities for the promo workspace
//!
//! Shared fixtures, a fault-injecting control API and a ready-made pipeline
//! environment.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use promo_core::{
    DeploymentPolicyId, DistributionConfig, DistributionControl, ETag, ExportRegistry,
    InMemoryControl, PipelineConfig, Precondition, PromotionPipeline, ResourceIdentifier,
    StateMachineService, VersionedConfig,
};
use promo_kernel::{AuditLog, BackoffConfig, ExecutionContext, RetryPolicy, StepError, StepResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const PRIMARY_ID: &str = "primary-1";
pub const STAGING_ID: &str = "staging-1";
pub const STAGED_POLICY: &str = "policy-42";

type Mutation = Box<dyn FnOnce(&mut DistributionConfig) + Send>;

/// Wraps `InMemoryControl` and injects failures on demand
pub struct FaultyControl {
    inner: Arc<InMemoryControl>,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    write_after_read: Mutex<Option<Mutation>>,
    reads: AtomicU32,
    writes: AtomicU32,
}

impl FaultyControl {
    pub fn new(inner: Arc<InMemoryControl>) -> Self {
        Self {
            inner,
            failing_reads: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            write_after_read: Mutex::new(None),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryControl> {
        &self.inner
    }

    /// Next `n` reads fail with `TransientInfra`
    pub fn fail_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Next `n` writes fail with `TransientInfra`
    pub fn fail_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// After the next successful read, an external writer applies `change`
    pub fn concurrent_write_after_read(
        &self,
        change: impl FnOnce(&mut DistributionConfig) + Send + 'static,
    ) {
        *self.write_after_read.lock() = Some(Box::new(change));
    }

    /// Calls to `get_config`, including failed ones
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Calls to `put_config`, including failed ones
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DistributionControl for FaultyControl {
    async fn get_config(&self, id: &ResourceIdentifier) -> StepResult<VersionedConfig> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&self.failing_reads) {
            return Err(StepError::TransientInfra("injected read throttling".into()));
        }
        let current = self.inner.get_config(id).await?;
        let change = self.write_after_read.lock().take();
        if let Some(change) = change {
            self.inner.external_write(id, change)?;
        }
        Ok(current)
    }

    async fn put_config(
        &self,
        id: &ResourceIdentifier,
        config: DistributionConfig,
        precondition: Precondition,
    ) -> StepResult<ETag> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&self.failing_writes) {
            return Err(StepError::TransientInfra("injected write timeout".into()));
        }
        self.inner.put_config(id, config, precondition).await
    }
}

pub fn primary_id() -> ResourceIdentifier {
    ResourceIdentifier::new(PRIMARY_ID)
}

pub fn staging_id() -> ResourceIdentifier {
    ResourceIdentifier::new(STAGING_ID)
}

/// `{id: "primary-1", deployment_policy_id: "old", region: "us-east-1"}`
pub fn primary_config() -> DistributionConfig {
    DistributionConfig::new(primary_id())
        .with_policy(DeploymentPolicyId::new("old"))
        .with_field("region", "us-east-1")
}

/// Staging configuration carrying the staged policy and extra settings
pub fn staging_config() -> DistributionConfig {
    DistributionConfig::new(staging_id())
        .with_policy(DeploymentPolicyId::new(STAGED_POLICY))
        .with_field("region", "us-east-1")
        .with_field("price_class", "PriceClass_100")
        .with_field(
            "origins",
            serde_json::json!([{"domain": "staging-origin.example.com", "protocol": "https-only"}]),
        )
}

pub fn test_context() -> ExecutionContext {
    ExecutionContext::new("123456789012", "us-east-1")
}

/// Three attempts, no delays
pub fn fast_retry() -> BackoffConfig {
    BackoffConfig::immediate(3)
}

pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig::new("test-pipeline")
        .with_execution_context(test_context())
        .with_retry(fast_retry())
}

/// Registry with the primary, staging and policy exports of `config`
pub fn seeded_exports(config: &PipelineConfig) -> ExportRegistry {
    let names = config.export_names();
    let exports = ExportRegistry::new();
    exports.publish(names.primary_distribution_id, PRIMARY_ID).unwrap();
    exports.publish(names.staging_distribution_id, STAGING_ID).unwrap();
    exports.publish(names.deployment_policy_id, STAGED_POLICY).unwrap();
    exports
}

/// Control API holding `primary_config()` and `staging_config()`
pub fn seeded_control() -> Arc<InMemoryControl> {
    let control = Arc::new(InMemoryControl::new());
    control.insert(primary_config());
    control.insert(staging_config());
    control
}

/// Everything a pipeline test needs
pub struct TestEnv {
    pub store: Arc<InMemoryControl>,
    pub control: Arc<FaultyControl>,
    pub exports: ExportRegistry,
    pub audit: Arc<AuditLog>,
    pub service: StateMachineService<FaultyControl>,
    pub config: PipelineConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(test_pipeline_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let store = seeded_control();
        let control = Arc::new(FaultyControl::new(Arc::clone(&store)));
        let exports = seeded_exports(&config);
        let audit = Arc::new(AuditLog::new());
        let service = StateMachineService::new(
            config.state_machine_name.clone(),
            Arc::clone(&control),
            RetryPolicy::new(config.retry.clone()),
            Arc::clone(&audit),
        );
        Self {
            store,
            control,
            exports,
            audit,
            service,
            config,
        }
    }

    pub fn pipeline(&self) -> Arc<PromotionPipeline<FaultyControl>> {
        Arc::new(
            PromotionPipeline::new(self.config.clone(), &self.exports, self.service.clone())
                .expect("test pipeline should construct"),
        )
    }

    /// Live primary configuration
    pub fn primary(&self) -> DistributionConfig {
        self.store
            .current(&primary_id())
            .expect("primary is seeded")
            .config
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
