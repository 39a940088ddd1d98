//! Promo Core - staged promotion of a staging distribution onto a primary
//!
//! The pipeline runs two waves against the primary distribution:
//! - **Update-DeploymentPolicy**: an Update execution attaches the staging
//!   deployment policy to the live primary configuration (fetch, merge, write
//!   with a version check), and an approval gate that opens once it succeeds
//! - **Promote-StagingDistribution**: after approval, a Promotion execution
//!   replaces the primary configuration with the validated staging snapshot
//!
//! # Example
//!
//! ```rust,ignore
//! use promo_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(exports: ExportRegistry, control: Arc<InMemoryControl>) -> Result<(), PipelineError> {
//! let config = PipelineConfig::load("pipeline.toml")?;
//! let service = StateMachineService::new(
//!     config.state_machine_name.clone(),
//!     control,
//!     RetryPolicy::new(config.retry.clone()),
//!     Arc::new(AuditLog::new()),
//! );
//! let pipeline = Arc::new(PromotionPipeline::new(config, &exports, service)?);
//!
//! let outputs = pipeline.collect_staging_outputs(&exports).await?;
//! let run = pipeline.start(outputs)?;
//! pipeline.gate(run)?.wait_until_open().await;
//! pipeline.approve(run, "alice", Some("staging verified".into()))?;
//!
//! let report = pipeline.wait(run).await?;
//! println!("run finished: {:?}", report.status);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
pub mod config;
pub mod control;
pub mod error;
pub mod exports;
pub mod gate;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod steps;

// Re-exports for convenience
pub use config::{ApprovalConfig, ConfigError, PipelineConfig, DEFAULT_APPROVAL_COMMENT};
pub use control::DistributionControl;
pub use error::PipelineError;
pub use exports::{ExportNames, ExportRegistry};
pub use gate::{ApprovalGate, ApprovalRecord, Decision, GateError};
pub use memory::{InMemoryControl, WriteKind, WriteRecord};
pub use model::{
    DeploymentPolicyId, DistributionConfig, ETag, Precondition, PromotionRequest,
    ResourceIdentifier, StagingOutputs, UpdateRequest, VersionedConfig,
};
pub use pipeline::{build_plan, PipelineReport, PipelineStatus, PromotionPipeline};
pub use scheduler::{
    PlannedStep, ScheduleReport, StepKind, StepOutcome, StepReport, StepRunner, Wave, WaveBuilder,
    WavePlan, WaveReport, WaveScheduler,
};
pub use schema::SnapshotValidator;
pub use service::{ExecutionPhase, ExecutionStatus, StateMachineService};
pub use steps::{PromotionStep, TransitionObserver, UpdateStep};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a promotion pipeline
    pub use crate::{
        DistributionControl, ExportRegistry, InMemoryControl, PipelineConfig, PipelineError,
        PipelineReport, PipelineStatus, PromotionPipeline, StateMachineService,
    };
    pub use promo_kernel::{AuditLog, BackoffConfig, ExecutionContext, ExecutionToken, RetryPolicy};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
