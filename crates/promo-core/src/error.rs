//! Error types for the promotion pipeline
//!
//! Step-level failures travel as `promo_kernel::StepError` inside step
//! outcomes and execution status records. `PipelineError` is what the
//! orchestrator API itself returns:
//! - construction problems (missing export, missing execution context)
//! - operator actions that the gate refuses
//! - lookups of unknown runs or executions

use crate::config::ConfigError;
use crate::gate::GateError;
use promo_kernel::{ErrorKind, ExecutionToken, GraphError, StepError};

/// Orchestrator error
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Workflow cannot be constructed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Pipeline configuration failed to load or validate
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Step-level error raised outside a step execution
    #[error(transparent)]
    Step(#[from] StepError),

    /// Wave plan is malformed
    #[error("wave plan error: {0}")]
    Graph(#[from] GraphError),

    /// Gate refused an operator action
    #[error(transparent)]
    Gate(#[from] GateError),

    /// No run or execution with this token
    #[error("unknown execution: {0}")]
    UnknownExecution(ExecutionToken),

    /// Background task ended without reporting
    #[error("execution {0} ended without a result")]
    Abandoned(ExecutionToken),
}

impl PipelineError {
    /// Taxonomy kind, when the error maps onto one
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Configuration(_) | Self::Config(_) | Self::Graph(_) => {
                Some(ErrorKind::Configuration)
            }
            Self::Step(err) => Some(err.kind()),
            Self::Gate(_) | Self::UnknownExecution(_) | Self::Abandoned(_) => None,
        }
    }

    /// Whether construction failed because of configuration
    #[inline]
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.kind() == Some(ErrorKind::Configuration)
    }
}
