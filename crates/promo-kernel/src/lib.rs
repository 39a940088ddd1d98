//! Promo Kernel
//!
//! Execution primitives shared by every promotion workflow:
//! 1. **State machines**: transition tables for the update, promotion and
//!    approval machines, plus a tracker that refuses illegal moves
//! 2. **Step graphs**: dependency edges between steps of a wave, kept acyclic
//! 3. **Retry**: bounded exponential backoff that only absorbs transient errors
//! 4. **Audit**: an append-only, hash-chained record of decisions and transitions
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use promo_kernel::prelude::*;
//!
//! let graph = StepGraph::new();
//! let update = StepId::new();
//! let gate = StepId::new();
//! graph.add_dependency(update, gate)?;
//!
//! let mut tracker = StateTracker::new(UpdateState::FetchCurrent);
//! tracker.transition(UpdateState::MergePolicy)?;
//! ```

pub mod audit;
pub mod dag;
pub mod error;
pub mod retry;
pub mod state_machine;
pub mod types;

pub use audit::{AuditEvent, AuditLog};
pub use dag::StepGraph;
pub use error::{
    AuditError, ErrorDetail, ErrorKind, GraphError, StateMachineError, StepError, StepResult,
};
pub use retry::{BackoffConfig, RetryPolicy};
pub use state_machine::{
    validate_transition, GateState, MachineState, PromotionState, StateTracker, Transition,
    UpdateState,
};
pub use types::{EventId, ExecutionContext, ExecutionToken, MachineKind, StepId};

/// Common imports for kernel consumers
pub mod prelude {
    pub use crate::audit::AuditLog;
    pub use crate::dag::StepGraph;
    pub use crate::error::{ErrorKind, StepError, StepResult};
    pub use crate::retry::{BackoffConfig, RetryPolicy};
    pub use crate::state_machine::{
        GateState, MachineState, PromotionState, StateTracker, UpdateState,
    };
    pub use crate::types::{ExecutionContext, ExecutionToken, MachineKind, StepId};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
