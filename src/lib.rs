//! Multi-agent workflow orchestration engine
//!
//! This crate executes directed-acyclic graphs of AI tasks. Each task ("step")
//! is assigned to a specialized agent; steps exchange structured data through
//! typed inputs/outputs, fan out in bounded parallelism, may branch on
//! runtime conditions evaluated by a decision-tree engine, and observe
//! per-step timeouts, retry policies, and quality gates.
//!
//! Three tightly coupled subsystems make up the core:
//! - [`orchestrator`]: DAG execution, scheduling, retries, pause/resume/cancel.
//! - [`agent_manager`]: agent registry, capability matching, load balancing.
//! - [`decision`]: decision-tree evaluation with a restricted condition grammar.
//!
//! [`bus`] and [`handoff`] are the supporting communication and audit layers.
//! The engine itself persists nothing and invokes no model: the actual "think"
//! step is a pluggable [`agent_manager::StepHandler`].

pub mod agent_manager;
pub mod bus;
pub mod decision;
pub mod execution;
pub mod handoff;
pub mod orchestrator;
pub mod types;

pub use agent_manager::{AgentInstance, AgentManager, StepHandler};
pub use bus::{CommunicationBus, Message, MessagePriority, MessageType};
pub use decision::{DecisionEngine, DecisionResult};
pub use execution::{AgentExecution, ExecutionStatus, StepExecution, StepStatus, WorkflowExecution};
pub use handoff::{AuditSink, HandoffTicket, LoggingAuditSink};
pub use orchestrator::{ExecutionListFilter, Orchestrator, OrchestratorResponse};
pub use types::{
    AgentDefinition, AgentType, Capability, DecisionTree, Priority, RetryPolicy,
    StepType, WorkflowDefinition, WorkflowStep,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every error kind this engine can surface, per the error taxonomy: validation,
/// resource, transient, timeout, safety, and internal errors.
#[derive(Error, Debug, Clone)]
pub enum OrchestrationError {
    #[error("missing required field: {0}")]
    MissingFields(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("capability mismatch: agent {agent_id} cannot handle step type {step_type:?}")]
    CapabilityMismatch { agent_id: String, step_type: types::StepType },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("invalid status transition: {0}")]
    InvalidStatus(String),

    #[error("execution timeout after {0} ms")]
    ExecutionTimeout(u64),

    #[error("invalid decision tree: {0}")]
    InvalidDecisionTree(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// Stable identifier surfaced as `details.code` in the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => "MISSING_FIELDS",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::AgentNotAvailable(_) => "AGENT_NOT_AVAILABLE",
            Self::CapabilityMismatch { .. } => "CAPABILITY_MISMATCH",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::InvalidStatus(_) => "INVALID_STATUS",
            Self::ExecutionTimeout(_) => "EXECUTION_TIMEOUT",
            Self::InvalidDecisionTree(_) => "INVALID_DECISION_TREE",
            Self::InvalidMessage(_) => "INVALID_MESSAGE",
            Self::Transient(_) => "TRANSIENT_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for error kinds spec §7 classifies as recoverable (transient errors,
    /// and resource errors at the workflow retry level). Validation, safety, and
    /// internal errors are never retried.
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::AgentNotAvailable(_))
    }

    /// The symbolic kind name used to match against a step's
    /// `retryPolicy.retryableErrors` list.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Transient(_) => "TemporaryServiceError",
            Self::AgentNotAvailable(_) => "AgentNotAvailable",
            Self::ExecutionTimeout(_) => "ExecutionTimeoutError",
            Self::CapabilityMismatch { .. } => "CapabilityMismatch",
            Self::ValidationError(_) => "ValidationError",
            Self::InvalidDecisionTree(_) => "InvalidDecisionTree",
            Self::InvalidMessage(_) => "InvalidMessage",
            _ => "InternalError",
        }
    }
}

/// Central, explicitly-defaulted configuration for the orchestrator. Every
/// numeric default named in spec §3/§4 lives here rather than scattered across
/// call sites, matching the teacher's `OrchestrationConfig` pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Fallback for `metadata.maxConcurrentSteps` when a definition omits it.
    pub default_max_concurrent_steps: usize,
    /// Fallback for `metadata.estimatedDuration`, in minutes.
    pub default_estimated_duration_minutes: u64,
    /// Idle-yield duration used by the scheduler when the ready set is empty
    /// but steps are still running (spec §4.1 step 4).
    pub scheduler_idle_yield_ms: u64,
    /// Smoothing factor for every EMA metric update (spec glossary).
    pub ema_alpha: f64,
    /// Per-agent-queue capacity before oldest-drop (spec §4.4).
    pub bus_queue_capacity: usize,
    /// Bound on the per-execution decision history (spec §4.3).
    pub decision_history_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent_steps: 1,
            default_estimated_duration_minutes: 5,
            scheduler_idle_yield_ms: 50,
            ema_alpha: 0.1,
            bus_queue_capacity: 1000,
            decision_history_capacity: 50,
        }
    }
}

/// Installs a `tracing-subscriber` with an env filter, for binaries and tests
/// that embed this crate. The library itself never calls this implicitly.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
