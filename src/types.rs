//! Shared data model: workflow definitions, steps, agents, and decision trees.
//!
//! Everything here is the immutable template side of the system (spec §3).
//! The mutable run-time side (`WorkflowExecution`, `StepExecution`,
//! `AgentExecution`) lives in [`crate::execution`].

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::OrchestrationError;

/// A step's position in the seven recognized task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Analysis,
    Generation,
    Validation,
    Transformation,
    Decision,
    Aggregation,
    Notification,
    HumanReview,
}

/// The six agent archetypes the capability-matching table dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Analysis,
    Content,
    Recommendation,
    Validation,
    Coordination,
    Specialist,
}

impl AgentType {
    /// Fixed per-type concurrency cap (spec §4.2).
    pub fn max_concurrent_executions(&self) -> usize {
        match self {
            AgentType::Analysis => 3,
            AgentType::Content => 2,
            AgentType::Recommendation => 4,
            AgentType::Validation => 5,
            AgentType::Coordination => 1,
            AgentType::Specialist => 2,
        }
    }

    /// Fallback-by-type capability table, used only when no declared
    /// capability matches the step type (spec §4.2).
    pub fn handles_by_type(&self, step_type: StepType) -> bool {
        match self {
            AgentType::Analysis => matches!(step_type, StepType::Analysis | StepType::Validation),
            AgentType::Content => matches!(step_type, StepType::Generation),
            AgentType::Recommendation => matches!(step_type, StepType::Decision | StepType::Generation),
            AgentType::Validation => matches!(step_type, StepType::Validation),
            AgentType::Coordination => matches!(step_type, StepType::Aggregation | StepType::Notification),
            AgentType::Specialist => matches!(step_type, StepType::Transformation | StepType::Analysis),
        }
    }
}

/// A capability type as declared on an [`AgentDefinition`]; maps to the step
/// types it serves via the fixed table in spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    TextAnalysis,
    ContentGeneration,
    DataExtraction,
    QualityAssessment,
    DecisionMaking,
    Coordination,
    Validation,
}

impl CapabilityType {
    pub fn serves(&self, step_type: StepType) -> bool {
        match self {
            CapabilityType::TextAnalysis => matches!(step_type, StepType::Analysis | StepType::Validation),
            CapabilityType::ContentGeneration => matches!(step_type, StepType::Generation),
            CapabilityType::DataExtraction => matches!(step_type, StepType::Analysis | StepType::Transformation),
            CapabilityType::QualityAssessment => matches!(step_type, StepType::Validation),
            CapabilityType::DecisionMaking => matches!(step_type, StepType::Decision),
            CapabilityType::Coordination => matches!(step_type, StepType::Aggregation | StepType::Notification),
            CapabilityType::Validation => matches!(step_type, StepType::Validation),
        }
    }
}

/// One declared capability of an agent, with the metrics needed for load
/// balancing and cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub capability_type: CapabilityType,
    pub input_types: Vec<String>,
    pub output_types: Vec<String>,
    pub average_processing_time_ms: u64,
    pub accuracy: f64,
    pub cost_per_operation: f64,
}

/// Domain specialization metadata for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Specialization {
    pub domain: String,
    pub expertise: Vec<String>,
    pub quality_threshold: f64,
    pub supported_languages: Vec<String>,
    pub supported_formats: Vec<String>,
}

/// Model/runtime configuration carried alongside an agent definition. Fields
/// are opaque to the orchestrator core and forwarded verbatim to the injected
/// [`crate::agent_manager::StepHandler`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub model_params: HashMap<String, Value>,
    pub system_prompt: Option<String>,
    pub safety_settings: HashMap<String, Value>,
}

/// Cross-execution memory sharing policy. Retention governs memory *outside*
/// the per-execution partition this crate manages (spec §4.2); out of scope
/// here but carried on the type for downstream injected executors to honor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub retention_period_seconds: u64,
    pub shared_across_executions: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            retention_period_seconds: 0,
            shared_across_executions: false,
        }
    }
}

/// An agent template. Once registered with [`crate::agent_manager::AgentManager`]
/// it is instantiated per execution as an [`crate::agent_manager::AgentInstance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub agent_type: AgentType,
    pub specialization: Specialization,
    pub capabilities: Vec<Capability>,
    pub configuration: AgentConfiguration,
    pub memory_config: MemoryConfig,
    pub communication_protocols: Vec<String>,
}

/// Backoff shape used between retry attempts (spec §4.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable_errors: Vec<String>,
    pub timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay_ms: 0,
            max_delay_ms: 0,
            retryable_errors: Vec::new(),
            timeout_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, where `attempts` is the count of
    /// attempts already made (spec §4.1.3).
    pub fn delay_for(&self, attempts: u32) -> u64 {
        match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms * attempts as u64,
            BackoffStrategy::Exponential => {
                let scaled = self.base_delay_ms.saturating_mul(1u64 << attempts.saturating_sub(1).min(62));
                scaled.min(self.max_delay_ms.max(self.base_delay_ms))
            }
        }
    }

    pub fn allows_retry(&self, attempts: u32, error: &OrchestrationError) -> bool {
        attempts < self.max_attempts
            && error.recoverable()
            && self.retryable_errors.iter().any(|k| k == error.kind_name())
    }
}

/// Where an input's value, or an output's destination, comes from/goes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueSource {
    WorkflowInput { reference: String },
    StepOutput { reference: String, path: Option<String> },
    AgentMemory { agent_id: String, reference: String, path: Option<String> },
    Constant { value: Value },
}

/// A transformation applied, in order, after an input is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    Map { function: String },
    Filter { function: String },
    Format { format: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub name: String,
    pub source: ValueSource,
    pub required: bool,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub name: String,
    pub destination: Option<String>,
}

/// What fires a [`ConditionAction`]: the step's terminal status (or, for
/// `custom`, an expression gated by `allowCustomExpressions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionType {
    Success,
    Failure,
    Timeout,
    Custom { expression: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionAction {
    Continue,
    Skip { target: String },
    Fail,
    Branch { decision_tree_id: String },
    Notify { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    pub condition_type: ConditionType,
    pub action: ConditionAction,
}

/// One node of a [`WorkflowDefinition`]'s DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub step_type: StepType,
    pub agent_id: String,
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    #[serde(default)]
    pub outputs: Vec<StepOutput>,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
    /// Seconds; 0 means no per-step deadline.
    pub timeout: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub min_quality_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub estimated_duration_minutes: u64,
    pub max_concurrent_steps: usize,
    pub allow_custom_expressions: bool,
    pub tags: Vec<String>,
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        Self {
            estimated_duration_minutes: 5,
            max_concurrent_steps: 1,
            allow_custom_expressions: false,
            tags: Vec::new(),
        }
    }
}

/// Priority of a requested execution; forwarded to the [`crate::bus`] and used
/// to break ties in observability, not in scheduling admission order (spec
/// §5: step launches are attempted in *definition* order among ready steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// An immutable workflow template, admitted once validation (§4.1) passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: String,
    pub steps: Vec<WorkflowStep>,
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub decision_trees: Vec<DecisionTree>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

impl WorkflowDefinition {
    /// Implements every validation rule of spec §4.1: non-empty steps/agents,
    /// dependency references resolve, agent references resolve, and the
    /// dependency graph is acyclic.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.steps.is_empty() {
            return Err(OrchestrationError::ValidationError("workflow has no steps".into()));
        }
        if self.agents.is_empty() {
            return Err(OrchestrationError::ValidationError("workflow has no agents".into()));
        }

        let step_ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        let agent_ids: HashSet<&str> = self.agents.iter().map(|a| a.id.as_str()).collect();

        for step in &self.steps {
            if !agent_ids.contains(step.agent_id.as_str()) {
                return Err(OrchestrationError::ValidationError(format!(
                    "step '{}' references unknown agent '{}'",
                    step.id, step.agent_id
                )));
            }
            for dep in &step.dependencies {
                if !step_ids.contains(dep.as_str()) {
                    return Err(OrchestrationError::ValidationError(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for step in &self.steps {
            graph.add_node(step.id.as_str());
        }
        for step in &self.steps {
            for dep in &step.dependencies {
                graph.add_edge(dep.as_str(), step.id.as_str(), ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(OrchestrationError::ValidationError(
                "dependency graph contains a cycle".into(),
            ));
        }

        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn decision_tree(&self, id: &str) -> Option<&DecisionTree> {
        self.decision_trees.iter().find(|t| t.id == id)
    }

    /// Steps with no downstream dependents, used to derive a handoff ticket's
    /// `toAgent` (spec §4.1 step 7: the agent of the first downstream step, or
    /// "orchestrator" if none).
    pub fn first_downstream_agent(&self, step_id: &str) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.dependencies.iter().any(|d| d == step_id))
            .map(|s| s.agent_id.as_str())
    }

    pub fn effective_max_concurrent_steps(&self) -> usize {
        self.metadata.max_concurrent_steps.max(1)
    }
}

// ---------------------------------------------------------------------------
// Decision tree types (spec §4.3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionVariable {
    pub name: String,
    pub source: String,
    pub default_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub id: String,
    pub name: String,
    pub actions: Vec<DecisionTreeAction>,
    pub probability: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionTreeAction {
    AssignAgent { agent_id: String },
    ModifyWorkflow { change: String },
    Escalate { target: String },
    Terminate,
    SendNotification { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionNode {
    Condition {
        id: String,
        condition: String,
        true_node: String,
        false_node: String,
    },
    Action {
        id: String,
        action: DecisionTreeAction,
        next_node: Option<String>,
    },
    Leaf {
        id: String,
    },
}

impl DecisionNode {
    pub fn id(&self) -> &str {
        match self {
            DecisionNode::Condition { id, .. } => id,
            DecisionNode::Action { id, .. } => id,
            DecisionNode::Leaf { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    pub id: String,
    pub root_node: String,
    pub variables: Vec<DecisionVariable>,
    pub nodes: Vec<DecisionNode>,
    pub outcomes: Vec<DecisionOutcome>,
    pub default_outcome: Option<String>,
}

impl DecisionTree {
    pub fn node(&self, id: &str) -> Option<&DecisionNode> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn outcome(&self, id: &str) -> Option<&DecisionOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

/// Descends a JSON value by a dot-separated path (`"a.b.c"`). Used for
/// `source.path` on inputs (spec §4.1.1) and variable resolution fallback
/// (spec §4.3).
pub fn get_path(value: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.clone());
    }
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}
