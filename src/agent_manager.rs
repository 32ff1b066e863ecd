//! Agent Manager (spec §4.2): registry, capability matching, load balancing,
//! per-execution memory, and EMA-based performance tracking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{get_path, AgentDefinition, StepType, WorkflowStep};
use crate::OrchestrationError;

/// What the scheduler learns back from a single step execution: the teacher's
/// `(step, inputs) -> (outputs, cost, qualityScore)` contract from spec §1,
/// plus the timing and side-channel data §4.2 requires to update metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub outputs: HashMap<String, Value>,
    pub cost: f64,
    pub quality_score: f64,
    pub processing_time_ms: u64,
    pub memory_updates: HashMap<String, Value>,
    pub communication_log: Vec<String>,
}

/// The injected "think" step: turns `(agent, step, inputs)` into a
/// [`StepOutcome`]. This is the only place an actual model call would live;
/// this crate ships a simulated default for tests and local runs.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(
        &self,
        agent: &AgentDefinition,
        step: &WorkflowStep,
        inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, OrchestrationError>;
}

/// Simulated handler mirroring the teacher's `Agent::execute_task`: enforces
/// an observable minimum work time, returns a quality score in `[0, 1]`, and
/// derives cost from the matching capability's `cost_per_operation` scaled by
/// elapsed seconds (floor 0.001 s), per spec §4.2.
pub struct SimulatedStepHandler;

#[async_trait]
impl StepHandler for SimulatedStepHandler {
    async fn execute(
        &self,
        agent: &AgentDefinition,
        step: &WorkflowStep,
        inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, OrchestrationError> {
        let start = Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        let elapsed = start.elapsed();
        let elapsed_secs = elapsed.as_secs_f64().max(0.001);

        let cost_per_op = agent
            .capabilities
            .iter()
            .find(|c| c.capability_type.serves(step.step_type))
            .map(|c| c.cost_per_operation)
            .unwrap_or(0.0);

        let quality_score = 0.7 + rand::random::<f64>() * 0.3;

        let mut outputs = HashMap::new();
        for output in &step.outputs {
            outputs.insert(output.name.clone(), Value::String(format!("{}:result", output.name)));
        }
        if outputs.is_empty() {
            outputs.insert("result".to_string(), Value::from(inputs.len()));
        }

        Ok(StepOutcome {
            outputs,
            cost: (cost_per_op * elapsed_secs).max(0.0),
            quality_score,
            processing_time_ms: elapsed.as_millis().max(1) as u64,
            memory_updates: HashMap::new(),
            communication_log: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Maintenance,
    Error,
}

/// EMA-tracked performance metrics, smoothed with `alpha` on every update
/// (spec glossary: EMA, α = 0.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub average_response_time_ms: f64,
    pub quality_score: f64,
    pub success_rate: f64,
    pub cost_efficiency: f64,
    pub completed_steps_count: u64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            average_response_time_ms: 0.0,
            quality_score: 0.7,
            success_rate: 1.0,
            cost_efficiency: 1.0,
            completed_steps_count: 0,
        }
    }
}

impl AgentMetrics {
    fn update(&mut self, alpha: f64, elapsed_ms: f64, quality_score: f64, cost: f64) {
        self.average_response_time_ms = (1.0 - alpha) * self.average_response_time_ms + alpha * elapsed_ms;
        self.quality_score = (1.0 - alpha) * self.quality_score + alpha * quality_score;
        let success = if quality_score >= 0.7 { 1.0 } else { 0.0 };
        self.success_rate = (1.0 - alpha) * self.success_rate + alpha * success;
        if cost > 0.0 {
            self.cost_efficiency = (1.0 - alpha) * self.cost_efficiency + alpha * (quality_score / cost);
        }
        self.completed_steps_count += 1;
    }
}

/// The per-execution view of an agent rented out by the manager: current
/// rental ledger, EMA metrics, and memory partitions keyed by
/// `execution:<id>` (spec §3, §4.2).
pub struct AgentInstance {
    pub definition: AgentDefinition,
    pub status: AgentStatus,
    pub current_executions: HashSet<Uuid>,
    pub metrics: AgentMetrics,
    memory: HashMap<String, HashMap<String, Value>>,
}

impl AgentInstance {
    fn new(definition: AgentDefinition) -> Self {
        Self {
            definition,
            status: AgentStatus::Idle,
            current_executions: HashSet::new(),
            metrics: AgentMetrics::default(),
            memory: HashMap::new(),
        }
    }

    fn partition_key(execution_id: Uuid) -> String {
        format!("execution:{execution_id}")
    }

    fn is_available(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Busy)
            && self.current_executions.len() < self.definition.agent_type.max_concurrent_executions()
    }

    /// Handled via declared capability first, falling back to the agent-type
    /// table when no capability matches (spec §4.2).
    fn can_handle(&self, step_type: StepType) -> bool {
        self.definition
            .capabilities
            .iter()
            .any(|c| c.capability_type.serves(step_type))
            || self.definition.agent_type.handles_by_type(step_type)
    }

    /// Weighted load-balancing score (spec §4.2):
    /// `0.4*quality + 0.3*cost_efficiency + 0.2*(1 - load/5) + 0.1*success_rate`.
    fn load_balance_score(&self) -> f64 {
        let load = self.current_executions.len() as f64;
        0.4 * self.metrics.quality_score
            + 0.3 * self.metrics.cost_efficiency.min(1.0)
            + 0.2 * (1.0 - (load / 5.0)).max(0.0)
            + 0.1 * self.metrics.success_rate
    }
}

/// Registry and rental ledger of [`AgentInstance`]s, plus the injected
/// [`StepHandler`] used to actually carry out a step.
pub struct AgentManager {
    agents: DashMap<String, RwLock<AgentInstance>>,
    handler: Arc<dyn StepHandler>,
    ema_alpha: f64,
}

impl AgentManager {
    pub fn new(handler: Arc<dyn StepHandler>, ema_alpha: f64) -> Self {
        Self {
            agents: DashMap::new(),
            handler,
            ema_alpha,
        }
    }

    pub fn with_simulated_handler() -> Self {
        Self::new(Arc::new(SimulatedStepHandler), 0.1)
    }

    /// Idempotent by id: a later registration replaces the earlier one,
    /// resetting rental state (spec §4.2).
    pub fn register(&self, definition: AgentDefinition) {
        let id = definition.id.clone();
        tracing::info!(agent_id = %id, agent_type = ?definition.agent_type, "registering agent");
        self.agents.insert(id, RwLock::new(AgentInstance::new(definition)));
    }

    pub fn is_available(&self, agent_id: &str) -> bool {
        self.agents
            .get(agent_id)
            .map(|entry| entry.read().is_available())
            .unwrap_or(false)
    }

    pub fn can_handle(&self, agent_id: &str, step_type: StepType) -> Result<bool, OrchestrationError> {
        let entry = self
            .agents
            .get(agent_id)
            .ok_or_else(|| OrchestrationError::AgentNotAvailable(agent_id.to_string()))?;
        let result = entry.read().can_handle(step_type);
        Ok(result)
    }

    /// Reserves a rental slot and allocates a memory partition for
    /// `execution_id`. Fails when the agent is in `maintenance`/`error`
    /// (spec §4.2).
    pub fn initialize(&self, agent_id: &str, execution_id: Uuid) -> Result<(), OrchestrationError> {
        let entry = self
            .agents
            .get(agent_id)
            .ok_or_else(|| OrchestrationError::AgentNotAvailable(agent_id.to_string()))?;
        let mut instance = entry.write();
        if matches!(instance.status, AgentStatus::Maintenance | AgentStatus::Error) {
            return Err(OrchestrationError::AgentNotAvailable(format!(
                "agent '{agent_id}' is in {:?}",
                instance.status
            )));
        }
        if !instance.is_available() {
            return Err(OrchestrationError::AgentNotAvailable(format!(
                "agent '{agent_id}' has no free concurrency slots"
            )));
        }
        instance.current_executions.insert(execution_id);
        instance.status = AgentStatus::Busy;
        instance.memory.entry(AgentInstance::partition_key(execution_id)).or_default();
        Ok(())
    }

    /// Runs the step via the injected [`StepHandler`] and folds the result
    /// into the agent's EMA metrics (spec §4.2).
    pub async fn execute_step(
        &self,
        agent_id: &str,
        step: &WorkflowStep,
        inputs: HashMap<String, Value>,
        execution_id: Uuid,
    ) -> Result<StepOutcome, OrchestrationError> {
        let definition = {
            let entry = self
                .agents
                .get(agent_id)
                .ok_or_else(|| OrchestrationError::AgentNotAvailable(agent_id.to_string()))?;
            let instance = entry.read();
            if !instance.can_handle(step.step_type) {
                return Err(OrchestrationError::CapabilityMismatch {
                    agent_id: agent_id.to_string(),
                    step_type: step.step_type,
                });
            }
            instance.definition.clone()
        };

        let outcome = self.handler.execute(&definition, step, &inputs).await;

        if let Some(entry) = self.agents.get(agent_id) {
            let mut instance = entry.write();
            match &outcome {
                Ok(o) => {
                    instance
                        .metrics
                        .update(self.ema_alpha, o.processing_time_ms as f64, o.quality_score, o.cost);
                    if instance.metrics.success_rate < 0.5 {
                        instance.status = AgentStatus::Error;
                        tracing::warn!(agent_id = %agent_id, success_rate = instance.metrics.success_rate, "agent marked error");
                    }
                    let key = AgentInstance::partition_key(execution_id);
                    let partition = instance.memory.entry(key).or_default();
                    for (k, v) in &o.memory_updates {
                        partition.insert(k.clone(), v.clone());
                    }
                }
                Err(_) => {
                    instance.metrics.update(self.ema_alpha, 0.0, 0.0, 0.0);
                    if instance.metrics.success_rate < 0.5 {
                        instance.status = AgentStatus::Error;
                    }
                }
            }
        }

        outcome
    }

    /// Idempotent: releasing twice leaves the agent in the state one release
    /// would (spec §8).
    pub fn release(&self, agent_id: &str, execution_id: Uuid) {
        if let Some(entry) = self.agents.get(agent_id) {
            let mut instance = entry.write();
            instance.current_executions.remove(&execution_id);
            instance.memory.remove(&AgentInstance::partition_key(execution_id));
            if instance.current_executions.is_empty() && instance.status == AgentStatus::Busy {
                instance.status = AgentStatus::Idle;
            }
        }
    }

    pub fn update_memory(&self, agent_id: &str, execution_id: Uuid, key: &str, value: Value) -> Result<(), OrchestrationError> {
        let entry = self
            .agents
            .get(agent_id)
            .ok_or_else(|| OrchestrationError::AgentNotAvailable(agent_id.to_string()))?;
        let mut instance = entry.write();
        instance
            .memory
            .entry(AgentInstance::partition_key(execution_id))
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn get_memory_value(
        &self,
        agent_id: &str,
        execution_id: Uuid,
        key: &str,
        path: Option<&str>,
    ) -> Option<Value> {
        let entry = self.agents.get(agent_id)?;
        let instance = entry.read();
        let partition = instance.memory.get(&AgentInstance::partition_key(execution_id))?;
        let value = partition.get(key)?;
        match path {
            Some(p) => get_path(value, p),
            None => Some(value.clone()),
        }
    }

    pub fn current_execution_count(&self, agent_id: &str) -> usize {
        self.agents
            .get(agent_id)
            .map(|e| e.read().current_executions.len())
            .unwrap_or(0)
    }

    pub fn metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.agents.get(agent_id).map(|e| e.read().metrics.clone())
    }

    /// Highest-scoring available agent that can handle `step_type`, ties
    /// broken by id ordering (spec §4.2).
    pub fn optimal_agent(&self, step_type: StepType) -> Option<String> {
        let mut candidates: Vec<(String, f64)> = self
            .agents
            .iter()
            .filter(|entry| {
                let instance = entry.value().read();
                instance.is_available() && instance.can_handle(step_type)
            })
            .map(|entry| {
                let instance = entry.value().read();
                (entry.key().clone(), instance.load_balance_score())
            })
            .collect();

        candidates.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        candidates.into_iter().next().map(|(id, _)| id)
    }
}
