//! The mutable run-time side of the data model: executions, step attempts,
//! and per-agent execution views (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a [`WorkflowExecution`]. `Completed`, `Failed`, `Cancelled`,
/// and `Timeout` are sinks; `Paused` resumes back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

/// Status of one attempt of a step inside an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl StepStatus {
    /// A dependent step becomes ready once its dependency reaches any of
    /// these (spec §4.1 step 2: "move it to `Done` on terminal status").
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Timeout | StepStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub error_type: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Per-attempt record of a step's execution inside a [`WorkflowExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub inputs: HashMap<String, Value>,
    pub outputs: HashMap<String, Value>,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub cost: f64,
    pub quality_score: Option<f64>,
    pub errors: Vec<StepError>,
}

impl StepExecution {
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            attempts: 0,
            cost: 0.0,
            quality_score: None,
            errors: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
            _ => None,
        }
    }
}

/// The per-execution view of one participating agent: what it was assigned,
/// what it finished, and its running totals (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent_id: String,
    pub assigned_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub total_processing_time_ms: u64,
    pub total_cost: f64,
    pub average_quality_score: f64,
    pub communication_log: Vec<String>,
}

impl AgentExecution {
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            assigned_steps: Vec::new(),
            completed_steps: Vec::new(),
            total_processing_time_ms: 0,
            total_cost: 0.0,
            average_quality_score: 0.0,
            communication_log: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionErrorDetail {
    pub error_type: String,
    pub message: String,
    pub step_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub human_review_required: bool,
    /// Copied from `WorkflowDefinition.metadata.tags` at `execute` time, so
    /// the `list` action's filters (spec §6) can match without re-reading
    /// the (no longer held) definition.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ids of every agent registered for this execution, for the `list`
    /// action's `agentIds` filter and for lifecycle notifications.
    #[serde(default)]
    pub agent_ids: Vec<String>,
}

/// A running (or finished) instance of a [`crate::types::WorkflowDefinition`]
/// on specific inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub priority: crate::types::Priority,
    pub inputs: HashMap<String, Value>,
    pub outputs: HashMap<String, Value>,
    pub step_executions: Vec<StepExecution>,
    pub agent_executions: HashMap<String, AgentExecution>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub quality_score: Option<f64>,
    pub error_details: Vec<ExecutionErrorDetail>,
    pub metadata: ExecutionMetadata,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: &str,
        tenant_id: &str,
        user_id: &str,
        priority: crate::types::Priority,
        inputs: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            priority,
            inputs,
            outputs: HashMap::new(),
            step_executions: Vec::new(),
            agent_executions: HashMap::new(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            total_cost: 0.0,
            quality_score: None,
            error_details: Vec::new(),
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn step_execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.step_executions.iter().rev().find(|s| s.step_id == step_id)
    }

    pub fn step_execution_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.step_executions.iter_mut().rev().find(|s| s.step_id == step_id)
    }

    /// Aggregate terminal status per spec §4.1: `timeout` if any step timed
    /// out, else `failed` if any step failed, else `completed`.
    pub fn aggregate_status(&self) -> ExecutionStatus {
        if self.step_executions.iter().any(|s| s.status == StepStatus::Timeout) {
            ExecutionStatus::Timeout
        } else if self.step_executions.iter().any(|s| s.status == StepStatus::Failed) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    }

    /// Mean of the per-step quality scores that are defined; `None` if no
    /// step recorded a score (spec §8 invariant).
    pub fn compute_quality_score(&self) -> Option<f64> {
        let scores: Vec<f64> = self.step_executions.iter().filter_map(|s| s.quality_score).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }

    /// Sum of `cost` over every recorded step attempt, including retries
    /// (spec §8 invariant).
    pub fn recompute_total_cost(&mut self) {
        self.total_cost = self.step_executions.iter().map(|s| s.cost).sum();
    }

    pub fn finalize(&mut self) {
        self.status = self.aggregate_status();
        self.quality_score = self.compute_quality_score();
        self.recompute_total_cost();
        self.end_time = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time.map(|e| (e - self.start_time).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn exec() -> WorkflowExecution {
        WorkflowExecution::new("w", "tenant", "user", Priority::Normal, HashMap::new())
    }

    #[test]
    fn aggregate_status_prefers_timeout_over_failed() {
        let mut e = exec();
        let mut s1 = StepExecution::pending("s1");
        s1.status = StepStatus::Failed;
        let mut s2 = StepExecution::pending("s2");
        s2.status = StepStatus::Timeout;
        e.step_executions.push(s1);
        e.step_executions.push(s2);
        assert_eq!(e.aggregate_status(), ExecutionStatus::Timeout);
    }

    #[test]
    fn aggregate_status_completed_when_all_steps_completed() {
        let mut e = exec();
        let mut s1 = StepExecution::pending("s1");
        s1.status = StepStatus::Completed;
        e.step_executions.push(s1);
        assert_eq!(e.aggregate_status(), ExecutionStatus::Completed);
    }

    #[test]
    fn quality_score_is_mean_of_defined_scores() {
        let mut e = exec();
        let mut s1 = StepExecution::pending("s1");
        s1.quality_score = Some(0.8);
        let mut s2 = StepExecution::pending("s2");
        s2.quality_score = Some(0.4);
        let s3 = StepExecution::pending("s3");
        e.step_executions.push(s1);
        e.step_executions.push(s2);
        e.step_executions.push(s3);
        assert_eq!(e.compute_quality_score(), Some(0.6));
    }

    #[test]
    fn quality_score_is_none_when_no_step_scored() {
        let mut e = exec();
        e.step_executions.push(StepExecution::pending("s1"));
        assert_eq!(e.compute_quality_score(), None);
    }

    #[test]
    fn total_cost_sums_every_attempt_including_retries() {
        let mut e = exec();
        let mut s1 = StepExecution::pending("s1");
        s1.cost = 0.01;
        let mut s1_retry = StepExecution::pending("s1");
        s1_retry.cost = 0.02;
        e.step_executions.push(s1);
        e.step_executions.push(s1_retry);
        e.recompute_total_cost();
        assert!((e.total_cost - 0.03).abs() < 1e-9);
    }
}
