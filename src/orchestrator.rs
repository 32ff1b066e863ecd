//! Workflow Orchestrator (spec §4.1): DAG scheduling, the per-step pipeline,
//! retries, and the pause/resume/cancel lifecycle.
//!
//! Grounded in the teacher's `workflow.rs` (`WorkflowEngine::execute`) for the
//! ready-set scheduling loop and `recovery.rs` for retry consultation,
//! generalized from the teacher's fixed pipeline stages to the data-driven
//! steps, conditions, and decision trees spec §4.1 describes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

use crate::agent_manager::AgentManager;
use crate::bus::{CommunicationBus, Message, MessageType};
use crate::decision::{AgentContextMetrics, DecisionContext, DecisionEngine, EnvironmentData};
use crate::execution::{StepError, StepExecution, StepStatus, WorkflowExecution};
use crate::handoff::{AuditSink, HandoffTicket};
use crate::types::{
    get_path, ConditionAction, ConditionType, DecisionTreeAction, Transformation, ValueSource, WorkflowDefinition,
    WorkflowStep,
};
use crate::{OrchestrationError, OrchestratorConfig};

/// Uniform response envelope wrapping every orchestrator-facing call
/// (spec §6): a payload on success, or a structured error with a stable code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl<T> OrchestratorResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_code: None,
            error_message: None,
        }
    }

    pub fn err(error: OrchestrationError) -> Self {
        Self {
            success: false,
            data: None,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
        }
    }
}

impl<T> From<Result<T, OrchestrationError>> for OrchestratorResponse<T> {
    fn from(result: Result<T, OrchestrationError>) -> Self {
        match result {
            Ok(v) => Self::ok(v),
            Err(e) => Self::err(e),
        }
    }
}

/// Filters accepted by the `list` action (spec §6): any unset field matches
/// everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionListFilter {
    pub status: Option<crate::execution::ExecutionStatus>,
    pub date_range: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
    pub tags: Vec<String>,
    pub agent_ids: Vec<String>,
}

impl ExecutionListFilter {
    fn matches(&self, execution: &WorkflowExecution) -> bool {
        if let Some(status) = self.status {
            if execution.status != status {
                return false;
            }
        }
        if let Some((from, to)) = self.date_range {
            if execution.start_time < from || execution.start_time > to {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| execution.metadata.tags.contains(t)) {
            return false;
        }
        if !self.agent_ids.is_empty() && !self.agent_ids.iter().any(|a| execution.metadata.agent_ids.contains(a)) {
            return false;
        }
        true
    }
}

struct RunningExecution {
    control: Arc<Notify>,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    agent_ids: Vec<String>,
}

/// Owns every in-flight [`WorkflowExecution`], drives its DAG to completion,
/// and exposes the `execute`/`pause`/`resume`/`cancel`/`getStatus`/
/// `listActive` contract (spec §4.1, §6).
pub struct Orchestrator {
    agent_manager: Arc<AgentManager>,
    decision_engine: Arc<DecisionEngine>,
    bus: Arc<CommunicationBus>,
    audit_sink: Arc<dyn AuditSink>,
    config: OrchestratorConfig,
    executions: DashMap<Uuid, WorkflowExecution>,
    running: DashMap<Uuid, RunningExecution>,
}

impl Orchestrator {
    pub fn new(
        agent_manager: Arc<AgentManager>,
        decision_engine: Arc<DecisionEngine>,
        bus: Arc<CommunicationBus>,
        audit_sink: Arc<dyn AuditSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            agent_manager,
            decision_engine,
            bus,
            audit_sink,
            config,
            executions: DashMap::new(),
            running: DashMap::new(),
        }
    }

    pub fn get_status(&self, execution_id: Uuid) -> Result<WorkflowExecution, OrchestrationError> {
        self.executions
            .get(&execution_id)
            .map(|e| e.clone())
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Filtered snapshots of every currently active execution (spec §6 `list`
    /// action: `{status, dateRange, tags[], agentIds[]}`).
    pub fn list_active(&self, filter: &ExecutionListFilter) -> Vec<WorkflowExecution> {
        self.running
            .iter()
            .filter_map(|entry| self.executions.get(entry.key()).map(|e| e.clone()))
            .filter(|execution| filter.matches(execution))
            .collect()
    }

    /// Validates `definition`, registers its agents, and drives the DAG to a
    /// terminal state. Returns the finalized [`WorkflowExecution`] (spec §4.1).
    pub async fn execute(
        &self,
        definition: WorkflowDefinition,
        tenant_id: &str,
        user_id: &str,
        priority: crate::types::Priority,
        inputs: HashMap<String, Value>,
    ) -> Result<WorkflowExecution, OrchestrationError> {
        definition.validate()?;
        for agent in &definition.agents {
            self.agent_manager.register(agent.clone());
        }

        let agent_ids: Vec<String> = definition.agents.iter().map(|a| a.id.clone()).collect();

        let mut execution = WorkflowExecution::new(&definition.id, tenant_id, user_id, priority, inputs);
        execution.status = crate::execution::ExecutionStatus::Running;
        execution.metadata.tags = definition.metadata.tags.clone();
        execution.metadata.agent_ids = agent_ids.clone();
        let execution_id = execution.id;
        self.executions.insert(execution_id, execution);

        let control = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        self.running.insert(
            execution_id,
            RunningExecution {
                control: control.clone(),
                paused: paused.clone(),
                cancelled: cancelled.clone(),
                agent_ids,
            },
        );

        let result = self.run_to_completion(execution_id, &definition, control, paused, cancelled).await;

        self.running.remove(&execution_id);
        for agent in &definition.agents {
            self.agent_manager.release(&agent.id, execution_id);
        }

        result?;
        self.get_status(execution_id)
    }

    /// Sends a `pauseResumeSignal` message to every agent participating in
    /// `execution_id` (spec §4.1: "the bus is the coordination channel, not
    /// an interrupt").
    fn notify_agents(&self, agent_ids: &[String], execution_id: Uuid, action: &str) {
        for agent_id in agent_ids {
            let message = Message::new(
                MessageType::PauseResumeSignal,
                "orchestrator",
                agent_id,
                serde_json::json!({"executionId": execution_id.to_string(), "action": action}),
            );
            if let Err(e) = self.bus.send(message) {
                tracing::warn!(agent_id = %agent_id, error = %e, "failed to notify agent of lifecycle transition");
            }
        }
    }

    pub fn pause(&self, execution_id: Uuid) -> Result<(), OrchestrationError> {
        let running = self
            .running
            .get(&execution_id)
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(execution_id.to_string()))?;
        running.paused.store(true, Ordering::SeqCst);
        if let Some(mut exec) = self.executions.get_mut(&execution_id) {
            exec.status = crate::execution::ExecutionStatus::Paused;
        }
        self.notify_agents(&running.agent_ids, execution_id, "pause");
        running.control.notify_waiters();
        Ok(())
    }

    pub fn resume(&self, execution_id: Uuid) -> Result<(), OrchestrationError> {
        let running = self
            .running
            .get(&execution_id)
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(execution_id.to_string()))?;
        running.paused.store(false, Ordering::SeqCst);
        if let Some(mut exec) = self.executions.get_mut(&execution_id) {
            exec.status = crate::execution::ExecutionStatus::Running;
        }
        self.notify_agents(&running.agent_ids, execution_id, "resume");
        running.control.notify_waiters();
        Ok(())
    }

    pub fn cancel(&self, execution_id: Uuid) -> Result<(), OrchestrationError> {
        let running = self
            .running
            .get(&execution_id)
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(execution_id.to_string()))?;
        running.cancelled.store(true, Ordering::SeqCst);
        self.notify_agents(&running.agent_ids, execution_id, "cancel");
        running.control.notify_waiters();
        Ok(())
    }

    /// The scheduling loop (spec §4.1 step 4): repeatedly computes the ready
    /// set (dependencies terminal, not yet started or skipped), launches up
    /// to `maxConcurrentSteps` concurrently, and waits for the first to
    /// finish before recomputing. Idles on `scheduler_idle_yield_ms` when
    /// nothing is ready but steps are still in flight, and honors
    /// pause/cancel signals between rounds.
    async fn run_to_completion(
        &self,
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        control: Arc<Notify>,
        paused: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<(), OrchestrationError> {
        let max_concurrent = definition.effective_max_concurrent_steps();
        let mut started: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();

        loop {
            if cancelled.load(Ordering::SeqCst) {
                if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                    exec.status = crate::execution::ExecutionStatus::Cancelled;
                    exec.end_time = Some(Utc::now());
                }
                return Ok(());
            }

            if paused.load(Ordering::SeqCst) {
                control.notified().await;
                continue;
            }

            let snapshot = self.executions.get(&execution_id).unwrap().clone();

            let ready: Vec<WorkflowStep> = definition
                .steps
                .iter()
                .filter(|s| {
                    !started.contains(&s.id)
                        && s.dependencies.iter().all(|d| {
                            snapshot.step_execution(d).map(|se| se.status.is_terminal()).unwrap_or(false)
                        })
                })
                .cloned()
                .collect();

            for step in ready {
                if in_flight.len() >= max_concurrent {
                    break;
                }
                started.insert(step.id.clone());
                let definition_clone = definition.clone();
                let agent_manager = self.agent_manager.clone();
                let audit_sink = self.audit_sink.clone();
                let execution_snapshot = snapshot.clone();
                in_flight.push(async move {
                    let step_id = step.id.clone();
                    let outcome = Self::run_step(execution_id, &step, &execution_snapshot, agent_manager, audit_sink, &definition_clone)
                        .await;
                    (step_id, outcome)
                });
            }

            if in_flight.is_empty() {
                // `all_steps_seen` false means a dependency will never turn
                // terminal (e.g. it was never scheduled): the DAG can't
                // progress further either way, so both branches finalize.
                let _all_steps_seen = definition.steps.iter().all(|s| started.contains(&s.id));
                self.finalize_execution(execution_id);
                return Ok(());
            }

            match timeout(Duration::from_millis(self.config.scheduler_idle_yield_ms), in_flight.next()).await {
                Ok(Some((step_id, step_result))) => {
                    self.apply_step_result(execution_id, &step_id, step_result.clone());
                    if let Some(step_def) = definition.step(&step_id) {
                        self.apply_step_conditions(execution_id, definition, step_def, &step_result, &mut started).await;
                    }
                }
                Ok(None) | Err(_) => {}
            }
        }
    }

    fn apply_step_result(&self, execution_id: Uuid, _step_id: &str, result: StepExecution) {
        if let Some(mut exec) = self.executions.get_mut(&execution_id) {
            exec.step_executions.push(result);
            exec.recompute_total_cost();
        }
    }

    /// Closes out an execution: quality score, total cost, and end time are
    /// always recomputed, but `status` is left alone when a `fail` condition
    /// action or a `terminate` decision-tree action already drove it to
    /// `Failed` — `aggregate_status` only knows about step statuses, so
    /// running it here would silently undo that override.
    fn finalize_execution(&self, execution_id: Uuid) {
        if let Some(mut exec) = self.executions.get_mut(&execution_id) {
            if exec.status == crate::execution::ExecutionStatus::Failed {
                exec.quality_score = exec.compute_quality_score();
                exec.recompute_total_cost();
                exec.end_time = Some(Utc::now());
            } else {
                exec.finalize();
            }
        }
    }

    /// Evaluates a completed step's `conditions[]` against its terminal
    /// status (spec §4.1.2) and carries out the matching action: `skip`
    /// marks the named target completed without running it, `fail` forces
    /// the execution terminal, `branch` hands control to a decision tree and
    /// applies the outcome's actions, and `notify` posts a message on the
    /// bus. `continue` is a no-op.
    async fn apply_step_conditions(
        &self,
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        step_execution: &StepExecution,
        started: &mut HashSet<String>,
    ) {
        if let Some(min_quality) = step.min_quality_score {
            if step_execution.status == StepStatus::Completed
                && step_execution.quality_score.map(|q| q < min_quality).unwrap_or(false)
            {
                if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                    exec.metadata.human_review_required = true;
                }
            }
        }

        let variables = condition_variables(step_execution);

        for condition in &step.conditions {
            let fires = match &condition.condition_type {
                ConditionType::Success => step_execution.status == StepStatus::Completed,
                ConditionType::Failure => step_execution.status == StepStatus::Failed,
                ConditionType::Timeout => step_execution.status == StepStatus::Timeout,
                ConditionType::Custom { expression } => {
                    definition.metadata.allow_custom_expressions
                        && crate::decision::evaluate_condition(expression, &variables, true)
                }
            };
            if !fires {
                continue;
            }

            match &condition.action {
                ConditionAction::Continue => {}
                ConditionAction::Skip { target } => {
                    if started.insert(target.clone()) {
                        if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                            let mut skipped = StepExecution::pending(target);
                            skipped.status = StepStatus::Completed;
                            skipped.start_time = Some(Utc::now());
                            skipped.end_time = Some(Utc::now());
                            exec.step_executions.push(skipped);
                        }
                    }
                }
                ConditionAction::Fail => {
                    if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                        exec.status = crate::execution::ExecutionStatus::Failed;
                    }
                }
                ConditionAction::Branch { decision_tree_id } => {
                    if let Some(tree) = definition.decision_tree(decision_tree_id) {
                        let context = self.build_decision_context(execution_id, definition);
                        match self.decision_engine.execute_decision_tree(tree, &context).await {
                            Ok(result) => self.apply_decision_actions(execution_id, &result.actions),
                            Err(e) => {
                                tracing::warn!(tree_id = %decision_tree_id, error = %e, "decision tree evaluation failed");
                            }
                        }
                    }
                }
                ConditionAction::Notify { message } => {
                    let to_agent = definition.first_downstream_agent(&step.id).unwrap_or("orchestrator");
                    let notification = Message::new(
                        MessageType::HandoffNotification,
                        &step.agent_id,
                        to_agent,
                        serde_json::json!({"message": message, "step": step.id}),
                    );
                    if let Err(e) = self.bus.send(notification) {
                        tracing::warn!(step = %step.id, error = %e, "notify action failed to post to the bus");
                    }
                }
            }
        }
    }

    /// Assembles the Decision Engine's context (spec §4.3) from the live
    /// execution snapshot: `stepOutputs` keyed by step id, and `agentMetrics`
    /// keyed by agent id, scoped to this execution's own step attempts.
    fn build_decision_context(&self, execution_id: Uuid, definition: &WorkflowDefinition) -> DecisionContext {
        let snapshot = self.executions.get(&execution_id).map(|e| e.clone()).unwrap_or_else(|| {
            WorkflowExecution::new(&definition.id, "", "", crate::types::Priority::Normal, HashMap::new())
        });

        let mut step_outputs = HashMap::new();
        let mut agent_costs: HashMap<String, f64> = HashMap::new();
        let mut agent_durations: HashMap<String, Vec<i64>> = HashMap::new();
        let mut agent_completed: HashMap<String, u64> = HashMap::new();
        for step_execution in &snapshot.step_executions {
            step_outputs.insert(step_execution.step_id.clone(), step_execution.outputs.clone());
            if let Some(step_def) = definition.step(&step_execution.step_id) {
                *agent_costs.entry(step_def.agent_id.clone()).or_insert(0.0) += step_execution.cost;
                if let Some(duration) = step_execution.duration_ms() {
                    agent_durations.entry(step_def.agent_id.clone()).or_default().push(duration);
                }
                if step_execution.status == StepStatus::Completed {
                    *agent_completed.entry(step_def.agent_id.clone()).or_insert(0) += 1;
                }
            }
        }

        let mut agent_metrics = HashMap::new();
        for agent in &definition.agents {
            let quality_score = self.agent_manager.metrics(&agent.id).map(|m| m.quality_score).unwrap_or(0.0);
            let durations = agent_durations.get(&agent.id);
            let processing_time_ms =
                durations.map(|d| d.iter().sum::<i64>() as f64 / d.len() as f64).unwrap_or(0.0);
            agent_metrics.insert(
                agent.id.clone(),
                AgentContextMetrics {
                    processing_time_ms,
                    cost: *agent_costs.get(&agent.id).unwrap_or(&0.0),
                    quality_score,
                    completed_steps_count: *agent_completed.get(&agent.id).unwrap_or(&0),
                },
            );
        }

        let mut execution_view = snapshot.clone();
        execution_view.quality_score = execution_view.compute_quality_score();
        execution_view.total_cost = execution_view.step_executions.iter().map(|s| s.cost).sum();

        let execution_duration_ms = Utc::now().signed_duration_since(execution_view.start_time).num_milliseconds();

        DecisionContext {
            execution: execution_view.clone(),
            step_outputs,
            agent_metrics,
            environment: EnvironmentData {
                current_time: Utc::now(),
                execution_duration_ms,
                total_cost: execution_view.total_cost,
                quality_score: execution_view.quality_score.unwrap_or(0.0),
                allow_custom_expressions: definition.metadata.allow_custom_expressions,
            },
            total_steps: definition.steps.len(),
        }
    }

    /// Applies the orchestrator-level side effects of a decision outcome's
    /// actions (spec §4.3 `outcome.actions`, exercised by spec §8 scenario 5:
    /// escalation sets `humanReviewRequired`).
    fn apply_decision_actions(&self, execution_id: Uuid, actions: &[DecisionTreeAction]) {
        for action in actions {
            match action {
                DecisionTreeAction::Escalate { target } => {
                    if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                        exec.metadata.human_review_required = true;
                    }
                    tracing::info!(execution_id = %execution_id, escalation_target = %target, "decision outcome escalated for human review");
                }
                DecisionTreeAction::Terminate => {
                    if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                        exec.status = crate::execution::ExecutionStatus::Failed;
                    }
                }
                DecisionTreeAction::SendNotification { message } => {
                    if let Some(exec) = self.executions.get(&execution_id) {
                        for agent_id in &exec.metadata.agent_ids {
                            let notification = Message::new(
                                MessageType::EscalationAlert,
                                "orchestrator",
                                agent_id,
                                serde_json::json!({"message": message}),
                            );
                            let _ = self.bus.send(notification);
                        }
                    }
                }
                DecisionTreeAction::AssignAgent { .. } | DecisionTreeAction::ModifyWorkflow { .. } => {
                    tracing::info!(execution_id = %execution_id, action = ?action, "decision outcome action logged, no orchestrator-level effect defined");
                }
            }
        }
    }

    /// Runs one step's attempt loop: resolve inputs, dispatch to the agent,
    /// retry on a recoverable error per the step's [`crate::types::RetryPolicy`],
    /// and finally emit a handoff ticket (spec §4.1 steps 2, 3, 5, 6, 7).
    /// Never returns `Err`: a step that exhausts retries still produces a
    /// terminal [`StepExecution`] so the scheduler can keep the DAG moving.
    async fn run_step(
        execution_id: Uuid,
        step: &WorkflowStep,
        execution_snapshot: &WorkflowExecution,
        agent_manager: Arc<AgentManager>,
        audit_sink: Arc<dyn AuditSink>,
        definition: &WorkflowDefinition,
    ) -> StepExecution {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let mut step_execution = StepExecution::pending(&step.id);
            step_execution.attempts = attempts;
            step_execution.start_time = Some(Utc::now());

            let outcome = Self::attempt_step(execution_id, step, execution_snapshot, &agent_manager, &mut step_execution).await;
            step_execution.end_time = Some(Utc::now());

            if let Err(e) = &outcome {
                step_execution.status = if matches!(e, OrchestrationError::ExecutionTimeout(_)) {
                    StepStatus::Timeout
                } else {
                    StepStatus::Failed
                };
                step_execution.errors.push(StepError {
                    error_type: e.kind_name().to_string(),
                    message: e.to_string(),
                    occurred_at: Utc::now(),
                });
                if step.retry_policy.allows_retry(attempts, e) {
                    tokio::time::sleep(Duration::from_millis(step.retry_policy.delay_for(attempts))).await;
                    continue;
                }
            }

            Self::emit_handoff(execution_id, step, definition, &step_execution, &audit_sink).await;
            return step_execution;
        }
    }

    async fn attempt_step(
        execution_id: Uuid,
        step: &WorkflowStep,
        execution_snapshot: &WorkflowExecution,
        agent_manager: &AgentManager,
        step_execution: &mut StepExecution,
    ) -> Result<(), OrchestrationError> {
        let inputs = Self::resolve_inputs(execution_id, step, execution_snapshot, agent_manager)?;
        step_execution.inputs = inputs.clone();

        agent_manager.initialize(&step.agent_id, execution_id)?;

        let dispatch = agent_manager.execute_step(&step.agent_id, step, inputs, execution_id);

        // Per-step deadline: `timeout * 1000` ms, falling back to
        // `retryPolicy.timeoutMs`; 0 means no deadline (spec §4.1 step 2).
        let deadline_ms = if step.timeout > 0 {
            step.timeout * 1000
        } else {
            step.retry_policy.timeout_ms.unwrap_or(0)
        };

        let outcome = if deadline_ms > 0 {
            timeout(Duration::from_millis(deadline_ms), dispatch)
                .await
                .map_err(|_| OrchestrationError::ExecutionTimeout(deadline_ms))??
        } else {
            dispatch.await?
        };

        step_execution.outputs = outcome.outputs;
        step_execution.cost = outcome.cost;
        step_execution.quality_score = Some(outcome.quality_score);
        step_execution.status = StepStatus::Completed;
        Ok(())
    }

    /// Resolves every declared input against workflow inputs, a prior step's
    /// outputs, agent memory, or a constant, applying transformations in
    /// order (spec §4.1.1). A required input that resolves to nothing, or to
    /// JSON `null`, fails the step (spec §3).
    fn resolve_inputs(
        execution_id: Uuid,
        step: &WorkflowStep,
        execution_snapshot: &WorkflowExecution,
        agent_manager: &AgentManager,
    ) -> Result<HashMap<String, Value>, OrchestrationError> {
        let mut resolved = HashMap::new();
        for input in &step.inputs {
            let mut value = match &input.source {
                ValueSource::WorkflowInput { reference } => {
                    get_path(&serde_json::to_value(&execution_snapshot.inputs).unwrap_or(Value::Null), reference)
                }
                ValueSource::StepOutput { reference, path } => {
                    let (step_id, field) = reference.split_once('.').unwrap_or((reference.as_str(), ""));
                    execution_snapshot.step_execution(step_id).and_then(|se| {
                        let outputs = serde_json::to_value(&se.outputs).ok()?;
                        let full_path = match (field.is_empty(), path) {
                            (false, Some(p)) => format!("{field}.{p}"),
                            (false, None) => field.to_string(),
                            (true, Some(p)) => p.clone(),
                            (true, None) => String::new(),
                        };
                        get_path(&outputs, &full_path)
                    })
                }
                ValueSource::AgentMemory { agent_id, reference, path } => {
                    agent_manager.get_memory_value(agent_id, execution_id, reference, path.as_deref())
                }
                ValueSource::Constant { value } => Some(value.clone()),
            };

            for transform in &input.transformations {
                value = value.map(|v| apply_transformation(transform, v));
            }

            match value {
                Some(v) if input.required && v.is_null() => {
                    return Err(OrchestrationError::MissingFields(format!(
                        "step '{}' required input '{}' resolved to null",
                        step.id, input.name
                    )));
                }
                Some(v) => {
                    resolved.insert(input.name.clone(), v);
                }
                None if input.required => {
                    return Err(OrchestrationError::MissingFields(format!(
                        "step '{}' missing required input '{}'",
                        step.id, input.name
                    )));
                }
                None => {}
            }
        }
        Ok(resolved)
    }

    async fn emit_handoff(
        execution_id: Uuid,
        step: &WorkflowStep,
        definition: &WorkflowDefinition,
        step_execution: &StepExecution,
        audit_sink: &Arc<dyn AuditSink>,
    ) {
        let to_agent = definition.first_downstream_agent(&step.id).unwrap_or("orchestrator");
        let reason = match step_execution.status {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Timeout => "timeout",
            StepStatus::Skipped => "skipped",
            StepStatus::Pending | StepStatus::Running => "in_progress",
        };

        let context = serde_json::json!({
            "inputs": step_execution.inputs,
            "outputs": step_execution.outputs,
        });

        let mut ticket = HandoffTicket::new(&step.id, to_agent, reason, context);
        if let Some(timeout_ms) = step.retry_policy.timeout_ms {
            ticket = ticket.with_sla(timeout_ms);
        }
        if let Some(quality_score) = step_execution.quality_score {
            ticket = ticket.with_confidence(quality_score);
        }
        audit_sink.record(&ticket).await;
        let _ = execution_id;
    }
}

/// The variables a `custom` condition expression can reference (spec
/// §4.1.2): the step's own terminal outputs, quality score, cost, and
/// attempt count.
fn condition_variables(step_execution: &StepExecution) -> HashMap<String, Value> {
    let mut vars = HashMap::new();
    vars.insert(
        "qualityScore".to_string(),
        step_execution.quality_score.map(Value::from).unwrap_or(Value::Null),
    );
    vars.insert("cost".to_string(), Value::from(step_execution.cost));
    vars.insert("attempts".to_string(), Value::from(step_execution.attempts));
    for (name, value) in &step_execution.outputs {
        vars.insert(name.clone(), value.clone());
    }
    vars
}

/// Applies a named `map`/`filter` function to `value`, or element-wise over
/// it when it's an array (spec §4.1.1: "`map`/`filter` use function
/// parameters if provided").
fn apply_named_function(function: &str, value: &Value) -> Value {
    match function {
        "uppercase" => Value::String(value.as_str().map(|s| s.to_uppercase()).unwrap_or_else(|| value.to_string())),
        "lowercase" => Value::String(value.as_str().map(|s| s.to_lowercase()).unwrap_or_else(|| value.to_string())),
        "to_string" => Value::String(value.as_str().map(|s| s.to_string()).unwrap_or_else(|| value.to_string())),
        "round" => value.as_f64().map(|n| Value::from(n.round())).unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

fn passes_named_predicate(function: &str, value: &Value) -> bool {
    match function {
        "non_null" => !value.is_null(),
        "truthy" => match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        },
        "non_empty" => match value {
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            other => !other.is_null(),
        },
        _ => true,
    }
}

fn apply_transformation(transform: &Transformation, value: Value) -> Value {
    match transform {
        Transformation::Format { format } => match format.as_str() {
            "uppercase" => Value::String(value.as_str().map(|s| s.to_uppercase()).unwrap_or_else(|| value.to_string())),
            "lowercase" => Value::String(value.as_str().map(|s| s.to_lowercase()).unwrap_or_else(|| value.to_string())),
            "json" => Value::String(value.to_string()),
            other => {
                tracing::warn!(format = other, "unknown format transformation, passing value through");
                value
            }
        },
        Transformation::Map { function } => match value {
            Value::Array(items) => Value::Array(items.iter().map(|v| apply_named_function(function, v)).collect()),
            other => apply_named_function(function, &other),
        },
        Transformation::Filter { function } => match value {
            Value::Array(items) => {
                Value::Array(items.into_iter().filter(|v| passes_named_predicate(function, v)).collect())
            }
            other => other,
        },
    }
}
