//! End-to-end scenarios over the public API: happy path, retry, timeout
//! escalation, parallel fan-out, decision-tree branching, and cycle rejection
//! (spec §8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use workflow_orchestrator::agent_manager::{AgentManager, StepHandler, StepOutcome};
use workflow_orchestrator::bus::CommunicationBus;
use workflow_orchestrator::decision::DecisionEngine;
use workflow_orchestrator::execution::{ExecutionStatus, StepStatus};
use workflow_orchestrator::handoff::InMemoryAuditSink;
use workflow_orchestrator::orchestrator::ExecutionListFilter;
use workflow_orchestrator::types::{
    AgentConfiguration, AgentDefinition, AgentType, BackoffStrategy, Capability, CapabilityType, ConditionAction,
    ConditionType, MemoryConfig, Priority, RetryPolicy, Specialization, StepCondition, StepInput, StepOutput,
    StepType, Transformation, ValueSource, WorkflowDefinition, WorkflowMetadata, WorkflowStep,
};
use workflow_orchestrator::{Orchestrator, OrchestratorConfig};

fn agent(id: &str, agent_type: AgentType, cap: CapabilityType) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        agent_type,
        specialization: Specialization::default(),
        capabilities: vec![Capability {
            capability_type: cap,
            input_types: vec![],
            output_types: vec![],
            average_processing_time_ms: 5,
            accuracy: 0.9,
            cost_per_operation: 0.01,
        }],
        configuration: AgentConfiguration::default(),
        memory_config: MemoryConfig::default(),
        communication_protocols: vec![],
    }
}

fn single_step_workflow(id: &str, timeout: u64) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        version: "1".to_string(),
        steps: vec![WorkflowStep {
            id: "s1".to_string(),
            step_type: StepType::Analysis,
            agent_id: "a1".to_string(),
            inputs: vec![StepInput {
                name: "x".to_string(),
                source: ValueSource::Constant { value: Value::from(1) },
                required: false,
                transformations: vec![],
            }],
            outputs: vec![StepOutput { name: "y".to_string(), destination: None }],
            conditions: vec![],
            timeout,
            retry_policy: RetryPolicy::default(),
            dependencies: vec![],
            min_quality_score: None,
        }],
        agents: vec![agent("a1", AgentType::Analysis, CapabilityType::TextAnalysis)],
        decision_trees: vec![],
        metadata: WorkflowMetadata::default(),
    }
}

fn build_orchestrator(handler: Arc<dyn StepHandler>) -> Orchestrator {
    build_orchestrator_with_bus(handler).0
}

fn build_orchestrator_with_bus(handler: Arc<dyn StepHandler>) -> (Orchestrator, Arc<CommunicationBus>) {
    let config = OrchestratorConfig::default();
    let agent_manager = Arc::new(AgentManager::new(handler, config.ema_alpha));
    let decision_engine = Arc::new(DecisionEngine::with_default_executor(config.decision_history_capacity));
    let bus = Arc::new(CommunicationBus::new(config.bus_queue_capacity));
    let audit_sink = InMemoryAuditSink::new(100);
    let orchestrator = Orchestrator::new(agent_manager, decision_engine, bus.clone(), audit_sink, config);
    (orchestrator, bus)
}

struct AlwaysSucceeds;

#[async_trait]
impl StepHandler for AlwaysSucceeds {
    async fn execute(
        &self,
        _agent: &AgentDefinition,
        step: &WorkflowStep,
        inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, workflow_orchestrator::OrchestrationError> {
        let mut outputs = HashMap::new();
        for out in &step.outputs {
            outputs.insert(out.name.clone(), json!(inputs.len()));
        }
        Ok(StepOutcome {
            outputs,
            cost: 0.01,
            quality_score: 0.9,
            processing_time_ms: 1,
            memory_updates: HashMap::new(),
            communication_log: vec![],
        })
    }
}

#[tokio::test]
async fn happy_path_single_step() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let workflow = single_step_workflow("wf-happy", 0);
    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.step_executions.len(), 1);
    assert_eq!(result.step_executions[0].status, StepStatus::Completed);
    assert!(result.quality_score.unwrap() > 0.0);
}

struct FailsThenSucceeds {
    attempts: AtomicU32,
}

#[async_trait]
impl StepHandler for FailsThenSucceeds {
    async fn execute(
        &self,
        _agent: &AgentDefinition,
        step: &WorkflowStep,
        _inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, workflow_orchestrator::OrchestrationError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < 2 {
            return Err(workflow_orchestrator::OrchestrationError::Transient("service hiccup".to_string()));
        }
        let mut outputs = HashMap::new();
        for out in &step.outputs {
            outputs.insert(out.name.clone(), json!("ok"));
        }
        Ok(StepOutcome {
            outputs,
            cost: 0.0,
            quality_score: 0.8,
            processing_time_ms: 1,
            memory_updates: HashMap::new(),
            communication_log: vec![],
        })
    }
}

#[tokio::test]
async fn retry_then_succeed() {
    let orchestrator = build_orchestrator(Arc::new(FailsThenSucceeds { attempts: AtomicU32::new(0) }));
    let mut workflow = single_step_workflow("wf-retry", 0);
    workflow.steps[0].retry_policy = RetryPolicy {
        max_attempts: 3,
        backoff_strategy: BackoffStrategy::Fixed,
        base_delay_ms: 1,
        max_delay_ms: 1,
        retryable_errors: vec!["TemporaryServiceError".to_string()],
        timeout_ms: None,
    };
    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.step_executions[0].attempts, 2);
}

struct NeverFinishes;

#[async_trait]
impl StepHandler for NeverFinishes {
    async fn execute(
        &self,
        _agent: &AgentDefinition,
        _step: &WorkflowStep,
        _inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, workflow_orchestrator::OrchestrationError> {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        unreachable!()
    }
}

struct SlowSucceeds;

#[async_trait]
impl StepHandler for SlowSucceeds {
    async fn execute(
        &self,
        _agent: &AgentDefinition,
        step: &WorkflowStep,
        _inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, workflow_orchestrator::OrchestrationError> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut outputs = HashMap::new();
        for out in &step.outputs {
            outputs.insert(out.name.clone(), json!("ok"));
        }
        Ok(StepOutcome {
            outputs,
            cost: 0.0,
            quality_score: 0.9,
            processing_time_ms: 50,
            memory_updates: HashMap::new(),
            communication_log: vec![],
        })
    }
}

#[tokio::test]
async fn per_step_timeout_escalates_to_workflow_failure() {
    let orchestrator = build_orchestrator(Arc::new(NeverFinishes));
    let workflow = single_step_workflow("wf-timeout", 1);
    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.step_executions[0].status, StepStatus::Timeout);
}

#[tokio::test]
async fn parallel_fan_out_runs_independent_steps_concurrently() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let workflow = WorkflowDefinition {
        id: "wf-parallel".to_string(),
        version: "1".to_string(),
        steps: vec![
            WorkflowStep {
                id: "s1".to_string(),
                step_type: StepType::Analysis,
                agent_id: "a1".to_string(),
                inputs: vec![],
                outputs: vec![],
                conditions: vec![],
                timeout: 0,
                retry_policy: RetryPolicy::default(),
                dependencies: vec![],
                min_quality_score: None,
            },
            WorkflowStep {
                id: "s2".to_string(),
                step_type: StepType::Analysis,
                agent_id: "a2".to_string(),
                inputs: vec![],
                outputs: vec![],
                conditions: vec![],
                timeout: 0,
                retry_policy: RetryPolicy::default(),
                dependencies: vec![],
                min_quality_score: None,
            },
            WorkflowStep {
                id: "s3".to_string(),
                step_type: StepType::Analysis,
                agent_id: "a1".to_string(),
                inputs: vec![],
                outputs: vec![],
                conditions: vec![],
                timeout: 0,
                retry_policy: RetryPolicy::default(),
                dependencies: vec!["s1".to_string(), "s2".to_string()],
                min_quality_score: None,
            },
        ],
        agents: vec![
            agent("a1", AgentType::Analysis, CapabilityType::TextAnalysis),
            agent("a2", AgentType::Analysis, CapabilityType::TextAnalysis),
        ],
        decision_trees: vec![],
        metadata: WorkflowMetadata {
            max_concurrent_steps: 2,
            ..WorkflowMetadata::default()
        },
    };
    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.step_executions.len(), 3);
    let s1_end = result.step_execution("s1").unwrap().end_time.unwrap();
    let s3_start = result.step_execution("s3").unwrap().start_time.unwrap();
    assert!(s3_start >= s1_end);
}

#[tokio::test]
async fn cyclic_dependency_graph_is_rejected_before_execution() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let mut workflow = single_step_workflow("wf-cycle", 0);
    workflow.steps.push(WorkflowStep {
        id: "s2".to_string(),
        step_type: StepType::Analysis,
        agent_id: "a1".to_string(),
        inputs: vec![],
        outputs: vec![],
        conditions: vec![],
        timeout: 0,
        retry_policy: RetryPolicy::default(),
        dependencies: vec!["s1".to_string()],
        min_quality_score: None,
    });
    workflow.steps[0].dependencies.push("s2".to_string());

    let err = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn pause_then_resume_allows_completion() {
    let orchestrator = Arc::new(build_orchestrator(Arc::new(AlwaysSucceeds)));
    let workflow = single_step_workflow("wf-pause", 0);

    let orchestrator_clone = orchestrator.clone();
    let handle = tokio::spawn(async move {
        orchestrator_clone
            .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
            .await
    });

    tokio::task::yield_now().await;
    for execution in orchestrator.list_active(&ExecutionListFilter::default()) {
        let _ = orchestrator.pause(execution.id);
        let _ = orchestrator.resume(execution.id);
    }

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn decision_tree_execution_engine_resolves_outcome_directly() {
    use workflow_orchestrator::decision::{DecisionContext, EnvironmentData};
    use workflow_orchestrator::execution::WorkflowExecution;
    use workflow_orchestrator::types::{DecisionNode, DecisionOutcome, DecisionTree, DecisionTreeAction, DecisionVariable};

    let tree = DecisionTree {
        id: "escalation".to_string(),
        root_node: "check".to_string(),
        variables: vec![DecisionVariable {
            name: "quality".to_string(),
            source: "execution.qualityScore".to_string(),
            default_value: Some(json!(1.0)),
        }],
        nodes: vec![DecisionNode::Condition {
            id: "check".to_string(),
            condition: "quality < 0.5".to_string(),
            true_node: "escalate_leaf".to_string(),
            false_node: "ok_leaf".to_string(),
        }, DecisionNode::Leaf { id: "escalate_leaf".to_string() }, DecisionNode::Leaf { id: "ok_leaf".to_string() }],
        outcomes: vec![
            DecisionOutcome {
                id: "escalate_leaf".to_string(),
                name: "escalate".to_string(),
                actions: vec![DecisionTreeAction::Escalate { target: "human-review".to_string() }],
                probability: Some(0.9),
            },
            DecisionOutcome {
                id: "ok_leaf".to_string(),
                name: "continue".to_string(),
                actions: vec![],
                probability: Some(0.95),
            },
        ],
        default_outcome: None,
    };

    let engine = DecisionEngine::with_default_executor(50);
    let mut exec = WorkflowExecution::new("wf", "t", "u", Priority::Normal, HashMap::new());
    exec.quality_score = Some(0.2);

    let context = DecisionContext {
        execution: exec,
        step_outputs: HashMap::new(),
        agent_metrics: HashMap::new(),
        environment: EnvironmentData {
            current_time: chrono::Utc::now(),
            execution_duration_ms: 0,
            total_cost: 0.0,
            quality_score: 0.2,
            allow_custom_expressions: false,
        },
        total_steps: 1,
    };

    let result = engine.execute_decision_tree(&tree, &context).await.unwrap();
    assert_eq!(result.outcome_name, "escalate");
    assert!(result.confidence > 0.0);
}

#[tokio::test]
async fn custom_expression_syntax_is_rejected_without_opt_in() {
    use workflow_orchestrator::decision::evaluate_condition;
    let vars: HashMap<String, Value> = [("x".to_string(), json!(10))].into_iter().collect();
    assert!(!evaluate_condition("x * 2 > 15", &vars, false));
    assert!(evaluate_condition("x * 2 > 15", &vars, true));
}

#[tokio::test]
async fn execution_not_found_is_a_stable_error() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let err = orchestrator.get_status(Uuid::new_v4()).unwrap_err();
    assert_eq!(err.code(), "EXECUTION_NOT_FOUND");
}

fn escalation_tree() -> (workflow_orchestrator::types::DecisionTree, &'static str) {
    use workflow_orchestrator::types::{DecisionNode, DecisionOutcome, DecisionTree, DecisionTreeAction};
    let tree = DecisionTree {
        id: "human_review_tree".to_string(),
        root_node: "leaf".to_string(),
        variables: vec![],
        nodes: vec![DecisionNode::Leaf { id: "leaf".to_string() }],
        outcomes: vec![DecisionOutcome {
            id: "leaf".to_string(),
            name: "escalate".to_string(),
            actions: vec![DecisionTreeAction::Escalate { target: "human-review".to_string() }],
            probability: Some(0.9),
        }],
        default_outcome: None,
    };
    (tree, "human_review_tree")
}

#[tokio::test]
async fn custom_condition_branch_escalates_for_human_review() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let mut workflow = single_step_workflow("wf-scenario5", 0);
    workflow.metadata.allow_custom_expressions = true;
    let (tree, tree_id) = escalation_tree();
    workflow.decision_trees.push(tree);
    workflow.steps[0].conditions.push(StepCondition {
        condition_type: ConditionType::Custom { expression: "qualityScore >= 0.8".to_string() },
        action: ConditionAction::Branch { decision_tree_id: tree_id.to_string() },
    });

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.metadata.human_review_required);
}

#[tokio::test]
async fn custom_condition_ignored_without_opt_in() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let mut workflow = single_step_workflow("wf-scenario5-no-optin", 0);
    let (tree, tree_id) = escalation_tree();
    workflow.decision_trees.push(tree);
    workflow.steps[0].conditions.push(StepCondition {
        condition_type: ConditionType::Custom { expression: "qualityScore >= 0.8".to_string() },
        action: ConditionAction::Branch { decision_tree_id: tree_id.to_string() },
    });

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(!result.metadata.human_review_required);
}

struct RecordingHandler {
    invoked: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl StepHandler for RecordingHandler {
    async fn execute(
        &self,
        _agent: &AgentDefinition,
        step: &WorkflowStep,
        _inputs: &HashMap<String, Value>,
    ) -> Result<StepOutcome, workflow_orchestrator::OrchestrationError> {
        self.invoked.lock().unwrap().push(step.id.clone());
        let mut outputs = HashMap::new();
        for out in &step.outputs {
            outputs.insert(out.name.clone(), json!("ok"));
        }
        Ok(StepOutcome {
            outputs,
            cost: 0.0,
            quality_score: 0.9,
            processing_time_ms: 1,
            memory_updates: HashMap::new(),
            communication_log: vec![],
        })
    }
}

fn three_step_chain(skip_target: &str) -> WorkflowDefinition {
    WorkflowDefinition {
        id: "wf-skip".to_string(),
        version: "1".to_string(),
        steps: vec![
            WorkflowStep {
                id: "s1".to_string(),
                step_type: StepType::Analysis,
                agent_id: "a1".to_string(),
                inputs: vec![],
                outputs: vec![],
                conditions: vec![StepCondition {
                    condition_type: ConditionType::Success,
                    action: ConditionAction::Skip { target: skip_target.to_string() },
                }],
                timeout: 0,
                retry_policy: RetryPolicy::default(),
                dependencies: vec![],
                min_quality_score: None,
            },
            WorkflowStep {
                id: "s2".to_string(),
                step_type: StepType::Analysis,
                agent_id: "a1".to_string(),
                inputs: vec![],
                outputs: vec![],
                conditions: vec![],
                timeout: 0,
                retry_policy: RetryPolicy::default(),
                dependencies: vec![],
                min_quality_score: None,
            },
            WorkflowStep {
                id: "s3".to_string(),
                step_type: StepType::Analysis,
                agent_id: "a1".to_string(),
                inputs: vec![],
                outputs: vec![],
                conditions: vec![],
                timeout: 0,
                retry_policy: RetryPolicy::default(),
                dependencies: vec!["s2".to_string()],
                min_quality_score: None,
            },
        ],
        agents: vec![agent("a1", AgentType::Analysis, CapabilityType::TextAnalysis)],
        decision_trees: vec![],
        metadata: WorkflowMetadata {
            max_concurrent_steps: 1,
            ..WorkflowMetadata::default()
        },
    }
}

#[tokio::test]
async fn skip_action_completes_target_without_running_its_handler() {
    let invoked = Arc::new(std::sync::Mutex::new(Vec::new()));
    let orchestrator = build_orchestrator(Arc::new(RecordingHandler { invoked: invoked.clone() }));
    let workflow = three_step_chain("s2");

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    let seen = invoked.lock().unwrap().clone();
    assert!(seen.contains(&"s1".to_string()));
    assert!(seen.contains(&"s3".to_string()));
    assert!(!seen.contains(&"s2".to_string()));
    assert_eq!(result.step_execution("s2").unwrap().status, StepStatus::Completed);
}

#[tokio::test]
async fn self_skip_condition_leaves_the_genuine_completion_standing() {
    let invoked = Arc::new(std::sync::Mutex::new(Vec::new()));
    let orchestrator = build_orchestrator(Arc::new(RecordingHandler { invoked: invoked.clone() }));
    let mut workflow = single_step_workflow("wf-self-skip", 0);
    workflow.steps[0].conditions.push(StepCondition {
        condition_type: ConditionType::Success,
        action: ConditionAction::Skip { target: "s1".to_string() },
    });

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.step_executions.len(), 1);
    assert_eq!(invoked.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn fail_action_forces_execution_into_failed_status() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let mut workflow = single_step_workflow("wf-fail-action", 0);
    workflow.steps[0].conditions.push(StepCondition {
        condition_type: ConditionType::Success,
        action: ConditionAction::Fail,
    });

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    // The step itself still ran to completion; only the execution-level
    // status is forced, not the step's own terminal status.
    assert_eq!(result.step_executions[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn notify_action_posts_a_message_to_the_bus() {
    let (orchestrator, bus) = build_orchestrator_with_bus(Arc::new(AlwaysSucceeds));
    let mut workflow = single_step_workflow("wf-notify", 0);
    workflow.steps[0].conditions.push(StepCondition {
        condition_type: ConditionType::Success,
        action: ConditionAction::Notify { message: "step s1 done".to_string() },
    });

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let message = bus.receive("orchestrator").expect("notify should have posted to the bus");
    assert_eq!(message.payload["message"], json!("step s1 done"));
    assert_eq!(message.payload["step"], json!("s1"));
}

#[tokio::test]
async fn pause_and_resume_notify_participating_agents_over_the_bus() {
    let (orchestrator, bus) = build_orchestrator_with_bus(Arc::new(SlowSucceeds));
    let orchestrator = Arc::new(orchestrator);
    let workflow = single_step_workflow("wf-pause-notify", 0);

    let orchestrator_clone = orchestrator.clone();
    let handle = tokio::spawn(async move {
        orchestrator_clone
            .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
            .await
    });

    tokio::task::yield_now().await;
    let active = orchestrator.list_active(&ExecutionListFilter::default());
    assert!(!active.is_empty(), "execution should still be running while its step sleeps");
    for execution in active {
        let _ = orchestrator.pause(execution.id);
        let _ = orchestrator.resume(execution.id);
    }

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);

    let mut actions = Vec::new();
    while let Some(message) = bus.receive("a1") {
        actions.push(message.payload["action"].as_str().unwrap().to_string());
    }
    assert!(actions.contains(&"pause".to_string()));
    assert!(actions.contains(&"resume".to_string()));
}

#[tokio::test]
async fn list_active_filters_by_status_tags_and_agent_ids() {
    let (orchestrator, _bus) = build_orchestrator_with_bus(Arc::new(SlowSucceeds));
    let orchestrator = Arc::new(orchestrator);
    let mut workflow = single_step_workflow("wf-list-active", 0);
    workflow.metadata.tags = vec!["billing".to_string()];

    let orchestrator_clone = orchestrator.clone();
    let handle = tokio::spawn(async move {
        orchestrator_clone
            .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
            .await
    });

    tokio::task::yield_now().await;

    let matches_tag = orchestrator.list_active(&ExecutionListFilter {
        tags: vec!["billing".to_string()],
        ..Default::default()
    });
    let matches_agent = orchestrator.list_active(&ExecutionListFilter {
        agent_ids: vec!["a1".to_string()],
        ..Default::default()
    });
    let no_match_tag = orchestrator.list_active(&ExecutionListFilter {
        tags: vec!["unrelated".to_string()],
        ..Default::default()
    });

    let _ = handle.await.unwrap().unwrap();

    assert!(!matches_tag.is_empty());
    assert!(!matches_agent.is_empty());
    assert!(no_match_tag.is_empty());
}

#[tokio::test]
async fn required_input_resolving_to_json_null_fails_the_step() {
    let orchestrator = build_orchestrator(Arc::new(AlwaysSucceeds));
    let mut workflow = single_step_workflow("wf-null-required", 0);
    workflow.steps[0].inputs = vec![StepInput {
        name: "x".to_string(),
        source: ValueSource::Constant { value: Value::Null },
        required: true,
        transformations: vec![],
    }];

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.step_executions[0].status, StepStatus::Failed);
    assert!(result.step_executions[0].errors[0].message.contains("null"));
}

#[tokio::test]
async fn zero_timeout_falls_back_to_retry_policy_deadline() {
    let orchestrator = build_orchestrator(Arc::new(NeverFinishes));
    let mut workflow = single_step_workflow("wf-fallback-deadline", 0);
    workflow.steps[0].retry_policy.timeout_ms = Some(1);

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.step_executions[0].status, StepStatus::Timeout);
}

#[tokio::test]
async fn transformation_functions_cover_format_map_and_filter() {
    let mut workflow = single_step_workflow("wf-transforms", 0);
    workflow.steps[0].inputs = vec![
        StepInput {
            name: "shout".to_string(),
            source: ValueSource::Constant { value: json!("hello") },
            required: false,
            transformations: vec![Transformation::Format { format: "uppercase".to_string() }],
        },
        StepInput {
            name: "quiet".to_string(),
            source: ValueSource::Constant { value: json!("WORLD") },
            required: false,
            transformations: vec![Transformation::Format { format: "lowercase".to_string() }],
        },
        StepInput {
            name: "encoded".to_string(),
            source: ValueSource::Constant { value: json!({"a": 1}) },
            required: false,
            transformations: vec![Transformation::Format { format: "json".to_string() }],
        },
        StepInput {
            name: "mapped".to_string(),
            source: ValueSource::Constant { value: json!(["a", "b"]) },
            required: false,
            transformations: vec![Transformation::Map { function: "uppercase".to_string() }],
        },
        StepInput {
            name: "filtered".to_string(),
            source: ValueSource::Constant { value: json!([null, "keep", ""]) },
            required: false,
            transformations: vec![Transformation::Filter { function: "non_empty".to_string() }],
        },
    ];

    struct EchoHandler;
    #[async_trait]
    impl StepHandler for EchoHandler {
        async fn execute(
            &self,
            _agent: &AgentDefinition,
            _step: &WorkflowStep,
            inputs: &HashMap<String, Value>,
        ) -> Result<StepOutcome, workflow_orchestrator::OrchestrationError> {
            Ok(StepOutcome {
                outputs: inputs.clone(),
                cost: 0.0,
                quality_score: 0.9,
                processing_time_ms: 1,
                memory_updates: HashMap::new(),
                communication_log: vec![],
            })
        }
    }
    let orchestrator = build_orchestrator(Arc::new(EchoHandler));

    let result = orchestrator
        .execute(workflow, "tenant", "user", Priority::Normal, HashMap::new())
        .await
        .unwrap();

    let outputs = &result.step_executions[0].outputs;
    assert_eq!(outputs["shout"], json!("HELLO"));
    assert_eq!(outputs["quiet"], json!("world"));
    assert_eq!(outputs["encoded"], json!("{\"a\":1}"));
    assert_eq!(outputs["mapped"], json!(["A", "B"]));
    assert_eq!(outputs["filtered"], json!(["keep"]));
}
