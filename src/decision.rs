//! Decision Engine (spec §4.3): decision-tree traversal, variable resolution
//! from execution context, and a restricted boolean condition grammar.
//!
//! The tree-walking shape (id-linked nodes, lazily built index) is grounded
//! in the teacher's `mcts.rs` search tree, generalized from a search tree to
//! a fixed decision tree — the MCTS search itself has no counterpart here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::WorkflowExecution;
use crate::types::{get_path, DecisionNode, DecisionTree, DecisionTreeAction};
use crate::OrchestrationError;

/// Per-agent metrics as seen from inside a decision tree evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContextMetrics {
    pub processing_time_ms: f64,
    pub cost: f64,
    pub quality_score: f64,
    pub completed_steps_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentData {
    pub current_time: DateTime<Utc>,
    pub execution_duration_ms: i64,
    pub total_cost: f64,
    pub quality_score: f64,
    pub allow_custom_expressions: bool,
}

/// Read-only snapshot assembled before every traversal (spec §4.3).
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub execution: WorkflowExecution,
    pub step_outputs: HashMap<String, HashMap<String, Value>>,
    pub agent_metrics: HashMap<String, AgentContextMetrics>,
    pub environment: EnvironmentData,
    pub total_steps: usize,
}

impl DecisionContext {
    /// Resolves a source string by the prefix-based resolver table, falling
    /// back to a dot-path lookup over the whole context (spec §4.3).
    pub fn resolve(&self, source: &str) -> Option<Value> {
        if let Some(rest) = source.strip_prefix("execution.") {
            return self.resolve_execution(rest);
        }
        if let Some(rest) = source.strip_prefix("agent.") {
            return self.resolve_agent(rest);
        }
        if let Some(rest) = source.strip_prefix("environment.") {
            return self.resolve_environment(rest);
        }
        if let Some(rest) = source.strip_prefix("calculated.") {
            return self.resolve_calculated(rest);
        }
        self.resolve_whole_context(source)
    }

    fn resolve_execution(&self, path: &str) -> Option<Value> {
        match path {
            "status" => serde_json::to_value(self.execution.status).ok(),
            "totalCost" => Some(Value::from(self.execution.total_cost)),
            "qualityScore" => self.execution.quality_score.map(Value::from),
            "id" => Some(Value::String(self.execution.id.to_string())),
            other => {
                if let Some(step_id) = other.strip_prefix("steps.") {
                    let (step_id, rest) = step_id.split_once('.').unwrap_or((step_id, ""));
                    let outputs = self.step_outputs.get(step_id)?;
                    if rest.is_empty() {
                        serde_json::to_value(outputs).ok()
                    } else {
                        get_path(&serde_json::to_value(outputs).ok()?, rest)
                    }
                } else {
                    get_path(&serde_json::to_value(&self.execution).ok()?, other)
                }
            }
        }
    }

    fn resolve_agent(&self, path: &str) -> Option<Value> {
        let (agent_id, field) = path.split_once('.')?;
        let metrics = self.agent_metrics.get(agent_id)?;
        match field {
            "processingTime" => Some(Value::from(metrics.processing_time_ms)),
            "cost" => Some(Value::from(metrics.cost)),
            "qualityScore" => Some(Value::from(metrics.quality_score)),
            "completedStepsCount" => Some(Value::from(metrics.completed_steps_count)),
            other => get_path(&serde_json::to_value(metrics).ok()?, other),
        }
    }

    fn resolve_environment(&self, field: &str) -> Option<Value> {
        match field {
            "currentTime" => Some(Value::String(self.environment.current_time.to_rfc3339())),
            "executionDuration" => Some(Value::from(self.environment.execution_duration_ms)),
            "totalCost" => Some(Value::from(self.environment.total_cost)),
            "qualityScore" => Some(Value::from(self.environment.quality_score)),
            "allowCustomExpressions" => Some(Value::Bool(self.environment.allow_custom_expressions)),
            other => get_path(&serde_json::to_value(&self.environment).ok()?, other),
        }
    }

    fn resolve_calculated(&self, name: &str) -> Option<Value> {
        match name {
            "completionRate" => {
                if self.total_steps == 0 {
                    Some(Value::from(0.0))
                } else {
                    let completed = self
                        .execution
                        .step_executions
                        .iter()
                        .filter(|s| s.status == crate::execution::StepStatus::Completed)
                        .count();
                    Some(Value::from(completed as f64 / self.total_steps as f64))
                }
            }
            "averageQuality" => Some(Value::from(self.execution.quality_score.unwrap_or(0.0))),
            "costEfficiency" => {
                if self.execution.total_cost > 0.0 {
                    Some(Value::from(self.execution.quality_score.unwrap_or(0.0) / self.execution.total_cost))
                } else {
                    Some(Value::from(0.0))
                }
            }
            _ => None,
        }
    }

    fn resolve_whole_context(&self, path: &str) -> Option<Value> {
        let whole = serde_json::json!({
            "execution": &self.execution,
            "environment": &self.environment,
        });
        get_path(&whole, path)
    }
}

/// Trait for executing a decision-tree action node (spec §4.3: `assign_agent`,
/// `modify_workflow`, `escalate`, `terminate`, `send_notification`).
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &DecisionTreeAction, execution_id: Uuid) -> Result<(), OrchestrationError>;
}

/// Default executor: logs the action via `tracing`. Real assignment/escalation
/// side effects are the orchestrator's concern and are wired in by callers
/// that need more than audit logging.
pub struct LoggingActionExecutor;

#[async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute(&self, action: &DecisionTreeAction, execution_id: Uuid) -> Result<(), OrchestrationError> {
        tracing::info!(execution_id = %execution_id, action = ?action, "decision tree action executed");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResult {
    pub outcome_id: String,
    pub outcome_name: String,
    pub actions: Vec<DecisionTreeAction>,
    pub confidence: f64,
    pub reasoning: Vec<String>,
    pub variables: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAuditRecord {
    pub tree_id: String,
    pub result: DecisionResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionPatternAnalysis {
    pub average_confidence: f64,
    pub common_outcomes: Vec<(String, usize)>,
    pub effectiveness: f64,
    pub suggestions: Vec<String>,
}

/// Evaluates a decision tree against a [`DecisionContext`], maintaining a
/// lazily-built `O(1)`-per-hop node index per tree and a bounded
/// per-execution audit history (spec §4.3).
pub struct DecisionEngine {
    action_executor: Arc<dyn ActionExecutor>,
    node_indices: DashMap<String, HashMap<String, usize>>,
    history: DashMap<Uuid, Mutex<VecDeque<DecisionAuditRecord>>>,
    history_capacity: usize,
}

impl DecisionEngine {
    pub fn new(action_executor: Arc<dyn ActionExecutor>, history_capacity: usize) -> Self {
        Self {
            action_executor,
            node_indices: DashMap::new(),
            history: DashMap::new(),
            history_capacity,
        }
    }

    pub fn with_default_executor(history_capacity: usize) -> Self {
        Self::new(Arc::new(LoggingActionExecutor), history_capacity)
    }

    fn index_for<'a>(&self, tree: &'a DecisionTree) -> HashMap<String, usize> {
        if let Some(existing) = self.node_indices.get(&tree.id) {
            return existing.clone();
        }
        // BFS from the root so any node reachable from it resolves, even if
        // referenced before it appears earlier in `nodes` (spec §9 open
        // question (b)).
        let mut index = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(tree.root_node.clone());
        while let Some(id) = queue.pop_front() {
            if index.contains_key(&id) {
                continue;
            }
            if let Some(pos) = tree.nodes.iter().position(|n| n.id() == id) {
                index.insert(id.clone(), pos);
                match &tree.nodes[pos] {
                    DecisionNode::Condition { true_node, false_node, .. } => {
                        queue.push_back(true_node.clone());
                        queue.push_back(false_node.clone());
                    }
                    DecisionNode::Action { next_node, .. } => {
                        if let Some(next) = next_node {
                            queue.push_back(next.clone());
                        }
                    }
                    DecisionNode::Leaf { .. } => {}
                }
            }
        }
        self.node_indices.insert(tree.id.clone(), index.clone());
        index
    }

    /// Traverses `tree` against `context`, returning the resolved outcome.
    pub async fn execute_decision_tree(
        &self,
        tree: &DecisionTree,
        context: &DecisionContext,
    ) -> Result<DecisionResult, OrchestrationError> {
        let index = self.index_for(tree);

        let mut resolved = HashMap::new();
        for variable in &tree.variables {
            let value = context
                .resolve(&variable.source)
                .or_else(|| variable.default_value.clone());
            if let Some(v) = value {
                resolved.insert(variable.name.clone(), v);
            }
        }

        let mut reasoning = Vec::new();
        let mut current_id = tree.root_node.clone();
        let mut hops = 0usize;
        let outcome_id = loop {
            hops += 1;
            if hops > tree.nodes.len().max(1) * 2 + 8 {
                return Err(OrchestrationError::InvalidDecisionTree(format!(
                    "traversal did not terminate for tree '{}'",
                    tree.id
                )));
            }
            let pos = index.get(&current_id).ok_or_else(|| {
                OrchestrationError::InvalidDecisionTree(format!("node '{current_id}' not found in tree '{}'", tree.id))
            })?;
            let node = &tree.nodes[*pos];
            match node {
                DecisionNode::Condition { condition, true_node, false_node, .. } => {
                    let outcome = evaluate_condition(condition, &resolved, context.environment.allow_custom_expressions);
                    reasoning.push(format!("condition '{condition}' evaluated to {outcome}"));
                    current_id = if outcome { true_node.clone() } else { false_node.clone() };
                }
                DecisionNode::Action { action, next_node, .. } => {
                    self.action_executor.execute(action, context.execution.id).await?;
                    reasoning.push(format!("executed action {action:?}"));
                    match next_node {
                        Some(next) => current_id = next.clone(),
                        None => {
                            break tree.default_outcome.clone().ok_or_else(|| {
                                OrchestrationError::InvalidDecisionTree(format!(
                                    "tree '{}' has no default outcome for a terminal action node",
                                    tree.id
                                ))
                            })?;
                        }
                    }
                }
                DecisionNode::Leaf { id } => break id.clone(),
            }
        };

        let outcome = tree.outcome(&outcome_id).ok_or_else(|| {
            OrchestrationError::InvalidDecisionTree(format!("outcome '{outcome_id}' not found in tree '{}'", tree.id))
        })?;

        let confidence = compute_confidence(outcome.probability, &resolved);

        let result = DecisionResult {
            outcome_id: outcome.id.clone(),
            outcome_name: outcome.name.clone(),
            actions: outcome.actions.clone(),
            confidence,
            reasoning,
            variables: resolved,
        };

        self.record_history(context.execution.id, tree.id.clone(), result.clone());

        Ok(result)
    }

    fn record_history(&self, execution_id: Uuid, tree_id: String, result: DecisionResult) {
        let entry = self
            .history
            .entry(execution_id)
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut history = entry.lock();
        history.push_back(DecisionAuditRecord {
            tree_id,
            result,
            recorded_at: Utc::now(),
        });
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }

    pub fn history(&self, execution_id: Uuid) -> Vec<DecisionAuditRecord> {
        self.history
            .get(&execution_id)
            .map(|h| h.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Average confidence, most common outcomes, and free-text suggestions
    /// derived from an execution's decision history (spec §4.3).
    pub fn analyze_decision_patterns(&self, execution_id: Uuid) -> DecisionPatternAnalysis {
        let records = self.history(execution_id);
        if records.is_empty() {
            return DecisionPatternAnalysis {
                average_confidence: 0.0,
                common_outcomes: Vec::new(),
                effectiveness: 0.0,
                suggestions: vec!["no decisions recorded yet".to_string()],
            };
        }

        let average_confidence = records.iter().map(|r| r.result.confidence).sum::<f64>() / records.len() as f64;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in &records {
            *counts.entry(record.result.outcome_name.clone()).or_insert(0) += 1;
        }
        let mut common_outcomes: Vec<(String, usize)> = counts.into_iter().collect();
        common_outcomes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let effectiveness = average_confidence;
        let mut suggestions = Vec::new();
        if average_confidence < 0.5 {
            suggestions.push("decision confidence is low; consider adding more variables or defaults".to_string());
        }
        if common_outcomes.len() == 1 {
            suggestions.push("a single outcome dominates; verify branch conditions are discriminating".to_string());
        }

        DecisionPatternAnalysis {
            average_confidence,
            common_outcomes,
            effectiveness,
            suggestions,
        }
    }
}

fn compute_confidence(probability: Option<f64>, variables: &HashMap<String, Value>) -> f64 {
    let base = probability.unwrap_or(0.7);
    if variables.is_empty() {
        return base.clamp(0.0, 1.0);
    }
    let evidence_sum: f64 = variables
        .values()
        .map(|v| match v {
            Value::Number(_) | Value::Bool(_) => 0.1,
            Value::String(s) if !s.is_empty() => 0.05,
            _ => 0.0,
        })
        .sum();
    let normalized = evidence_sum / variables.len() as f64;
    (base + 0.1 * normalized).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Restricted boolean condition grammar (spec §4.3, REDESIGN FLAGS §9)
//
// Grammar: `(expr)`, `a op b` with op in {==, !=, <, <=, >, >=}, `and`/`or`/
// `not`, identifiers bound to the resolved variables map, and literals
// (numbers, quoted strings, `true`/`false`). When `allow_custom` is set the
// same grammar additionally permits `+ - * /` arithmetic inside comparisons
// (the "richer", still variables-only, sandboxed language spec §4.3 allows
// opting into). Anything outside the grammar evaluates to `false` and logs.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Bool(bool),
    Op(&'static str),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                }));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                match two.as_str() {
                    "==" | "!=" | "<=" | ">=" => {
                        tokens.push(Token::Op(match two.as_str() {
                            "==" => "==",
                            "!=" => "!=",
                            "<=" => "<=",
                            _ => ">=",
                        }));
                        i += 2;
                    }
                    _ => {
                        if c == '<' || c == '>' {
                            tokens.push(Token::Op(if c == '<' { "<" } else { ">" }));
                            i += 1;
                        } else {
                            return Err(format!("unexpected character '{c}'"));
                        }
                    }
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    s.push(chars[i]);
                    i += 1;
                }
                let n: f64 = s.parse().map_err(|_| format!("invalid number literal '{s}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    s.push(chars[i]);
                    i += 1;
                }
                tokens.push(match s.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(s),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    allow_arithmetic: bool,
}

#[derive(Debug, Clone)]
enum Expr {
    Bool(bool),
    Value(Value),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(&'static str, Box<Expr>, Box<Expr>),
    Arithmetic(&'static str, Box<Expr>, Box<Expr>),
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], allow_arithmetic: bool) -> Self {
        Self { tokens, pos: 0, allow_arithmetic }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_sum()?;
        if let Some(Token::Op(op @ ("==" | "!=" | "<" | "<=" | ">" | ">="))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_sum()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_sum(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_atom()?;
        loop {
            match self.peek() {
                Some(Token::Op(op @ ("+" | "-"))) => {
                    if !self.allow_arithmetic {
                        return Err("arithmetic requires custom expressions".to_string());
                    }
                    let op = *op;
                    self.advance();
                    let right = self.parse_atom()?;
                    left = Expr::Arithmetic(op, Box::new(left), Box::new(right));
                }
                Some(Token::Op(op @ ("*" | "/"))) => {
                    if !self.allow_arithmetic {
                        return Err("arithmetic requires custom expressions".to_string());
                    }
                    let op = *op;
                    self.advance();
                    let right = self.parse_atom()?;
                    left = Expr::Arithmetic(op, Box::new(left), Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Expr, String> {
        match self.advance().cloned() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected closing parenthesis".to_string()),
                }
            }
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::Number(n)) => Ok(Expr::Value(Value::from(n))),
            Some(Token::Str(s)) => Ok(Expr::Value(Value::String(s))),
            Some(Token::Ident(name)) => Ok(Expr::Value(Value::String(format!("$ident:{name}")))),
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn finished(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

fn resolve_value(expr: &Expr, variables: &HashMap<String, Value>) -> Result<Value, String> {
    match expr {
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Value(Value::String(s)) if s.starts_with("$ident:") => {
            let name = &s["$ident:".len()..];
            variables.get(name).cloned().ok_or_else(|| format!("unbound identifier '{name}'"))
        }
        Expr::Value(v) => Ok(v.clone()),
        Expr::Arithmetic(op, l, r) => {
            let lv = resolve_value(l, variables)?;
            let rv = resolve_value(r, variables)?;
            let (ln, rn) = (as_f64(&lv)?, as_f64(&rv)?);
            let result = match *op {
                "+" => ln + rn,
                "-" => ln - rn,
                "*" => ln * rn,
                "/" => ln / rn,
                _ => return Err(format!("unsupported arithmetic operator '{op}'")),
            };
            Ok(Value::from(result))
        }
        other => Err(format!("{other:?} is not a value expression")),
    }
}

fn as_f64(v: &Value) -> Result<f64, String> {
    v.as_f64().ok_or_else(|| format!("'{v}' is not numeric"))
}

fn eval_expr(expr: &Expr, variables: &HashMap<String, Value>) -> Result<bool, String> {
    match expr {
        Expr::Bool(b) => Ok(*b),
        Expr::And(l, r) => Ok(eval_expr(l, variables)? && eval_expr(r, variables)?),
        Expr::Or(l, r) => Ok(eval_expr(l, variables)? || eval_expr(r, variables)?),
        Expr::Not(inner) => Ok(!eval_expr(inner, variables)?),
        Expr::Compare(op, l, r) => {
            let lv = resolve_value(l, variables)?;
            let rv = resolve_value(r, variables)?;
            compare(op, &lv, &rv)
        }
        Expr::Value(Value::String(s)) if s.starts_with("$ident:") => {
            let name = &s["$ident:".len()..];
            match variables.get(name) {
                Some(Value::Bool(b)) => Ok(*b),
                Some(other) => Err(format!("identifier '{name}' ({other}) used as a boolean")),
                None => Err(format!("unbound identifier '{name}'")),
            }
        }
        other => Err(format!("{other:?} is not a boolean expression")),
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> Result<bool, String> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok(match op {
            "==" => (l - r).abs() < f64::EPSILON,
            "!=" => (l - r).abs() >= f64::EPSILON,
            "<" => l < r,
            "<=" => l <= r,
            ">" => l > r,
            ">=" => l >= r,
            _ => return Err(format!("unsupported operator '{op}'")),
        });
    }
    match op {
        "==" => Ok(left == right),
        "!=" => Ok(left != right),
        _ => Err(format!("operator '{op}' requires numeric operands")),
    }
}

/// Evaluates `condition` against `variables`. Any syntax outside the
/// restricted grammar evaluates to `false` and is logged (spec §4.3).
pub fn evaluate_condition(condition: &str, variables: &HashMap<String, Value>, allow_custom: bool) -> bool {
    let tokens = match tokenize(condition) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(condition, error = %e, "condition failed to tokenize, treating as false");
            return false;
        }
    };
    let mut parser = Parser::new(&tokens, allow_custom);
    let expr = match parser.parse_expr() {
        Ok(e) if parser.finished() => e,
        Ok(_) => {
            tracing::warn!(condition, "trailing tokens after parsing condition, treating as false");
            return false;
        }
        Err(e) => {
            tracing::warn!(condition, error = %e, "condition outside restricted grammar, treating as false");
            return false;
        }
    };
    match eval_expr(&expr, variables) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(condition, error = %e, "condition failed to evaluate, treating as false");
            false
        }
    }
}
