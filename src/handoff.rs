//! Handoff tickets and audit sinks (spec §4.1 step 7, §6).
//!
//! Grounded in the teacher's `monitor.rs`, which emits a similar append-only
//! event record on every state transition; generalized here to the fixed
//! `HandoffTicket` wire format spec §6 requires.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Acknowledged,
    Expired,
}

/// The stable audit record emitted on every step transition (spec §6). Field
/// names and shape are the wire contract: do not rename without a version
/// bump elsewhere in the integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffTicket {
    pub id: Uuid,
    pub transition: String,
    pub reason: String,
    pub expected_outcome: Option<String>,
    pub sla_ms: Option<u64>,
    pub confidence: Option<f64>,
    pub status: HandoffStatus,
    pub created_at: DateTime<Utc>,
    pub context: Value,
    pub annotations: Vec<String>,
    pub payload_keys: Vec<String>,
}

impl HandoffTicket {
    /// Builds a ticket for the transition `from_step` -> `to_agent`. `context`
    /// is the step's resolved input/output map; `payload_keys` is recorded
    /// without the values themselves, per spec §6 audit-minimization note.
    pub fn new(from_step: &str, to_agent: &str, reason: &str, context: Value) -> Self {
        let payload_keys = match &context {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        Self {
            id: Uuid::new_v4(),
            transition: format!("{from_step} -> {to_agent}"),
            reason: reason.to_string(),
            expected_outcome: None,
            sla_ms: None,
            confidence: None,
            status: HandoffStatus::Pending,
            created_at: Utc::now(),
            context,
            annotations: Vec::new(),
            payload_keys,
        }
    }

    pub fn with_sla(mut self, sla_ms: u64) -> Self {
        self.sla_ms = Some(sla_ms);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_expected_outcome(mut self, outcome: &str) -> Self {
        self.expected_outcome = Some(outcome.to_string());
        self
    }

    pub fn acknowledge(&mut self) {
        self.status = HandoffStatus::Acknowledged;
    }

    pub fn expire(&mut self) {
        self.status = HandoffStatus::Expired;
    }
}

/// Durable sink for handoff tickets; the orchestrator writes one on every
/// step transition (spec §4.1 step 7).
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, ticket: &HandoffTicket);
}

/// Default sink: structured `tracing` events, matching the teacher's
/// preference for logging over ad hoc persistence at this layer.
pub struct LoggingAuditSink;

#[async_trait]
impl AuditSink for LoggingAuditSink {
    async fn record(&self, ticket: &HandoffTicket) {
        tracing::info!(
            ticket_id = %ticket.id,
            transition = %ticket.transition,
            reason = %ticket.reason,
            status = ?ticket.status,
            "handoff ticket recorded"
        );
    }
}

/// Bounded in-memory sink used by tests and by callers that want to inspect
/// recent tickets without standing up external storage.
pub struct InMemoryAuditSink {
    tickets: Mutex<VecDeque<HandoffTicket>>,
    capacity: usize,
}

impl InMemoryAuditSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            tickets: Mutex::new(VecDeque::new()),
            capacity,
        })
    }

    pub fn tickets(&self) -> Vec<HandoffTicket> {
        self.tickets.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, ticket: &HandoffTicket) {
        let mut tickets = self.tickets.lock();
        tickets.push_back(ticket.clone());
        while tickets.len() > self.capacity {
            tickets.pop_front();
        }
    }
}
