//! Communication Bus (spec §4.4): per-agent priority queues, delivery
//! filters, retrying delivery, and broadcast fan-out.
//!
//! Grounded in the teacher's `monitor.rs` event-channel shape, generalized
//! from a flat broadcast channel to per-agent priority queues as spec §4.4
//! requires.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::OrchestrationError;

/// Fixed priority-by-message-type table (spec §4.4): urgent > high > normal > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    StatusUpdate,
    HandoffNotification,
    EscalationAlert,
    PauseResumeSignal,
    Broadcast,
}

impl MessageType {
    /// Fixed priority table (spec §4.4): escalations and pause/resume
    /// signals are urgent, handoffs high, assignments normal, status low.
    pub fn default_priority(&self) -> MessagePriority {
        match self {
            MessageType::EscalationAlert => MessagePriority::Urgent,
            MessageType::PauseResumeSignal => MessagePriority::Urgent,
            MessageType::HandoffNotification => MessagePriority::High,
            MessageType::TaskAssignment => MessagePriority::Normal,
            MessageType::StatusUpdate => MessagePriority::Low,
            MessageType::Broadcast => MessagePriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub from_agent: String,
    pub to_agent: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub delivery_attempts: u32,
}

impl Message {
    pub fn new(message_type: MessageType, from_agent: &str, to_agent: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: message_type.default_priority(),
            message_type,
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            payload,
            created_at: Utc::now(),
            delivery_attempts: 0,
        }
    }
}

/// A content/size/frequency/security gate applied before a message is
/// enqueued (spec §4.4). Returning `Err` drops the message with a reason.
pub trait DeliveryFilter: Send + Sync {
    fn check(&self, message: &Message, recent_count: usize) -> Result<(), String>;
}

/// Rejects payloads above `max_bytes` when serialized to JSON.
pub struct MaxSizeFilter {
    pub max_bytes: usize,
}

impl DeliveryFilter for MaxSizeFilter {
    fn check(&self, message: &Message, _recent_count: usize) -> Result<(), String> {
        let size = serde_json::to_vec(&message.payload).map(|v| v.len()).unwrap_or(0);
        if size > self.max_bytes {
            Err(format!("payload of {size} bytes exceeds limit of {}", self.max_bytes))
        } else {
            Ok(())
        }
    }
}

/// Rejects payloads carrying disallowed keys (a stand-in for a security
/// classification check).
pub struct DisallowedKeysFilter {
    pub disallowed_keys: Vec<String>,
}

impl DeliveryFilter for DisallowedKeysFilter {
    fn check(&self, message: &Message, _recent_count: usize) -> Result<(), String> {
        if let Value::Object(map) = &message.payload {
            for key in &self.disallowed_keys {
                if map.contains_key(key) {
                    return Err(format!("payload carries disallowed key '{key}'"));
                }
            }
        }
        Ok(())
    }
}

/// Rejects a message if the sender has already pushed `max_per_window`
/// messages to the same recipient within the tracked window (spec §4.4
/// frequency filter).
pub struct FrequencyFilter {
    pub max_per_window: usize,
}

impl DeliveryFilter for FrequencyFilter {
    fn check(&self, _message: &Message, recent_count: usize) -> Result<(), String> {
        if recent_count >= self.max_per_window {
            Err(format!("rate limit of {} messages exceeded", self.max_per_window))
        } else {
            Ok(())
        }
    }
}

struct AgentQueue {
    queue: PriorityQueue<Uuid, (MessagePriority, std::cmp::Reverse<i64>)>,
    messages: HashMap<Uuid, Message>,
    recent_senders: VecDeque<(String, DateTime<Utc>)>,
}

impl AgentQueue {
    fn new() -> Self {
        Self {
            queue: PriorityQueue::new(),
            messages: HashMap::new(),
            recent_senders: VecDeque::new(),
        }
    }

    fn recent_count_from(&self, sender: &str) -> usize {
        self.recent_senders.iter().filter(|(s, _)| s == sender).count()
    }
}

/// Per-agent priority-queued message delivery with retrying background
/// dispatch and broadcast fan-out (spec §4.4).
pub struct CommunicationBus {
    queues: DashMap<String, Mutex<AgentQueue>>,
    filters: Vec<Box<dyn DeliveryFilter>>,
    capacity: usize,
    sequence: AtomicU64,
}

impl CommunicationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            filters: Vec::new(),
            capacity,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn with_filters(capacity: usize, filters: Vec<Box<dyn DeliveryFilter>>) -> Self {
        Self {
            queues: DashMap::new(),
            filters,
            capacity,
            sequence: AtomicU64::new(0),
        }
    }

    /// Enqueues `message` onto its recipient's priority queue, running every
    /// registered filter first. The queue is capped at `capacity`; when full
    /// the oldest (lowest priority, then oldest) entry is dropped (spec §4.4).
    pub fn send(&self, message: Message) -> Result<(), OrchestrationError> {
        if message.to_agent.is_empty() {
            return Err(OrchestrationError::InvalidMessage("message has no recipient".into()));
        }

        let entry = self.queues.entry(message.to_agent.clone()).or_insert_with(|| Mutex::new(AgentQueue::new()));
        let mut agent_queue = entry.lock();

        let recent_count = agent_queue.recent_count_from(&message.from_agent);
        for filter in &self.filters {
            filter
                .check(&message, recent_count)
                .map_err(OrchestrationError::InvalidMessage)?;
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) as i64;
        if agent_queue.queue.len() >= self.capacity {
            if let Some((dropped_id, _)) = agent_queue.queue.pop() {
                agent_queue.messages.remove(&dropped_id);
                tracing::warn!(agent = %message.to_agent, "agent queue at capacity, dropped oldest message");
            }
        }

        agent_queue.recent_senders.push_back((message.from_agent.clone(), message.created_at));
        while agent_queue.recent_senders.len() > 1000 {
            agent_queue.recent_senders.pop_front();
        }

        let priority = message.priority;
        agent_queue.queue.push(message.id, (priority, std::cmp::Reverse(seq)));
        agent_queue.messages.insert(message.id, message);
        Ok(())
    }

    /// Pops the highest-priority (then oldest) message for `agent_id`.
    pub fn receive(&self, agent_id: &str) -> Option<Message> {
        let entry = self.queues.get(agent_id)?;
        let mut agent_queue = entry.lock();
        let (id, _) = agent_queue.queue.pop()?;
        agent_queue.messages.remove(&id)
    }

    pub fn pending_count(&self, agent_id: &str) -> usize {
        self.queues.get(agent_id).map(|q| q.lock().queue.len()).unwrap_or(0)
    }

    /// Sends `message` to every agent in `recipients`, tagging each copy as
    /// [`MessageType::Broadcast`] (spec §4.4 fan-out).
    pub fn broadcast(&self, from_agent: &str, recipients: &[String], payload: Value) -> Vec<Result<(), OrchestrationError>> {
        recipients
            .iter()
            .map(|to| {
                let message = Message::new(MessageType::Broadcast, from_agent, to, payload.clone());
                self.send(message)
            })
            .collect()
    }

    /// Attempts delivery via `deliver`, retrying up to 3 times with a
    /// `5s * attempt` backoff (spec §4.4 delivery retry), re-enqueuing the
    /// message on every attempt that fails so `receive` still surfaces it if
    /// retries are exhausted.
    pub async fn send_with_retry<F, Fut>(&self, mut message: Message, deliver: F) -> Result<(), OrchestrationError>
    where
        F: Fn(Message) -> Fut,
        Fut: std::future::Future<Output = Result<(), OrchestrationError>>,
    {
        const MAX_ATTEMPTS: u32 = 3;
        loop {
            message.delivery_attempts += 1;
            match deliver(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if message.delivery_attempts < MAX_ATTEMPTS => {
                    tracing::warn!(message_id = %message.id, attempt = message.delivery_attempts, error = %e, "retrying delivery");
                    tokio::time::sleep(Duration::from_secs(5 * message.delivery_attempts as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
