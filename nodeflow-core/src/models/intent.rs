//! Intent data models

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Highest dispatch priority
pub const HIGHEST_PRIORITY: u8 = 1;

/// Priority assigned when none is given
pub const DEFAULT_PRIORITY: u8 = 5;

/// Declarative description of a side effect.
///
/// Intents are produced by pure steps and never executed by their producer;
/// the router hands them to the handler registered for `intent_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Handler registry key
    #[serde(rename = "type")]
    pub intent_type: String,
    /// What the effect acts on (resource, topic, path)
    pub target: String,
    pub payload: IntentPayload,
    /// Lower value dispatches first; 1 is highest
    #[serde(default = "default_priority", deserialize_with = "deserialize_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn deserialize_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    u8::deserialize(deserializer).map(|p| p.max(HIGHEST_PRIORITY))
}

impl Intent {
    pub fn new(intent_type: impl Into<String>, target: impl Into<String>, payload: IntentPayload) -> Self {
        Self {
            intent_type: intent_type.into(),
            target: target.into(),
            payload,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Set priority, clamped so that 0 is never produced
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.max(HIGHEST_PRIORITY);
        self
    }
}

/// Intent payload variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntentPayload {
    /// Publish an event to a topic
    Event { topic: String, data: Value },
    /// Write a structured log line
    Log { level: String, message: String },
    /// Persist a value under a key
    Persist { key: String, value: Value },
    /// Handler-defined payload
    Custom { data: Value },
}

impl IntentPayload {
    pub fn custom(data: Value) -> Self {
        IntentPayload::Custom { data }
    }
}
