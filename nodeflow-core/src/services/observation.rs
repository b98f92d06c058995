//! Structured observations emitted by the execution core

use serde::Serialize;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Something noteworthy the core did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Observation {
    StateTransitioned {
        machine: String,
        from: String,
        to: String,
        trigger: String,
        intents: usize,
    },
    IntentRouted {
        intent_type: String,
        target: String,
        priority: u8,
        success: bool,
        attempts: u32,
    },
    IntentUnroutable {
        intent_type: String,
        target: String,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    CircuitOpened {
        key: String,
        failure_count: u32,
    },
    CircuitHalfOpened {
        key: String,
    },
    CircuitClosed {
        key: String,
    },
    TransactionCommitted {
        transaction_id: Uuid,
        operations: usize,
    },
    TransactionRolledBack {
        transaction_id: Uuid,
        compensations: usize,
        failures: usize,
    },
    StepStarted {
        workflow: String,
        step_id: String,
    },
    StepCompleted {
        workflow: String,
        step_id: String,
        attempts: u32,
    },
    StepFailed {
        workflow: String,
        step_id: String,
        error: String,
    },
    StepSkipped {
        workflow: String,
        step_id: String,
        reason: String,
    },
    StepCompensated {
        workflow: String,
        step_id: String,
        success: bool,
    },
    CheckpointSaved {
        workflow: String,
        execution_id: Uuid,
        completed_steps: usize,
    },
}

/// Receiver for observations; implementations decide where they go
pub trait ObservationSink: Send + Sync {
    fn record(&self, observation: Observation);
}

/// Shared handle to an injected sink
pub type SharedSink = Arc<dyn ObservationSink>;

/// Default sink: the tracing-backed one
pub fn default_sink() -> SharedSink {
    Arc::new(TracingSink)
}

/// Forwards observations to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservationSink for TracingSink {
    fn record(&self, observation: Observation) {
        match &observation {
            Observation::StateTransitioned {
                machine,
                from,
                to,
                trigger,
                intents,
            } => tracing::info!(
                machine = %machine,
                from = %from,
                to = %to,
                trigger = %trigger,
                intents = intents,
                "State transition"
            ),
            Observation::IntentRouted {
                intent_type,
                target,
                success,
                attempts,
                ..
            } => tracing::info!(
                intent_type = %intent_type,
                target = %target,
                success = success,
                attempts = attempts,
                "Intent routed"
            ),
            Observation::IntentUnroutable {
                intent_type,
                target,
            } => tracing::warn!(
                intent_type = %intent_type,
                target = %target,
                "Unroutable intent"
            ),
            Observation::RetryScheduled {
                operation,
                attempt,
                delay_ms,
                error,
            } => tracing::info!(
                operation = %operation,
                attempt = attempt,
                delay_ms = delay_ms,
                error = %error,
                "Retry scheduled"
            ),
            Observation::CircuitOpened { key, failure_count } => tracing::warn!(
                key = %key,
                failure_count = failure_count,
                "Circuit breaker opened"
            ),
            Observation::CircuitHalfOpened { key } => {
                tracing::info!(key = %key, "Circuit breaker half-open")
            }
            Observation::CircuitClosed { key } => {
                tracing::info!(key = %key, "Circuit breaker closed")
            }
            Observation::TransactionCommitted {
                transaction_id,
                operations,
            } => tracing::debug!(
                transaction_id = %transaction_id,
                operations = operations,
                "Transaction committed"
            ),
            Observation::TransactionRolledBack {
                transaction_id,
                compensations,
                failures,
            } => tracing::warn!(
                transaction_id = %transaction_id,
                compensations = compensations,
                failures = failures,
                "Transaction rolled back"
            ),
            Observation::StepStarted { workflow, step_id } => {
                tracing::debug!(workflow = %workflow, step_id = %step_id, "Step started")
            }
            Observation::StepCompleted {
                workflow,
                step_id,
                attempts,
            } => tracing::info!(
                workflow = %workflow,
                step_id = %step_id,
                attempts = attempts,
                "Step completed"
            ),
            Observation::StepFailed {
                workflow,
                step_id,
                error,
            } => tracing::error!(
                workflow = %workflow,
                step_id = %step_id,
                error = %error,
                "Step failed"
            ),
            Observation::StepSkipped {
                workflow,
                step_id,
                reason,
            } => tracing::warn!(
                workflow = %workflow,
                step_id = %step_id,
                reason = %reason,
                "Step skipped"
            ),
            Observation::StepCompensated {
                workflow,
                step_id,
                success,
            } => tracing::warn!(
                workflow = %workflow,
                step_id = %step_id,
                success = success,
                "Step compensated"
            ),
            Observation::CheckpointSaved {
                workflow,
                execution_id,
                completed_steps,
            } => tracing::debug!(
                workflow = %workflow,
                execution_id = %execution_id,
                completed_steps = completed_steps,
                "Checkpoint saved"
            ),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObservationSink for NoopSink {
    fn record(&self, _observation: Observation) {}
}

/// Keeps observations in memory, for assertions and audit trails
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Observation>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<Observation> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Observation) -> bool,
    {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|o| predicate(o))
            .count()
    }
}

impl ObservationSink for RecordingSink {
    fn record(&self, observation: Observation) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.record(Observation::CircuitOpened {
            key: "db".to_string(),
            failure_count: 3,
        });
        sink.record(Observation::CircuitClosed {
            key: "db".to_string(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Observation::CircuitOpened { .. }));
        assert_eq!(
            sink.count(|o| matches!(o, Observation::CircuitClosed { .. })),
            1
        );
    }

    #[test]
    fn test_observation_serializes_with_event_tag() {
        let value = serde_json::to_value(Observation::IntentUnroutable {
            intent_type: "fax".to_string(),
            target: "office".to_string(),
        })
        .unwrap();
        assert_eq!(value["event"], "intent_unroutable");
        assert_eq!(value["intent_type"], "fax");
    }

    #[test]
    fn test_tracing_sink_accepts_every_variant() {
        let sink = TracingSink;
        sink.record(Observation::StepSkipped {
            workflow: "wf".to_string(),
            step_id: "b".to_string(),
            reason: "dependency 'a' failed".to_string(),
        });
        NoopSink.record(Observation::CircuitHalfOpened {
            key: "db".to_string(),
        });
    }
}
