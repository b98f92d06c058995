//! Pure FSM transition function

use serde_json::Value;

use crate::error::FsmError;
use crate::fsm::actions::{ActionContext, ActionPhase, ActionRegistry};
use crate::fsm::definition::{State, StateMachineDefinition, Transition};
use crate::fsm::guard;
use crate::models::Intent;
use crate::services::{default_sink, Observation, SharedSink};

/// Result of a successful transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub previous_state: String,
    pub next_state: String,
    pub trigger: String,
    /// Intents produced by exit then entry actions, in declaration order
    pub intents: Vec<Intent>,
    /// Name of the transition taken, if declared
    pub transition: Option<String>,
    /// Dispatch the intents as one unit
    pub atomic: bool,
    /// The trigger may be re-submitted if dispatch fails
    pub retryable: bool,
}

/// Computes transitions against a definition.
///
/// Holds only immutable configuration; the current state is always passed in
/// and the next state always returned.
#[derive(Clone)]
pub struct FsmExecutor {
    actions: ActionRegistry,
    sink: SharedSink,
}

impl FsmExecutor {
    pub fn new(actions: ActionRegistry) -> Self {
        Self {
            actions,
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Check that every action the definition references is registered
    pub fn verify(&self, definition: &StateMachineDefinition) -> Result<(), FsmError> {
        for state in definition.states() {
            for action in state.exit_actions.iter().chain(&state.entry_actions) {
                if !self.actions.contains(action) {
                    return Err(FsmError::UnknownAction {
                        state: state.name.clone(),
                        action: action.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Compute the next state and emitted intents for `trigger` in `current_state`
    pub fn transition(
        &self,
        definition: &StateMachineDefinition,
        current_state: &str,
        trigger: &str,
        payload: &Value,
    ) -> Result<TransitionOutcome, FsmError> {
        let current = definition
            .state(current_state)
            .ok_or_else(|| FsmError::UnknownState {
                machine: definition.name().to_string(),
                state: current_state.to_string(),
            })?;

        let mut blocked = Vec::new();
        let mut chosen: Option<&Transition> = None;
        for candidate in definition.candidates(current_state, trigger) {
            match guard::check_transition(candidate, payload) {
                Ok(()) => {
                    chosen = Some(candidate);
                    break;
                }
                Err(failure) => blocked.push(failure),
            }
        }

        let Some(transition) = chosen else {
            tracing::debug!(
                machine = %definition.name(),
                state = %current_state,
                trigger = %trigger,
                blocked = blocked.len(),
                "No viable transition"
            );
            return Err(if current.is_terminal() {
                FsmError::TerminalStateViolation {
                    state: current_state.to_string(),
                    trigger: trigger.to_string(),
                    blocked,
                }
            } else {
                FsmError::NoMatchingTransition {
                    state: current_state.to_string(),
                    trigger: trigger.to_string(),
                    blocked,
                }
            });
        };

        let next = definition
            .state(&transition.to)
            .ok_or_else(|| FsmError::UnknownState {
                machine: definition.name().to_string(),
                state: transition.to.clone(),
            })?;

        let mut intents = Vec::new();
        self.run_actions(definition, current, next, trigger, payload, ActionPhase::Exit, &mut intents)?;
        self.run_actions(definition, current, next, trigger, payload, ActionPhase::Entry, &mut intents)?;

        self.sink.record(Observation::StateTransitioned {
            machine: definition.name().to_string(),
            from: current.name.clone(),
            to: next.name.clone(),
            trigger: trigger.to_string(),
            intents: intents.len(),
        });

        Ok(TransitionOutcome {
            previous_state: current.name.clone(),
            next_state: next.name.clone(),
            trigger: trigger.to_string(),
            intents,
            transition: transition.name.clone(),
            atomic: transition.atomic,
            retryable: transition.retryable,
        })
    }

    /// Apply a sequence of triggers starting at `state`, collecting every intent.
    ///
    /// Stops at the first failing trigger.
    pub fn replay<'a, I>(
        &self,
        definition: &StateMachineDefinition,
        state: &str,
        triggers: I,
    ) -> Result<(String, Vec<Intent>), FsmError>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut current = state.to_string();
        let mut intents = Vec::new();
        for (trigger, payload) in triggers {
            let outcome = self.transition(definition, &current, trigger, payload)?;
            current = outcome.next_state;
            intents.extend(outcome.intents);
        }
        Ok((current, intents))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_actions(
        &self,
        definition: &StateMachineDefinition,
        from: &State,
        to: &State,
        trigger: &str,
        payload: &Value,
        phase: ActionPhase,
        intents: &mut Vec<Intent>,
    ) -> Result<(), FsmError> {
        let (owner, names) = match phase {
            ActionPhase::Exit => (from, &from.exit_actions),
            ActionPhase::Entry => (to, &to.entry_actions),
        };

        let ctx = ActionContext {
            machine: definition.name(),
            from: &from.name,
            to: &to.name,
            trigger,
            payload,
            phase,
        };

        for name in names {
            let action = self.actions.get(name).ok_or_else(|| FsmError::UnknownAction {
                state: owner.name.clone(),
                action: name.clone(),
            })?;
            intents.extend(action(&ctx));
        }
        Ok(())
    }
}

impl Default for FsmExecutor {
    fn default() -> Self {
        Self::new(ActionRegistry::new())
    }
}
