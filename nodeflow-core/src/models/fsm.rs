//! FSM contract data models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;

use crate::error::ContractError;
use crate::models::document;

/// From-state values that match any current state
pub const WILDCARD_STATES: [&str; 2] = ["*", "any"];

/// Check whether a from-state name is a wildcard
pub fn is_wildcard(state: &str) -> bool {
    WILDCARD_STATES.contains(&state)
}

/// Classification of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// Regular working state
    #[default]
    Operational,
    /// Workflow end point; only error-recovery transitions leave it
    Terminal,
    /// Failure state
    Error,
}

/// FSM contract document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmContract {
    /// Machine name used in logs and errors
    #[serde(default = "default_machine_name", alias = "state_machine_name")]
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the starting state
    pub initial_state: String,
    /// All states of the machine
    pub states: Vec<StateSpec>,
    /// Declared transitions, in priority order
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
    /// States that end the machine
    #[serde(default)]
    pub terminal_states: Vec<String>,
    /// States that represent failure
    #[serde(default)]
    pub error_states: Vec<String>,
    /// Named units of work with optional compensations
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

fn default_machine_name() -> String {
    "state_machine".to_string()
}

impl FsmContract {
    pub fn from_yaml_str(content: &str) -> Result<Self, ContractError> {
        document::from_yaml_str(content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ContractError> {
        document::from_json_str(content)
    }

    pub fn load(path: &Path) -> Result<Self, ContractError> {
        document::load_document(path)
    }
}

/// State declaration inside an FSM contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSpec {
    /// State name (unique within the machine)
    #[serde(alias = "state_name")]
    pub name: String,
    /// Explicit kind; derived from terminal/error lists when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateKind>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Actions run when the state is entered
    #[serde(default)]
    pub entry_actions: Vec<String>,
    /// Actions run when the state is left
    #[serde(default)]
    pub exit_actions: Vec<String>,
    /// Validation rule identifiers attached to the state
    #[serde(default)]
    pub validation_rules: Vec<String>,
}

/// Transition declaration inside an FSM contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    /// Optional transition name
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "transition_name")]
    pub name: Option<String>,
    /// Source state or wildcard (`*` / `any`)
    #[serde(alias = "from_state")]
    pub from: String,
    /// Target state
    #[serde(alias = "to_state")]
    pub to: String,
    /// Trigger name
    pub trigger: String,
    /// Guards evaluated in order against the payload
    #[serde(default, alias = "conditions")]
    pub guards: Vec<GuardCondition>,
    /// Intents of this transition should be dispatched as one unit
    #[serde(default)]
    pub atomic: bool,
    /// Callers may re-submit the trigger after a failed dispatch
    #[serde(default, alias = "retry_enabled")]
    pub retryable: bool,
}

/// Field/operator/value guard triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardCondition {
    /// Dot-separated path into the payload
    pub field: String,
    pub operator: GuardOperator,
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators for guard conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOperator {
    #[serde(alias = "==", alias = "eq")]
    Equals,
    #[serde(alias = "!=", alias = "ne")]
    NotEquals,
    #[serde(alias = ">", alias = "gt")]
    GreaterThan,
    #[serde(alias = ">=", alias = "gte")]
    GreaterThanOrEqual,
    #[serde(alias = "<", alias = "lt")]
    LessThan,
    #[serde(alias = "<=", alias = "lte")]
    LessThanOrEqual,
    Contains,
    In,
    Exists,
    NotExists,
}

impl fmt::Display for GuardOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardOperator::Equals => "equals",
            GuardOperator::NotEquals => "not_equals",
            GuardOperator::GreaterThan => "greater_than",
            GuardOperator::GreaterThanOrEqual => "greater_than_or_equal",
            GuardOperator::LessThan => "less_than",
            GuardOperator::LessThanOrEqual => "less_than_or_equal",
            GuardOperator::Contains => "contains",
            GuardOperator::In => "in",
            GuardOperator::Exists => "exists",
            GuardOperator::NotExists => "not_exists",
        };
        f.write_str(name)
    }
}

/// Operation declaration inside an FSM contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Operation name (unique within the machine)
    #[serde(alias = "operation_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the operation that reverses this one
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rollback")]
    pub compensation: Option<String>,
}
