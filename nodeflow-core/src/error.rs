//! Error taxonomy shared by the FSM, effect, routing and workflow layers

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::validation::ValidationError;

/// Coarse classification of every failure the core can surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoMatchingTransition,
    TerminalStateViolation,
    GuardConditionFailed,
    CyclicDependency,
    UnroutableIntent,
    CircuitOpen,
    RetryableFailure,
    FatalFailure,
    CompensationFailure,
    Cancelled,
    MalformedContract,
}

impl ErrorKind {
    /// Whether the failure may succeed when attempted again
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RetryableFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoMatchingTransition => "NoMatchingTransition",
            ErrorKind::TerminalStateViolation => "TerminalStateViolation",
            ErrorKind::GuardConditionFailed => "GuardConditionFailed",
            ErrorKind::CyclicDependency => "CyclicDependency",
            ErrorKind::UnroutableIntent => "UnroutableIntent",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::RetryableFailure => "RetryableFailure",
            ErrorKind::FatalFailure => "FatalFailure",
            ErrorKind::CompensationFailure => "CompensationFailure",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::MalformedContract => "MalformedContract",
        };
        f.write_str(name)
    }
}

/// Errors raised while loading or building FSM and workflow contracts
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract '{contract}' is malformed: {}", join_validation_errors(.errors))]
    Malformed {
        contract: String,
        errors: Vec<ValidationError>,
    },

    #[error("cyclic dependency detected: {}", .cycle.join(" → "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("failed to parse {format} contract: {message}")]
    Parse {
        format: &'static str,
        message: String,
    },

    #[error("failed to read contract '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ContractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContractError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            _ => ErrorKind::MalformedContract,
        }
    }
}

fn join_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A single guard condition that rejected a candidate transition
#[derive(Debug, Clone, PartialEq, Error)]
#[error("guard '{field} {operator} {expected}' failed on transition {from} -> {to} (actual: {})", display_actual(.actual))]
pub struct GuardConditionFailed {
    pub from: String,
    pub to: String,
    pub field: String,
    pub operator: String,
    pub expected: Value,
    pub actual: Option<Value>,
}

fn display_actual(actual: &Option<Value>) -> String {
    actual
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "<missing>".to_string())
}

/// Errors produced by the FSM executor
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FsmError {
    #[error("no transition from '{state}' on trigger '{trigger}'{}", describe_blocked(.blocked))]
    NoMatchingTransition {
        state: String,
        trigger: String,
        blocked: Vec<GuardConditionFailed>,
    },

    #[error(
        "state '{state}' is terminal and admits no transition on trigger '{trigger}'{}",
        describe_blocked(.blocked)
    )]
    TerminalStateViolation {
        state: String,
        trigger: String,
        /// Guards that rejected an otherwise permitted escape to an error state
        blocked: Vec<GuardConditionFailed>,
    },

    #[error("state '{state}' is not defined by machine '{machine}'")]
    UnknownState { machine: String, state: String },

    #[error("action '{action}' referenced by state '{state}' is not registered")]
    UnknownAction { state: String, action: String },
}

impl FsmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsmError::NoMatchingTransition { .. } => ErrorKind::NoMatchingTransition,
            FsmError::TerminalStateViolation { .. } => ErrorKind::TerminalStateViolation,
            FsmError::UnknownState { .. } | FsmError::UnknownAction { .. } => {
                ErrorKind::MalformedContract
            }
        }
    }
}

fn describe_blocked(blocked: &[GuardConditionFailed]) -> String {
    if blocked.is_empty() {
        String::new()
    } else {
        format!(
            " ({} candidate(s) blocked: {})",
            blocked.len(),
            blocked
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        )
    }
}

/// Failure classification returned by an effect operation or handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectFailure {
    /// Timeouts, unavailable resources and other failures worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// Validation or programming errors; never retried
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl EffectFailure {
    pub fn transient(message: impl fmt::Display) -> Self {
        EffectFailure::Transient(message.to_string())
    }

    pub fn fatal(message: impl fmt::Display) -> Self {
        EffectFailure::Fatal(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EffectFailure::Transient(_) => ErrorKind::RetryableFailure,
            EffectFailure::Fatal(_) => ErrorKind::FatalFailure,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EffectFailure::Transient(m) | EffectFailure::Fatal(m) => m,
        }
    }
}

impl From<anyhow::Error> for EffectFailure {
    /// Unclassified errors are treated as fatal
    fn from(err: anyhow::Error) -> Self {
        EffectFailure::Fatal(format!("{:#}", err))
    }
}

/// One compensation that failed during rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationError {
    pub operation: String,
    pub message: String,
}

/// Aggregate of every compensation failure seen during one rollback
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rollback of transaction {transaction_id} ran {executed} compensation(s), {} failed: {}", .failures.len(), join_compensation_errors(.failures))]
pub struct CompensationFailure {
    pub transaction_id: Uuid,
    pub executed: usize,
    pub failures: Vec<CompensationError>,
}

fn join_compensation_errors(failures: &[CompensationError]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.operation, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by transaction bookkeeping
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction {id} is already {state}")]
    NotOpen { id: Uuid, state: String },

    #[error(transparent)]
    Compensation(#[from] CompensationFailure),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::NotOpen { .. } => ErrorKind::FatalFailure,
            TransactionError::Compensation(_) => ErrorKind::CompensationFailure,
        }
    }
}

/// Record of one failed effect attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based attempt index
    pub attempt: u32,
    pub kind: ErrorKind,
    pub error: String,
    /// Backoff applied before the next attempt, if one was scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Whether partial transactional work was rolled back after this attempt
    #[serde(default)]
    pub rolled_back: bool,
}

/// Terminal errors returned by the effect runner
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EffectError {
    #[error(
        "circuit '{key}' is open; operation '{operation}' not attempted (after {attempts} attempt(s)){}",
        last_error_suffix(.last_error)
    )]
    CircuitOpen {
        operation: String,
        key: String,
        attempts: u32,
        /// Error of the last attempt made before the breaker rejected the next one
        last_error: Option<String>,
        history: Vec<AttemptRecord>,
    },

    #[error("operation '{operation}' failed after {attempts} attempt(s): {last_error}")]
    Fatal {
        operation: String,
        attempts: u32,
        last_error: String,
        history: Vec<AttemptRecord>,
        compensation: Option<CompensationFailure>,
    },

    #[error("operation '{operation}' cancelled after {attempts} attempt(s)")]
    Cancelled {
        operation: String,
        attempts: u32,
        compensation: Option<CompensationFailure>,
    },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(error) => format!("; last error: {}", error),
        None => String::new(),
    }
}

impl EffectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EffectError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            EffectError::Fatal { .. } => ErrorKind::FatalFailure,
            EffectError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            EffectError::CircuitOpen { operation, .. }
            | EffectError::Fatal { operation, .. }
            | EffectError::Cancelled { operation, .. } => operation,
        }
    }

    /// Attempts made before the run ended, oldest first
    pub fn history(&self) -> &[AttemptRecord] {
        match self {
            EffectError::CircuitOpen { history, .. } | EffectError::Fatal { history, .. } => history,
            EffectError::Cancelled { .. } => &[],
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            EffectError::CircuitOpen { attempts, .. }
            | EffectError::Fatal { attempts, .. }
            | EffectError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// Compensation failure recorded alongside the triggering error, if any
    pub fn compensation(&self) -> Option<&CompensationFailure> {
        match self {
            EffectError::Fatal { compensation, .. } | EffectError::Cancelled { compensation, .. } => {
                compensation.as_ref()
            }
            EffectError::CircuitOpen { .. } => None,
        }
    }
}

/// Errors recorded while routing intents to handlers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    #[error("no handler registered for intent type '{intent_type}' (target '{target}')")]
    UnroutableIntent { intent_type: String, target: String },

    #[error("intent '{intent_type}' for '{target}' failed: {source}")]
    Effect {
        intent_type: String,
        target: String,
        #[source]
        source: EffectError,
    },

    #[error("dispatch of intent '{intent_type}' for '{target}' cancelled")]
    Cancelled { intent_type: String, target: String },
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::UnroutableIntent { .. } => ErrorKind::UnroutableIntent,
            RoutingError::Effect { source, .. } => source.kind(),
            RoutingError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

/// Errors raised by checkpoint stores
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint store '{}' I/O failed: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint store is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported checkpoint version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Errors raised by workflow building and resumption
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("checkpoint belongs to workflow '{found}', not '{expected}'")]
    CheckpointMismatch { expected: String, found: String },

    #[error("no checkpoint stored for execution {execution_id}")]
    CheckpointNotFound { execution_id: Uuid },

    #[error("no checkpoint store configured")]
    NoCheckpointStore,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Contract(e) => e.kind(),
            _ => ErrorKind::FatalFailure,
        }
    }
}
