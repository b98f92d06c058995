//! Workflow orchestration data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use uuid::Uuid;

use crate::error::{ContractError, ErrorKind};
use crate::models::document;

/// Node kinds a workflow step can be backed by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Pure transformation
    #[default]
    Compute,
    /// Side-effecting I/O
    Effect,
    /// State transition through an FSM
    Reducer,
    /// Nested workflow coordination
    Orchestrator,
}

/// How steps are scheduled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time in dependency order
    #[default]
    Sequential,
    /// Whole dependency layers at a time
    Parallel,
    /// Each step as soon as its own dependencies complete
    DependencyOrdered,
}

/// What happens to completed work when a step fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Skip dependents of the failed step, keep running independent branches
    #[default]
    Continue,
    /// Re-run failed steps once more; compensate if they still fail
    RetryFailed,
    /// Compensate every completed step in reverse completion order
    CompensateAll,
}

/// Workflow contract document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContract {
    pub workflow_metadata: WorkflowMetadata,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub coordination_rules: CoordinationRules,
}

impl WorkflowContract {
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

/// Workflow-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Unique workflow identifier
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Bound on the whole execution in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Retries per step after the first attempt
    #[serde(default)]
    pub max_retries: u32,
}

/// Failure handling and concurrency rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationRules {
    #[serde(default)]
    pub failure_recovery_strategy: RecoveryStrategy,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    #[serde(default)]
    pub enable_checkpoints: bool,
}

fn default_max_parallel_steps() -> usize {
    4
}

impl Default for CoordinationRules {
    fn default() -> Self {
        Self {
            failure_recovery_strategy: RecoveryStrategy::default(),
            max_parallel_steps: default_max_parallel_steps(),
            enable_checkpoints: false,
        }
    }
}

/// Individual workflow step definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Step id (unique within workflow)
    #[serde(alias = "step_id")]
    pub id: String,
    /// Human-readable name
    #[serde(default, alias = "step_name")]
    pub name: String,
    #[serde(default, alias = "step_type")]
    pub kind: NodeKind,
    /// Ids of steps that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the workflow max_retries for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind: NodeKind::default(),
            depends_on: Vec::new(),
            enabled: true,
            max_retries: None,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Execution status of a single step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
    /// Not run because a dependency failed or execution stopped
    Skipped,
    /// Disabled in the contract
    Disabled,
    /// Completed, then reversed during recovery
    Compensated,
    Cancelled,
}

/// Overall workflow outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Per-step execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub status: StepStatus,
    /// Effect attempts spent on this step, across recovery rounds
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepReport {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            error_kind: None,
            duration_ms: None,
        }
    }
}

/// Result of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    /// Step reports in contract declaration order
    pub steps: Vec<StepReport>,
    /// Steps reversed during recovery, in compensation order
    #[serde(default)]
    pub compensated: Vec<String>,
    /// Compensations that failed, as "step: error"
    #[serde(default)]
    pub compensation_failures: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Ids of steps with the given status, in declaration order
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_serialization() {
        let json = serde_json::to_string(&ExecutionMode::DependencyOrdered).unwrap();
        assert_eq!(json, "\"dependency_ordered\"");
    }

    #[test]
    fn test_workflow_contract_from_yaml() {
        let yaml = r#"
workflow_metadata:
  name: nightly-backup
  execution_mode: parallel
  timeout: 30000
  max_retries: 2
steps:
  - step_id: snapshot
    step_name: Snapshot database
    step_type: effect
  - step_id: upload
    depends_on: [snapshot]
coordination_rules:
  failure_recovery_strategy: compensate_all
  max_parallel_steps: 2
"#;

        let contract = WorkflowContract::from_yaml_str(yaml).unwrap();
        assert_eq!(contract.workflow_metadata.name, "nightly-backup");
        assert_eq!(
            contract.workflow_metadata.execution_mode,
            ExecutionMode::Parallel
        );
        assert_eq!(contract.workflow_metadata.timeout_ms, Some(30000));
        assert_eq!(contract.steps[0].kind, NodeKind::Effect);
        assert_eq!(contract.steps[1].depends_on, vec!["snapshot"]);
        assert!(contract.steps[1].enabled);
        assert_eq!(
            contract.coordination_rules.failure_recovery_strategy,
            RecoveryStrategy::CompensateAll
        );
        assert!(!contract.coordination_rules.enable_checkpoints);
    }

    #[test]
    fn test_coordination_rules_defaults() {
        let rules = CoordinationRules::default();
        assert_eq!(rules.failure_recovery_strategy, RecoveryStrategy::Continue);
        assert_eq!(rules.max_parallel_steps, 4);
    }

    #[test]
    fn test_step_builder_helpers() {
        let step = WorkflowStep::new("load")
            .depends_on(["extract"])
            .kind(NodeKind::Reducer)
            .disabled();

        assert_eq!(step.name, "load");
        assert_eq!(step.depends_on, vec!["extract"]);
        assert_eq!(step.kind, NodeKind::Reducer);
        assert!(!step.enabled);
    }
}
