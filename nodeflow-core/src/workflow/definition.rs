//! Built, immutable workflows

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ContractError;
use crate::models::workflow::{
    CoordinationRules, ExecutionMode, WorkflowContract, WorkflowMetadata, WorkflowStep,
};
use crate::validation::ValidationResult;
use crate::workflow::step::{StepAction, StepRegistry};
use crate::workflow::validator::WorkflowValidator;

/// Validated step DAG with its actions bound.
///
/// Building rejects duplicate ids, unknown dependencies, cycles and enabled
/// steps without an action, so execution never meets any of them.
pub struct Workflow {
    metadata: WorkflowMetadata,
    rules: CoordinationRules,
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    layers: Vec<Vec<usize>>,
    actions: Vec<Option<Arc<dyn StepAction>>>,
}

impl Workflow {
    pub fn build(contract: WorkflowContract, registry: &StepRegistry) -> Result<Self, ContractError> {
        let name = contract.workflow_metadata.name.clone();
        WorkflowValidator::validate(&contract).into_result(&name)?;

        if let Some(cycle) = WorkflowValidator::detect_cycle(&contract.steps) {
            tracing::error!(workflow = %name, cycle = %cycle.join(" → "), "Cyclic workflow rejected");
            return Err(ContractError::CyclicDependency { cycle });
        }

        let mut missing = ValidationResult::new();
        let actions: Vec<Option<Arc<dyn StepAction>>> = contract
            .steps
            .iter()
            .map(|step| {
                let action = registry.get(&step.id).cloned();
                if step.enabled && action.is_none() {
                    missing.add_error(
                        format!("steps.{}", step.id),
                        format!("No action registered for step '{}'", step.id),
                    );
                }
                action
            })
            .collect();
        missing.into_result(&name)?;

        let index: HashMap<String, usize> = contract
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.id.clone(), i))
            .collect();

        let mut dependencies: Vec<Vec<usize>> = contract
            .steps
            .iter()
            .map(|step| step.depends_on.iter().filter_map(|d| index.get(d).copied()).collect())
            .collect();
        for deps in &mut dependencies {
            deps.sort_unstable();
            deps.dedup();
        }

        let layers = layer(&dependencies);
        tracing::debug!(
            workflow = %name,
            steps = contract.steps.len(),
            layers = layers.len(),
            "Workflow built"
        );

        Ok(Self {
            metadata: contract.workflow_metadata,
            rules: contract.coordination_rules,
            steps: contract.steps,
            index,
            dependencies,
            layers,
            actions,
        })
    }

    pub fn from_yaml_str(content: &str, registry: &StepRegistry) -> Result<Self, ContractError> {
        Self::build(WorkflowContract::from_yaml_str(content)?, registry)
    }

    pub fn from_json_str(content: &str, registry: &StepRegistry) -> Result<Self, ContractError> {
        Self::build(WorkflowContract::from_json_str(content)?, registry)
    }

    pub fn load(path: &Path, registry: &StepRegistry) -> Result<Self, ContractError> {
        Self::build(WorkflowContract::load(path)?, registry)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &WorkflowMetadata {
        &self.metadata
    }

    pub fn rules(&self) -> &CoordinationRules {
        &self.rules
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.metadata.execution_mode
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.metadata.timeout_ms.map(Duration::from_millis)
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.index.get(step_id).map(|&i| &self.steps[i])
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn position(&self, step_id: &str) -> Option<usize> {
        self.index.get(step_id).copied()
    }

    pub(crate) fn dependencies_of(&self, position: usize) -> &[usize] {
        &self.dependencies[position]
    }

    pub(crate) fn action(&self, position: usize) -> Option<&Arc<dyn StepAction>> {
        self.actions.get(position).and_then(Option::as_ref)
    }

    pub(crate) fn layer_positions(&self) -> &[Vec<usize>] {
        &self.layers
    }

    /// Dependency layers as step ids; each layer depends only on earlier ones
    pub fn layers(&self) -> Vec<Vec<&str>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| self.steps[i].id.as_str()).collect())
            .collect()
    }

    /// A topological order: layers flattened, declaration order within a layer
    pub fn topological_order(&self) -> Vec<&str> {
        self.layers
            .iter()
            .flatten()
            .map(|&i| self.steps[i].id.as_str())
            .collect()
    }

    pub(crate) fn order_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers.iter().flatten().copied()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.metadata.name)
            .field("mode", &self.metadata.execution_mode)
            .field("layers", &self.layers())
            .finish()
    }
}

/// Kahn layering over an acyclic dependency list; stable in declaration order
fn layer(dependencies: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = dependencies.len();
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); n];
    for (step, deps) in dependencies.iter().enumerate() {
        for &dep in deps {
            dependents[dep].push(step);
        }
    }

    let mut layers = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &step in &current {
            for &dependent in &dependents[step] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        layers.push(current);
        current = next;
    }
    layers
}
