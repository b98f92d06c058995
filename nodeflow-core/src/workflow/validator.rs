//! Workflow contract validation

use std::collections::{HashMap, HashSet};

use crate::models::workflow::{WorkflowContract, WorkflowStep};
use crate::validation::ValidationResult;

/// Workflow validator
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Structural checks: names, ids, dependency references and limits.
    ///
    /// Cycles are reported separately by [`WorkflowValidator::detect_cycle`].
    pub fn validate(contract: &WorkflowContract) -> ValidationResult {
        let mut result = ValidationResult::new();
        let metadata = &contract.workflow_metadata;

        if metadata.name.trim().is_empty() {
            result.add_error("workflow_metadata.name", "Workflow name cannot be empty");
        }

        if metadata.timeout_ms == Some(0) {
            result.add_error(
                "workflow_metadata.timeout",
                "timeout must be greater than zero when set",
            );
        }

        if contract.coordination_rules.max_parallel_steps == 0 {
            result.add_error(
                "coordination_rules.max_parallel_steps",
                "max_parallel_steps must be at least 1",
            );
        }

        if contract.steps.is_empty() {
            result.add_warning(format!("Workflow '{}' has no steps", metadata.name));
        }

        let mut seen = HashSet::new();
        for step in &contract.steps {
            if step.id.trim().is_empty() {
                result.add_error("steps", "Step id cannot be empty");
                continue;
            }
            if !seen.insert(step.id.as_str()) {
                result.add_error(
                    format!("steps.{}", step.id),
                    format!("Duplicate step id '{}'", step.id),
                );
            }
        }

        for step in &contract.steps {
            let mut deps = HashSet::new();
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    result.add_error(
                        format!("steps.{}.depends_on", step.id),
                        format!("Dependency '{}' not found in steps", dep),
                    );
                }
                if !deps.insert(dep.as_str()) {
                    result.add_warning(format!(
                        "Step '{}' lists dependency '{}' more than once",
                        step.id, dep
                    ));
                }
            }
        }

        for step in contract.steps.iter().filter(|s| !s.enabled) {
            let dependents: Vec<&str> = contract
                .steps
                .iter()
                .filter(|s| s.depends_on.contains(&step.id))
                .map(|s| s.id.as_str())
                .collect();
            if !dependents.is_empty() {
                result.add_warning(format!(
                    "Disabled step '{}' is treated as satisfied for {}",
                    step.id,
                    dependents.join(", ")
                ));
            }
        }

        result
    }

    /// Detect circular dependencies using DFS cycle detection.
    ///
    /// Returns the cycle as a closed path, e.g. `[a, b, c, a]`, where each
    /// step depends on the next. Self-dependencies count as cycles.
    pub fn detect_cycle(steps: &[WorkflowStep]) -> Option<Vec<String>> {
        let edges: HashMap<&str, &[String]> = steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
            .collect();

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut parent = HashMap::new();

        fn dfs<'a>(
            node: &'a str,
            edges: &HashMap<&'a str, &'a [String]>,
            visited: &mut HashSet<&'a str>,
            rec_stack: &mut HashSet<&'a str>,
            parent: &mut HashMap<&'a str, &'a str>,
        ) -> Option<Vec<String>> {
            visited.insert(node);
            rec_stack.insert(node);

            for target in edges.get(node).copied().unwrap_or_default() {
                let target = target.as_str();
                if !edges.contains_key(target) {
                    // Unknown references are reported by validate()
                    continue;
                }
                if !visited.contains(target) {
                    parent.insert(target, node);
                    if let Some(cycle) = dfs(target, edges, visited, rec_stack, parent) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(target) {
                    // Walk back from node to target, then close the loop
                    let mut cycle = vec![node.to_string()];
                    let mut current = node;
                    while current != target {
                        current = *parent.get(current)?;
                        cycle.push(current.to_string());
                    }
                    cycle.reverse();
                    cycle.push(target.to_string());
                    return Some(cycle);
                }
            }

            rec_stack.remove(node);
            None
        }

        for step in steps {
            if !visited.contains(step.id.as_str()) {
                if let Some(cycle) = dfs(
                    step.id.as_str(),
                    &edges,
                    &mut visited,
                    &mut rec_stack,
                    &mut parent,
                ) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{CoordinationRules, WorkflowMetadata};

    fn contract(steps: Vec<WorkflowStep>) -> WorkflowContract {
        WorkflowContract {
            workflow_metadata: WorkflowMetadata {
                name: "test".to_string(),
                description: None,
                execution_mode: Default::default(),
                timeout_ms: None,
                max_retries: 0,
            },
            steps,
            coordination_rules: CoordinationRules::default(),
        }
    }

    #[test]
    fn test_valid_dag() {
        let c = contract(vec![
            WorkflowStep::new("a"),
            WorkflowStep::new("b").depends_on(["a"]),
            WorkflowStep::new("c").depends_on(["a", "b"]),
        ]);
        assert!(WorkflowValidator::validate(&c).is_valid());
        assert!(WorkflowValidator::detect_cycle(&c.steps).is_none());
    }

    #[test]
    fn test_unknown_dependency_and_duplicate_id() {
        let c = contract(vec![
            WorkflowStep::new("a"),
            WorkflowStep::new("a"),
            WorkflowStep::new("b").depends_on(["ghost"]),
        ]);
        let result = WorkflowValidator::validate(&c);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().any(|e| e.message.contains("Duplicate step id")));
        assert!(result.errors.iter().any(|e| e.message.contains("'ghost'")));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut c = contract(vec![WorkflowStep::new("a")]);
        c.coordination_rules.max_parallel_steps = 0;
        assert!(!WorkflowValidator::validate(&c).is_valid());
    }

    #[test]
    fn test_three_step_cycle_detected() {
        let steps = vec![
            WorkflowStep::new("a").depends_on(["c"]),
            WorkflowStep::new("b").depends_on(["a"]),
            WorkflowStep::new("c").depends_on(["b"]),
        ];
        let cycle = WorkflowValidator::detect_cycle(&steps).unwrap();
        assert_eq!(cycle.len(), 4);
        assert_eq!(cycle.first(), cycle.last());
        for id in ["a", "b", "c"] {
            assert!(cycle.iter().any(|s| s == id));
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![WorkflowStep::new("loop").depends_on(["loop"])];
        assert_eq!(
            WorkflowValidator::detect_cycle(&steps),
            Some(vec!["loop".to_string(), "loop".to_string()])
        );
    }

    #[test]
    fn test_disabled_dependency_warns() {
        let c = contract(vec![
            WorkflowStep::new("a").disabled(),
            WorkflowStep::new("b").depends_on(["a"]),
        ]);
        let result = WorkflowValidator::validate(&c);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }
}
