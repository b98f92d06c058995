//! Immutable state machine definitions built from validated contracts

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::error::ContractError;
use crate::models::{
    is_wildcard, FsmContract, GuardCondition, GuardOperator, StateKind,
};
use crate::validation::ValidationResult;

/// Resolved state of a machine
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub name: String,
    pub kind: StateKind,
    /// Ends the machine; error states may be terminal too
    pub terminal: bool,
    pub description: Option<String>,
    pub entry_actions: Vec<String>,
    pub exit_actions: Vec<String>,
    pub validation_rules: Vec<String>,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_error(&self) -> bool {
        self.kind == StateKind::Error
    }
}

/// Resolved transition of a machine
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub name: Option<String>,
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub guards: Vec<GuardCondition>,
    pub atomic: bool,
    pub retryable: bool,
}

impl Transition {
    pub fn is_wildcard(&self) -> bool {
        is_wildcard(&self.from)
    }
}

/// Named unit of work with an optional compensating operation
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub description: Option<String>,
    pub compensation: Option<String>,
}

/// Validated, read-only state machine.
///
/// Construction rejects unknown state references, so every transition target
/// and non-wildcard source is guaranteed to exist. Share it freely behind `Arc`.
#[derive(Debug, Clone)]
pub struct StateMachineDefinition {
    name: String,
    description: Option<String>,
    initial_state: String,
    states: Vec<State>,
    state_index: HashMap<String, usize>,
    transitions: Vec<Transition>,
    operations: Vec<Operation>,
}

impl StateMachineDefinition {
    /// Validate a contract and build the definition from it
    pub fn from_contract(contract: FsmContract) -> Result<Self, ContractError> {
        Self::validate_contract(&contract).into_result(&contract.name)?;

        let terminal: HashSet<&str> = contract.terminal_states.iter().map(String::as_str).collect();
        let errors: HashSet<&str> = contract.error_states.iter().map(String::as_str).collect();

        let states: Vec<State> = contract
            .states
            .iter()
            .map(|spec| {
                let kind = spec.kind.unwrap_or(if errors.contains(spec.name.as_str()) {
                    StateKind::Error
                } else if terminal.contains(spec.name.as_str()) {
                    StateKind::Terminal
                } else {
                    StateKind::Operational
                });

                State {
                    name: spec.name.clone(),
                    kind,
                    terminal: kind == StateKind::Terminal || terminal.contains(spec.name.as_str()),
                    description: spec.description.clone(),
                    entry_actions: spec.entry_actions.clone(),
                    exit_actions: spec.exit_actions.clone(),
                    validation_rules: spec.validation_rules.clone(),
                }
            })
            .collect();

        let state_index = states
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let transitions = contract
            .transitions
            .into_iter()
            .map(|spec| Transition {
                name: spec.name,
                from: spec.from,
                to: spec.to,
                trigger: spec.trigger,
                guards: spec.guards,
                atomic: spec.atomic,
                retryable: spec.retryable,
            })
            .collect();

        let operations = contract
            .operations
            .into_iter()
            .map(|spec| Operation {
                name: spec.name,
                description: spec.description,
                compensation: spec.compensation,
            })
            .collect();

        tracing::debug!(machine = %contract.name, "State machine definition built");

        Ok(Self {
            name: contract.name,
            description: contract.description,
            initial_state: contract.initial_state,
            states,
            state_index,
            transitions,
            operations,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ContractError> {
        Self::from_contract(FsmContract::from_yaml_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ContractError> {
        Self::from_contract(FsmContract::from_json_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ContractError> {
        Self::from_contract(FsmContract::load(path)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.state_index.get(name).map(|&i| &self.states[i])
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.state(state).is_some_and(State::is_terminal)
    }

    /// Transitions for (state, trigger) in precedence order: exact matches in
    /// declaration order, then wildcard matches in declaration order.
    pub fn candidates<'a>(
        &'a self,
        state: &'a str,
        trigger: &'a str,
    ) -> impl Iterator<Item = &'a Transition> + 'a {
        let exact = self
            .transitions
            .iter()
            .filter(move |t| t.trigger == trigger && t.from == state);
        let wildcard = self
            .transitions
            .iter()
            .filter(move |t| t.trigger == trigger && t.is_wildcard());
        exact.chain(wildcard)
    }

    /// Structural validation of a contract, collecting every problem found
    pub fn validate_contract(contract: &FsmContract) -> ValidationResult {
        let mut result = ValidationResult::new();

        if contract.name.is_empty() {
            result.add_error("name", "State machine name cannot be empty");
        }

        if contract.states.is_empty() {
            result.add_error("states", "At least one state must be defined");
        }

        let mut names = HashSet::new();
        for (i, state) in contract.states.iter().enumerate() {
            if state.name.is_empty() {
                result.add_error(format!("states[{}].name", i), "State name cannot be empty");
            } else if is_wildcard(&state.name) {
                result.add_error(
                    format!("states[{}].name", i),
                    format!("'{}' is reserved for wildcard transitions", state.name),
                );
            } else if !names.insert(state.name.as_str()) {
                result.add_error(
                    format!("states[{}].name", i),
                    format!("Duplicate state '{}'", state.name),
                );
            }
        }

        if !names.contains(contract.initial_state.as_str()) {
            result.add_error(
                "initial_state",
                format!("Initial state '{}' not found in states", contract.initial_state),
            );
        }

        for terminal_state in &contract.terminal_states {
            if !names.contains(terminal_state.as_str()) {
                result.add_error(
                    "terminal_states",
                    format!("Terminal state '{}' not found in states", terminal_state),
                );
            }
        }

        for error_state in &contract.error_states {
            if !names.contains(error_state.as_str()) {
                result.add_error(
                    "error_states",
                    format!("Error state '{}' not found in states", error_state),
                );
            }
        }

        if contract.terminal_states.contains(&contract.initial_state) {
            result.add_warning(format!(
                "Initial state '{}' is terminal; only wildcard transitions can leave it",
                contract.initial_state
            ));
        }

        let is_terminal = |name: &str| {
            contract.terminal_states.iter().any(|t| t == name)
                || contract
                    .states
                    .iter()
                    .any(|s| s.name == name && s.kind == Some(StateKind::Terminal))
        };
        let is_error = |name: &str| {
            contract.error_states.iter().any(|t| t == name)
                || contract
                    .states
                    .iter()
                    .any(|s| s.name == name && s.kind == Some(StateKind::Error))
        };

        let mut seen_exact: HashSet<(&str, &str, String)> = HashSet::new();
        for (i, transition) in contract.transitions.iter().enumerate() {
            let field = format!("transitions[{}]", i);

            if transition.trigger.is_empty() {
                result.add_error(format!("{}.trigger", field), "Trigger cannot be empty");
            }

            if is_wildcard(&transition.to) {
                result.add_error(
                    format!("{}.to", field),
                    "Transition target cannot be a wildcard",
                );
            } else if !names.contains(transition.to.as_str()) {
                result.add_error(
                    format!("{}.to", field),
                    format!("Transition target state '{}' not found", transition.to),
                );
            }

            if !is_wildcard(&transition.from) {
                if !names.contains(transition.from.as_str()) {
                    result.add_error(
                        format!("{}.from", field),
                        format!("Transition source state '{}' not found", transition.from),
                    );
                } else if is_terminal(&transition.from) && !is_error(&transition.to) {
                    result.add_error(
                        format!("{}.from", field),
                        format!(
                            "Terminal state '{}' may only transition to an error state, not '{}'",
                            transition.from, transition.to
                        ),
                    );
                }

                let guard_key = serde_json::to_string(&transition.guards).unwrap_or_default();
                if !seen_exact.insert((
                    transition.from.as_str(),
                    transition.trigger.as_str(),
                    guard_key,
                )) {
                    result.add_warning(format!(
                        "Transition {} from '{}' on '{}' is shadowed by an earlier identical declaration",
                        i, transition.from, transition.trigger
                    ));
                }
            }

            for (g, guard) in transition.guards.iter().enumerate() {
                if guard.field.is_empty()
                    && !matches!(guard.operator, GuardOperator::Exists | GuardOperator::NotExists)
                {
                    result.add_warning(format!(
                        "{}.guards[{}] compares the whole payload",
                        field, g
                    ));
                }
                if guard.operator == GuardOperator::In
                    && !(guard.value.is_array() || guard.value.is_string())
                {
                    result.add_error(
                        format!("{}.guards[{}].value", field, g),
                        "'in' requires an array or string value",
                    );
                }
            }
        }

        let mut operation_names = HashSet::new();
        for (i, operation) in contract.operations.iter().enumerate() {
            if !operation_names.insert(operation.name.as_str()) {
                result.add_error(
                    format!("operations[{}].name", i),
                    format!("Duplicate operation '{}'", operation.name),
                );
            }
        }
        for (i, operation) in contract.operations.iter().enumerate() {
            if let Some(compensation) = &operation.compensation {
                if !operation_names.contains(compensation.as_str()) {
                    result.add_error(
                        format!("operations[{}].compensation", i),
                        format!("Compensation operation '{}' not found", compensation),
                    );
                }
            }
        }

        for state_name in Self::find_unreachable_states(contract) {
            result.add_warning(format!(
                "State '{}' is unreachable from initial state '{}'",
                state_name, contract.initial_state
            ));
        }

        result
    }

    /// Find unreachable states using BFS; wildcard transitions are reachable
    /// from every visited state.
    fn find_unreachable_states(contract: &FsmContract) -> Vec<String> {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();

        queue.push_back(contract.initial_state.as_str());
        reachable.insert(contract.initial_state.as_str());

        while let Some(state_name) = queue.pop_front() {
            for transition in &contract.transitions {
                if (transition.from == state_name || is_wildcard(&transition.from))
                    && reachable.insert(transition.to.as_str())
                {
                    queue.push_back(transition.to.as_str());
                }
            }
        }

        contract
            .states
            .iter()
            .filter(|s| !reachable.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect()
    }
}
