//! Entry/exit actions: pure functions from transition context to intents

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::models::Intent;

/// Whether an action runs on leaving or entering a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Exit,
    Entry,
}

/// Read-only view of the transition an action runs for
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub machine: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    pub trigger: &'a str,
    pub payload: &'a Value,
    pub phase: ActionPhase,
}

/// Action body. Must be pure: it describes effects as intents and never performs I/O.
pub type ActionFn = Arc<dyn Fn(&ActionContext<'_>) -> Vec<Intent> + Send + Sync>;

/// Immutable map from action identifier to action body
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action, replacing any previous one with the same name
    pub fn with_action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&ActionContext<'_>) -> Vec<Intent> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry")
            .field("actions", &names)
            .finish()
    }
}
