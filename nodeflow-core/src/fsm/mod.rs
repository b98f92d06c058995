//! Declarative finite-state machines
//!
//! A [`StateMachineDefinition`] is built once from a validated contract and
//! never changes. [`FsmExecutor::transition`] is a pure function over it:
//! (state, trigger, payload) in, (next state, intents) out.

pub mod actions;
pub mod definition;
pub mod executor;
pub mod guard;

pub use actions::{ActionContext, ActionFn, ActionPhase, ActionRegistry};
pub use definition::{Operation, State, StateMachineDefinition, Transition};
pub use executor::{FsmExecutor, TransitionOutcome};
