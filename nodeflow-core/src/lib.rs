//! # Nodeflow Core Library
//!
//! Execution core for nodeflow: declarative state machines that emit
//! intents, an intent router, an effect runner with retry, circuit breaking
//! and compensating transactions, and a workflow orchestrator over step DAGs.

pub mod effects;
pub mod error;
pub mod fsm;
pub mod intents;
pub mod models;
pub mod services;
pub mod validation;
pub mod workflow;

pub use error::{
    ContractError, EffectError, EffectFailure, ErrorKind, FsmError, RoutingError, WorkflowError,
};
