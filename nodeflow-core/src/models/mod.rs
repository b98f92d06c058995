//! Data models for nodeflow

pub mod configuration;
pub mod document;
pub mod fsm;
pub mod intent;
pub mod workflow;

pub use configuration::*;
pub use fsm::*;
pub use intent::*;
pub use workflow::*;
