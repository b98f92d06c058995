//! Ambient services injected into the execution core

pub mod logging;
pub mod observation;

pub use logging::*;
pub use observation::*;
