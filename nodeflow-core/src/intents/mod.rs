//! Intent collection and routing

pub mod queue;
pub mod router;

pub use queue::{dispatch_order, IntentQueue};
pub use router::{
    handler_fn, DispatchFailure, Dispatched, EffectHandler, FnHandler, IntentRouter, RoutingReport,
};
