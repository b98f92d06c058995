//! Side-effect execution: retry with backoff, circuit breakers and
//! compensation-based transactions

pub mod cancellation;
pub mod circuit_breaker;
pub mod runner;
pub mod transaction;

pub use cancellation::CancellationSignal;
pub use circuit_breaker::{
    Admission, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState,
    Permit,
};
pub use runner::{
    operation_fn, AttemptContext, EffectConfig, EffectOperation, EffectOutcome, EffectRunner,
    FnOperation,
};
pub use transaction::{
    Compensation, CompensationFuture, RegisteredOperation, Transaction, TransactionManager,
    TransactionState,
};
