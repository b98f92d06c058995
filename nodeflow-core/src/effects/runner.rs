//! Effect execution with retry, backoff, transactions and circuit breaking

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::effects::cancellation::CancellationSignal;
use crate::effects::circuit_breaker::{Admission, CircuitBreakerRegistry};
use crate::effects::transaction::{Compensation, Transaction, TransactionManager};
use crate::error::{AttemptRecord, CompensationFailure, EffectError, EffectFailure, TransactionError};
use crate::models::EngineConfiguration;
use crate::services::{default_sink, Observation, SharedSink};

/// Retry, transaction and breaker policy for one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectConfig {
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Run each attempt inside its own transaction
    pub transactional: bool,
    pub circuit_breaker_key: Option<String>,
    /// Per-attempt deadline; expiry counts as a transient failure
    pub attempt_timeout: Option<Duration>,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            transactional: false,
            circuit_breaker_key: None,
            attempt_timeout: None,
        }
    }
}

impl From<&EngineConfiguration> for EffectConfig {
    fn from(config: &EngineConfiguration) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            ..Self::default()
        }
    }
}

impl EffectConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub fn with_circuit_breaker(mut self, key: impl Into<String>) -> Self {
        self.circuit_breaker_key = Some(key.into());
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Delay before the retry that follows zero-based attempt `attempt`:
    /// `base_delay * 2^attempt`, capped at `max_delay`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Per-attempt handle given to an operation
pub struct AttemptContext {
    operation: String,
    attempt: u32,
    transaction: Option<Transaction>,
    manager: TransactionManager,
}

impl AttemptContext {
    /// Context without a transaction, for invoking operations outside a runner
    pub fn detached(operation: impl Into<String>, attempt: u32) -> Self {
        Self {
            operation: operation.into(),
            attempt,
            transaction: None,
            manager: TransactionManager::new(),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Zero-based attempt index
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_transactional(&self) -> bool {
        self.transaction.is_some()
    }

    /// Register completed sub-work and how to undo it.
    ///
    /// Without a transaction the compensation is discarded.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        data: Value,
        compensation: Compensation,
    ) -> Result<(), EffectFailure> {
        match self.transaction.as_mut() {
            Some(transaction) => self
                .manager
                .add_operation(transaction, name, data, Some(compensation))
                .map_err(EffectFailure::fatal),
            None => Ok(()),
        }
    }
}

/// Side-effecting work executed by the runner
#[async_trait]
pub trait EffectOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut AttemptContext) -> Result<Value, EffectFailure>;
}

/// Operation backed by a closure over the attempt index
pub struct FnOperation<F> {
    name: String,
    body: F,
}

pub fn operation_fn<F, Fut>(name: impl Into<String>, body: F) -> FnOperation<F>
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EffectFailure>> + Send + 'static,
{
    FnOperation {
        name: name.into(),
        body,
    }
}

#[async_trait]
impl<F, Fut> EffectOperation for FnOperation<F>
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EffectFailure>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut AttemptContext) -> Result<Value, EffectFailure> {
        (self.body)(ctx.attempt()).await
    }
}

/// Successful effect execution
#[derive(Debug, Clone, PartialEq)]
pub struct EffectOutcome {
    pub value: Value,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Executes effect operations under an [`EffectConfig`]
#[derive(Clone)]
pub struct EffectRunner {
    breakers: Arc<CircuitBreakerRegistry>,
    transactions: TransactionManager,
    sink: SharedSink,
}

impl EffectRunner {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            breakers,
            transactions: TransactionManager::new(),
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.transactions = self.transactions.with_sink(sink.clone());
        self.sink = sink;
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub async fn execute<O>(&self, operation: &O, config: &EffectConfig) -> Result<EffectOutcome, EffectError>
    where
        O: EffectOperation + ?Sized,
    {
        self.execute_with_cancel(operation, config, &CancellationSignal::new())
            .await
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts its retries,
    /// hits an open breaker or is cancelled.
    pub async fn execute_with_cancel<O>(
        &self,
        operation: &O,
        config: &EffectConfig,
        cancel: &CancellationSignal,
    ) -> Result<EffectOutcome, EffectError>
    where
        O: EffectOperation + ?Sized,
    {
        let name = operation.name().to_string();
        let breaker_key = config.circuit_breaker_key.as_deref();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(EffectError::Cancelled {
                    operation: name,
                    attempts: attempt,
                    compensation: None,
                });
            }

            let permit = match breaker_key {
                Some(key) => match self.breakers.acquire(key).await {
                    Admission::Rejected { remaining } => {
                        tracing::warn!(
                            operation = %name,
                            key = %key,
                            remaining_ms = remaining.as_millis() as u64,
                            "Circuit open, attempt rejected"
                        );
                        return Err(circuit_open(name, key, attempt, history));
                    }
                    admission => admission.permit(),
                },
                None => None,
            };

            let mut ctx = AttemptContext {
                operation: name.clone(),
                attempt,
                transaction: config.transactional.then(|| self.transactions.begin()),
                manager: self.transactions.clone(),
            };

            tracing::debug!(operation = %name, attempt = attempt, "Attempt started");
            let result = tokio::select! {
                result = run_attempt(operation, &mut ctx, config.attempt_timeout) => Some(result),
                _ = cancel.cancelled() => None,
            };

            let Some(result) = result else {
                if let (Some(key), Some(permit)) = (breaker_key, permit) {
                    if permit.is_trial() {
                        self.breakers.abandon_trial(key, permit).await;
                    }
                }
                let (_, compensation) = self.unwind(&mut ctx).await;
                tracing::info!(operation = %name, attempt = attempt, "Attempt cancelled");
                return Err(EffectError::Cancelled {
                    operation: name,
                    attempts: attempt + 1,
                    compensation,
                });
            };

            match result {
                Ok(value) => {
                    if let Some(transaction) = ctx.transaction.as_mut() {
                        if let Err(e) = self.transactions.commit(transaction) {
                            tracing::warn!(operation = %name, error = %e, "Commit after success failed");
                        }
                    }
                    if let (Some(key), Some(permit)) = (breaker_key, permit) {
                        self.breakers.record_success(key, permit).await;
                    }
                    return Ok(EffectOutcome {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(failure) => {
                    let (rolled_back, compensation) = self.unwind(&mut ctx).await;
                    if let (Some(key), Some(permit)) = (breaker_key, permit) {
                        self.breakers.record_failure(key, permit).await;
                    }

                    // An incomplete rollback leaves unknown state behind; stop retrying
                    let retry = failure.kind().is_retryable()
                        && attempt < config.max_retries
                        && compensation.is_none();

                    if !retry {
                        history.push(AttemptRecord {
                            attempt,
                            kind: failure.kind(),
                            error: failure.to_string(),
                            delay_ms: None,
                            rolled_back,
                        });
                        tracing::error!(
                            operation = %name,
                            attempts = attempt + 1,
                            error = %failure,
                            "Operation failed"
                        );
                        return Err(EffectError::Fatal {
                            operation: name,
                            attempts: attempt + 1,
                            last_error: failure.to_string(),
                            history,
                            compensation,
                        });
                    }

                    let delay = config.backoff_delay(attempt);

                    // Don't sleep just to be turned away by a breaker still cooling down
                    if let Some(key) = breaker_key {
                        if let Some(remaining) = self.breakers.open_for(key).await {
                            if remaining > delay {
                                history.push(AttemptRecord {
                                    attempt,
                                    kind: failure.kind(),
                                    error: failure.to_string(),
                                    delay_ms: None,
                                    rolled_back,
                                });
                                tracing::warn!(
                                    operation = %name,
                                    key = %key,
                                    attempts = attempt + 1,
                                    remaining_ms = remaining.as_millis() as u64,
                                    "Circuit opened during retries"
                                );
                                return Err(circuit_open(name, key, attempt + 1, history));
                            }
                        }
                    }

                    let delay_ms = delay.as_millis() as u64;
                    history.push(AttemptRecord {
                        attempt,
                        kind: failure.kind(),
                        error: failure.to_string(),
                        delay_ms: Some(delay_ms),
                        rolled_back,
                    });
                    self.sink.record(Observation::RetryScheduled {
                        operation: name.clone(),
                        attempt: attempt + 1,
                        delay_ms,
                        error: failure.to_string(),
                    });

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(EffectError::Cancelled {
                                operation: name,
                                attempts: attempt + 1,
                                compensation: None,
                            });
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Roll back whatever the attempt registered.
    /// Returns whether anything was compensated and any compensation failure.
    async fn unwind(&self, ctx: &mut AttemptContext) -> (bool, Option<CompensationFailure>) {
        let Some(transaction) = ctx.transaction.as_mut() else {
            return (false, None);
        };
        let had_operations = !transaction.is_empty();
        match self.transactions.rollback(transaction).await {
            Ok(_) => (had_operations, None),
            Err(TransactionError::Compensation(failure)) => (had_operations, Some(failure)),
            Err(e) => {
                tracing::warn!(operation = %ctx.operation, error = %e, "Rollback skipped");
                (false, None)
            }
        }
    }
}

impl Default for EffectRunner {
    fn default() -> Self {
        Self::new(Arc::new(CircuitBreakerRegistry::default()))
    }
}

fn circuit_open(operation: String, key: &str, attempts: u32, history: Vec<AttemptRecord>) -> EffectError {
    EffectError::CircuitOpen {
        operation,
        key: key.to_string(),
        attempts,
        last_error: history.last().map(|record| record.error.clone()),
        history,
    }
}

async fn run_attempt<O>(
    operation: &O,
    ctx: &mut AttemptContext,
    timeout: Option<Duration>,
) -> Result<Value, EffectFailure>
where
    O: EffectOperation + ?Sized,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation.run(ctx))
            .await
            .unwrap_or_else(|_| {
                Err(EffectFailure::transient(format!(
                    "attempt timed out after {}ms",
                    limit.as_millis()
                )))
            }),
        None => operation.run(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::error::ErrorKind;
    use crate::services::RecordingSink;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails `failures` times with the given classification, then succeeds
    struct Flaky {
        failures: u32,
        transient: bool,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures,
                transient,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EffectOperation for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, _ctx: &mut AttemptContext) -> Result<Value, EffectFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.transient {
                    Err(EffectFailure::transient("connection reset"))
                } else {
                    Err(EffectFailure::fatal("invalid input"))
                }
            } else {
                Ok(json!({"call": call}))
            }
        }
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = EffectConfig::default()
            .with_delays(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(64), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let runner = EffectRunner::default();
        let op = Flaky::new(2, true);

        let outcome = runner.execute(&op, &EffectConfig::default()).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.value, json!({"call": 2}));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let runner = EffectRunner::default();
        let op = Flaky::new(5, false);

        let err = runner.execute(&op, &EffectConfig::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalFailure);
        assert_eq!(err.attempts(), 1);
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_keep_history() {
        let sink = Arc::new(RecordingSink::new());
        let runner = EffectRunner::default().with_sink(sink.clone());
        let op = Flaky::new(10, true);
        let config = EffectConfig::default().with_max_retries(2);

        let err = runner.execute(&op, &config).await.unwrap_err();
        match err {
            EffectError::Fatal {
                attempts, history, ..
            } => {
                assert_eq!(attempts, 3);
                let delays: Vec<Option<u64>> = history.iter().map(|h| h.delay_ms).collect();
                assert_eq!(delays, vec![Some(100), Some(200), None]);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            sink.count(|o| matches!(o, Observation::RetryScheduled { .. })),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_transient() {
        let runner = EffectRunner::default();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let op = operation_fn("slow", move |attempt| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(json!("done"))
            }
        });
        let config = EffectConfig::default().with_attempt_timeout(Duration::from_secs(1));

        let outcome = runner.execute(&op, &config).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct PartialWriter {
        undone: Arc<Mutex<Vec<String>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EffectOperation for PartialWriter {
        fn name(&self) -> &str {
            "partial_writer"
        }

        async fn run(&self, ctx: &mut AttemptContext) -> Result<Value, EffectFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let undone = self.undone.clone();
            let label = format!("chunk-{}", call);
            ctx.register(
                label.clone(),
                json!({"call": call}),
                Compensation::sync(move || {
                    undone.lock().unwrap().push(label);
                    Ok(())
                }),
            )?;
            if call == 0 {
                Err(EffectFailure::transient("write interrupted"))
            } else {
                Ok(json!("written"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transactional_attempt_rolls_back_before_retry() {
        let runner = EffectRunner::default();
        let op = PartialWriter {
            undone: Arc::new(Mutex::new(Vec::new())),
            calls: AtomicU32::new(0),
        };

        let outcome = runner
            .execute(&op, &EffectConfig::default().transactional())
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        // Only the failed attempt is compensated; the successful one commits
        assert_eq!(*op.undone.lock().unwrap(), vec!["chunk-0"]);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            threshold: 1,
            cooldown: Duration::from_secs(60),
        }));
        let runner = EffectRunner::new(breakers.clone());
        let config = EffectConfig::default()
            .with_max_retries(0)
            .with_circuit_breaker("payments");

        let failing = Flaky::new(10, true);
        let err = runner.execute(&failing, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalFailure);
        assert_eq!(breakers.state("payments").await, CircuitState::Open);

        let healthy = Flaky::new(0, true);
        let err = runner.execute(&healthy, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let runner = EffectRunner::default();
        let op = Flaky::new(10, true);
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = runner
            .execute_with_cancel(&op, &EffectConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_keeps_history() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            threshold: 2,
            cooldown: Duration::from_secs(60),
        }));
        let runner = EffectRunner::new(breakers);
        let op = Flaky::new(10, true);
        let config = EffectConfig::default()
            .with_max_retries(5)
            .with_circuit_breaker("svc");

        let started = tokio::time::Instant::now();
        let err = runner.execute(&op, &config).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.attempts(), 2);
        assert_eq!(op.calls.load(Ordering::SeqCst), 2);
        // Only the first backoff is slept; the open breaker ends the run before the second
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert!(err.to_string().contains("connection reset"));
        match err {
            EffectError::CircuitOpen {
                last_error, history, ..
            } => {
                assert_eq!(last_error.as_deref(), Some("transient failure: connection reset"));
                let delays: Vec<Option<u64>> = history.iter().map(|h| h.delay_ms).collect();
                assert_eq!(delays, vec![Some(100), None]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_success_does_not_close_breaker_opened_meanwhile() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            threshold: 1,
            cooldown: Duration::from_secs(60),
        }));
        let runner = EffectRunner::new(breakers.clone());
        let config = EffectConfig::default()
            .with_max_retries(0)
            .with_circuit_breaker("svc");

        let slow = operation_fn("slow", |_attempt| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("late"))
        });
        let failing = Flaky::new(1, true);
        let (late, failed) = tokio::join!(
            runner.execute(&slow, &config),
            runner.execute(&failing, &config)
        );
        assert!(late.is_ok());
        assert_eq!(failed.unwrap_err().kind(), ErrorKind::FatalFailure);
        assert_eq!(breakers.state("svc").await, CircuitState::Open);

        let healthy = Flaky::new(0, true);
        let err = runner.execute(&healthy, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);
    }

    struct Hanging {
        undone: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EffectOperation for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn run(&self, ctx: &mut AttemptContext) -> Result<Value, EffectFailure> {
            let undone = self.undone.clone();
            ctx.register(
                "reserve",
                json!({}),
                Compensation::sync(move || {
                    undone.lock().unwrap().push("undo".to_string());
                    Ok(())
                }),
            )?;
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("reserved"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_attempt_rolls_back_transaction() {
        let runner = EffectRunner::default();
        let op = Hanging {
            undone: Arc::new(Mutex::new(Vec::new())),
        };
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let err = runner
            .execute_with_cancel(&op, &EffectConfig::default().transactional(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.attempts(), 1);
        assert!(err.compensation().is_none());
        assert_eq!(*op.undone.lock().unwrap(), vec!["undo"]);
    }
}
