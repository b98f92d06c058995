//! Compensation-based transactions
//!
//! A [`Transaction`] records operations together with the closure that undoes
//! each of them. Rollback runs those closures newest-first and keeps going
//! when one fails, so every registered compensation gets its chance.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use uuid::Uuid;

use crate::error::{CompensationError, CompensationFailure, TransactionError};
use crate::services::{default_sink, Observation, SharedSink};

/// Future produced by a compensation
pub type CompensationFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Undo action for one registered operation; runs at most once
pub struct Compensation(Box<dyn FnOnce() -> CompensationFuture + Send>);

impl Compensation {
    pub fn new<F, Fut>(undo: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(undo())))
    }

    /// Compensation with a synchronous body
    pub fn sync<F>(undo: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self::new(move || async move { undo() })
    }

    fn run(self) -> CompensationFuture {
        (self.0)()
    }
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Compensation(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Open => "open",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Operation registered in a transaction
#[derive(Debug)]
pub struct RegisteredOperation {
    pub name: String,
    pub data: Value,
    compensation: Option<Compensation>,
}

/// Ordered log of compensable operations.
///
/// Dropping an open transaction that still holds compensations schedules its
/// rollback on the current tokio runtime.
pub struct Transaction {
    id: Uuid,
    state: TransactionState,
    operations: Vec<RegisteredOperation>,
    started_at: DateTime<Utc>,
    sink: SharedSink,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operation_names(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.name.as_str()).collect()
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransactionError::NotOpen {
                id: self.id,
                state: self.state.to_string(),
            })
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("operations", &self.operation_names())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Open
            || self.operations.iter().all(|op| op.compensation.is_none())
        {
            return;
        }

        let operations = std::mem::take(&mut self.operations);
        let id = self.id;
        let sink = self.sink.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(transaction_id = %id, "Open transaction dropped, rolling back");
                handle.spawn(async move {
                    if let Err(failure) = run_compensations(id, operations, &sink).await {
                        tracing::error!(transaction_id = %id, error = %failure, "Background rollback incomplete");
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    transaction_id = %id,
                    operations = operations.len(),
                    "Open transaction dropped outside a runtime; compensations not run"
                );
            }
        }
    }
}

/// Creates and settles transactions
#[derive(Clone)]
pub struct TransactionManager {
    sink: SharedSink,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn begin(&self) -> Transaction {
        let transaction = Transaction {
            id: Uuid::new_v4(),
            state: TransactionState::Open,
            operations: Vec::new(),
            started_at: Utc::now(),
            sink: self.sink.clone(),
        };
        tracing::debug!(transaction_id = %transaction.id, "Transaction started");
        transaction
    }

    /// Record an operation and the compensation that undoes it
    pub fn add_operation(
        &self,
        transaction: &mut Transaction,
        name: impl Into<String>,
        data: Value,
        compensation: Option<Compensation>,
    ) -> Result<(), TransactionError> {
        transaction.ensure_open()?;
        let name = name.into();
        tracing::trace!(transaction_id = %transaction.id, operation = %name, "Operation registered");
        transaction.operations.push(RegisteredOperation {
            name,
            data,
            compensation,
        });
        Ok(())
    }

    /// Discard compensations; the registered work stands
    pub fn commit(&self, transaction: &mut Transaction) -> Result<(), TransactionError> {
        transaction.ensure_open()?;
        let operations = std::mem::take(&mut transaction.operations);
        transaction.state = TransactionState::Committed;
        self.sink.record(Observation::TransactionCommitted {
            transaction_id: transaction.id,
            operations: operations.len(),
        });
        Ok(())
    }

    /// Run every compensation in reverse registration order.
    ///
    /// Returns the number of compensations executed. Failures do not stop the
    /// remaining compensations; they are aggregated into one error.
    pub async fn rollback(&self, transaction: &mut Transaction) -> Result<usize, TransactionError> {
        transaction.ensure_open()?;
        let operations = std::mem::take(&mut transaction.operations);
        transaction.state = TransactionState::RolledBack;
        let executed = run_compensations(transaction.id, operations, &self.sink).await?;
        Ok(executed)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_compensations(
    transaction_id: Uuid,
    operations: Vec<RegisteredOperation>,
    sink: &SharedSink,
) -> Result<usize, CompensationFailure> {
    let mut executed = 0;
    let mut failures = Vec::new();

    for operation in operations.into_iter().rev() {
        let Some(compensation) = operation.compensation else {
            continue;
        };
        executed += 1;
        if let Err(e) = compensation.run().await {
            tracing::warn!(
                transaction_id = %transaction_id,
                operation = %operation.name,
                error = %e,
                "Compensation failed"
            );
            failures.push(CompensationError {
                operation: operation.name,
                message: format!("{:#}", e),
            });
        }
    }

    sink.record(Observation::TransactionRolledBack {
        transaction_id,
        compensations: executed,
        failures: failures.len(),
    });

    if failures.is_empty() {
        Ok(executed)
    } else {
        Err(CompensationFailure {
            transaction_id,
            executed,
            failures,
        })
    }
}
