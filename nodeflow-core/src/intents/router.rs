//! Dispatch of intents to effect handlers

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::effects::{AttemptContext, CancellationSignal, EffectConfig, EffectOperation, EffectRunner};
use crate::error::{EffectError, EffectFailure, RoutingError};
use crate::intents::queue::{dispatch_order, IntentQueue};
use crate::models::Intent;
use crate::services::{default_sink, Observation, SharedSink};

/// Performs the side effect an intent describes
#[async_trait]
pub trait EffectHandler: Send + Sync {
    async fn handle(&self, intent: &Intent, ctx: &mut AttemptContext) -> Result<Value, EffectFailure>;
}

/// Handler backed by a closure over an owned intent
pub struct FnHandler<F> {
    body: F,
}

pub fn handler_fn<F, Fut>(body: F) -> FnHandler<F>
where
    F: Fn(Intent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EffectFailure>> + Send + 'static,
{
    FnHandler { body }
}

#[async_trait]
impl<F, Fut> EffectHandler for FnHandler<F>
where
    F: Fn(Intent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EffectFailure>> + Send + 'static,
{
    async fn handle(&self, intent: &Intent, _ctx: &mut AttemptContext) -> Result<Value, EffectFailure> {
        (self.body)(intent.clone()).await
    }
}

/// Adapts one intent + handler pair to the runner
struct IntentOperation<'a> {
    name: String,
    intent: &'a Intent,
    handler: &'a dyn EffectHandler,
}

#[async_trait]
impl EffectOperation for IntentOperation<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut AttemptContext) -> Result<Value, EffectFailure> {
        self.handler.handle(self.intent, ctx).await
    }
}

#[derive(Clone)]
struct Route {
    handler: Arc<dyn EffectHandler>,
    config: Option<EffectConfig>,
}

/// Intent that reached its handler and succeeded
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub intent: Intent,
    pub value: Value,
    pub attempts: u32,
}

/// Intent that could not be dispatched successfully
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub intent: Intent,
    pub error: RoutingError,
}

/// Outcome of routing one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingReport {
    pub dispatched: Vec<Dispatched>,
    pub failures: Vec<DispatchFailure>,
    /// Intents never attempted because routing stopped early
    pub aborted: Vec<Intent>,
}

impl RoutingReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_empty()
    }

    pub fn unroutable(&self) -> impl Iterator<Item = &Intent> {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, RoutingError::UnroutableIntent { .. }))
            .map(|f| &f.intent)
    }

    pub fn was_cancelled(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f.error, RoutingError::Cancelled { .. }))
    }
}

/// Routes intents by type to registered handlers, each call wrapped in the runner
#[derive(Clone)]
pub struct IntentRouter {
    routes: HashMap<String, Route>,
    runner: EffectRunner,
    default_config: EffectConfig,
    fail_fast: bool,
    sink: SharedSink,
}

impl IntentRouter {
    pub fn new(runner: EffectRunner) -> Self {
        Self {
            routes: HashMap::new(),
            runner,
            default_config: EffectConfig::default(),
            fail_fast: false,
            sink: default_sink(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Stop routing at the first failure instead of continuing
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Effect configuration for handlers registered without their own
    pub fn with_default_config(mut self, config: EffectConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn with_handler<H>(mut self, intent_type: impl Into<String>, handler: H) -> Self
    where
        H: EffectHandler + 'static,
    {
        self.routes.insert(
            intent_type.into(),
            Route {
                handler: Arc::new(handler),
                config: None,
            },
        );
        self
    }

    pub fn with_handler_config<H>(
        mut self,
        intent_type: impl Into<String>,
        handler: H,
        config: EffectConfig,
    ) -> Self
    where
        H: EffectHandler + 'static,
    {
        self.routes.insert(
            intent_type.into(),
            Route {
                handler: Arc::new(handler),
                config: Some(config),
            },
        );
        self
    }

    pub fn handles(&self, intent_type: &str) -> bool {
        self.routes.contains_key(intent_type)
    }

    pub async fn route(&self, intents: Vec<Intent>) -> RoutingReport {
        self.route_with_cancel(intents, &CancellationSignal::new())
            .await
    }

    /// Drain `queue` and route everything it held
    pub async fn route_queue(&self, queue: &mut IntentQueue) -> RoutingReport {
        self.route(queue.drain()).await
    }

    pub async fn route_with_cancel(
        &self,
        intents: Vec<Intent>,
        cancel: &CancellationSignal,
    ) -> RoutingReport {
        let mut report = RoutingReport::default();
        let mut pending = dispatch_order(intents).into_iter();

        while let Some(intent) = pending.next() {
            if cancel.is_cancelled() {
                report.aborted.push(intent);
                report.aborted.extend(pending);
                break;
            }

            let Some(route) = self.routes.get(&intent.intent_type) else {
                self.sink.record(Observation::IntentUnroutable {
                    intent_type: intent.intent_type.clone(),
                    target: intent.target.clone(),
                });
                report.failures.push(DispatchFailure {
                    error: RoutingError::UnroutableIntent {
                        intent_type: intent.intent_type.clone(),
                        target: intent.target.clone(),
                    },
                    intent,
                });
                if self.fail_fast {
                    report.aborted.extend(pending);
                    break;
                }
                continue;
            };

            let result = {
                let operation = IntentOperation {
                    name: format!("{}:{}", intent.intent_type, intent.target),
                    intent: &intent,
                    handler: route.handler.as_ref(),
                };
                let config = route.config.as_ref().unwrap_or(&self.default_config);
                self.runner.execute_with_cancel(&operation, config, cancel).await
            };

            let (success, attempts) = match &result {
                Ok(outcome) => (true, outcome.attempts),
                Err(e) => (false, e.attempts()),
            };
            self.sink.record(Observation::IntentRouted {
                intent_type: intent.intent_type.clone(),
                target: intent.target.clone(),
                priority: intent.priority,
                success,
                attempts,
            });

            match result {
                Ok(outcome) => report.dispatched.push(Dispatched {
                    intent,
                    value: outcome.value,
                    attempts: outcome.attempts,
                }),
                Err(EffectError::Cancelled { .. }) => {
                    report.failures.push(DispatchFailure {
                        error: RoutingError::Cancelled {
                            intent_type: intent.intent_type.clone(),
                            target: intent.target.clone(),
                        },
                        intent,
                    });
                    report.aborted.extend(pending);
                    break;
                }
                Err(source) => {
                    report.failures.push(DispatchFailure {
                        error: RoutingError::Effect {
                            intent_type: intent.intent_type.clone(),
                            target: intent.target.clone(),
                            source,
                        },
                        intent,
                    });
                    if self.fail_fast {
                        report.aborted.extend(pending);
                        break;
                    }
                }
            }
        }

        report
    }
}
