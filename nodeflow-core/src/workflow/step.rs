//! Step actions bound to workflow steps

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::effects::AttemptContext;
use crate::error::EffectFailure;
use crate::models::NodeKind;

/// What a step sees when it runs
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow: String,
    pub execution_id: Uuid,
    pub step_id: String,
    pub kind: NodeKind,
    /// Outputs of completed direct dependencies, by step id
    pub inputs: HashMap<String, Value>,
}

impl StepContext {
    pub fn input(&self, step_id: &str) -> Option<&Value> {
        self.inputs.get(step_id)
    }
}

/// Work performed by one workflow step
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Run the step. Effect steps get a transactional `attempt` context and may
    /// register compensations for partial work.
    async fn run(&self, ctx: &StepContext, attempt: &mut AttemptContext) -> Result<Value, EffectFailure>;

    /// Undo a completed step during recovery
    async fn compensate(&self, _ctx: &StepContext, _output: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}

type CompensateFn = Arc<dyn Fn(StepContext, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Step action built from closures
pub struct FnStep<R> {
    run: R,
    compensate: Option<CompensateFn>,
}

pub fn step_fn<R, Fut>(run: R) -> FnStep<R>
where
    R: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EffectFailure>> + Send + 'static,
{
    FnStep {
        run,
        compensate: None,
    }
}

impl<R> FnStep<R> {
    pub fn with_compensation<C, CFut>(mut self, compensate: C) -> Self
    where
        C: Fn(StepContext, Value) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx, output| Box::pin(compensate(ctx, output))));
        self
    }
}

#[async_trait]
impl<R, Fut> StepAction for FnStep<R>
where
    R: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EffectFailure>> + Send + 'static,
{
    async fn run(&self, ctx: &StepContext, _attempt: &mut AttemptContext) -> Result<Value, EffectFailure> {
        (self.run)(ctx.clone()).await
    }

    async fn compensate(&self, ctx: &StepContext, output: &Value) -> anyhow::Result<()> {
        match &self.compensate {
            Some(compensate) => compensate(ctx.clone(), output.clone()).await,
            None => Ok(()),
        }
    }
}

/// Step actions keyed by step id
#[derive(Clone, Default)]
pub struct StepRegistry {
    actions: HashMap<String, Arc<dyn StepAction>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step<A>(mut self, step_id: impl Into<String>, action: A) -> Self
    where
        A: StepAction + 'static,
    {
        self.actions.insert(step_id.into(), Arc::new(action));
        self
    }

    pub fn with_shared_step(mut self, step_id: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        self.actions.insert(step_id.into(), action);
        self
    }

    pub fn get(&self, step_id: &str) -> Option<&Arc<dyn StepAction>> {
        self.actions.get(step_id)
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.actions.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.actions.keys().collect();
        ids.sort();
        f.debug_struct("StepRegistry").field("steps", &ids).finish()
    }
}
