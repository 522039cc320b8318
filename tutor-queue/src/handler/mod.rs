pub mod registry;

pub use registry::{HandlerRegistry, Registration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;

use crate::{JobError, JobId};

/// Execution metadata handed to a handler alongside the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCtx {
    pub job_id: JobId,
    pub kind: String,
    /// 1-based attempt number of this invocation
    pub attempt: u32,
    pub max_attempts: u32,
    pub requester: Option<String>,
}

impl HandlerCtx {
    /// Stable key for deduplicating side effects across retried executions
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.kind, self.job_id)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Type-erased capability for one job kind
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Shape check run by the dispatcher before a job is accepted
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Execute the job. `Err(Retryable)` is retried with backoff,
    /// `Err(Permanent)` fails the job immediately.
    async fn run(&self, ctx: HandlerCtx, payload: Value) -> Result<Value, JobError>;
}

/// Trait for defining typed jobs; the payload is the serialized job itself
#[async_trait]
pub trait Job: Send + Sync + DeserializeOwned + 'static {
    /// Context type passed to job execution
    type Context: Send + Sync + Clone + 'static;

    /// Result type stored in the registry on success
    type Output: Send + Sync + Serialize + 'static;

    /// Kind identifier for dispatch
    const KIND: &'static str;

    /// Per-kind retry ceiling; `None` uses the configured default
    const MAX_ATTEMPTS: Option<u32> = None;

    /// Execute the job with the given context
    async fn execute(&self, ctx: Self::Context, job: &HandlerCtx) -> Result<Self::Output, JobError>;
}

/// Handler for a typed [`Job`]; a payload is valid iff it deserializes
pub(crate) struct TypedHandler<J: Job> {
    context: J::Context,
    _phantom: PhantomData<fn() -> J>,
}

impl<J: Job> TypedHandler<J> {
    pub(crate) fn new(context: J::Context) -> Self {
        Self {
            context,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job> JobHandler for TypedHandler<J> {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        J::deserialize(payload).map(|_| ()).map_err(|e| e.to_string())
    }

    async fn run(&self, ctx: HandlerCtx, payload: Value) -> Result<Value, JobError> {
        let job: J = serde_json::from_value(payload)
            .map_err(|e| JobError::Permanent(format!("Failed to deserialize job: {}", e)))?;

        let output = job.execute(self.context.clone(), &ctx).await?;

        serde_json::to_value(output)
            .map_err(|e| JobError::Permanent(format!("Failed to serialize result: {}", e)))
    }
}

/// Handler backed by a plain async function value
pub(crate) struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub(crate) fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(HandlerCtx, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn run(&self, ctx: HandlerCtx, payload: Value) -> Result<Value, JobError> {
        (self.func)(ctx, payload).await
    }
}
