use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::{
    QueueError, QueueResult, JobError,
    handler::{FnHandler, HandlerCtx, Job, JobHandler, TypedHandler},
};

/// A registered capability for one job kind
#[derive(Clone)]
pub struct Registration {
    handler: Arc<dyn JobHandler>,
    max_attempts: Option<u32>,
}

impl Registration {
    pub fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.handler)
    }

    /// Per-kind retry ceiling, if one was registered
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        self.handler.validate(payload)
    }
}

/// Map from job kind to handler, populated at startup and shared read-only
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type-erased handler under `kind`
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) -> QueueResult<()> {
        self.insert(kind.into(), handler, None)
    }

    /// Register a typed job together with the context it executes in
    pub fn register_job<J: Job>(&mut self, context: J::Context) -> QueueResult<()> {
        self.insert(J::KIND.to_string(), Arc::new(TypedHandler::<J>::new(context)), J::MAX_ATTEMPTS)
    }

    /// Register an async function value; payloads are accepted unchecked
    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, func: F) -> QueueResult<()>
    where
        F: Fn(HandlerCtx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        self.insert(kind.into(), Arc::new(FnHandler::new(func)), None)
    }

    /// Override the retry ceiling for an already registered kind
    pub fn with_max_attempts(&mut self, kind: &str, max_attempts: u32) -> QueueResult<()> {
        if max_attempts == 0 {
            return Err(QueueError::Config(format!("max_attempts for '{}' must be at least 1", kind)));
        }
        let registration = self
            .handlers
            .get_mut(kind)
            .ok_or_else(|| QueueError::KindNotRegistered(kind.to_string()))?;
        registration.max_attempts = Some(max_attempts);
        Ok(())
    }

    fn insert(&mut self, kind: String, handler: Arc<dyn JobHandler>, max_attempts: Option<u32>) -> QueueResult<()> {
        if kind.trim().is_empty() {
            return Err(QueueError::Config("job kind must not be empty".to_string()));
        }
        if max_attempts == Some(0) {
            return Err(QueueError::Config(format!("max_attempts for '{}' must be at least 1", kind)));
        }
        if self.handlers.contains_key(&kind) {
            return Err(QueueError::Config(format!("Job kind '{}' already registered", kind)));
        }

        self.handlers.insert(kind, Registration { handler, max_attempts });
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&Registration> {
        self.handlers.get(kind)
    }

    /// Check if a kind is registered
    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// All registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobId;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct GradeJob {
        submission: String,
        answers: Vec<u32>,
    }

    #[async_trait::async_trait]
    impl Job for GradeJob {
        type Context = u32;
        type Output = Value;

        const KIND: &'static str = "grade";
        const MAX_ATTEMPTS: Option<u32> = Some(5);

        async fn execute(&self, max_score: Self::Context, _job: &HandlerCtx) -> Result<Self::Output, JobError> {
            let score: u32 = self.answers.iter().sum::<u32>().min(max_score);
            Ok(json!({ "submission": self.submission, "score": score }))
        }
    }

    fn ctx(kind: &str) -> HandlerCtx {
        HandlerCtx {
            job_id: JobId::new(),
            kind: kind.to_string(),
            attempt: 1,
            max_attempts: 3,
            requester: None,
        }
    }

    #[tokio::test]
    async fn test_typed_job_registration_and_run() {
        let mut registry = HandlerRegistry::new();
        registry.register_job::<GradeJob>(10).unwrap();

        let registration = registry.get("grade").unwrap();
        assert_eq!(registration.max_attempts(), Some(5));

        let payload = json!({"submission": "s-1", "answers": [3, 4, 9]});
        assert!(registration.validate(&payload).is_ok());

        let output = registration.handler().run(ctx("grade"), payload).await.unwrap();
        assert_eq!(output, json!({"submission": "s-1", "score": 10}));
    }

    #[tokio::test]
    async fn test_typed_job_rejects_bad_shape() {
        let mut registry = HandlerRegistry::new();
        registry.register_job::<GradeJob>(10).unwrap();
        let registration = registry.get("grade").unwrap();

        let bad = json!({"submission": 12});
        assert!(registration.validate(&bad).is_err());

        let result = registration.handler().run(ctx("grade"), bad).await;
        assert!(matches!(result, Err(JobError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("echo", |ctx: HandlerCtx, payload: Value| async move {
                Ok::<_, JobError>(json!({ "attempt": ctx.attempt, "payload": payload }))
            })
            .unwrap();

        let handler = registry.get("echo").unwrap().handler();
        let output = handler.run(ctx("echo"), json!("hi")).await.unwrap();
        assert_eq!(output, json!({"attempt": 1, "payload": "hi"}));
    }

    #[test]
    fn test_duplicate_and_invalid_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register_job::<GradeJob>(10).unwrap();
        assert!(matches!(registry.register_job::<GradeJob>(10), Err(QueueError::Config(_))));

        let noop = |_: HandlerCtx, _: Value| async { Ok::<_, JobError>(Value::Null) };
        assert!(registry.register_fn("  ", noop).is_err());
        registry.register("echo", Arc::new(FnHandler::new(noop))).unwrap();
        assert!(registry.with_max_attempts("echo", 0).is_err());
        assert!(matches!(
            registry.with_max_attempts("missing", 2),
            Err(QueueError::KindNotRegistered(_))
        ));
        registry.with_max_attempts("echo", 7).unwrap();
        assert_eq!(registry.get("echo").unwrap().max_attempts(), Some(7));

        assert_eq!(registry.kinds(), vec!["echo".to_string(), "grade".to_string()]);
        assert!(registry.is_registered("grade"));
        assert!(!registry.is_registered("explain"));
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let ctx = ctx("grade");
        assert_eq!(ctx.idempotency_key(), format!("grade:{}", ctx.job_id));
        assert!(!ctx.is_final_attempt());
    }
}
