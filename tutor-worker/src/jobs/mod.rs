//! AI job kinds served by this worker

mod explain;
mod grade;

pub use explain::{Explanation, ExplanationLevel, GenerateExplanation};
pub use grade::{Answer, Grade, GradeProblemSet, QuestionFeedback};

use std::sync::Arc;

use tutor_queue::{HandlerRegistry, QueueResult};

use crate::model::ModelClient;

/// Shared context for every model-backed job
pub type ModelContext = Arc<dyn ModelClient>;

/// Register every job kind this worker can execute
pub fn register_all(handlers: &mut HandlerRegistry, model: ModelContext) -> QueueResult<()> {
    handlers.register_job::<GradeProblemSet>(Arc::clone(&model))?;
    handlers.register_job::<GenerateExplanation>(model)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;
    use tutor_queue::JobError;

    use crate::model::ModelClient;

    /// Model double that replays canned replies and records each request
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        replies: Mutex<VecDeque<Result<Value, JobError>>>,
        pub(crate) calls: Mutex<Vec<(String, Value, String)>>,
    }

    impl ScriptedModel {
        pub(crate) fn replying(replies: Vec<Result<Value, JobError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::default(),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn invoke(&self, task: &str, request: Value, idempotency_key: &str) -> Result<Value, JobError> {
            self.calls
                .lock()
                .unwrap()
                .push((task.to_string(), request, idempotency_key.to_string()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(JobError::permanent("no scripted reply left")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::ScriptedModel;

    #[test]
    fn test_register_all() {
        let mut handlers = HandlerRegistry::new();
        register_all(&mut handlers, Arc::new(ScriptedModel::default())).unwrap();
        assert_eq!(handlers.kinds(), vec!["generate-explanation", "grade-problem-set"]);
        assert_eq!(handlers.get("grade-problem-set").unwrap().max_attempts(), Some(4));
        assert_eq!(handlers.get("generate-explanation").unwrap().max_attempts(), None);
    }
}
