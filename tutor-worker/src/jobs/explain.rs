use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tutor_queue::{HandlerCtx, Job, JobError};

use super::ModelContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationLevel {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

/// Write a worked explanation of a question for a student
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerateExplanation {
    pub topic: String,
    pub question: String,
    #[serde(default)]
    pub level: ExplanationLevel,
    #[serde(default)]
    pub max_words: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub text: String,
    #[serde(default)]
    pub references: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

/// Reply body expected from the model
#[derive(Deserialize)]
struct ModelReply {
    text: String,
    #[serde(default)]
    references: Vec<String>,
}

#[async_trait]
impl Job for GenerateExplanation {
    type Context = ModelContext;
    type Output = Explanation;

    const KIND: &'static str = "generate-explanation";

    async fn execute(&self, model: Self::Context, job: &HandlerCtx) -> Result<Explanation, JobError> {
        if self.question.trim().is_empty() {
            return Err(JobError::permanent("question is empty"));
        }
        if self.max_words == Some(0) {
            return Err(JobError::permanent("maxWords must be positive"));
        }

        let request = json!({
            "topic": self.topic,
            "question": self.question,
            "level": self.level,
            "maxWords": self.max_words,
        });
        let reply = model.invoke("explain", request, &job.idempotency_key()).await?;

        let reply: ModelReply = serde_json::from_value(reply)
            .map_err(|e| JobError::retryable(format!("model returned a malformed explanation: {}", e)))?;
        if reply.text.trim().is_empty() {
            return Err(JobError::retryable("model returned an empty explanation"));
        }

        Ok(Explanation {
            text: reply.text,
            references: reply.references,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::ScriptedModel;
    use std::sync::Arc;
    use tutor_queue::JobId;

    fn ctx() -> HandlerCtx {
        HandlerCtx {
            job_id: JobId::from("job-3"),
            kind: GenerateExplanation::KIND.to_string(),
            attempt: 1,
            max_attempts: 3,
            requester: None,
        }
    }

    fn job() -> GenerateExplanation {
        serde_json::from_value(json!({
            "topic": "limits",
            "question": "Why is sin(x)/x -> 1 as x -> 0?"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_explains_through_model() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(json!({
            "text": "Squeeze it between cos(x) and 1.",
            "references": ["Stewart 2.3"]
        }))]));

        let explanation = job().execute(model.clone(), &ctx()).await.unwrap();
        assert_eq!(explanation.text, "Squeeze it between cos(x) and 1.");
        assert_eq!(explanation.references, vec!["Stewart 2.3"]);

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls[0].0, "explain");
        assert_eq!(calls[0].1["level"], "intermediate");
        assert_eq!(calls[0].2, "generate-explanation:job-3");
    }

    #[tokio::test]
    async fn test_blank_reply_is_retried() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(json!({"text": "  "}))]));
        let error = job().execute(model, &ctx()).await.unwrap_err();
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let model = Arc::new(ScriptedModel::default());
        let mut blank = job();
        blank.question = " ".to_string();
        assert!(!blank.execute(model.clone(), &ctx()).await.unwrap_err().is_retryable());

        let mut zero = job();
        zero.max_words = Some(0);
        assert!(!zero.execute(model.clone(), &ctx()).await.unwrap_err().is_retryable());
        assert_eq!(model.call_count(), 0);
    }

    #[test]
    fn test_level_parsing() {
        let advanced: GenerateExplanation = serde_json::from_value(json!({
            "topic": "series",
            "question": "Does 1/n converge?",
            "level": "advanced",
            "maxWords": 200
        }))
        .unwrap();
        assert_eq!(advanced.level, ExplanationLevel::Advanced);
        assert_eq!(advanced.max_words, Some(200));

        let bogus = serde_json::from_value::<GenerateExplanation>(json!({
            "topic": "series",
            "question": "?",
            "level": "expert"
        }));
        assert!(bogus.is_err());
    }
}
