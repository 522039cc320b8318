use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use tutor_queue::{HandlerCtx, Job, JobError};

use super::ModelContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question_id: String,
    pub response: String,
}

/// Grade a student's submission for one problem set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GradeProblemSet {
    pub submission_id: String,
    pub problem_set_id: String,
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub rubric: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionFeedback {
    pub question_id: String,
    pub points: f64,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grade {
    pub submission_id: String,
    pub score: f64,
    pub max_score: f64,
    pub feedback: Vec<QuestionFeedback>,
}

#[async_trait]
impl Job for GradeProblemSet {
    type Context = ModelContext;
    type Output = Grade;

    const KIND: &'static str = "grade-problem-set";
    const MAX_ATTEMPTS: Option<u32> = Some(4);

    async fn execute(&self, model: Self::Context, job: &HandlerCtx) -> Result<Grade, JobError> {
        if self.answers.is_empty() {
            return Err(JobError::permanent("submission has no answers to grade"));
        }

        let request = json!({
            "submissionId": self.submission_id,
            "problemSetId": self.problem_set_id,
            "answers": self.answers,
            "rubric": self.rubric,
        });
        let reply = model.invoke("grade", request, &job.idempotency_key()).await?;

        let grade: Grade = serde_json::from_value(reply)
            .map_err(|e| JobError::retryable(format!("model returned a malformed grade: {}", e)))?;
        if grade.submission_id != self.submission_id {
            return Err(JobError::retryable(format!(
                "model graded submission {} instead of {}",
                grade.submission_id, self.submission_id
            )));
        }
        if grade.score < 0.0 || grade.score > grade.max_score {
            return Err(JobError::retryable(format!(
                "model score {} is outside 0..={}",
                grade.score, grade.max_score
            )));
        }

        info!(
            job_id = %job.job_id,
            submission_id = %self.submission_id,
            score = grade.score,
            max_score = grade.max_score,
            "Problem set graded"
        );
        Ok(grade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::ScriptedModel;
    use std::sync::Arc;
    use tutor_queue::JobId;

    fn job() -> GradeProblemSet {
        GradeProblemSet {
            submission_id: "sub-1".to_string(),
            problem_set_id: "calc-2".to_string(),
            answers: vec![Answer {
                question_id: "q1".to_string(),
                response: "x^2 + C".to_string(),
            }],
            rubric: None,
        }
    }

    fn ctx(attempt: u32) -> HandlerCtx {
        HandlerCtx {
            job_id: JobId::from("job-7"),
            kind: GradeProblemSet::KIND.to_string(),
            attempt,
            max_attempts: 4,
            requester: Some("course-3".to_string()),
        }
    }

    fn grade(submission_id: &str, score: f64) -> serde_json::Value {
        json!({
            "submissionId": submission_id,
            "score": score,
            "maxScore": 10.0,
            "feedback": [{"questionId": "q1", "points": score, "comment": "missing constant"}]
        })
    }

    #[tokio::test]
    async fn test_grades_through_model() {
        let model = Arc::new(ScriptedModel::replying(vec![Ok(grade("sub-1", 8.5))]));

        let result = job().execute(model.clone(), &ctx(1)).await.unwrap();
        assert_eq!(result.score, 8.5);
        assert_eq!(result.feedback.len(), 1);

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls[0].0, "grade");
        assert_eq!(calls[0].1["answers"][0]["questionId"], "q1");
        assert_eq!(calls[0].2, "grade-problem-set:job-7");
    }

    #[tokio::test]
    async fn test_empty_submission_is_permanent() {
        let model = Arc::new(ScriptedModel::default());
        let mut empty = job();
        empty.answers.clear();

        let error = empty.execute(model.clone(), &ctx(1)).await.unwrap_err();
        assert!(!error.is_retryable());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_implausible_grade_is_retried() {
        let model = Arc::new(ScriptedModel::replying(vec![
            Ok(json!({"text": "not a grade"})),
            Ok(grade("sub-2", 5.0)),
            Ok(grade("sub-1", 11.0)),
        ]));

        for _ in 0..3 {
            let error = job().execute(model.clone(), &ctx(2)).await.unwrap_err();
            assert!(error.is_retryable(), "{}", error);
        }
    }

    #[tokio::test]
    async fn test_model_errors_pass_through() {
        let model = Arc::new(ScriptedModel::replying(vec![Err(JobError::permanent("rubric rejected"))]));
        let error = job().execute(model, &ctx(1)).await.unwrap_err();
        assert_eq!(error, JobError::permanent("rubric rejected"));
    }

    #[test]
    fn test_payload_shape() {
        let parsed: GradeProblemSet = serde_json::from_value(json!({
            "submissionId": "sub-1",
            "problemSetId": "calc-2",
            "answers": [{"questionId": "q1", "response": "42"}]
        }))
        .unwrap();
        assert!(parsed.rubric.is_none());

        let unknown_field = serde_json::from_value::<GradeProblemSet>(json!({
            "submissionId": "sub-1",
            "problemSetId": "calc-2",
            "answers": [],
            "deadline": "tomorrow"
        }));
        assert!(unknown_field.is_err());
    }
}
