use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use tutor_queue::JobError;

/// Remote model that performs the actual grading or writing
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run `task` on the model. The idempotency key is forwarded so the
    /// endpoint can deduplicate a request replayed after a worker crash.
    async fn invoke(&self, task: &str, request: Value, idempotency_key: &str) -> Result<Value, JobError>;
}

/// [`ModelClient`] over HTTP: `POST {endpoint}/v1/{task}` with a JSON body
pub struct HttpModelClient {
    client: Client,
    endpoint: String,
}

impl HttpModelClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, task: &str) -> String {
        format!("{}/v1/{}", self.endpoint, task)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn invoke(&self, task: &str, request: Value, idempotency_key: &str) -> Result<Value, JobError> {
        let url = self.url(task);
        debug!(url = %url, idempotency_key, "Calling model endpoint");

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", idempotency_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| JobError::retryable(format!("model response was not valid JSON: {}", e)))
    }
}

/// Map a non-success HTTP status onto the retry classification.
/// Rate limiting, request timeouts and server errors are worth another
/// attempt; any other client error means the request itself is wrong.
pub fn classify_status(status: StatusCode, body: &str) -> JobError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("model endpoint returned {}", status)
    } else {
        format!("model endpoint returned {}: {}", status, truncate(detail, 200))
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        JobError::retryable(message)
    } else {
        JobError::permanent(message)
    }
}

fn classify_transport(error: reqwest::Error) -> JobError {
    if error.is_builder() {
        JobError::permanent(format!("invalid model request: {}", error))
    } else if error.is_timeout() {
        JobError::retryable(format!("model request timed out: {}", error))
    } else {
        JobError::retryable(format!("model request failed: {}", error))
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(classify_status(status, "").is_retryable(), "{} should be retried", status);
        }
    }

    #[test]
    fn test_permanent_statuses() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            assert!(!classify_status(status, "").is_retryable(), "{} should not be retried", status);
        }
    }

    #[test]
    fn test_message_carries_body() {
        let error = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "  rubric is empty \n");
        assert_eq!(error.message(), "model endpoint returned 422 Unprocessable Entity: rubric is empty");

        let long = "x".repeat(500);
        let error = classify_status(StatusCode::BAD_GATEWAY, &long);
        assert!(error.message().len() < 300);
    }

    #[test]
    fn test_url_join() {
        let client = HttpModelClient::new("http://model:9000/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url("grade"), "http://model:9000/v1/grade");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // port 9 (discard) is not expected to accept HTTP
        let client = HttpModelClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let error = client.invoke("grade", Value::Null, "grade:1").await.unwrap_err();
        assert!(error.is_retryable());
    }
}
