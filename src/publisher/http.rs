use super::{BatchPublisher, PublishError};
use crate::aggregation::types::FinalizedBatch;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// POSTs each batch as JSON to an external queue endpoint.
#[derive(Clone)]
pub struct HttpPublisher {
    client: reqwest::Client,
    url: String,
}

impl HttpPublisher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url.trim().to_string();
        if url.is_empty() {
            anyhow::bail!("publisher URL is empty");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build publisher HTTP client")?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BatchPublisher for HttpPublisher {
    fn name(&self) -> &str {
        "http"
    }

    async fn publish(&self, batch: &FinalizedBatch) -> Result<(), PublishError> {
        let resp = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_KEY_HEADER, &batch.idempotency_key)
            .json(batch)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        let detail = format!("{status}: {}", body.trim());
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(PublishError::Rejected(detail))
        } else {
            Err(PublishError::Transport(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::types::{ArrivalEvent, GroupKey, MessageGroup};
    use chrono::Utc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn batch() -> FinalizedBatch {
        let now = Utc::now();
        let group = MessageGroup::open(
            GroupKey::new("k"),
            ArrivalEvent::new("+1", "media/a.jpg", now).with_text("hello"),
            now,
        );
        FinalizedBatch::from_group(&group, 3, now)
    }

    fn publisher(server: &MockServer) -> HttpPublisher {
        HttpPublisher::new(&format!("{}/batches", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn posts_batch_with_idempotency_header() {
        let server = MockServer::start().await;
        let batch = batch();
        Mock::given(method("POST"))
            .and(path("/batches"))
            .and(header(IDEMPOTENCY_KEY_HEADER, batch.idempotency_key.as_str()))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        publisher(&server).publish(&batch).await.unwrap();

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["sender_id"], "+1");
        assert_eq!(body["items"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn client_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad batch"))
            .mount(&server)
            .await;

        let err = publisher(&server).publish(&batch()).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected(ref m) if m.contains("bad batch")));
    }

    #[tokio::test]
    async fn server_error_and_throttling_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let publisher = publisher(&server);
        assert!(publisher.publish(&batch()).await.unwrap_err().is_retryable());
        assert!(publisher.publish(&batch()).await.unwrap_err().is_retryable());
    }

    #[test]
    fn empty_url_is_refused() {
        assert!(HttpPublisher::new("  ", Duration::from_secs(1)).is_err());
    }
}
