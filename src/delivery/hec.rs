//! HTTP event collector sink

use async_trait::async_trait;

use super::DeliveryClient;
use super::envelope::{EnvelopeOptions, encode_batch};
use crate::error::Result;
use crate::types::Event;

/// Destination for batches of events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one batch in a single request
    async fn publish(&self, chunk: &[Event], token: &str, options: &EnvelopeOptions) -> Result<()>;
}

/// Event collector endpoint (`Authorization: Splunk <token>`)
#[derive(Clone, Debug)]
pub struct HecSink {
    client: DeliveryClient,
    url: String,
}

impl HecSink {
    /// Sink posting to `url` through `client`
    pub fn new(client: DeliveryClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// The collector URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSink for HecSink {
    async fn publish(&self, chunk: &[Event], token: &str, options: &EnvelopeOptions) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let body = encode_batch(chunk, options)?;
        let authorization = format!("Splunk {}", token);

        self.client
            .send(|http| {
                http.post(&self.url)
                    .header(reqwest::header::AUTHORIZATION, &authorization)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
            })
            .await?;

        tracing::debug!(url = %self.url, events = chunk.len(), "Published batch");
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::fast_config;
    use crate::error::{DeliveryError, Error};
    use serde_json::json;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink_for(server: &MockServer) -> HecSink {
        let config = fast_config(&server.uri());
        HecSink::new(DeliveryClient::new(&config).unwrap(), config.hec_url)
    }

    fn events() -> Vec<Event> {
        vec![
            Event::from_value(json!({"id": 1, "kind": "audit"})).unwrap(),
            Event::from_value(json!({"id": 2, "kind": "audit"})).unwrap(),
        ]
    }

    #[tokio::test]
    async fn test_publishes_concatenated_envelopes_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .and(header("Authorization", "Splunk secret-token"))
            .and(body_string(
                r#"{"event":{"id":1},"sourcetype":"audit"}{"event":{"id":2},"sourcetype":"audit"}"#,
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"text":"Success"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let options = EnvelopeOptions {
            time_field: None,
            category_field: Some("kind".into()),
        };
        sink_for(&server)
            .publish(&events(), "secret-token", &options)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retries_transient_status_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        sink_for(&server)
            .publish(&events(), "t", &EnvelopeOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Invalid token"))
            .expect(1)
            .mount(&server)
            .await;

        let err = sink_for(&server)
            .publish(&events(), "bad", &EnvelopeOptions::default())
            .await
            .unwrap_err();

        match err {
            Error::Delivery(DeliveryError::Status {
                status,
                body,
                transient,
                ..
            }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "Invalid token");
                assert!(!transient);
            }
            other => panic!("expected delivery status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_transient_error() {
        let server = MockServer::start().await;
        // First attempt plus two retries
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let err = sink_for(&server)
            .publish(&events(), "t", &EnvelopeOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "delivery_transient");
    }

    #[tokio::test]
    async fn test_non_200_success_codes_are_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = sink_for(&server)
            .publish(&events(), "t", &EnvelopeOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        sink_for(&server)
            .publish(&[], "t", &EnvelopeOptions::default())
            .await
            .unwrap();
    }
}
