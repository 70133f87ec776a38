use tracing::debug;

use crate::decoder::decode_byte_stream;
use crate::errors::{SupervisorError, TransportError};

use super::config::EndpointConfig;
use super::{EventSource, GenerationEndpoint, GenerationRequest};

/// Streams replies from the assistant API's server-sent-event chat route.
pub struct HttpEndpoint {
    client: reqwest::Client,
    config: EndpointConfig,
}

impl HttpEndpoint {
    pub fn new(config: EndpointConfig) -> Result<Self, SupervisorError> {
        if config.base_url.trim().is_empty() {
            return Err(SupervisorError::Config(
                "endpoint base_url must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SupervisorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates an endpoint from `HEARTH_API_URL` / `HEARTH_API_TOKEN`.
    pub fn from_env() -> Result<Self, SupervisorError> {
        Self::new(EndpointConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl GenerationEndpoint for HttpEndpoint {
    async fn open(&self, request: GenerationRequest) -> Result<EventSource, TransportError> {
        debug!(turn_id = %request.turn_id, url = %self.config.message_url(), "opening chat stream");

        let mut http_req = self
            .client
            .post(self.config.message_url())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request);
        if let Some(token) = self.config.api_token.as_ref() {
            http_req = http_req.bearer_auth(token);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("chat request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(decode_byte_stream(Box::pin(response.bytes_stream()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_message_and_optional_conversation() {
        let request = GenerationRequest {
            turn_id: uuid::Uuid::new_v4(),
            message: "What's for dinner?".into(),
            conversation_id: None,
        };
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body, serde_json::json!({"message": "What's for dinner?"}));

        let request = GenerationRequest {
            conversation_id: Some("family".into()),
            ..request
        };
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body["conversation_id"], "family");
    }

    #[test]
    fn rejects_empty_base_url() {
        let result = HttpEndpoint::new(EndpointConfig::new("  "));
        assert!(matches!(result, Err(SupervisorError::Config(msg)) if msg.contains("base_url")));
    }

    #[tokio::test]
    async fn env_gated_smoke_open_stream_if_url_present() {
        if std::env::var("HEARTH_API_URL")
            .unwrap_or_default()
            .trim()
            .is_empty()
        {
            eprintln!("skipping chat endpoint smoke test (HEARTH_API_URL missing)");
            return;
        }

        let endpoint = HttpEndpoint::from_env().expect("endpoint");
        let result = endpoint
            .open(GenerationRequest {
                turn_id: uuid::Uuid::new_v4(),
                message: "hello".into(),
                conversation_id: None,
            })
            .await;
        assert!(result.is_ok(), "chat endpoint smoke failed: {:?}", result.err());
    }
}
