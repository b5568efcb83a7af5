//! Pub/Sub message envelopes and the publisher used to fan out background work.
//!
//! Handlers are triggered by push deliveries whose payload is an opaque,
//! base64-encoded string. Delivery is at-least-once, so every consumer of these
//! messages has to tolerate duplicates.

use crate::auth::{AuthError, TokenSource};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::string::FromUtf8Error;
use std::sync::Arc;
use url::Url;

/// A single Pub/Sub message as delivered to a handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PubSubMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default, rename = "messageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl PubSubMessage {
    /// Wraps a raw payload the same way the transport does.
    pub fn from_data(data: impl AsRef<[u8]>) -> Self {
        PubSubMessage {
            data: Some(STANDARD.encode(data)),
            ..Default::default()
        }
    }

    /// Pull out and decode the payload of the message.
    pub fn decode_data(&self) -> Result<String, EnvelopeError> {
        let encoded = self.data.as_deref().ok_or(EnvelopeError::MissingData)?;
        // Some producers use MIME-style base64 with line breaks.
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD.decode(compact.as_bytes())?;
        Ok(String::from_utf8(bytes)?)
    }
}

/// Body of a push subscription delivery.
#[derive(Clone, Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PubSubMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("message has no data")]
    MissingData,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("publish request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("could not authorize publish: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid publish URL: {0}")]
    InvalidUrl(String),
    #[error("publish to {topic} rejected with status {status}")]
    Rejected { topic: String, status: StatusCode },
    #[error("publish to {0} was not acknowledged")]
    NotAcknowledged(String),
    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publishes one message and resolves once the transport acknowledged it.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the message id assigned by the transport.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, PublishError>;
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: [OutgoingMessage<'a>; 1],
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    data: &'a str,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default, rename = "messageIds")]
    message_ids: Vec<String>,
}

/// Publisher backed by the Pub/Sub REST API.
pub struct PubSubClient {
    client: reqwest::Client,
    base_url: Url,
    project: String,
    tokens: Arc<dyn TokenSource>,
}

impl PubSubClient {
    pub fn new(base_url: Url, project: String, tokens: Arc<dyn TokenSource>) -> Self {
        PubSubClient {
            client: reqwest::Client::new(),
            base_url,
            project,
            tokens,
        }
    }

    fn topic_url(&self, topic: &str) -> Result<Url, PublishError> {
        let full_url = format!(
            "{}/v1/projects/{}/topics/{}:publish",
            self.base_url.as_str().trim_end_matches('/'),
            self.project,
            topic
        );
        Url::parse(&full_url).map_err(|e| PublishError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl Publisher for PubSubClient {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<String, PublishError> {
        let url = self.topic_url(topic)?;
        let token = self.tokens.token().await?;
        let encoded = STANDARD.encode(&data);
        let body = PublishRequest {
            messages: [OutgoingMessage { data: &encoded }],
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PublishError::Rejected {
                topic: topic.to_string(),
                status: response.status(),
            });
        }

        let published = response.json::<PublishResponse>().await?;
        let message_id = published
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::NotAcknowledged(topic.to_string()))?;

        tracing::debug!(topic, message_id = %message_id, bytes = data.len(), "Published message");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_decode_data() {
        let message = PubSubMessage::from_data(r#"{"trial_id": "foo"}"#);
        assert_eq!(message.decode_data().unwrap(), r#"{"trial_id": "foo"}"#);
    }

    #[test]
    fn test_decode_mime_base64() {
        // base64.encodebytes style output, wrapped with a trailing newline
        let message = PubSubMessage {
            data: Some("eyJ0cmlhbF9pZCI6\nICJmb28ifQ==\n".into()),
            ..Default::default()
        };
        assert_eq!(message.decode_data().unwrap(), r#"{"trial_id": "foo"}"#);
    }

    #[test]
    fn test_decode_errors() {
        let missing = PubSubMessage::default();
        assert!(matches!(
            missing.decode_data(),
            Err(EnvelopeError::MissingData)
        ));

        let garbage = PubSubMessage {
            data: Some("not base64!".into()),
            ..Default::default()
        };
        assert!(matches!(
            garbage.decode_data(),
            Err(EnvelopeError::Base64(_))
        ));

        let not_utf8 = PubSubMessage::from_data([0xff, 0xfe]);
        assert!(matches!(not_utf8.decode_data(), Err(EnvelopeError::Utf8(_))));
    }

    #[test]
    fn test_push_envelope() {
        let body = r#"{
            "message": {"data": "MTIz", "attributes": {"a": "b"}, "messageId": "42"},
            "subscription": "projects/p/subscriptions/s"
        }"#;
        let envelope: PushEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.message.message_id.as_deref(), Some("42"));
        assert_eq!(envelope.message.decode_data().unwrap(), "123");
        assert_eq!(envelope.message.attributes.get("a").unwrap(), "b");
    }

    #[tokio::test]
    async fn test_publish() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/projects/cidc/topics/worker:publish"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(serde_json::json!({"messages": [{"data": "aGVsbG8="}]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"messageIds": ["7"]})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = PubSubClient::new(
            Url::parse(&mock_server.uri()).unwrap(),
            "cidc".into(),
            Arc::new(StaticToken::new("secret")),
        );
        let id = client.publish("worker", b"hello".to_vec()).await.unwrap();
        assert_eq!(id, "7");
    }

    #[test]
    fn test_topic_url_keeps_base_path() {
        for base in ["http://emulator:8085/pubsub", "http://emulator:8085/pubsub/"] {
            let client = PubSubClient::new(
                Url::parse(base).unwrap(),
                "cidc".into(),
                Arc::new(StaticToken::new("secret")),
            );
            assert_eq!(
                client.topic_url("worker").unwrap().as_str(),
                "http://emulator:8085/pubsub/v1/projects/cidc/topics/worker:publish"
            );
        }
    }

    #[tokio::test]
    async fn test_publish_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let client = PubSubClient::new(
            Url::parse(&mock_server.uri()).unwrap(),
            "cidc".into(),
            Arc::new(StaticToken::new("secret")),
        );
        let result = client.publish("worker", b"hello".to_vec()).await;
        assert!(matches!(
            result,
            Err(PublishError::Rejected { status, .. }) if status == StatusCode::FORBIDDEN
        ));
    }
}
