//! Client for the hosted Dify chat-messages API.

use futures::Stream;
use log::info;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const CHAT_MESSAGES_ROUTE: &str = "/v1/chat-messages";

#[derive(Debug, Error)]
pub enum DifyError {
    #[error("invalid API key: {0}")]
    InvalidKey(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API returned status {0}")]
    BadStatus(StatusCode),
}

/// Outbound request body for `/v1/chat-messages`.
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub inputs: serde_json::Value,
    pub query: String,
    pub response_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub user: String,
    pub auto_generate_name: bool,
}

/// One decoded record of the streaming response body. Kinds other than the
/// three the widget understood deserialize as [`StreamEvent::Unknown`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum StreamEvent {
    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        answer: String,
    },
    #[serde(rename = "message_end")]
    MessageEnd {
        #[serde(default)]
        conversation_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Maps unrecognized kinds to `None` so callers can skip them.
    pub fn into_known(self) -> Option<Self> {
        match self {
            StreamEvent::Unknown => None,
            event => Some(event),
        }
    }
}

pub struct DifyClient {
    http: HttpClient,
    base_url: String,
}

impl DifyClient {
    /// Build a client for one API key. The bearer header is installed once;
    /// `timeout` bounds every request so a stalled upstream cannot hang a
    /// caller indefinitely.
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, DifyError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| DifyError::InvalidKey(e.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = HttpClient::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}{}", self.base_url, CHAT_MESSAGES_ROUTE)
    }

    pub(crate) fn request_body(
        query: &str,
        conversation_id: &str,
        user: &str,
        mode: &str,
    ) -> ChatRequest {
        ChatRequest {
            inputs: serde_json::json!({}),
            query: query.to_string(),
            response_mode: mode.to_string(),
            conversation_id: if conversation_id.is_empty() {
                None
            } else {
                Some(conversation_id.to_string())
            },
            user: user.to_string(),
            auto_generate_name: true,
        }
    }

    /// One-shot chat completion. The upstream JSON is passed through
    /// untouched so the relay can return it as-is.
    pub async fn chat_blocking(
        &self,
        query: &str,
        conversation_id: &str,
        user: &str,
    ) -> Result<serde_json::Value, DifyError> {
        let body = Self::request_body(query, conversation_id, user, "blocking");
        let resp = self.http.post(self.chat_url()).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            info!("Dify blocking request rejected: {}", status);
            return Err(DifyError::BadStatus(status));
        }
        Ok(resp.json().await?)
    }

    /// Start a streaming chat and return the raw response body as a byte
    /// stream for [`crate::stream::StreamConsumer`].
    pub async fn chat_stream(
        &self,
        query: &str,
        conversation_id: &str,
        user: &str,
    ) -> Result<impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin, DifyError> {
        let body = Self::request_body(query, conversation_id, user, "streaming");
        let resp = self.http.post(self.chat_url()).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            info!("Dify streaming request rejected: {}", status);
            return Err(DifyError::BadStatus(status));
        }
        Ok(resp.bytes_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_includes_assigned_conversation_id() {
        let body = DifyClient::request_body("hi", "abc", "user-1", "blocking");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"conversation_id\":\"abc\""));
        assert!(json.contains("\"response_mode\":\"blocking\""));
    }

    #[test]
    fn request_body_omits_empty_conversation_id() {
        let body = DifyClient::request_body("hi", "", "user-1", "streaming");
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("conversation_id"));
        assert!(json.contains("\"auto_generate_name\":true"));
    }

    #[test]
    fn stream_event_decodes_known_kinds() {
        let e: StreamEvent = serde_json::from_str("{\"event\":\"message\",\"answer\":\"a\"}").unwrap();
        assert!(matches!(e, StreamEvent::Message { ref answer } if answer == "a"));

        let e: StreamEvent =
            serde_json::from_str("{\"event\":\"message_end\",\"conversation_id\":\"c\"}").unwrap();
        assert!(matches!(e, StreamEvent::MessageEnd { conversation_id: Some(ref c) } if c == "c"));

        let e: StreamEvent = serde_json::from_str("{\"event\":\"error\",\"message\":\"m\"}").unwrap();
        assert!(matches!(e, StreamEvent::Error { ref message } if message == "m"));
    }

    #[test]
    fn unknown_event_kind_maps_to_none() {
        let e: StreamEvent =
            serde_json::from_str("{\"event\":\"workflow_started\",\"task_id\":\"t\"}").unwrap();
        assert!(e.into_known().is_none());
    }
}
