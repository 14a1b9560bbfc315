use crate::recovery::Credential;
use crate::types::{ParleyError, Result, TurnRequest};
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;

/// Forward-only response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// Issues one streaming request. An authentication failure before the body
/// must surface as an auth error so the caller can retry it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &TurnRequest, credential: &Credential) -> Result<ByteStream>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &TurnRequest, credential: &Credential) -> Result<ByteStream> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", credential.bearer())
            .json(&serde_json::json!({
                "conversation_id": request.conversation_id,
                "model": request.model,
                "prompt": request.prompt,
                "stream": true,
            }))
            .send()
            .await
            .map_err(ParleyError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            let message = extract_error_message(&body);
            tracing::warn!("[☁️  -> ⚙️ ] Upstream returned {}: {}", status, message);
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ParleyError::Unauthorized(message).into());
            }
            return Err(ParleyError::Upstream(status, message).into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(Box::pin(bytes_stream))
    }
}

/// Pulls `error.message` (or `message`) out of a JSON error body; otherwise
/// the body itself.
fn extract_error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
    });
    match message {
        Some(m) => m,
        None if body.trim().is_empty() => "Upstream request failed".to_string(),
        None => body.trim().to_string(),
    }
}
