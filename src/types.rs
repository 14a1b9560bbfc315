use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TurnId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 6)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TurnId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Backend that produced a turn. Decides which decoding and normalization
/// rules apply to its stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResponseProvider {
    OpenAi,
    Anthropic,
    Gemini,
    Perplexity,
    WebSearch,
    PageSpeed,
    ImageGeneration,
    Standard,
}

impl ResponseProvider {
    pub fn from_model_name(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.contains("perplexity") || lower.contains("sonar") {
            ResponseProvider::Perplexity
        } else if lower.contains("web-search") || lower.contains("websearch") {
            ResponseProvider::WebSearch
        } else if lower.contains("pagespeed") || lower.contains("page-speed") {
            ResponseProvider::PageSpeed
        } else if lower.contains("dall-e") || lower.contains("image") || lower.contains("imagen") {
            ResponseProvider::ImageGeneration
        } else if lower.contains("google/") || lower.contains("gemini") {
            ResponseProvider::Gemini
        } else if lower.contains("anthropic/") || lower.contains("claude") {
            ResponseProvider::Anthropic
        } else if lower.contains("openai/") || lower.contains("gpt") {
            ResponseProvider::OpenAi
        } else {
            ResponseProvider::Standard
        }
    }

    /// Search-augmented providers embed `[n]` citation markers in their text
    /// and render a sources block under the answer.
    pub fn is_search_augmented(&self) -> bool {
        matches!(self, ResponseProvider::Perplexity | ResponseProvider::WebSearch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseProvider::OpenAi => "open_ai",
            ResponseProvider::Anthropic => "anthropic",
            ResponseProvider::Gemini => "gemini",
            ResponseProvider::Perplexity => "perplexity",
            ResponseProvider::WebSearch => "web_search",
            ResponseProvider::PageSpeed => "page_speed",
            ResponseProvider::ImageGeneration => "image_generation",
            ResponseProvider::Standard => "standard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Closed,
    Errored,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStatus::Closed | TurnStatus::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Streaming => "streaming",
            TurnStatus::Closed => "closed",
            TurnStatus::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TurnStatus::Pending),
            "streaming" => Some(TurnStatus::Streaming),
            "closed" => Some(TurnStatus::Closed),
            "errored" => Some(TurnStatus::Errored),
            _ => None,
        }
    }
}

/// Side flags of an in-flight turn that do not touch the answer text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFlags {
    pub loader_active: bool,
    pub deliberating: bool,
}

/// One prompt/answer exchange within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    pub prompt_text: String,
    pub answer_text: String,
    pub response_provider: ResponseProvider,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub status: TurnStatus,
    pub sequence: i64,
}

impl Turn {
    pub fn new_pending(
        conversation_id: ConversationId,
        prompt_text: impl Into<String>,
        response_provider: ResponseProvider,
        sequence: i64,
    ) -> Self {
        Self {
            id: TurnId::new(),
            conversation_id,
            prompt_text: prompt_text.into(),
            answer_text: String::new(),
            response_provider,
            metadata: Map::new(),
            status: TurnStatus::Pending,
            sequence,
        }
    }

    /// Text as the rendering layer should show it. Search-augmented turns get
    /// a sources block built from their metadata unless one is already there.
    pub fn renderable_text(&self) -> String {
        if !self.response_provider.is_search_augmented() {
            return self.answer_text.clone();
        }
        if self.answer_text.contains(crate::constants::SOURCES_HEADING) {
            return self.answer_text.clone();
        }
        match crate::normalizer::sources_block_from_metadata(&self.metadata) {
            Some(block) => format!("{}{}", self.answer_text, block),
            None => self.answer_text.clone(),
        }
    }
}

/// Parameters of a submitted prompt. Re-issued unchanged on retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
}

impl TurnRequest {
    pub fn provider(&self) -> ResponseProvider {
        ResponseProvider::from_model_name(&self.model)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlMarker {
    LoaderStart,
    LoaderEnd,
    AgentDeliberating,
    /// Auxiliary progress lines; swallowed entirely.
    Ignore,
    /// Explicit terminal token, equivalent to end of stream.
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Citations,
    WebResources,
    PageSpeed,
    Images,
    Video,
    Extra(String),
}

impl PayloadKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            crate::constants::TAG_CITATIONS => PayloadKind::Citations,
            crate::constants::TAG_WEB_RESOURCES => PayloadKind::WebResources,
            crate::constants::TAG_PAGE_SPEED => PayloadKind::PageSpeed,
            crate::constants::TAG_IMAGES => PayloadKind::Images,
            crate::constants::TAG_VIDEO => PayloadKind::Video,
            other => PayloadKind::Extra(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            PayloadKind::Citations => crate::constants::TAG_CITATIONS,
            PayloadKind::WebResources => crate::constants::TAG_WEB_RESOURCES,
            PayloadKind::PageSpeed => crate::constants::TAG_PAGE_SPEED,
            PayloadKind::Images => crate::constants::TAG_IMAGES,
            PayloadKind::Video => crate::constants::TAG_VIDEO,
            PayloadKind::Extra(tag) => tag,
        }
    }
}

/// Transient decoded unit. Produced by the decoder, consumed once by the
/// normalizer and assembler, never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    ControlMarker(ControlMarker),
    StructuredPayload(PayloadKind, Value),
    /// In-band error object reported by the provider mid-stream.
    UpstreamError { status: Option<u16>, message: String },
}

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl ParleyError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ParleyError::Unauthorized(_) => true,
            ParleyError::Upstream(status, _) => {
                *status == axum::http::StatusCode::UNAUTHORIZED
                    || *status == axum::http::StatusCode::FORBIDDEN
            }
            _ => false,
        }
    }

    /// Message shown in place of the answer when the turn ends in error.
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::Upstream(_, m) | ParleyError::Unauthorized(m) => m.clone(),
            ParleyError::Network(e) => format!("Network error: {}", e),
            ParleyError::Io(e) => format!("Stream interrupted: {}", e),
            other => other.to_string(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            ParleyError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            ParleyError::Unauthorized(m) => (
                axum::http::StatusCode::UNAUTHORIZED,
                m.clone(),
                "UNAUTHORIZED",
            ),
            ParleyError::Conflict(m) => (axum::http::StatusCode::CONFLICT, m.clone(), "CONFLICT"),
            ParleyError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_REQUEST",
            ),
            ParleyError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            ParleyError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            ParleyError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            ParleyError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            ParleyError::Crypto(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "CRYPTO_ERROR",
            ),
            ParleyError::ChannelClosed(m) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                m.clone(),
                "CHANNEL_CLOSED",
            ),
            ParleyError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ParleyError,
    pub span_trace: SpanTrace,
}

impl ObservedError {
    pub fn is_auth_failure(&self) -> bool {
        self.inner.is_auth_failure()
    }
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ParleyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_from_model_name() {
        assert_eq!(
            ResponseProvider::from_model_name("perplexity/sonar-pro"),
            ResponseProvider::Perplexity
        );
        assert_eq!(
            ResponseProvider::from_model_name("anthropic/claude-3.5-sonnet"),
            ResponseProvider::Anthropic
        );
        assert_eq!(
            ResponseProvider::from_model_name("mystery-model"),
            ResponseProvider::Standard
        );
        assert!(ResponseProvider::Perplexity.is_search_augmented());
        assert!(!ResponseProvider::Gemini.is_search_augmented());
    }

    #[test]
    fn test_provider_round_trips_through_str() {
        let p = ResponseProvider::ImageGeneration;
        assert_eq!(ResponseProvider::parse(p.as_str()), Some(p));
        assert_eq!(ResponseProvider::parse("nope"), None);
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(ParleyError::Unauthorized("expired".into()).is_auth_failure());
        assert!(ParleyError::Upstream(axum::http::StatusCode::FORBIDDEN, "no".into())
            .is_auth_failure());
        assert!(!ParleyError::Upstream(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "boom".into()
        )
        .is_auth_failure());
    }

    #[test]
    fn test_renderable_text_appends_sources_once() {
        let mut turn = Turn::new_pending(
            ConversationId::from("c1"),
            "q",
            ResponseProvider::Perplexity,
            1,
        );
        turn.answer_text = "Answer".into();
        turn.metadata.insert(
            "citations".into(),
            serde_json::json!(["https://a.com/x", "https://b.org"]),
        );
        let rendered = turn.renderable_text();
        assert!(rendered.starts_with("Answer"));
        assert!(rendered.contains("### Sources"));
        assert!(rendered.contains("- https://a.com/x"));

        turn.answer_text = rendered.clone();
        assert_eq!(turn.renderable_text(), rendered);
    }
}
