use crate::types::{ControlMarker, StreamEvent, Turn};
use chrono::{DateTime, Utc};
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-parley-request-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id and runs the handler inside a span carrying it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id, path = %req.uri().path());
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-stream counters, summarized in one line when the stream ends.
pub struct StreamMetric {
    pub started_at: DateTime<Utc>,
    pub events: usize,
    pub text_parts: usize,
    pub text_chars: usize,
    pub payloads: usize,
    pub markers: usize,
    pub payload_tags: Vec<String>,
    pub attempts: u32,
}

impl Default for StreamMetric {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            events: 0,
            text_parts: 0,
            text_chars: 0,
            payloads: 0,
            markers: 0,
            payload_tags: Vec::new(),
            attempts: 0,
        }
    }
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }

    pub fn record_event(&mut self, event: &StreamEvent) {
        self.events += 1;
        match event {
            StreamEvent::Text(text) => {
                self.text_parts += 1;
                self.text_chars += text.chars().count();
            }
            StreamEvent::StructuredPayload(kind, _) => {
                self.payloads += 1;
                if !self.payload_tags.iter().any(|t| t == kind.tag()) {
                    self.payload_tags.push(kind.tag().to_string());
                }
            }
            StreamEvent::ControlMarker(ControlMarker::Ignore) => {}
            StreamEvent::ControlMarker(_) => self.markers += 1,
            StreamEvent::UpstreamError { .. } => {}
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn log_summary(&self, turn: &Turn) {
        let payloads_str = if self.payload_tags.is_empty() {
            format!("{}", self.payloads)
        } else {
            format!("{} ({})", self.payloads, self.payload_tags.join(", "))
        };

        info!(
            target: "flight_recorder",
            "[STREAM END] Turn: {} | Status: {} | Duration: {}ms | Attempts: {} | Events: {} | Text: {} chars in {} parts | Payloads: {} | Markers: {}",
            turn.id.short(),
            turn.status.as_str(),
            self.elapsed_ms(),
            self.attempts,
            self.events,
            self.text_chars,
            self.text_parts,
            payloads_str,
            self.markers
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PayloadKind;

    #[test]
    fn test_stream_metric_counts() {
        let mut metric = StreamMetric::new();
        metric.record_event(&StreamEvent::Text("héllo".into()));
        metric.record_event(&StreamEvent::ControlMarker(ControlMarker::Ignore));
        metric.record_event(&StreamEvent::ControlMarker(ControlMarker::LoaderStart));
        metric.record_event(&StreamEvent::StructuredPayload(
            PayloadKind::Citations,
            serde_json::json!([]),
        ));
        metric.record_event(&StreamEvent::StructuredPayload(
            PayloadKind::Citations,
            serde_json::json!([]),
        ));

        assert_eq!(metric.events, 5);
        assert_eq!(metric.text_chars, 5);
        assert_eq!(metric.markers, 1);
        assert_eq!(metric.payloads, 2);
        assert_eq!(metric.payload_tags, vec!["citations".to_string()]);
        assert!(metric.elapsed_ms() >= 0);
    }
}
