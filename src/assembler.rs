//! Turn assembly
//!
//! Folds decoded [`StreamEvent`]s into one evolving [`Turn`] and broadcasts
//! what changed. The turn moves `pending -> streaming -> closed | errored`;
//! terminal states are reached only through [`TurnAssembler::finish`] and
//! [`TurnAssembler::fail`].

use crate::constants::{SOURCES_HEADING, TAG_CITATIONS};
use crate::logging::StreamMetric;
use crate::normalizer::{merge_extra, NormalizerConfig, PayloadAction, PayloadNormalizer};
use crate::realtime::RealtimeChannel;
use crate::types::{ControlMarker, StreamEvent, Turn, TurnFlags, TurnStatus, UserId};
use serde_json::Value;
use std::sync::Arc;

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Continue,
    /// Explicit terminal token; nothing after it belongs to the turn.
    Finished,
    /// In-band error reported by the provider.
    UpstreamError { status: Option<u16>, message: String },
}

pub struct TurnAssembler {
    turn: Turn,
    normalizer: PayloadNormalizer,
    realtime: Arc<dyn RealtimeChannel>,
    user: Option<UserId>,
    flags: TurnFlags,
    /// Text viewers have already received as deltas.
    broadcast: String,
    metric: StreamMetric,
}

impl TurnAssembler {
    pub fn new(
        turn: Turn,
        config: NormalizerConfig,
        realtime: Arc<dyn RealtimeChannel>,
        user: Option<UserId>,
    ) -> Self {
        Self {
            turn,
            normalizer: PayloadNormalizer::new(config),
            realtime,
            user,
            flags: TurnFlags::default(),
            broadcast: String::new(),
            metric: StreamMetric::new(),
        }
    }

    pub fn turn(&self) -> &Turn {
        &self.turn
    }

    pub fn flags(&self) -> TurnFlags {
        self.flags
    }

    pub fn apply(&mut self, event: StreamEvent) -> Applied {
        if self.turn.status.is_terminal() {
            tracing::warn!(
                "[⚙️ ] Ignoring event for already finished turn {}",
                self.turn.id.short()
            );
            return Applied::Continue;
        }
        self.metric.record_event(&event);

        match event {
            StreamEvent::Text(text) => {
                let normalized = self.normalizer.normalize_text(&text);
                self.flags.deliberating = false;
                self.append(&normalized);
                Applied::Continue
            }
            StreamEvent::ControlMarker(marker) => match marker {
                ControlMarker::LoaderStart => {
                    self.flags.loader_active = true;
                    Applied::Continue
                }
                ControlMarker::LoaderEnd => {
                    self.flags.loader_active = false;
                    Applied::Continue
                }
                ControlMarker::AgentDeliberating => {
                    self.flags.deliberating = true;
                    Applied::Continue
                }
                ControlMarker::Ignore => Applied::Continue,
                ControlMarker::Done => Applied::Finished,
            },
            StreamEvent::StructuredPayload(kind, value) => {
                match self.normalizer.classify(kind, value) {
                    PayloadAction::Citations(urls) => {
                        let list = urls.into_iter().map(Value::String).collect();
                        self.merge_metadata(TAG_CITATIONS.to_string(), Value::Array(list));
                    }
                    PayloadAction::Merge { key, value } => self.merge_metadata(key, value),
                    PayloadAction::Supersede { key, value, text } => {
                        self.merge_metadata(key, value);
                        self.flags.loader_active = false;
                        self.turn.answer_text = text;
                        self.mark_streaming();
                    }
                    PayloadAction::Extra { tag, value } => {
                        merge_extra(&mut self.turn.metadata, tag, value)
                    }
                }
                Applied::Continue
            }
            StreamEvent::UpstreamError { status, message } => {
                Applied::UpstreamError { status, message }
            }
        }
    }

    /// Discards what the failed attempt produced so the retried attempt
    /// supersedes it. Viewers keep what they already received.
    pub fn restart_attempt(&mut self) {
        tracing::debug!(
            "[⚙️ ] Restarting turn {} ({} chars superseded)",
            self.turn.id.short(),
            self.turn.answer_text.len()
        );
        self.turn.answer_text.clear();
        self.turn.metadata.clear();
        self.normalizer.reset();
        self.flags = TurnFlags::default();
    }

    /// Starts an attempt and returns its number. Every attempt after the
    /// first supersedes the one before it.
    pub fn begin_attempt(&mut self) -> u32 {
        self.metric.record_attempt();
        if self.metric.attempts > 1 {
            self.restart_attempt();
        }
        self.metric.attempts
    }

    /// Appends held-back text and the sources section, closes the turn and
    /// tells other viewers the final text.
    pub fn finish(&mut self) -> Turn {
        let (tail, sources) = self.normalizer.finish();
        self.append(&tail);
        if let Some(block) = sources {
            if !self.turn.answer_text.contains(SOURCES_HEADING) {
                self.turn.answer_text.push_str(&block);
            }
        }
        self.flags = TurnFlags::default();
        self.turn.status = TurnStatus::Closed;
        self.announce_close();
        self.turn.clone()
    }

    /// Ends the turn in error; the message replaces the answer and is
    /// broadcast like one.
    pub fn fail(&mut self, message: &str) -> Turn {
        tracing::warn!(
            "[⚙️ ] Turn {} ended in error: {}",
            self.turn.id.short(),
            message
        );
        self.turn.answer_text = message.to_string();
        self.flags = TurnFlags::default();
        self.turn.status = TurnStatus::Errored;
        self.announce_close();
        self.turn.clone()
    }

    fn announce_close(&self) {
        self.realtime.emit_stream_closed(
            &self.turn.conversation_id,
            &self.turn.id,
            &self.turn.answer_text,
            self.turn.status,
            self.user.as_ref(),
        );
        self.metric.log_summary(&self.turn);
    }

    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.turn.answer_text.push_str(text);
        self.mark_streaming();
        self.broadcast_new_suffix();
    }

    fn mark_streaming(&mut self) {
        if self.turn.status == TurnStatus::Pending {
            self.turn.status = TurnStatus::Streaming;
        }
    }

    /// Sends only the part of the answer viewers have not seen. A retried
    /// attempt replaying the same prefix stays silent until it moves past it;
    /// one that diverges stays silent until the close event.
    fn broadcast_new_suffix(&mut self) {
        let answer = &self.turn.answer_text;
        if !answer.starts_with(self.broadcast.as_str()) {
            return;
        }
        let delta = &answer[self.broadcast.len()..];
        if delta.is_empty() {
            return;
        }
        self.realtime.emit_delta(
            &self.turn.conversation_id,
            &self.turn.id,
            delta,
            self.user.as_ref(),
        );
        self.broadcast.push_str(delta);
    }

    fn merge_metadata(&mut self, key: String, value: Value) {
        self.turn.metadata.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, PayloadKind, ResponseProvider, TurnId};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        deltas: Mutex<Vec<String>>,
        closed: Mutex<Vec<(String, TurnStatus)>>,
    }

    impl RealtimeChannel for Recorder {
        fn emit_delta(&self, _: &ConversationId, _: &TurnId, chunk: &str, _: Option<&UserId>) {
            if let Ok(mut d) = self.deltas.lock() {
                d.push(chunk.to_string());
            }
        }

        fn emit_stream_closed(
            &self,
            _: &ConversationId,
            _: &TurnId,
            final_text: &str,
            status: TurnStatus,
            _: Option<&UserId>,
        ) {
            if let Ok(mut c) = self.closed.lock() {
                c.push((final_text.to_string(), status));
            }
        }
    }

    fn assembler(provider: ResponseProvider) -> (TurnAssembler, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let turn = Turn::new_pending(ConversationId::from("c1"), "q", provider, 1);
        let a = TurnAssembler::new(
            turn,
            NormalizerConfig::for_provider(provider),
            recorder.clone(),
            None,
        );
        (a, recorder)
    }

    fn deltas(r: &Recorder) -> Vec<String> {
        match r.deltas.lock() {
            Ok(d) => d.clone(),
            Err(e) => panic!("poisoned: {}", e),
        }
    }

    #[test]
    fn test_text_moves_turn_to_streaming_and_broadcasts() {
        let (mut a, rec) = assembler(ResponseProvider::OpenAi);
        assert_eq!(a.turn().status, TurnStatus::Pending);
        a.apply(StreamEvent::Text("Hello ".into()));
        a.apply(StreamEvent::Text("world".into()));
        assert_eq!(a.turn().status, TurnStatus::Streaming);
        assert_eq!(deltas(&rec), vec!["Hello ", "world"]);

        let turn = a.finish();
        assert_eq!(turn.answer_text, "Hello world");
        assert_eq!(turn.status, TurnStatus::Closed);
        match rec.closed.lock() {
            Ok(c) => assert_eq!(c.as_slice(), &[("Hello world".to_string(), TurnStatus::Closed)]),
            Err(e) => panic!("poisoned: {}", e),
        };
    }

    #[test]
    fn test_markers_only_touch_flags() {
        let (mut a, rec) = assembler(ResponseProvider::OpenAi);
        a.apply(StreamEvent::ControlMarker(ControlMarker::LoaderStart));
        a.apply(StreamEvent::ControlMarker(ControlMarker::AgentDeliberating));
        a.apply(StreamEvent::ControlMarker(ControlMarker::Ignore));
        assert_eq!(
            a.flags(),
            TurnFlags {
                loader_active: true,
                deliberating: true
            }
        );
        assert!(deltas(&rec).is_empty());
        assert_eq!(a.turn().answer_text, "");

        a.apply(StreamEvent::Text("x".into()));
        assert!(!a.flags().deliberating);
        assert_eq!(
            a.apply(StreamEvent::ControlMarker(ControlMarker::Done)),
            Applied::Finished
        );
    }

    #[test]
    fn test_citations_append_sources_on_close() {
        let (mut a, _rec) = assembler(ResponseProvider::Perplexity);
        a.apply(StreamEvent::StructuredPayload(
            PayloadKind::Citations,
            json!(["http://a.com"]),
        ));
        a.apply(StreamEvent::Text("[1] says X".into()));
        let turn = a.finish();
        assert_eq!(turn.answer_text, "a.com says X\n\n### Sources\n- http://a.com");
        assert_eq!(turn.metadata["citations"], json!(["http://a.com"]));
    }

    #[test]
    fn test_metadata_is_additive() {
        let (mut a, _rec) = assembler(ResponseProvider::PageSpeed);
        a.apply(StreamEvent::StructuredPayload(PayloadKind::PageSpeed, json!({"score": 1})));
        a.apply(StreamEvent::StructuredPayload(
            PayloadKind::Extra("usage".into()),
            json!({"n": 3}),
        ));
        a.apply(StreamEvent::StructuredPayload(PayloadKind::PageSpeed, json!({"score": 2})));
        let meta = &a.turn().metadata;
        assert_eq!(meta["page_speed"], json!({"score": 2}));
        assert_eq!(meta["provider_extra"]["usage"], json!({"n": 3}));
    }

    #[test]
    fn test_image_result_supersedes_placeholder() {
        let (mut a, _rec) = assembler(ResponseProvider::ImageGeneration);
        a.apply(StreamEvent::Text("Generating...".into()));
        a.apply(StreamEvent::StructuredPayload(
            PayloadKind::Images,
            json!(["https://cdn/img.png"]),
        ));
        assert_eq!(a.turn().answer_text, "![image](https://cdn/img.png)");
    }

    #[test]
    fn test_retry_does_not_rebroadcast_seen_prefix() {
        let (mut a, rec) = assembler(ResponseProvider::OpenAi);
        assert_eq!(a.begin_attempt(), 1);
        a.apply(StreamEvent::Text("Hel".into()));
        assert_eq!(a.begin_attempt(), 2);
        assert_eq!(a.turn().answer_text, "");
        a.apply(StreamEvent::Text("Hel".into()));
        a.apply(StreamEvent::Text("lo world".into()));
        let turn = a.finish();
        assert_eq!(turn.answer_text, "Hello world");
        assert_eq!(deltas(&rec), vec!["Hel", "lo world"]);
    }

    #[test]
    fn test_fail_replaces_answer() {
        let (mut a, rec) = assembler(ResponseProvider::OpenAi);
        a.apply(StreamEvent::Text("partial".into()));
        let turn = a.fail("Quota exceeded");
        assert_eq!(turn.status, TurnStatus::Errored);
        assert_eq!(turn.answer_text, "Quota exceeded");
        match rec.closed.lock() {
            Ok(c) => assert_eq!(c[0].1, TurnStatus::Errored),
            Err(e) => panic!("poisoned: {}", e),
        };
    }
}
