//! Conversation store
//!
//! Holds one conversation's turns in ascending `sequence` order plus the
//! turn this process has in flight. History pages arrive newest-first and are
//! merged without duplicating ids; the in-flight turn is never displaced by
//! history. Turns streamed by other instances are tracked apart from it, so
//! they never block a local submission.
//! Mutation goes through the single-writer actor in [`crate::kernel`].

use crate::constants::{DECRYPT_ERROR_PLACEHOLDER, PARSE_ERROR_PLACEHOLDER};
use crate::crypto::MessageCipher;
use crate::realtime::RealtimeEvent;
use crate::types::{
    ConversationId, ParleyError, ResponseProvider, Result, Turn, TurnFlags, TurnId, TurnStatus,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// A persisted turn as the history source returns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptedRecord {
    pub id: String,
    pub encrypted_prompt: String,
    pub encrypted_answer: String,
    pub sequence: i64,
    /// Plaintext `{"response_provider": .., "status": ..}`.
    #[serde(default)]
    pub provider_metadata: Value,
}

/// Decrypted answer body: the text plus the turn's metadata map.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnswerEnvelope {
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    #[serde(default)]
    response_provider: Option<ResponseProvider>,
    #[serde(default)]
    status: Option<TurnStatus>,
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Newest-first page of persisted turns with `sequence < before`.
    async fn fetch_page(
        &self,
        conversation_id: &ConversationId,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<EncryptedRecord>>;
}

#[async_trait]
pub trait TurnArchive: Send + Sync {
    async fn persist_turn(&self, turn: &Turn) -> Result<()>;
}

/// Builds the persisted form of a finished turn.
pub fn encrypt_turn(turn: &Turn, cipher: &MessageCipher) -> Result<EncryptedRecord> {
    let envelope = AnswerEnvelope {
        text: turn.answer_text.clone(),
        metadata: turn.metadata.clone(),
    };
    Ok(EncryptedRecord {
        id: turn.id.0.clone(),
        encrypted_prompt: cipher.encrypt_str(&turn.prompt_text)?,
        encrypted_answer: cipher.encrypt(&serde_json::to_vec(&envelope)?)?,
        sequence: turn.sequence,
        provider_metadata: serde_json::json!({
            "response_provider": turn.response_provider,
            "status": turn.status,
        }),
    })
}

/// Decrypts and parses one persisted record. Never fails: an unreadable
/// field is replaced by a placeholder and the rest of the record survives.
pub fn decrypt_and_parse(
    record: &EncryptedRecord,
    conversation_id: &ConversationId,
    cipher: &MessageCipher,
) -> Turn {
    let prompt_text = match cipher.decrypt(&record.encrypted_prompt) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => PARSE_ERROR_PLACEHOLDER.to_string(),
        },
        Err(e) => {
            tracing::warn!("[⚙️ ] Prompt of record {} unreadable: {}", record.id, e.inner);
            DECRYPT_ERROR_PLACEHOLDER.to_string()
        }
    };

    let (answer_text, metadata) = match cipher.decrypt(&record.encrypted_answer) {
        Ok(bytes) => match serde_json::from_slice::<AnswerEnvelope>(&bytes) {
            Ok(envelope) => (envelope.text, envelope.metadata),
            Err(e) => {
                tracing::warn!("[⚙️ ] Answer of record {} unparseable: {}", record.id, e);
                (PARSE_ERROR_PLACEHOLDER.to_string(), Map::new())
            }
        },
        Err(e) => {
            tracing::warn!("[⚙️ ] Answer of record {} unreadable: {}", record.id, e.inner);
            (DECRYPT_ERROR_PLACEHOLDER.to_string(), Map::new())
        }
    };

    let provider_meta: Option<ProviderMetadata> =
        serde_json::from_value(record.provider_metadata.clone()).ok();
    let (response_provider, status) = match provider_meta {
        Some(m) => (
            m.response_provider.unwrap_or(ResponseProvider::Standard),
            match m.status {
                Some(s) if s.is_terminal() => s,
                _ => TurnStatus::Closed,
            },
        ),
        None => (ResponseProvider::Standard, TurnStatus::Closed),
    };

    Turn {
        id: TurnId::from(record.id.clone()),
        conversation_id: conversation_id.clone(),
        prompt_text,
        answer_text,
        response_provider,
        metadata,
        status,
        sequence: record.sequence,
    }
}

/// Notifications for subscribers of one conversation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    TurnStarted { turn: Turn },
    InFlightUpdated { turn: Turn, flags: TurnFlags },
    TurnClosed { turn: Turn },
    HistoryLoaded { added: usize },
}

/// Turn as a viewer sees it, with the text prepared for rendering.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnView {
    #[serde(flatten)]
    pub turn: Turn,
    pub rendered_text: String,
    /// Present only while the turn is in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<TurnFlags>,
}

impl TurnView {
    fn in_flight(turn: &Turn, flags: TurnFlags) -> Self {
        Self {
            flags: Some(flags),
            ..Self::from(turn)
        }
    }
}

impl From<&Turn> for TurnView {
    fn from(turn: &Turn) -> Self {
        Self {
            turn: turn.clone(),
            rendered_text: turn.renderable_text(),
            flags: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationView {
    pub conversation_id: ConversationId,
    pub turns: Vec<TurnView>,
    pub in_flight: Option<TurnView>,
    /// Turns other instances are streaming, oldest first.
    pub remote_in_flight: Vec<TurnView>,
    pub cursor: HistoryCursor,
}

/// Where the next history page starts.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct HistoryCursor {
    /// Lowest sequence loaded from history; the next page fetches below it.
    pub before: Option<i64>,
    pub exhausted: bool,
}

pub struct ConversationStore {
    conversation_id: ConversationId,
    turns: Vec<Turn>,
    /// Only ever a turn begun through [`ConversationStore::begin_turn`].
    in_flight: Option<Turn>,
    in_flight_flags: TurnFlags,
    remote: Vec<Turn>,
    cursor: HistoryCursor,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    pub fn new(conversation_id: ConversationId, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            conversation_id,
            turns: Vec::new(),
            in_flight: None,
            in_flight_flags: TurnFlags::default(),
            remote: Vec::new(),
            cursor: HistoryCursor::default(),
            events,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn cursor(&self) -> HistoryCursor {
        self.cursor
    }

    /// Merges a newest-first page. Returns how many turns were new.
    pub fn append_history_page(&mut self, page: Vec<Turn>, page_size: u32) -> usize {
        let fetched = page.len();
        let mut added = 0;

        for turn in page.into_iter().rev() {
            if let Some(lowest) = self.cursor.before {
                if turn.sequence < lowest {
                    self.cursor.before = Some(turn.sequence);
                }
            } else {
                self.cursor.before = Some(turn.sequence);
            }

            if self.contains(&turn.id) {
                continue;
            }
            // The persisted record settles a remote turn whose close never arrived.
            if let Some(pos) = self.remote.iter().position(|t| t.id == turn.id) {
                self.remote.remove(pos);
            }
            self.insert_ordered(turn);
            added += 1;
        }

        if fetched < page_size as usize {
            self.cursor.exhausted = true;
        }

        if added > 0 {
            tracing::debug!(
                "[⚙️ ] Conversation {}: merged {} of {} history turns",
                self.conversation_id.short(),
                added,
                fetched
            );
        }
        self.notify(StoreEvent::HistoryLoaded { added });
        added
    }

    /// Creates the pending in-flight turn. Only one turn may be in flight.
    pub fn begin_turn(&mut self, prompt: &str, provider: ResponseProvider) -> Result<Turn> {
        if let Some(existing) = &self.in_flight {
            return Err(ParleyError::Conflict(format!(
                "Turn {} is still in flight",
                existing.id.short()
            ))
            .into());
        }
        let turn = Turn::new_pending(
            self.conversation_id.clone(),
            prompt,
            provider,
            self.next_sequence(),
        );
        self.in_flight = Some(turn.clone());
        self.in_flight_flags = TurnFlags::default();
        self.notify(StoreEvent::TurnStarted { turn: turn.clone() });
        Ok(turn)
    }

    pub fn update_in_flight(&mut self, turn: Turn, flags: TurnFlags) -> Result<()> {
        match &self.in_flight {
            Some(current) if current.id == turn.id => {
                self.in_flight = Some(turn.clone());
                self.in_flight_flags = flags;
                self.notify(StoreEvent::InFlightUpdated { turn, flags });
                Ok(())
            }
            _ => Err(ParleyError::InvalidRequest(format!(
                "Turn {} is not in flight",
                turn.id.short()
            ))
            .into()),
        }
    }

    /// Moves the in-flight turn into the persisted ordering as `closed`.
    pub fn close_in_flight_turn(
        &mut self,
        final_text: String,
        metadata: Map<String, Value>,
    ) -> Result<Turn> {
        self.finish_in_flight(final_text, Some(metadata), TurnStatus::Closed)
    }

    /// Moves the in-flight turn into the persisted ordering as `errored`,
    /// with the error message as its answer.
    pub fn fail_in_flight_turn(&mut self, message: String) -> Result<Turn> {
        self.finish_in_flight(message, None, TurnStatus::Errored)
    }

    /// Applies an event produced by another instance's pipeline. Events for
    /// closed turns and for the turn this process is driving are ignored.
    pub fn apply_remote(&mut self, event: &RealtimeEvent) -> bool {
        if event.conversation_id() != &self.conversation_id {
            return false;
        }
        let turn_id = event.turn_id();
        if self.turns.iter().any(|t| &t.id == turn_id) {
            return false;
        }
        if self.in_flight.as_ref().is_some_and(|t| &t.id == turn_id) {
            tracing::debug!(
                "[📡 -> ⚙️ ] Ignoring remote event for local turn {}",
                turn_id.short()
            );
            return false;
        }

        match event {
            RealtimeEvent::Delta { chunk, .. } => {
                let existing = self.remote.iter().position(|t| &t.id == turn_id);
                let idx = match existing {
                    Some(idx) => idx,
                    None => {
                        let placeholder = self.remote_turn(turn_id.clone(), TurnStatus::Pending);
                        self.remote.push(placeholder);
                        self.remote.len() - 1
                    }
                };
                let turn = &mut self.remote[idx];
                turn.answer_text.push_str(chunk);
                turn.status = TurnStatus::Streaming;
                let snapshot = turn.clone();
                self.notify(StoreEvent::InFlightUpdated {
                    turn: snapshot,
                    flags: TurnFlags::default(),
                });
                true
            }
            RealtimeEvent::StreamClosed {
                final_text, status, ..
            } => {
                let status = if status.is_terminal() {
                    *status
                } else {
                    TurnStatus::Closed
                };
                let existing = self.remote.iter().position(|t| &t.id == turn_id);
                let mut turn = match existing {
                    Some(idx) => self.remote.remove(idx),
                    None => self.remote_turn(turn_id.clone(), status),
                };
                turn.answer_text = final_text.clone();
                turn.status = status;
                self.insert_ordered(turn.clone());
                self.notify(StoreEvent::TurnClosed { turn });
                true
            }
        }
    }

    pub fn get_conversation_view(&self) -> ConversationView {
        ConversationView {
            conversation_id: self.conversation_id.clone(),
            turns: self.turns.iter().map(TurnView::from).collect(),
            in_flight: self
                .in_flight
                .as_ref()
                .map(|t| TurnView::in_flight(t, self.in_flight_flags)),
            remote_in_flight: self.remote.iter().map(TurnView::from).collect(),
            cursor: self.cursor,
        }
    }

    pub fn current_in_flight_turn(&self) -> Option<Turn> {
        self.in_flight.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn finish_in_flight(
        &mut self,
        final_text: String,
        metadata: Option<Map<String, Value>>,
        status: TurnStatus,
    ) -> Result<Turn> {
        let mut turn = match self.in_flight.take() {
            Some(t) => t,
            None => {
                return Err(ParleyError::InvalidRequest(format!(
                    "No turn in flight for conversation {}",
                    self.conversation_id.short()
                ))
                .into())
            }
        };
        turn.answer_text = final_text;
        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                turn.metadata.insert(key, value);
            }
        }
        turn.status = status;
        self.in_flight_flags = TurnFlags::default();
        self.insert_ordered(turn.clone());
        self.notify(StoreEvent::TurnClosed { turn: turn.clone() });
        Ok(turn)
    }

    fn remote_turn(&self, id: TurnId, status: TurnStatus) -> Turn {
        Turn {
            id,
            conversation_id: self.conversation_id.clone(),
            prompt_text: String::new(),
            answer_text: String::new(),
            response_provider: ResponseProvider::Standard,
            metadata: Map::new(),
            status,
            sequence: self.next_sequence(),
        }
    }

    fn contains(&self, id: &TurnId) -> bool {
        self.turns.iter().any(|t| &t.id == id)
            || self.in_flight.as_ref().is_some_and(|t| &t.id == id)
    }

    fn insert_ordered(&mut self, turn: Turn) {
        let idx = self.turns.partition_point(|t| t.sequence <= turn.sequence);
        self.turns.insert(idx, turn);
    }

    fn next_sequence(&self) -> i64 {
        let persisted = self.turns.last().map(|t| t.sequence);
        let in_flight = self.in_flight.as_ref().map(|t| t.sequence);
        let remote = self.remote.iter().map(|t| t.sequence).max();
        match persisted.max(in_flight).max(remote) {
            Some(s) => s + 1,
            None => 1,
        }
    }

    fn notify(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}
