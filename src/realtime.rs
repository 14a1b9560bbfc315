//! Real-time fan-out of streaming deltas to other viewers of a conversation.
//!
//! Delivery is fire-and-forget and at-most-once: a viewer that lags behind
//! loses deltas and converges on the final text carried by `StreamClosed`.

use crate::types::{ConversationId, TurnId, TurnStatus, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Delta {
        conversation_id: ConversationId,
        turn_id: TurnId,
        chunk: String,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    StreamClosed {
        conversation_id: ConversationId,
        turn_id: TurnId,
        final_text: String,
        status: TurnStatus,
        #[serde(default)]
        user_id: Option<UserId>,
    },
}

impl RealtimeEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            RealtimeEvent::Delta { conversation_id, .. } => conversation_id,
            RealtimeEvent::StreamClosed { conversation_id, .. } => conversation_id,
        }
    }

    pub fn turn_id(&self) -> &TurnId {
        match self {
            RealtimeEvent::Delta { turn_id, .. } => turn_id,
            RealtimeEvent::StreamClosed { turn_id, .. } => turn_id,
        }
    }
}

pub trait RealtimeChannel: Send + Sync {
    fn emit_delta(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        chunk: &str,
        user: Option<&UserId>,
    );

    fn emit_stream_closed(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        final_text: &str,
        status: TurnStatus,
        user: Option<&UserId>,
    );
}

/// In-process channel backed by `tokio::sync::broadcast`.
#[derive(Clone)]
pub struct BroadcastRealtime {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastRealtime {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, event: RealtimeEvent) {
        // No receivers is the normal case for a conversation nobody else is watching.
        if self.tx.send(event).is_err() {
            tracing::trace!("[⚙️  -> 📡] No real-time subscribers");
        }
    }
}

impl RealtimeChannel for BroadcastRealtime {
    fn emit_delta(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        chunk: &str,
        user: Option<&UserId>,
    ) {
        self.send(RealtimeEvent::Delta {
            conversation_id: conversation_id.clone(),
            turn_id: turn_id.clone(),
            chunk: chunk.to_string(),
            user_id: user.cloned(),
        });
    }

    fn emit_stream_closed(
        &self,
        conversation_id: &ConversationId,
        turn_id: &TurnId,
        final_text: &str,
        status: TurnStatus,
        user: Option<&UserId>,
    ) {
        tracing::debug!(
            "[⚙️  -> 📡] Stream closed for turn {} ({})",
            turn_id.short(),
            status.as_str()
        );
        self.send(RealtimeEvent::StreamClosed {
            conversation_id: conversation_id.clone(),
            turn_id: turn_id.clone(),
            final_text: final_text.to_string(),
            status,
            user_id: user.cloned(),
        });
    }
}
