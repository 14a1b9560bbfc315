use crate::crypto::MessageCipher;
use crate::realtime::RealtimeEvent;
use crate::store::{
    decrypt_and_parse, ConversationStore, ConversationView, EncryptedRecord, HistoryCursor,
    HistorySource, StoreEvent,
};
use crate::types::{ConversationId, ParleyError, ResponseProvider, Result, Turn, TurnFlags};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub enum StoreCommand {
    AppendHistoryPage {
        conversation_id: ConversationId,
        records: Vec<EncryptedRecord>,
        page_size: u32,
        resp: oneshot::Sender<usize>,
    },
    BeginTurn {
        conversation_id: ConversationId,
        prompt: String,
        provider: ResponseProvider,
        resp: oneshot::Sender<Result<Turn>>,
    },
    UpdateInFlight {
        turn: Turn,
        flags: TurnFlags,
    },
    CloseInFlight {
        conversation_id: ConversationId,
        final_text: String,
        metadata: Map<String, Value>,
        resp: oneshot::Sender<Result<Turn>>,
    },
    FailInFlight {
        conversation_id: ConversationId,
        message: String,
        resp: oneshot::Sender<Result<Turn>>,
    },
    ApplyRemote {
        event: RealtimeEvent,
        resp: oneshot::Sender<bool>,
    },
    GetView {
        conversation_id: ConversationId,
        resp: oneshot::Sender<ConversationView>,
    },
    GetInFlight {
        conversation_id: ConversationId,
        resp: oneshot::Sender<Option<Turn>>,
    },
    GetCursor {
        conversation_id: ConversationId,
        resp: oneshot::Sender<HistoryCursor>,
    },
    Subscribe {
        conversation_id: ConversationId,
        resp: oneshot::Sender<broadcast::Receiver<StoreEvent>>,
    },
}

/// Owns every conversation store and applies commands one at a time.
pub struct StoreKernel {
    stores: HashMap<ConversationId, ConversationStore>,
    cipher: Arc<MessageCipher>,
    event_capacity: usize,
    rx_cmd: mpsc::Receiver<StoreCommand>,
}

impl StoreKernel {
    pub fn new(
        cipher: Arc<MessageCipher>,
        event_capacity: usize,
        rx_cmd: mpsc::Receiver<StoreCommand>,
    ) -> Self {
        Self {
            stores: HashMap::new(),
            cipher,
            event_capacity,
            rx_cmd,
        }
    }

    /// Spawns the kernel and returns a handle to it.
    pub fn spawn(cipher: Arc<MessageCipher>, event_capacity: usize, command_capacity: usize) -> StoreHandle {
        let (tx, rx) = mpsc::channel(command_capacity);
        tokio::spawn(Self::new(cipher, event_capacity, rx).run());
        StoreHandle { tx }
    }

    pub async fn run(mut self) {
        tracing::info!("Store kernel event loop started");
        while let Some(cmd) = self.rx_cmd.recv().await {
            self.handle(cmd);
        }
        tracing::info!("Store kernel stopped");
    }

    fn store(&mut self, conversation_id: &ConversationId) -> &mut ConversationStore {
        let capacity = self.event_capacity;
        self.stores
            .entry(conversation_id.clone())
            .or_insert_with(|| ConversationStore::new(conversation_id.clone(), capacity))
    }

    fn handle(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::AppendHistoryPage {
                conversation_id,
                records,
                page_size,
                resp,
            } => {
                let cipher = self.cipher.clone();
                let page = records
                    .iter()
                    .map(|r| decrypt_and_parse(r, &conversation_id, &cipher))
                    .collect();
                let added = self.store(&conversation_id).append_history_page(page, page_size);
                let _ = resp.send(added);
            }
            StoreCommand::BeginTurn {
                conversation_id,
                prompt,
                provider,
                resp,
            } => {
                let _ = resp.send(self.store(&conversation_id).begin_turn(&prompt, provider));
            }
            StoreCommand::UpdateInFlight { turn, flags } => {
                let conversation_id = turn.conversation_id.clone();
                if let Err(e) = self.store(&conversation_id).update_in_flight(turn, flags) {
                    tracing::debug!("Dropping stale in-flight update: {}", e.inner);
                }
            }
            StoreCommand::CloseInFlight {
                conversation_id,
                final_text,
                metadata,
                resp,
            } => {
                let result = self
                    .store(&conversation_id)
                    .close_in_flight_turn(final_text, metadata);
                let _ = resp.send(result);
            }
            StoreCommand::FailInFlight {
                conversation_id,
                message,
                resp,
            } => {
                let _ = resp.send(self.store(&conversation_id).fail_in_flight_turn(message));
            }
            StoreCommand::ApplyRemote { event, resp } => {
                let conversation_id = event.conversation_id().clone();
                let _ = resp.send(self.store(&conversation_id).apply_remote(&event));
            }
            StoreCommand::GetView {
                conversation_id,
                resp,
            } => {
                let _ = resp.send(self.store(&conversation_id).get_conversation_view());
            }
            StoreCommand::GetInFlight {
                conversation_id,
                resp,
            } => {
                let _ = resp.send(self.store(&conversation_id).current_in_flight_turn());
            }
            StoreCommand::GetCursor {
                conversation_id,
                resp,
            } => {
                let _ = resp.send(self.store(&conversation_id).cursor());
            }
            StoreCommand::Subscribe {
                conversation_id,
                resp,
            } => {
                let _ = resp.send(self.store(&conversation_id).subscribe());
            }
        }
    }
}

/// Cloneable front for the kernel. Every call is one command.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> StoreCommand) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| ParleyError::ChannelClosed("store kernel is not running".to_string()))?;
        rx.await
            .map_err(|_| ParleyError::ChannelClosed("store kernel dropped the request".to_string()).into())
    }

    pub async fn append_history_page(
        &self,
        conversation_id: &ConversationId,
        records: Vec<EncryptedRecord>,
        page_size: u32,
    ) -> Result<usize> {
        self.request(|resp| StoreCommand::AppendHistoryPage {
            conversation_id: conversation_id.clone(),
            records,
            page_size,
            resp,
        })
        .await
    }

    /// Fetches the page below the current cursor and merges it.
    pub async fn load_next_page(
        &self,
        conversation_id: &ConversationId,
        source: &dyn HistorySource,
        page_size: u32,
    ) -> Result<usize> {
        let cursor = self.history_cursor(conversation_id).await?;
        if cursor.exhausted {
            return Ok(0);
        }
        let records = source
            .fetch_page(conversation_id, cursor.before, page_size)
            .await?;
        self.append_history_page(conversation_id, records, page_size).await
    }

    pub async fn begin_turn(
        &self,
        conversation_id: &ConversationId,
        prompt: &str,
        provider: ResponseProvider,
    ) -> Result<Turn> {
        self.request(|resp| StoreCommand::BeginTurn {
            conversation_id: conversation_id.clone(),
            prompt: prompt.to_string(),
            provider,
            resp,
        })
        .await?
    }

    pub async fn update_in_flight(&self, turn: Turn, flags: TurnFlags) -> Result<()> {
        self.tx
            .send(StoreCommand::UpdateInFlight { turn, flags })
            .await
            .map_err(|_| ParleyError::ChannelClosed("store kernel is not running".to_string()).into())
    }

    pub async fn close_in_flight_turn(
        &self,
        conversation_id: &ConversationId,
        final_text: String,
        metadata: Map<String, Value>,
    ) -> Result<Turn> {
        self.request(|resp| StoreCommand::CloseInFlight {
            conversation_id: conversation_id.clone(),
            final_text,
            metadata,
            resp,
        })
        .await?
    }

    pub async fn fail_in_flight_turn(
        &self,
        conversation_id: &ConversationId,
        message: String,
    ) -> Result<Turn> {
        self.request(|resp| StoreCommand::FailInFlight {
            conversation_id: conversation_id.clone(),
            message,
            resp,
        })
        .await?
    }

    pub async fn apply_remote(&self, event: RealtimeEvent) -> Result<bool> {
        self.request(|resp| StoreCommand::ApplyRemote { event, resp }).await
    }

    pub async fn get_conversation_view(&self, conversation_id: &ConversationId) -> Result<ConversationView> {
        self.request(|resp| StoreCommand::GetView {
            conversation_id: conversation_id.clone(),
            resp,
        })
        .await
    }

    pub async fn current_in_flight_turn(&self, conversation_id: &ConversationId) -> Result<Option<Turn>> {
        self.request(|resp| StoreCommand::GetInFlight {
            conversation_id: conversation_id.clone(),
            resp,
        })
        .await
    }

    pub async fn history_cursor(&self, conversation_id: &ConversationId) -> Result<HistoryCursor> {
        self.request(|resp| StoreCommand::GetCursor {
            conversation_id: conversation_id.clone(),
            resp,
        })
        .await
    }

    pub async fn subscribe(&self, conversation_id: &ConversationId) -> Result<broadcast::Receiver<StoreEvent>> {
        self.request(|resp| StoreCommand::Subscribe {
            conversation_id: conversation_id.clone(),
            resp,
        })
        .await
    }
}
