use crate::assembler::{Applied, TurnAssembler};
use crate::decoder::{decode_stream, DecoderConfig};
use crate::kernel::StoreHandle;
use crate::normalizer::NormalizerConfig;
use crate::realtime::RealtimeChannel;
use crate::recovery::{upstream_error, with_auth_retry, Credential, CredentialSource, RetryContext};
use crate::store::TurnArchive;
use crate::transport::Transport;
use crate::types::*;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How a turn's stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Closed(Turn),
    Errored(Turn),
    /// Reading stopped on request; the turn was left as it was.
    Cancelled(Turn),
}

impl TurnOutcome {
    pub fn turn(&self) -> &Turn {
        match self {
            TurnOutcome::Closed(t) | TurnOutcome::Errored(t) | TurnOutcome::Cancelled(t) => t,
        }
    }
}

/// Drives one turn from request to stored answer: request with auth recovery,
/// decode, normalize, assemble, broadcast, then close or fail in the store.
pub struct StreamHandler {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    realtime: Arc<dyn RealtimeChannel>,
    store: StoreHandle,
    archive: Option<Arc<dyn TurnArchive>>,
    decoder_config: DecoderConfig,
}

impl StreamHandler {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        realtime: Arc<dyn RealtimeChannel>,
        store: StoreHandle,
        decoder_config: DecoderConfig,
    ) -> Self {
        Self {
            transport,
            credentials,
            realtime,
            store,
            archive: None,
            decoder_config,
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn TurnArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Registers the pending turn. Fails with a conflict while another turn
    /// of the same conversation is in flight.
    pub async fn submit(&self, request: &TurnRequest) -> Result<Turn> {
        let turn = self
            .store
            .begin_turn(&request.conversation_id, &request.prompt, request.provider())
            .await?;
        tracing::info!(
            "Turn {} submitted for conversation {} ({})",
            turn.id.short(),
            request.conversation_id.short(),
            turn.response_provider.as_str()
        );
        Ok(turn)
    }

    pub async fn run_turn(&self, turn: Turn, request: TurnRequest, cancel: CancellationToken) -> TurnOutcome {
        let span = tracing::info_span!(
            "turn",
            cid = %request.conversation_id.short(),
            tid = %turn.id.short()
        );
        self.drive(turn, request, cancel).instrument(span).await
    }

    async fn drive(&self, turn: Turn, request: TurnRequest, cancel: CancellationToken) -> TurnOutcome {
        let conversation_id = turn.conversation_id.clone();
        let assembler = TurnAssembler::new(
            turn.clone(),
            NormalizerConfig::for_provider(turn.response_provider),
            self.realtime.clone(),
            request.user_id.clone(),
        );
        let shared = Arc::new(Mutex::new(assembler));
        let mut ctx = RetryContext::new(request.clone(), turn.id.clone());

        let result = {
            let shared = shared.clone();
            let transport = self.transport.clone();
            let store = self.store.clone();
            let decoder_config = self.decoder_config.clone();
            let request = request.clone();

            let attempt = with_auth_retry(&mut ctx, self.credentials.as_ref(), move |credential| {
                let shared = shared.clone();
                let transport = transport.clone();
                let store = store.clone();
                let decoder_config = decoder_config.clone();
                let request = request.clone();
                async move {
                    let mut assembler = shared.lock().await;
                    Self::run_attempt(
                        &mut assembler,
                        transport.as_ref(),
                        &store,
                        &request,
                        &credential,
                        decoder_config,
                    )
                    .await
                }
            });

            tokio::select! {
                result = attempt => Some(result),
                _ = cancel.cancelled() => None,
            }
        };

        let mut assembler = shared.lock().await;
        match result {
            None => {
                let snapshot = assembler.turn().clone();
                tracing::info!(
                    "Turn {} cancelled with {} chars received",
                    snapshot.id.short(),
                    snapshot.answer_text.len()
                );
                TurnOutcome::Cancelled(snapshot)
            }
            Some(Ok(())) => {
                let finished = assembler.finish();
                drop(assembler);
                let stored = match self
                    .store
                    .close_in_flight_turn(
                        &conversation_id,
                        finished.answer_text.clone(),
                        finished.metadata.clone(),
                    )
                    .await
                {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("Failed to close turn {} in store: {}", finished.id.short(), e.inner);
                        finished
                    }
                };
                self.archive(&stored).await;
                TurnOutcome::Closed(stored)
            }
            Some(Err(e)) => {
                tracing::error!("[☁️  -> ⚙️ ] Turn failed: {}", e.inner);
                let message = e.inner.user_message();
                let failed = assembler.fail(&message);
                drop(assembler);
                let stored = match self.store.fail_in_flight_turn(&conversation_id, message).await {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("Failed to record error for turn {}: {}", failed.id.short(), e.inner);
                        failed
                    }
                };
                self.archive(&stored).await;
                TurnOutcome::Errored(stored)
            }
        }
    }

    async fn run_attempt(
        assembler: &mut TurnAssembler,
        transport: &dyn Transport,
        store: &StoreHandle,
        request: &TurnRequest,
        credential: &Credential,
        decoder_config: DecoderConfig,
    ) -> Result<()> {
        let attempt = assembler.begin_attempt();
        tracing::debug!("[⚙️  -> ☁️ ] Opening stream (attempt {})", attempt);

        let body = transport.open(request, credential).await?;
        let events = decode_stream(body, decoder_config);
        futures_util::pin_mut!(events);

        while let Some(item) = events.next().await {
            let event = item?;
            let visible = !matches!(event, StreamEvent::ControlMarker(ControlMarker::Ignore));
            match assembler.apply(event) {
                Applied::Continue => {
                    if visible {
                        store
                            .update_in_flight(assembler.turn().clone(), assembler.flags())
                            .await?;
                    }
                }
                Applied::Finished => break,
                Applied::UpstreamError { status, message } => {
                    return Err(upstream_error(status, message));
                }
            }
        }
        Ok(())
    }

    async fn archive(&self, turn: &Turn) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.persist_turn(turn).await {
                tracing::error!("Failed to persist turn {}: {}", turn.id.short(), e.inner);
            }
        }
    }
}
