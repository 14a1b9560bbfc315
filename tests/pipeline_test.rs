use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parley::crypto::MessageCipher;
use parley::decoder::DecoderConfig;
use parley::kernel::{StoreHandle, StoreKernel};
use parley::realtime::{BroadcastRealtime, RealtimeEvent};
use parley::recovery::{Credential, CredentialSource};
use parley::store::{StoreEvent, TurnArchive};
use parley::streaming::{StreamHandler, TurnOutcome};
use parley::transport::{ByteStream, Transport};
use parley::types::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

enum Reply {
    Body(Vec<&'static str>),
    /// Yields the chunks, then never ends.
    Hang(Vec<&'static str>),
    /// Chunks cut at arbitrary byte offsets.
    Raw(Vec<Bytes>),
    Fail(ParleyError),
}

struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn credentials_seen(&self) -> Vec<String> {
        match self.seen.lock() {
            Ok(s) => s.clone(),
            Err(e) => panic!("poisoned: {}", e),
        }
    }
}

fn chunks(parts: Vec<&'static str>) -> Vec<std::io::Result<Bytes>> {
    parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _request: &TurnRequest, credential: &Credential) -> Result<ByteStream> {
        match self.seen.lock() {
            Ok(mut s) => s.push(credential.secret().to_string()),
            Err(e) => panic!("poisoned: {}", e),
        }
        let reply = match self.replies.lock() {
            Ok(mut r) => r.pop_front(),
            Err(e) => panic!("poisoned: {}", e),
        };
        let body: ByteStream = match reply {
            Some(Reply::Body(parts)) => Box::pin(stream::iter(chunks(parts))),
            Some(Reply::Hang(parts)) => Box::pin(stream::iter(chunks(parts)).chain(stream::pending())),
            Some(Reply::Raw(parts)) => {
                let parts: Vec<std::io::Result<Bytes>> = parts.into_iter().map(Ok).collect();
                Box::pin(stream::iter(parts))
            }
            Some(Reply::Fail(e)) => return Err(e.into()),
            None => panic!("transport called more often than scripted"),
        };
        Ok(body)
    }
}

#[derive(Default)]
struct CountingCredentials {
    refreshes: AtomicUsize,
}

#[async_trait]
impl CredentialSource for CountingCredentials {
    async fn current(&self) -> Result<Credential> {
        Ok(Credential::new("stale"))
    }

    async fn refresh(&self) -> Result<Credential> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::new("fresh"))
    }
}

#[derive(Default)]
struct RecordingArchive {
    turns: Mutex<Vec<Turn>>,
}

#[async_trait]
impl TurnArchive for RecordingArchive {
    async fn persist_turn(&self, turn: &Turn) -> Result<()> {
        match self.turns.lock() {
            Ok(mut t) => t.push(turn.clone()),
            Err(e) => panic!("poisoned: {}", e),
        }
        Ok(())
    }
}

struct Harness {
    handler: Arc<StreamHandler>,
    store: StoreHandle,
    transport: Arc<ScriptedTransport>,
    credentials: Arc<CountingCredentials>,
    archive: Arc<RecordingArchive>,
    events: broadcast::Receiver<RealtimeEvent>,
}

fn harness(replies: Vec<Reply>) -> Harness {
    let cipher = match MessageCipher::from_base64_key(&MessageCipher::generate_key()) {
        Ok(c) => Arc::new(c),
        Err(e) => panic!("cipher: {:?}", e),
    };
    let store = StoreKernel::spawn(cipher, 256, 64);
    let realtime = BroadcastRealtime::new(1024);
    let events = realtime.subscribe();
    let transport = Arc::new(ScriptedTransport::new(replies));
    let credentials = Arc::new(CountingCredentials::default());
    let archive = Arc::new(RecordingArchive::default());
    let handler = StreamHandler::new(
        transport.clone(),
        credentials.clone(),
        Arc::new(realtime),
        store.clone(),
        DecoderConfig::default(),
    )
    .with_archive(archive.clone());
    Harness {
        handler: Arc::new(handler),
        store,
        transport,
        credentials,
        archive,
        events,
    }
}

fn request(cid: &str, model: &str) -> TurnRequest {
    TurnRequest {
        conversation_id: ConversationId::from(cid),
        prompt: "question".to_string(),
        model: model.to_string(),
        user_id: None,
    }
}

async fn run(h: &Harness, req: TurnRequest) -> TurnOutcome {
    let turn = match h.handler.submit(&req).await {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {:?}", e),
    };
    h.handler.run_turn(turn, req, CancellationToken::new()).await
}

fn drain(events: &mut broadcast::Receiver<RealtimeEvent>) -> Vec<RealtimeEvent> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

fn deltas(events: &[RealtimeEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RealtimeEvent::Delta { chunk, .. } => Some(chunk.clone()),
            _ => None,
        })
        .collect()
}

fn closed_text(events: &[RealtimeEvent]) -> Option<(String, TurnStatus)> {
    events.iter().find_map(|e| match e {
        RealtimeEvent::StreamClosed {
            final_text, status, ..
        } => Some((final_text.clone(), *status)),
        _ => None,
    })
}

#[tokio::test]
async fn test_split_chunks_assemble_hello_world() {
    let mut h = harness(vec![Reply::Body(vec!["data: Hello ", "data: world\n"])]);
    let outcome = run(&h, request("c-hello", "gpt-4o")).await;

    match &outcome {
        TurnOutcome::Closed(turn) => {
            assert_eq!(turn.answer_text, "Hello world");
            assert_eq!(turn.status, TurnStatus::Closed);
        }
        other => panic!("expected closed turn, got {:?}", other),
    }

    let events = drain(&mut h.events);
    assert_eq!(deltas(&events).concat(), "Hello world");
    assert_eq!(
        closed_text(&events),
        Some(("Hello world".to_string(), TurnStatus::Closed))
    );
}

#[tokio::test]
async fn test_answer_is_independent_of_chunk_boundaries() {
    const BODY: &str = "data: Hello data: world\ndata: !\ndata: [DONE]\n";
    for split in 1..BODY.len() {
        let (head, tail) = BODY.split_at(split);
        let h = harness(vec![Reply::Body(vec![head, tail])]);
        let outcome = run(&h, request(&format!("c-split-{}", split), "gpt-4o")).await;
        assert_eq!(
            outcome.turn().answer_text,
            "Hello world!",
            "split at byte {} changed the answer",
            split
        );
    }
}

#[tokio::test]
async fn test_multibyte_text_and_straddling_citations_survive_any_split() {
    const BODY: &str = "data: café ✓,citations:['http://a.com',\ndata:  'http://b.com']\ndata:  see [1] and [2]\ndata: [DONE]\n";
    let bytes = BODY.as_bytes();

    let whole = harness(vec![Reply::Raw(vec![Bytes::from_static(bytes)])]);
    let baseline = run(&whole, request("c-utf8", "sonar-pro")).await.turn().answer_text.clone();
    assert!(
        baseline.starts_with("café ✓ see a.com and b.com"),
        "got {:?}",
        baseline
    );
    assert!(baseline.ends_with("### Sources\n- http://a.com\n- http://b.com"));

    for split in 1..bytes.len() {
        let h = harness(vec![Reply::Raw(vec![
            Bytes::copy_from_slice(&bytes[..split]),
            Bytes::copy_from_slice(&bytes[split..]),
        ])]);
        let outcome = run(&h, request(&format!("c-utf8-{}", split), "sonar-pro")).await;
        assert_eq!(
            outcome.turn().answer_text,
            baseline,
            "split at byte {} changed the answer",
            split
        );
    }
}

#[tokio::test]
async fn test_deliberation_marker_reaches_store_view() {
    let h = harness(vec![Reply::Hang(vec!["data: <<PRO_AGENT_THINKING>>\n"])]);
    let req = request("c-deliberate", "gpt-4o");
    let mut updates = match h.store.subscribe(&req.conversation_id).await {
        Ok(rx) => rx,
        Err(e) => panic!("subscribe failed: {:?}", e),
    };
    let turn = match h.handler.submit(&req).await {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {:?}", e),
    };

    let cancel = CancellationToken::new();
    let task = {
        let handler = h.handler.clone();
        let cancel = cancel.clone();
        let req = req.clone();
        tokio::spawn(async move { handler.run_turn(turn, req, cancel).await })
    };

    loop {
        match updates.recv().await {
            Ok(StoreEvent::InFlightUpdated { flags, .. }) if flags.deliberating => break,
            Ok(_) => continue,
            Err(e) => panic!("store events ended: {:?}", e),
        }
    }

    let view = match h.store.get_conversation_view(&req.conversation_id).await {
        Ok(v) => v,
        Err(e) => panic!("view failed: {:?}", e),
    };
    match view.in_flight {
        Some(v) => {
            assert_eq!(v.flags.map(|f| f.deliberating), Some(true));
            assert_eq!(v.turn.answer_text, "");
        }
        None => panic!("turn left flight while deliberating"),
    }

    cancel.cancel();
    if let Err(e) = task.await {
        panic!("turn task panicked: {:?}", e);
    }
}

#[tokio::test]
async fn test_inline_citations_produce_single_sources_section() {
    let h = harness(vec![Reply::Body(vec![
        "data: [1] says X,citations:['http://a.com']\n",
    ])]);
    let outcome = run(&h, request("c-sources", "sonar-pro")).await;

    let answer = &outcome.turn().answer_text;
    assert!(answer.ends_with("### Sources\n- http://a.com"), "got {:?}", answer);
    assert_eq!(answer.matches("### Sources").count(), 1);
    assert_eq!(answer.matches("- http://a.com").count(), 1);

    let archived = match h.archive.turns.lock() {
        Ok(t) => t.clone(),
        Err(e) => panic!("poisoned: {}", e),
    };
    assert_eq!(archived.len(), 1);
    assert_eq!(&archived[0].answer_text, answer);
}

#[tokio::test]
async fn test_auth_failure_before_body_is_retried_once() {
    let h = harness(vec![
        Reply::Fail(ParleyError::Unauthorized("token expired".to_string())),
        Reply::Body(vec!["data: Hello\n"]),
    ]);
    let outcome = run(&h, request("c-auth", "gpt-4o")).await;

    assert!(matches!(outcome, TurnOutcome::Closed(_)));
    assert_eq!(outcome.turn().answer_text, "Hello");
    assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.credentials_seen(), vec!["stale", "fresh"]);
}

#[tokio::test]
async fn test_inband_auth_error_retry_does_not_duplicate_deltas() {
    let mut h = harness(vec![
        Reply::Body(vec![
            "data: Hel\n",
            "data: {\"error\": {\"code\": 401, \"message\": \"token expired\"}}\n",
        ]),
        Reply::Body(vec!["data: Hello world\n"]),
    ]);
    let outcome = run(&h, request("c-inband", "gpt-4o")).await;

    assert_eq!(outcome.turn().answer_text, "Hello world");
    let events = drain(&mut h.events);
    assert_eq!(deltas(&events), vec!["Hel", "lo world"]);
    assert_eq!(
        closed_text(&events),
        Some(("Hello world".to_string(), TurnStatus::Closed))
    );
}

#[tokio::test]
async fn test_second_auth_failure_is_terminal() {
    let mut h = harness(vec![
        Reply::Fail(ParleyError::Unauthorized("token expired".to_string())),
        Reply::Fail(ParleyError::Unauthorized("still expired".to_string())),
    ]);
    let cid = ConversationId::from("c-terminal");
    let outcome = run(&h, request(&cid.0, "gpt-4o")).await;

    match &outcome {
        TurnOutcome::Errored(turn) => {
            assert_eq!(turn.status, TurnStatus::Errored);
            assert_eq!(turn.answer_text, "still expired");
        }
        other => panic!("expected errored turn, got {:?}", other),
    }
    assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 1);

    let events = drain(&mut h.events);
    assert_eq!(
        closed_text(&events),
        Some(("still expired".to_string(), TurnStatus::Errored))
    );

    match h.store.current_in_flight_turn(&cid).await {
        Ok(None) => {}
        other => panic!("errored turn should leave flight, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_not_retried() {
    let h = harness(vec![Reply::Fail(ParleyError::Upstream(
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        "boom".to_string(),
    ))]);
    let outcome = run(&h, request("c-500", "gpt-4o")).await;

    assert!(matches!(outcome, TurnOutcome::Errored(_)));
    assert_eq!(h.transport.credentials_seen().len(), 1);
    assert_eq!(h.credentials.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancellation_leaves_turn_in_flight() {
    let mut h = harness(vec![Reply::Hang(vec!["data: partial\n"])]);
    let req = request("c-cancel", "gpt-4o");
    let turn = match h.handler.submit(&req).await {
        Ok(t) => t,
        Err(e) => panic!("submit failed: {:?}", e),
    };
    let turn_id = turn.id.clone();

    let cancel = CancellationToken::new();
    let handler = h.handler.clone();
    let task = {
        let cancel = cancel.clone();
        let req = req.clone();
        tokio::spawn(async move { handler.run_turn(turn, req, cancel).await })
    };

    match h.events.recv().await {
        Ok(RealtimeEvent::Delta { chunk, .. }) => assert_eq!(chunk, "partial"),
        other => panic!("expected a delta, got {:?}", other),
    }
    cancel.cancel();

    let outcome = match task.await {
        Ok(o) => o,
        Err(e) => panic!("turn task panicked: {:?}", e),
    };
    assert!(matches!(outcome, TurnOutcome::Cancelled(_)));
    assert!(closed_text(&drain(&mut h.events)).is_none());

    match h.store.current_in_flight_turn(&req.conversation_id).await {
        Ok(Some(t)) => assert_eq!(t.id, turn_id),
        other => panic!("cancelled turn should stay in flight, got {:?}", other),
    }
}

#[tokio::test]
async fn test_second_submit_conflicts_while_in_flight() {
    let h = harness(vec![]);
    let req = request("c-conflict", "gpt-4o");
    if let Err(e) = h.handler.submit(&req).await {
        panic!("first submit failed: {:?}", e);
    }
    match h.handler.submit(&req).await {
        Err(e) => assert!(matches!(e.inner, ParleyError::Conflict(_))),
        Ok(t) => panic!("expected conflict, got turn {:?}", t),
    }
}
