use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use duet_session::{
    ChatEngine, ChatTransport, EngineError, EngineNotification, Message, Segment, SendOutcome,
    SendPhase, SendRequest, SessionId, TokenProvider,
};
use duet_wire::{EventStream, StreamEvent};

/// Scripted transport: each `open_stream` hands back the next registered
/// channel-backed stream, so tests feed events with precise interleaving.
#[derive(Default)]
struct MockTransport {
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<StreamEvent>>>,
    history: Mutex<HashMap<SessionId, Vec<Message>>>,
    post_results: Mutex<VecDeque<Result<SendOutcome>>>,
    open_calls: AtomicUsize,
    post_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the next stream and return its feeder.
    fn push_stream(&self) -> mpsc::UnboundedSender<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    fn set_history(&self, session: SessionId, messages: Vec<Message>) {
        self.history.lock().unwrap().insert(session, messages);
    }

    fn push_post_result(&self, result: Result<SendOutcome>) {
        self.post_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn open_stream(&self, _request: &SendRequest, _bearer: &str) -> Result<EventStream> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let mut rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no stream scripted"))?;

        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }))
    }

    async fn post_once(&self, _request: &SendRequest, _bearer: &str) -> Result<SendOutcome> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        self.post_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow::anyhow!("no post result scripted")))
    }

    async fn fetch_history(&self, session: SessionId, _bearer: &str) -> Result<Vec<Message>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&session)
            .cloned()
            .unwrap_or_default())
    }
}

struct StaticTokens;

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn access_token(&self) -> Option<String> {
        Some("test-token".to_string())
    }
}

struct NoTokens;

#[async_trait]
impl TokenProvider for NoTokens {
    async fn access_token(&self) -> Option<String> {
        None
    }
}

/// Token provider whose availability can be flipped mid-test.
struct SwitchTokens {
    available: AtomicBool,
}

#[async_trait]
impl TokenProvider for SwitchTokens {
    async fn access_token(&self) -> Option<String> {
        self.available
            .load(Ordering::SeqCst)
            .then(|| "test-token".to_string())
    }
}

fn engine(transport: Arc<MockTransport>) -> ChatEngine {
    // Long fallback so it never interferes unless a test wants it.
    ChatEngine::with_fallback_timeout(transport, Arc::new(StaticTokens), Duration::from_secs(600))
}

/// Let spawned stream tasks drain what was fed so far.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn scenario_new_session_tokens_and_done() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));
    let mut notifications = engine.subscribe();

    let session = SessionId::new();
    let tx = transport.push_stream();
    engine.send_message("Hello").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Session { id: session.0 }).unwrap();
    tx.send(StreamEvent::Token { text: "Hi".into() }).unwrap();
    tx.send(StreamEvent::Token { text: " there".into() }).unwrap();
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.session_id, Some(session));
    assert_eq!(snapshot.messages.last().unwrap().content, "Hi there");
    assert!(!snapshot.loading);
    assert_eq!(snapshot.phase, SendPhase::Done);

    assert_eq!(
        notifications.recv().await.unwrap(),
        EngineNotification::SessionCreated { id: session, preview: "Hello".into() }
    );
    assert_eq!(
        notifications.recv().await.unwrap(),
        EngineNotification::MessageSent { session_id: session, text: "Hello".into() }
    );
}

#[tokio::test]
async fn scenario_tokens_follow_session_after_navigation() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let s1 = SessionId::new();
    let s2 = SessionId::new();
    transport.set_history(s1, vec![Message::user("earlier")]);
    transport.set_history(s2, vec![Message::user("other thread")]);

    engine.present_session(s1).await.unwrap();

    let tx = transport.push_stream();
    engine.send_message("question").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Token { text: "a".into() }).unwrap();
    settle().await;

    // Navigate away mid-stream.
    engine.present_session(s2).await.unwrap();

    tx.send(StreamEvent::Token { text: "b".into() }).unwrap();
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    // S2's displayed list never saw S1's tokens.
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.session_id, Some(s2));
    assert!(snapshot.messages.iter().all(|m| !m.content.contains("ab")));
    assert!(snapshot.messages.iter().any(|m| m.content == "other thread"));

    // Back on S1 the full streamed reply is there.
    engine.present_session(s1).await.unwrap();
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.session_id, Some(s1));
    assert_eq!(snapshot.messages.last().unwrap().content, "ab");
    assert!(!snapshot.loading);
}

#[tokio::test]
async fn scenario_partner_message_single_draft_segment() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    let tx = transport.push_stream();
    engine.send_message("what should I say?").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Session { id: session.0 }).unwrap();
    tx.send(StreamEvent::PartnerMessage { text: "Call them tonight".into() }).unwrap();
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    let last = snapshot.messages.last().unwrap();
    assert_eq!(last.segments.len(), 1);
    assert_eq!(
        last.segments[0],
        Segment::PartnerDraft { text: "Call them tonight".into() }
    );
    assert!(!last.tool_loading);
}

#[tokio::test]
async fn scenario_fallback_reconciles_with_server_state() {
    let transport = MockTransport::new();
    let engine = ChatEngine::with_fallback_timeout(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::new(StaticTokens),
        Duration::from_millis(100),
    );

    let dialogue = SessionId::new();
    let request_id = Uuid::new_v4();
    transport.set_history(
        dialogue,
        vec![Message::user("Hello"), Message::assistant("Hi, how can I help?")],
    );
    transport.push_post_result(Ok(SendOutcome {
        request_id: Some(request_id),
        session_id: Some(dialogue),
    }));

    // Stream that never produces an event; keep the sender alive so the
    // decoder does not see EOF.
    let _tx = transport.push_stream();
    engine.send_message("Hello").await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(transport.post_calls.load(Ordering::SeqCst), 1);

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.session_id, Some(dialogue));
    assert!(!snapshot.loading);
    assert_eq!(snapshot.phase, SendPhase::Done);
    // Server state won: two messages, no leftover optimistic placeholder.
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages[1].content, "Hi, how can I help?");
}

#[tokio::test]
async fn scenario_fallback_failure_surfaces_error() {
    let transport = MockTransport::new();
    let engine = ChatEngine::with_fallback_timeout(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::new(StaticTokens),
        Duration::from_millis(100),
    );

    transport.push_post_result(Err(anyhow::anyhow!("server unavailable")));
    let _tx = transport.push_stream();
    engine.send_message("Hello").await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.phase, SendPhase::Errored);
    assert!(!snapshot.loading);
    assert!(snapshot.messages.last().unwrap().content.starts_with("Error: "));
}

#[tokio::test]
async fn scenario_error_replaces_last_message() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    let tx = transport.push_stream();
    engine.send_message("Hello").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Session { id: session.0 }).unwrap();
    tx.send(StreamEvent::Token { text: "partial".into() }).unwrap();
    tx.send(StreamEvent::Error { message: "rate limited".into() }).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.messages.last().unwrap().content, "Error: rate limited");
    assert!(!snapshot.loading);
    assert_eq!(snapshot.phase, SendPhase::Errored);
}

#[tokio::test]
async fn late_session_binding_uses_send_time_foreground() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));
    let mut notifications = engine.subscribe();

    let session = SessionId::new();
    transport.set_history(session, Vec::new());
    engine.present_session(session).await.unwrap();

    let tx = transport.push_stream();
    engine.send_message("hi").await.unwrap();
    settle().await;

    // No Session event on this stream at all.
    tx.send(StreamEvent::Token { text: "answer".into() }).unwrap();
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.session_id, Some(session));
    assert_eq!(snapshot.messages.last().unwrap().content, "answer");

    assert_eq!(
        notifications.recv().await.unwrap(),
        EngineNotification::MessageSent { session_id: session, text: "hi".into() }
    );
}

#[tokio::test]
async fn second_send_cancels_first_handle() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    transport.set_history(session, Vec::new());
    engine.present_session(session).await.unwrap();

    let tx1 = transport.push_stream();
    engine.send_message("one").await.unwrap();
    settle().await;

    let tx2 = transport.push_stream();
    engine.send_message("two").await.unwrap();
    settle().await;

    // Events for the superseded stream must go nowhere.
    let _ = tx1.send(StreamEvent::Token { text: "stale".into() });

    tx2.send(StreamEvent::Token { text: "fresh".into() }).unwrap();
    tx2.send(StreamEvent::Done).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    assert!(snapshot.messages.iter().all(|m| !m.content.contains("stale")));
    assert_eq!(snapshot.messages.last().unwrap().content, "fresh");
    assert_eq!(snapshot.phase, SendPhase::Done);
    assert!(!snapshot.loading);
}

#[tokio::test]
async fn stop_generation_is_silent_and_keeps_partial_content() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    let tx = transport.push_stream();
    engine.send_message("Hello").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Session { id: session.0 }).unwrap();
    tx.send(StreamEvent::Token { text: "par".into() }).unwrap();
    settle().await;

    engine.stop_generation().await;

    // Anything still in flight is discarded.
    let _ = tx.send(StreamEvent::Token { text: "tial".into() });
    settle().await;

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.phase, SendPhase::Cancelled);
    assert!(!snapshot.loading);
    assert_eq!(snapshot.messages.last().unwrap().content, "par");
    assert!(snapshot.messages.iter().all(|m| !m.content.starts_with("Error")));

    // Stopping again is a no-op.
    engine.stop_generation().await;
}

#[tokio::test]
async fn tool_loading_follows_tool_events() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    let tx = transport.push_stream();
    engine.send_message("look this up").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Session { id: session.0 }).unwrap();
    tx.send(StreamEvent::ToolStart).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    assert!(snapshot.messages.last().unwrap().tool_loading);

    tx.send(StreamEvent::ToolDone).unwrap();
    tx.send(StreamEvent::Token { text: "found it".into() }).unwrap();
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    let snapshot = engine.snapshot().await;
    let last = snapshot.messages.last().unwrap();
    assert!(!last.tool_loading);
    assert_eq!(last.content, "found it");
}

#[tokio::test]
async fn forced_reload_bypasses_fresh_cache() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    transport.set_history(session, vec![Message::user("v1")]);
    engine.present_session(session).await.unwrap();
    assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 1);

    transport.set_history(session, vec![Message::user("v1"), Message::assistant("v2")]);

    // Fresh cache: served without a round-trip.
    engine.load_history(false).await.unwrap();
    assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.snapshot().await.messages.len(), 1);

    // Forced: always hits the server.
    engine.load_history(true).await.unwrap();
    assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.snapshot().await.messages.len(), 2);
}

#[tokio::test]
async fn reload_after_send_keeps_streamed_conversation() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    let tx = transport.push_stream();
    engine.send_message("Hello").await.unwrap();
    settle().await;

    tx.send(StreamEvent::Session { id: session.0 }).unwrap();
    tx.send(StreamEvent::Token { text: "Hi there".into() }).unwrap();
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    // The server now holds the exchange; a non-forced reload must not serve
    // an entry cached before the send.
    transport.set_history(
        session,
        vec![Message::user("Hello"), Message::assistant("Hi there")],
    );
    engine.load_history(false).await.unwrap();
    assert_eq!(transport.fetch_calls.load(Ordering::SeqCst), 1);

    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages.last().unwrap().content, "Hi there");
}

#[tokio::test]
async fn failed_partner_draft_send_stays_retryable() {
    let transport = MockTransport::new();
    let tokens = Arc::new(SwitchTokens { available: AtomicBool::new(true) });
    let engine = ChatEngine::with_fallback_timeout(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        Arc::clone(&tokens) as Arc<dyn TokenProvider>,
        Duration::from_secs(600),
    );

    let session = SessionId::new();
    transport.set_history(session, Vec::new());
    engine.present_session(session).await.unwrap();

    // First attempt fails before anything leaves the engine.
    tokens.available.store(false, Ordering::SeqCst);
    let err = engine.send_partner_draft("Call them tonight").await.unwrap_err();
    assert!(matches!(err, EngineError::Auth));

    // The failed attempt must not count as sent.
    tokens.available.store(true, Ordering::SeqCst);
    let tx = transport.push_stream();
    engine.send_partner_draft("Call them tonight").await.unwrap();
    settle().await;
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    // Only the send that went through blocks a duplicate.
    let err = engine.send_partner_draft("Call them tonight").await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateDraft));
}

#[tokio::test]
async fn duplicate_partner_draft_send_is_rejected() {
    let transport = MockTransport::new();
    let engine = engine(Arc::clone(&transport));

    let session = SessionId::new();
    transport.set_history(session, Vec::new());
    engine.present_session(session).await.unwrap();

    let tx = transport.push_stream();
    engine.send_partner_draft("Call them tonight").await.unwrap();
    settle().await;
    tx.send(StreamEvent::Done).unwrap();
    settle().await;

    let err = engine.send_partner_draft("Call them tonight").await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateDraft));
}

#[tokio::test]
async fn send_without_token_fails_upfront() {
    let transport = MockTransport::new();
    let engine = ChatEngine::new(transport, Arc::new(NoTokens));

    let err = engine.send_message("hi").await.unwrap_err();
    assert!(matches!(err, EngineError::Auth));
}
