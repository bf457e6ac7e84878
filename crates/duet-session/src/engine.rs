use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use duet_wire::StreamEvent;

use crate::bus::{EngineBus, EngineNotification};
use crate::cache::SessionCache;
use crate::error::{EngineError, Result};
use crate::fallback::{spawn_fallback, FALLBACK_TIMEOUT};
use crate::reconcile::{merge_optimistic, SentDraftRegistry};
use crate::store::MessageStore;
use crate::transport::{ChatTransport, SendRequest, TokenProvider};
use crate::types::{Message, SessionId};

/// Lifecycle of the current send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Sending,
    Streaming,
    Done,
    Errored,
    Cancelled,
}

/// One in-flight send. At most one handle is current at a time; cancelling
/// a finished handle is a no-op.
struct StreamHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    fallback: Option<JoinHandle<()>>,
}

impl StreamHandle {
    /// Full cancellation: stream and fallback timer both go away.
    fn cancel(&mut self) {
        self.cancel_stream();
        if let Some(fallback) = self.fallback.take() {
            fallback.abort();
        }
    }

    /// Stop only the stream consumption. Used by the fallback path, which
    /// must keep its own task alive to finish the rescue.
    fn cancel_stream(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Normal termination: the stream finished on its own, so only the
    /// fallback timer needs tearing down.
    fn release(mut self) {
        if let Some(fallback) = self.fallback.take() {
            fallback.abort();
        }
    }
}

/// Everything the engine mutates lives behind one lock, so decoded events,
/// timers and user calls can never interleave a read-modify-write on the
/// same message list.
struct EngineState {
    store: MessageStore,
    cache: SessionCache,
    current: Option<StreamHandle>,
    phase: SendPhase,
}

impl EngineState {
    fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|h| h.id)
    }
}

/// Immutable anchor for one send, captured at call time. Late session-id
/// binding falls back to the snapshot when no `Session` event arrives.
struct StreamContext {
    handle_id: u64,
    snapshot_session: Option<SessionId>,
    snapshot_messages: Vec<Message>,
    bound_session: Option<SessionId>,
    request_id: Option<Uuid>,
    outgoing_text: String,
}

impl StreamContext {
    fn target_session(&self) -> Option<SessionId> {
        self.bound_session.or(self.snapshot_session)
    }
}

/// Point-in-time view of the foreground state, for presentation adapters.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub session_id: Option<SessionId>,
    pub messages: Vec<Message>,
    pub loading: bool,
    pub phase: SendPhase,
}

struct EngineInner {
    state: Mutex<EngineState>,
    transport: Arc<dyn ChatTransport>,
    tokens: Arc<dyn TokenProvider>,
    bus: EngineBus,
    drafts: SentDraftRegistry,
    next_handle_id: AtomicU64,
    fallback_timeout: Duration,
}

/// The stream coordinator. Executes sends end-to-end: optimistic inserts,
/// stream consumption, foreground/background routing, fallback supervision
/// and history reconciliation.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn new(transport: Arc<dyn ChatTransport>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_fallback_timeout(transport, tokens, FALLBACK_TIMEOUT)
    }

    pub fn with_fallback_timeout(
        transport: Arc<dyn ChatTransport>,
        tokens: Arc<dyn TokenProvider>,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    store: MessageStore::new(),
                    cache: SessionCache::new(),
                    current: None,
                    phase: SendPhase::Idle,
                }),
                transport,
                tokens,
                bus: EngineBus::new(),
                drafts: SentDraftRegistry::new(),
                next_handle_id: AtomicU64::new(1),
                fallback_timeout,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.inner.bus.subscribe()
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.inner.state.lock().await;
        EngineSnapshot {
            session_id: state.store.session_id,
            messages: state.store.messages().to_vec(),
            loading: state.store.loading,
            phase: state.phase,
        }
    }

    /// Send one message into the foreground session. A second call while a
    /// stream is active transparently cancels the first.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let bearer = self
            .inner
            .tokens
            .access_token()
            .await
            .ok_or(EngineError::Auth)?;

        let mut state = self.inner.state.lock().await;

        let snapshot_session = state.store.session_id;
        let snapshot_messages = state.store.messages().to_vec();

        state.store.push(Message::user(text));
        let placeholder = Message::placeholder();
        state.store.placeholder_id = Some(placeholder.id);
        state.store.push(placeholder);
        state.store.loading = true;

        if let Some(mut previous) = state.current.take() {
            debug!(handle = previous.id, "superseding in-flight send");
            previous.cancel();
        }
        state.phase = SendPhase::Sending;

        let handle_id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let first_event = Arc::new(Notify::new());

        let request = SendRequest {
            session_id: snapshot_session,
            text: text.to_string(),
        };

        let fallback = spawn_fallback(Arc::clone(&first_event), self.inner.fallback_timeout, {
            let inner = Arc::clone(&self.inner);
            let request = request.clone();
            let bearer = bearer.clone();
            move || async move {
                inner
                    .run_fallback(handle_id, snapshot_session, request, bearer)
                    .await;
            }
        });

        let context = StreamContext {
            handle_id,
            snapshot_session,
            snapshot_messages,
            bound_session: None,
            request_id: None,
            outgoing_text: text.to_string(),
        };

        let task = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let cancelled = Arc::clone(&cancelled);
            async move {
                inner
                    .run_stream(context, request, bearer, cancelled, first_event)
                    .await;
            }
        });

        state.current = Some(StreamHandle {
            id: handle_id,
            cancelled,
            task: Some(task),
            fallback: Some(fallback),
        });

        Ok(())
    }

    /// Send an accepted partner draft, refusing duplicates of a draft that
    /// was already sent for this session.
    pub async fn send_partner_draft(&self, text: &str) -> Result<()> {
        let session = {
            let state = self.inner.state.lock().await;
            state.store.session_id
        };

        if let Some(session) = session {
            if self.inner.drafts.is_sent(session, text) {
                return Err(EngineError::DuplicateDraft);
            }
        }

        // Register the draft only once the send is actually accepted; a
        // failed send must stay retryable.
        self.send_message(text).await?;

        if let Some(session) = session {
            self.inner.drafts.mark_sent(session, text);
        }
        Ok(())
    }

    /// Cancel the current stream. Silent and expected: no error-shaped
    /// message appears and the partial content stays visible.
    pub async fn stop_generation(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(mut handle) = state.current.take() {
            debug!(handle = handle.id, "stopping generation");
            handle.cancel();
            state.phase = SendPhase::Cancelled;
            state.store.loading = false;
        }
    }

    /// Switch the foreground to `session`, demoting the old foreground
    /// list into the cache and promoting any cached content (including a
    /// background streaming placeholder) for the new one.
    pub async fn present_session(&self, session: SessionId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.store.session_id == Some(session) {
            return Ok(());
        }

        // Demote: the cache takes ownership of the old list and of its
        // placeholder binding in the same step.
        let old_placeholder = state.store.placeholder_id.take();
        let old_messages = state.store.take_messages();
        if let Some(old) = state.store.session_id {
            state.cache.put(old, old_messages);
            state.cache.entry_mut(old).placeholder_id = old_placeholder;
        }

        state.store.session_id = Some(session);
        state.store.loading = false;

        match state.cache.get(session).cloned() {
            Some(entry) => {
                state.store.replace_all(entry.messages.clone());
                // Promote: binding migrates cache -> store.
                state.cache.entry_mut(session).placeholder_id = None;
                state.store.placeholder_id = entry.placeholder_id;
                state.store.loading = entry.placeholder_id.is_some();

                let revalidate = state.cache.needs_revalidation(&entry);
                drop(state);
                if revalidate {
                    self.spawn_refresh(session);
                }
                Ok(())
            }
            None => {
                drop(state);
                self.refresh_session(session).await
            }
        }
    }

    /// Reload the foreground session's history. `force` bypasses the cache
    /// regardless of freshness.
    pub async fn load_history(&self, force: bool) -> Result<()> {
        let session = {
            let mut state = self.inner.state.lock().await;
            let Some(session) = state.store.session_id else {
                return Ok(());
            };

            if force {
                state.cache.invalidate(session);
            } else if let Some(entry) = state.cache.get(session).cloned() {
                if state.cache.is_fresh(&entry) {
                    let revalidate = state.cache.needs_revalidation(&entry);
                    state.store.replace_all(entry.messages);
                    drop(state);
                    if revalidate {
                        self.spawn_refresh(session);
                    }
                    return Ok(());
                }
            }
            session
        };

        self.refresh_session(session).await
    }

    /// Fetch `session` from the server, reconcile any optimistic tail, and
    /// install the result wherever the session currently lives.
    async fn refresh_session(&self, session: SessionId) -> Result<()> {
        self.inner.refresh_session(session).await
    }

    fn spawn_refresh(&self, session: SessionId) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.refresh_session(session).await {
                warn!(%session, error = %e, "background refresh failed");
            }
        });
    }
}

impl EngineInner {
    async fn run_stream(
        self: Arc<Self>,
        mut context: StreamContext,
        request: SendRequest,
        bearer: String,
        cancelled: Arc<AtomicBool>,
        first_event: Arc<Notify>,
    ) {
        let stream = match self.transport.open_stream(&request, &bearer).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "failed to open stream");
                first_event.notify_one();
                let mut state = self.state.lock().await;
                self.finish_error(&mut state, &context, "connection failed");
                self.clear_handle(&mut state, context.handle_id);
                return;
            }
        };

        let mut stream = stream;
        while let Some(event) = stream.next().await {
            // Cooperative cancellation between reads.
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            first_event.notify_one();

            let terminal = event.is_terminal();
            {
                let mut state = self.state.lock().await;
                self.apply_event(&mut state, &mut context, event);
            }
            if terminal {
                break;
            }
        }

        let mut state = self.state.lock().await;
        self.clear_handle(&mut state, context.handle_id);
    }

    /// Drop the current handle only if it is still the one that finished;
    /// a superseding send's handle must survive.
    fn clear_handle(&self, state: &mut EngineState, handle_id: u64) {
        if state.current_id() == Some(handle_id) {
            if let Some(handle) = state.current.take() {
                handle.release();
            }
        }
    }

    fn apply_event(&self, state: &mut EngineState, context: &mut StreamContext, event: StreamEvent) {
        if state.phase == SendPhase::Sending && state.current_id() == Some(context.handle_id) {
            state.phase = SendPhase::Streaming;
        }

        match event {
            StreamEvent::Session { id } => self.bind_session(state, context, id.into()),
            StreamEvent::Request { id } => {
                debug!(request = %id, "request confirmed");
                context.request_id = Some(id);
            }
            StreamEvent::ToolStart => {
                self.update_target(state, context, |m| m.with_tool_loading(true));
            }
            StreamEvent::ToolArgs { raw } => {
                debug!(bytes = raw.len(), "tool argument fragment");
            }
            StreamEvent::ToolDone => {
                self.update_target(state, context, |m| m.with_tool_loading(false));
            }
            StreamEvent::Token { text } => {
                self.update_target(state, context, |m| m.push_token(&text));
            }
            StreamEvent::PartnerMessage { text } => {
                // Tool loading is untouched here; a later ToolDone still
                // clears it.
                self.update_target(state, context, |m| m.push_partner_draft(&text));
            }
            StreamEvent::Done => self.finish_done(state, context),
            StreamEvent::Error { message } => self.finish_error(state, context, &message),
        }
    }

    /// Routing rule: compare the target session against the session that
    /// is foreground *now*, not the one at send time.
    fn is_foreground(&self, state: &EngineState, target: Option<SessionId>) -> bool {
        target == state.store.session_id
    }

    fn update_target<F>(&self, state: &mut EngineState, context: &StreamContext, update: F)
    where
        F: FnOnce(Message) -> Message,
    {
        let target = context.target_session();
        if self.is_foreground(state, target) {
            state.store.update_placeholder(update);
        } else if let Some(session) = target {
            state.cache.entry_mut(session).update_placeholder(update);
        } else {
            // Snapshot had no session, none was bound, and the foreground
            // has moved on: nowhere consistent to write.
            warn!("dropping event with no resolvable session");
        }
    }

    fn bind_session(&self, state: &mut EngineState, context: &mut StreamContext, session: SessionId) {
        debug!(%session, "stream bound to session");
        context.bound_session = Some(session);

        if context.snapshot_session.is_none() {
            // Brand-new conversation. Adopt as foreground only if the user
            // has not started or switched to something else meanwhile.
            if state.store.session_id.is_none() {
                state.store.session_id = Some(session);
            }
            state
                .cache
                .seed(session, context.snapshot_messages.clone());
            self.bus.publish(EngineNotification::SessionCreated {
                id: session,
                preview: context.outgoing_text.clone(),
            });
        }
    }

    fn finish_done(&self, state: &mut EngineState, context: &StreamContext) {
        let target = context.target_session();

        if self.is_foreground(state, target) {
            state.store.loading = false;
            state.store.placeholder_id = None;
            if state.current_id() == Some(context.handle_id) {
                state.phase = SendPhase::Done;
            }
            if let Some(session) = target.or(state.store.session_id) {
                // The finished exchange lives in the store; a cached
                // pre-send snapshot must not shadow it on the next reload.
                state.cache.invalidate(session);
                self.bus.publish(EngineNotification::MessageSent {
                    session_id: session,
                    text: context.outgoing_text.clone(),
                });
            }
        } else if let Some(session) = target {
            // Background completion: persist the entry, release the
            // placeholder, leave foreground indicators alone.
            let messages = state.cache.entry_mut(session).messages.clone();
            state.cache.put(session, messages);
            state.cache.entry_mut(session).placeholder_id = None;
            if state.current_id() == Some(context.handle_id) {
                state.phase = SendPhase::Done;
            }
        }
    }

    fn finish_error(&self, state: &mut EngineState, context: &StreamContext, message: &str) {
        let target = context.target_session();
        self.apply_error(state, target, context.handle_id, message);
    }

    /// Replace the last message of the affected session with a synthetic
    /// assistant error; clear loading only when the session is foreground.
    fn apply_error(
        &self,
        state: &mut EngineState,
        target: Option<SessionId>,
        handle_id: u64,
        message: &str,
    ) {
        let synthetic = Message::assistant(format!("Error: {}", message));

        if self.is_foreground(state, target) {
            state.store.replace_last(synthetic);
            state.store.loading = false;
            state.store.placeholder_id = None;
        } else if let Some(session) = target {
            let entry = state.cache.entry_mut(session);
            entry.replace_last(synthetic);
            entry.placeholder_id = None;
        }

        if state.current_id() == Some(handle_id) {
            state.phase = SendPhase::Errored;
        }
    }

    async fn run_fallback(
        self: Arc<Self>,
        handle_id: u64,
        snapshot_session: Option<SessionId>,
        request: SendRequest,
        bearer: String,
    ) {
        match self.transport.post_once(&request, &bearer).await {
            Ok(outcome) => {
                debug!(request_id = ?outcome.request_id, "fallback send succeeded");

                let target = {
                    let mut state = self.state.lock().await;
                    if state.current_id() == Some(handle_id) {
                        if let Some(handle) = state.current.as_mut() {
                            handle.cancel_stream();
                        }
                        state.current = None;
                        state.phase = SendPhase::Done;
                    }

                    let target = outcome.session_id.or(snapshot_session);
                    if snapshot_session.is_none() && state.store.session_id.is_none() {
                        state.store.session_id = target;
                    }
                    if self.is_foreground(&state, target) {
                        state.store.loading = false;
                        state.store.placeholder_id = None;
                    }
                    if let Some(session) = target {
                        state.cache.invalidate(session);
                    }
                    target
                };

                // Converge on server state rather than partial optimistic
                // content.
                if let Some(session) = target {
                    if let Err(e) = self.refresh_session(session).await {
                        warn!(%session, error = %e, "post-fallback reload failed");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "fallback send failed");
                let mut state = self.state.lock().await;
                let was_current = state.current_id() == Some(handle_id);
                if was_current {
                    if let Some(mut handle) = state.current.take() {
                        handle.cancel_stream();
                    }
                }
                self.apply_error(&mut state, snapshot_session, handle_id, "message could not be sent");
                if was_current {
                    state.phase = SendPhase::Errored;
                }
            }
        }
    }

    async fn refresh_session(&self, session: SessionId) -> std::result::Result<(), EngineError> {
        let bearer = self.tokens.access_token().await.ok_or(EngineError::Auth)?;
        let fetched = self
            .transport
            .fetch_history(session, &bearer)
            .await
            .map_err(|e| EngineError::History(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.store.session_id == Some(session) {
            let local_last = state.store.last().cloned();
            let merged = merge_optimistic(fetched, local_last.as_ref());
            state.store.replace_all(merged.clone());
            state.cache.put(session, merged);
        } else {
            let local_last = state
                .cache
                .get(session)
                .and_then(|entry| entry.messages.last().cloned());
            let merged = merge_optimistic(fetched, local_last.as_ref());
            state.cache.put(session, merged);
        }
        Ok(())
    }
}
