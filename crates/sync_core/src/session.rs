use std::{
    collections::HashSet,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Credential, MessageId, UserId},
    error::ApiException,
    protocol::{ClientFrame, ConversationPayload, MessagePayload, Reaction, SendMessageRequest, ServerEnvelope},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    api::{ConversationApi, MediaUpload, MediaUploader},
    config::SyncSettings,
    error::{classify_close, CloseKind, HandshakeError, MutationKind, SyncError, NORMAL_CLOSURE},
    heartbeat::HeartbeatMonitor,
    pagination::{Pagination, ScrollAnchor, ScrollCommand, Viewport},
    polling::PollingFallback,
    reactions::{plan_toggle, ReactionOp},
    reconnect::{BackoffPolicy, ReconnectController, ReconnectDecision},
    store::{Delivery, MergeOutcome, Message, MessageStore, PendingMessage},
    transport::{
        spawn_handshake, spawn_pump, LinkCommand, PushConnector, PushLink, TransportChannel,
        TransportEvent, TransportSink,
    },
    typing::{LocalTyping, TypingState, TypingTable},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Push is down and a retry is scheduled; polling covers the gap.
    Reconnecting,
    /// Push is given up on for this session; polling only.
    Polling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionStateChanged(ConnectionState),
    MessagesChanged {
        scroll: Option<ScrollCommand>,
    },
    /// An older page was prepended. The host restores its scroll position with
    /// `anchor.restore(new_content_height)` once the page is laid out.
    BackfillApplied {
        anchor: ScrollAnchor,
        inserted: usize,
    },
    TypingChanged(Vec<TypingState>),
    MutationFailed {
        kind: MutationKind,
        message: String,
    },
    CredentialRejected {
        code: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<Participant>,
    pub archived: bool,
}

impl Conversation {
    fn participant_mut(&mut self, user_id: UserId) -> Option<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|participant| participant.user_id == user_id)
    }

    fn display_name(&self, user_id: UserId) -> Option<String> {
        self.participants
            .iter()
            .find(|participant| participant.user_id == user_id)
            .and_then(|participant| participant.display_name.clone())
    }
}

impl From<ConversationPayload> for Conversation {
    fn from(payload: ConversationPayload) -> Self {
        Self {
            id: payload.id,
            participants: payload
                .participants
                .into_iter()
                .map(|participant| Participant {
                    user_id: participant.user_id,
                    display_name: participant.display_name,
                    last_read_at: participant.last_read_at,
                })
                .collect(),
            archived: payload.is_archived,
        }
    }
}

pub struct SessionDependencies {
    pub api: Arc<dyn ConversationApi>,
    pub uploader: Arc<dyn MediaUploader>,
    pub connector: Arc<dyn PushConnector>,
}

struct SessionState {
    credential: Credential,
    conversation: Option<Conversation>,
    store: MessageStore,
    pagination: Pagination,
    typing: TypingTable,
    local_typing: LocalTyping,
    typing_idle: Option<JoinHandle<()>>,
    reconnect: ReconnectController,
    connection: ConnectionState,
    channel: TransportChannel,
    backoff_timer: Option<JoinHandle<()>>,
    polling: PollingFallback,
    viewport: Option<Viewport>,
    reactions_in_flight: HashSet<MessageId>,
    closed: bool,
}

impl SessionState {
    fn cancel_timers(&mut self) {
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.typing_idle.take() {
            timer.abort();
        }
    }
}

/// Sync engine for one open conversation.
///
/// All mutable state sits behind one async mutex, so every merge (push, poll,
/// optimistic or backfill) is applied whole before the next one starts. Network
/// calls are made with the lock released.
pub struct ConversationSession {
    conversation_id: ConversationId,
    local_user: UserId,
    api: Arc<dyn ConversationApi>,
    uploader: Arc<dyn MediaUploader>,
    connector: Arc<dyn PushConnector>,
    settings: SyncSettings,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SyncEvent>,
}

/// Routes transport callbacks to a session without keeping it alive.
struct SessionSink(Weak<ConversationSession>);

#[async_trait]
impl TransportSink for SessionSink {
    async fn on_opened(&self, epoch: u64, link: PushLink) {
        match self.0.upgrade() {
            Some(session) => session.handle_opened(epoch, link).await,
            None => {
                let _ = link.outbound.try_send(LinkCommand::Close(NORMAL_CLOSURE));
            }
        }
    }

    async fn on_transport_event(&self, epoch: u64, event: TransportEvent) {
        if let Some(session) = self.0.upgrade() {
            session.handle_transport_event(epoch, event).await;
        }
    }
}

impl ConversationSession {
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        credential: Credential,
        dependencies: SessionDependencies,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            conversation_id,
            local_user,
            api: dependencies.api,
            uploader: dependencies.uploader,
            connector: dependencies.connector,
            inner: Mutex::new(SessionState {
                credential,
                conversation: None,
                store: MessageStore::new(settings.reconcile_window),
                pagination: Pagination::new(
                    settings.backfill_trigger_px,
                    settings.live_edge_threshold_px,
                ),
                typing: TypingTable::new(settings.typing_ttl),
                local_typing: LocalTyping::new(settings.typing_idle_timeout, settings.typing_ttl),
                typing_idle: None,
                reconnect: ReconnectController::new(BackoffPolicy::from_settings(&settings)),
                connection: ConnectionState::Disconnected,
                channel: TransportChannel::default(),
                backoff_timer: None,
                polling: PollingFallback::default(),
                viewport: None,
                reactions_in_flight: HashSet::new(),
                closed: false,
            }),
            settings,
            events,
        })
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn set_connection(&self, state: &mut SessionState, next: ConnectionState) {
        if state.connection != next {
            state.connection = next;
            self.emit(SyncEvent::ConnectionStateChanged(next));
        }
    }

    /// Loads conversation metadata and the newest page, then connects push. Calling
    /// it again re-fetches and restarts the connection with a fresh retry budget.
    pub async fn open(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.inner.lock().await.closed {
            return Err(SyncError::Closed);
        }

        let conversation = self
            .api
            .fetch_conversation(self.conversation_id)
            .await
            .map_err(SyncError::Fetch)?;
        let page = self
            .api
            .list_messages(self.conversation_id, None)
            .await
            .map_err(SyncError::Fetch)?;

        let mut state = self.inner.lock().await;
        if state.closed {
            return Err(SyncError::Closed);
        }
        state.conversation = Some(conversation.into());
        let count = page.results.len();
        for payload in page.results {
            state.store.apply_remote(payload.into());
        }
        state.pagination.set_next(page.next.as_deref());
        self.emit(SyncEvent::MessagesChanged {
            scroll: Some(ScrollCommand::ToBottom { animated: false }),
        });
        info!(
            conversation_id = %self.conversation_id,
            messages = count,
            has_older = state.pagination.has_older(),
            "session: initial page loaded"
        );

        if let Some(timer) = state.backoff_timer.take() {
            timer.abort();
        }
        state.reconnect.begin_open();
        self.set_connection(&mut state, ConnectionState::Connecting);
        self.begin_connect(&mut state);
        Ok(())
    }

    /// Caller-initiated teardown. Cancels the handshake, the link tasks and every
    /// timer; the session cannot be reopened.
    pub async fn close(&self) {
        let mut state = self.inner.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        if state.local_typing.stop() {
            state.channel.send(ClientFrame::TypingStop);
        }
        state.channel.close(NORMAL_CLOSURE);
        state.cancel_timers();
        state.polling.stop();
        state.reconnect.on_clean_close();
        state.typing.clear();
        self.set_connection(&mut state, ConnectionState::Disconnected);
        info!(conversation_id = %self.conversation_id, "session: closed");
    }

    fn begin_connect(self: &Arc<Self>, state: &mut SessionState) {
        let epoch = state.channel.next_epoch();
        debug!(conversation_id = %self.conversation_id, epoch, "push: connecting");
        let handshake = spawn_handshake(
            Arc::new(SessionSink(Arc::downgrade(self))),
            self.connector.clone(),
            self.conversation_id,
            state.credential.clone(),
            epoch,
            self.settings.handshake_timeout,
        );
        state.channel.set_handshake(handshake);
    }

    async fn handle_opened(self: &Arc<Self>, epoch: u64, link: PushLink) {
        let mut state = self.inner.lock().await;
        if state.closed || !state.channel.is_current(epoch) {
            debug!(epoch, "push: dropping superseded link");
            let _ = link.outbound.try_send(LinkCommand::Close(NORMAL_CLOSURE));
            return;
        }
        let PushLink { outbound, inbound } = link;
        let pump = spawn_pump(
            Arc::new(SessionSink(Arc::downgrade(self))),
            epoch,
            inbound,
            outbound.clone(),
            HeartbeatMonitor::new(
                self.settings.heartbeat_interval,
                self.settings.heartbeat_missed_limit,
            ),
        );
        state.channel.attach(outbound, pump);
        state.reconnect.on_opened();
        state.polling.stop();
        self.set_connection(&mut state, ConnectionState::Connected);
        info!(conversation_id = %self.conversation_id, epoch, "push: channel opened");
    }

    async fn handle_transport_event(self: &Arc<Self>, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::MessageReceived(envelope) => self.apply_envelope(epoch, envelope).await,
            TransportEvent::Error(reason) => {
                debug!(epoch, %reason, "push: transport error");
            }
            TransportEvent::Closed { code, reason, .. } => {
                self.handle_closed(epoch, code, reason).await
            }
        }
    }

    async fn handle_closed(self: &Arc<Self>, epoch: u64, code: u16, reason: String) {
        let mut state = self.inner.lock().await;
        if state.closed || !state.channel.is_current(epoch) {
            return;
        }
        state.channel.detach();

        match classify_close(code) {
            CloseKind::Clean => {
                info!(
                    conversation_id = %self.conversation_id,
                    "push: server closed the channel normally; switching to polling"
                );
                state.reconnect.on_clean_close();
                self.start_polling(&mut state);
                self.set_connection(&mut state, ConnectionState::Polling);
            }
            kind => {
                if kind == CloseKind::Auth {
                    warn!(
                        conversation_id = %self.conversation_id,
                        code,
                        %reason,
                        "push: credential rejected"
                    );
                    self.emit(SyncEvent::CredentialRejected { code });
                } else {
                    warn!(conversation_id = %self.conversation_id, code, %reason, "push: channel lost");
                }
                self.schedule_reconnect(&mut state);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut SessionState) {
        self.start_polling(state);
        match state.reconnect.on_lost() {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    conversation_id = %self.conversation_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "push: reconnect scheduled"
                );
                self.set_connection(state, ConnectionState::Reconnecting);
                let epoch = state.channel.epoch();
                let session = Arc::downgrade(self);
                if let Some(previous) = state.backoff_timer.replace(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(session) = session.upgrade() {
                        session.retry_connect(epoch).await;
                    }
                })) {
                    previous.abort();
                }
            }
            ReconnectDecision::GiveUp { attempts } => {
                warn!(
                    conversation_id = %self.conversation_id,
                    attempts,
                    "push: reconnect attempts exhausted; staying on polling"
                );
                self.set_connection(state, ConnectionState::Polling);
            }
        }
    }

    async fn retry_connect(self: &Arc<Self>, epoch: u64) {
        let mut state = self.inner.lock().await;
        if state.closed || !state.channel.is_current(epoch) || !state.reconnect.begin_retry() {
            return;
        }
        state.backoff_timer = None;
        self.begin_connect(&mut state);
    }

    fn start_polling(self: &Arc<Self>, state: &mut SessionState) {
        let session = Arc::downgrade(self);
        state.polling.start(self.settings.poll_interval, move || {
            let session = session.clone();
            async move {
                match session.upgrade() {
                    Some(session) => session.poll_once().await,
                    None => false,
                }
            }
        });
    }

    /// One silent refresh of the newest page. Failures are logged and retried on the
    /// next tick. Returns false once the session is closed.
    async fn poll_once(&self) -> bool {
        if self.inner.lock().await.closed {
            return false;
        }
        match self.api.list_messages(self.conversation_id, None).await {
            Ok(page) => {
                let mut state = self.inner.lock().await;
                if state.closed {
                    return false;
                }
                self.merge_remote_batch(&mut state, page.results);
            }
            Err(err) => {
                debug!(conversation_id = %self.conversation_id, error = %err, "polling: refresh failed");
                self.check_credential(&err);
            }
        }
        true
    }

    fn merge_remote_batch(&self, state: &mut SessionState, payloads: Vec<MessagePayload>) {
        let mut changed = false;
        let mut appended = false;
        for payload in payloads {
            let mut incoming: Message = payload.into();
            // The optimistic reaction set stands until its request settles.
            if state.reactions_in_flight.contains(&incoming.id) {
                if let Some(current) = state.store.reactions(incoming.id) {
                    incoming.reactions = current.to_vec();
                }
            }
            let outcome = state.store.apply_remote(incoming);
            changed |= outcome.changed();
            appended |= matches!(outcome, MergeOutcome::Inserted { index } if index + 1 == state.store.len());
        }
        if changed {
            let scroll = if appended {
                state.pagination.live_edge_command(state.viewport.as_ref())
            } else {
                None
            };
            self.emit(SyncEvent::MessagesChanged { scroll });
        }
    }

    async fn apply_envelope(&self, epoch: u64, envelope: ServerEnvelope) {
        let mut state = self.inner.lock().await;
        if state.closed || !state.channel.is_current(epoch) {
            return;
        }
        let kind = envelope.kind();
        match envelope {
            ServerEnvelope::ConnectionAck | ServerEnvelope::Ping | ServerEnvelope::Pong => {}
            ServerEnvelope::MessageCreated(payload) | ServerEnvelope::MessageUpdated(payload) => {
                if payload.conversation_id != self.conversation_id {
                    debug!(kind, message_id = %payload.id, "push: message for another conversation");
                    return;
                }
                if kind == "message.created" && state.typing.remove(payload.sender_id) {
                    let active = state.typing.active(Instant::now());
                    self.emit(SyncEvent::TypingChanged(active));
                }
                self.merge_remote_batch(&mut state, vec![payload]);
            }
            ServerEnvelope::MessageDeleted(reference) => {
                if reference
                    .conversation_id
                    .is_some_and(|conversation_id| conversation_id != self.conversation_id)
                {
                    return;
                }
                if state.store.apply_remote_deletion(reference.id).changed() {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
            }
            ServerEnvelope::ReactionCreated(reaction) => {
                if state.store.apply_remote_reaction(reaction).changed() {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
            }
            ServerEnvelope::ReactionDeleted(reference) => {
                if state
                    .store
                    .remove_remote_reaction(reference.message_id, reference.id)
                    .changed()
                {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
            }
            ServerEnvelope::TypingStarted(typing) => {
                if typing.user_id == self.local_user {
                    return;
                }
                let now = Instant::now();
                if state.typing.refresh(typing.user_id, typing.display_name, now) {
                    let active = state.typing.active(now);
                    self.emit(SyncEvent::TypingChanged(active));
                }
            }
            ServerEnvelope::TypingStopped(typing) => {
                if state.typing.remove(typing.user_id) {
                    let active = state.typing.active(Instant::now());
                    self.emit(SyncEvent::TypingChanged(active));
                }
            }
        }
    }

    /// Sends a message optimistically and returns its confirmed id. Media is uploaded
    /// first and only the returned URL is attached to the request.
    pub async fn send_message(
        &self,
        content: Option<String>,
        media: Option<MediaUpload>,
    ) -> Result<MessageId, SyncError> {
        let content = content.filter(|content| !content.trim().is_empty());
        if content.is_none() && media.is_none() {
            return Err(SyncError::EmptyMessage);
        }

        let sentinel = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(SyncError::Closed);
            }
            if let Some(timer) = state.typing_idle.take() {
                timer.abort();
            }
            if state.local_typing.stop() {
                state.channel.send(ClientFrame::TypingStop);
            }
            let sender_name = state
                .conversation
                .as_ref()
                .and_then(|conversation| conversation.display_name(self.local_user));
            let sentinel = state.store.apply_optimistic(PendingMessage {
                conversation_id: self.conversation_id,
                sender_id: self.local_user,
                sender_name,
                content: content.clone(),
                media_url: None,
                submitted_at: Utc::now(),
            });
            self.emit(SyncEvent::MessagesChanged {
                scroll: Some(ScrollCommand::ToBottom { animated: true }),
            });
            sentinel
        };

        let result = async {
            let media_url = match media {
                Some(media) => Some(self.uploader.upload(media).await?),
                None => None,
            };
            self.api
                .send_message(self.conversation_id, &SendMessageRequest { content, media_url })
                .await
        }
        .await;

        let mut state = self.inner.lock().await;
        match result {
            Ok(confirmed) => {
                let id = confirmed.id;
                if !state.closed && state.store.resolve_optimistic(sentinel, confirmed.into()).changed() {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
                Ok(id)
            }
            Err(err) => {
                if state.store.fail_optimistic(sentinel).changed() {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
                Err(self.mutation_failed(MutationKind::Send, err))
            }
        }
    }

    /// A REST 401/403 is the same credential problem a push auth close reports,
    /// so it is signalled the same way.
    fn check_credential(&self, err: &anyhow::Error) {
        if let Some(exception) = err
            .downcast_ref::<ApiException>()
            .filter(|exception| exception.is_auth())
        {
            let code = HandshakeError::from_http_status(exception.status, "").code;
            warn!(conversation_id = %self.conversation_id, status = exception.status, "rest: credential rejected");
            self.emit(SyncEvent::CredentialRejected { code });
        }
    }

    fn mutation_failed(&self, kind: MutationKind, err: anyhow::Error) -> SyncError {
        warn!(conversation_id = %self.conversation_id, %kind, error = %err, "session: mutation failed");
        self.check_credential(&err);
        self.emit(SyncEvent::MutationFailed {
            kind,
            message: err.to_string(),
        });
        SyncError::send_failure(kind, err)
    }

    pub async fn edit_message(&self, id: MessageId, content: String) -> Result<(), SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let applied_at = Utc::now();
        let snapshot = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(SyncError::Closed);
            }
            if id.is_sentinel() {
                return Err(SyncError::NotConfirmed(id));
            }
            let snapshot = state
                .store
                .apply_local_edit(id, content.clone(), applied_at)
                .ok_or(SyncError::NotFound(id))?;
            self.emit(SyncEvent::MessagesChanged { scroll: None });
            snapshot
        };

        let result = self.api.edit_message(id, &content).await;

        let mut state = self.inner.lock().await;
        match result {
            Ok(confirmed) => {
                // The local edit time is only a placeholder; the server's copy wins.
                let reverted = state.store.revert_edit(&snapshot, applied_at);
                let merged = state.store.apply_remote(confirmed.into());
                if reverted.changed() || merged.changed() {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
                Ok(())
            }
            Err(err) => {
                if state.store.revert_edit(&snapshot, applied_at).changed() {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
                Err(self.mutation_failed(MutationKind::Edit, err))
            }
        }
    }

    /// Soft-deletes a confirmed message. A failed send is discarded locally instead.
    pub async fn delete_message(&self, id: MessageId) -> Result<(), SyncError> {
        let snapshot = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(SyncError::Closed);
            }
            if id.is_sentinel() {
                let delivery = state.store.get(id).map(|message| message.delivery);
                return match delivery {
                    Some(Delivery::Failed) => {
                        state.store.discard(id);
                        self.emit(SyncEvent::MessagesChanged { scroll: None });
                        Ok(())
                    }
                    Some(_) => Err(SyncError::NotConfirmed(id)),
                    None => Err(SyncError::NotFound(id)),
                };
            }
            let snapshot = state
                .store
                .apply_local_deletion(id)
                .ok_or(SyncError::NotFound(id))?;
            self.emit(SyncEvent::MessagesChanged { scroll: None });
            snapshot
        };

        if let Err(err) = self.api.delete_message(id).await {
            let mut state = self.inner.lock().await;
            if state.store.revert_deletion(&snapshot).changed() {
                self.emit(SyncEvent::MessagesChanged { scroll: None });
            }
            return Err(self.mutation_failed(MutationKind::Delete, err));
        }
        Ok(())
    }

    /// Removes a send that was flagged failed.
    pub async fn discard_failed(&self, id: MessageId) -> Result<(), SyncError> {
        let mut state = self.inner.lock().await;
        let failed = state
            .store
            .get(id)
            .is_some_and(|message| message.delivery == Delivery::Failed);
        if !failed {
            return Err(SyncError::NotFound(id));
        }
        state.store.discard(id);
        self.emit(SyncEvent::MessagesChanged { scroll: None });
        Ok(())
    }

    /// Adds, removes or swaps the local user's reaction. The new set is published
    /// before the request goes out; any failure restores the previous set exactly.
    pub async fn toggle_reaction(&self, message_id: MessageId, symbol: &str) -> Result<(), SyncError> {
        let plan = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(SyncError::Closed);
            }
            if message_id.is_sentinel() {
                return Err(SyncError::NotConfirmed(message_id));
            }
            let current = state
                .store
                .reactions(message_id)
                .ok_or(SyncError::NotFound(message_id))?
                .to_vec();
            if !state.reactions_in_flight.insert(message_id) {
                return Err(SyncError::ReactionInFlight(message_id));
            }
            let sentinel = state.store.next_reaction_sentinel();
            let plan = plan_toggle(message_id, &current, self.local_user, symbol, sentinel);
            if state
                .store
                .replace_reactions(message_id, plan.optimistic.clone())
                .changed()
            {
                self.emit(SyncEvent::MessagesChanged { scroll: None });
            }
            plan
        };

        let result: anyhow::Result<Option<Reaction>> = async {
            match &plan.op {
                ReactionOp::Create { symbol } => {
                    Ok(Some(self.api.create_reaction(message_id, symbol).await?))
                }
                ReactionOp::Delete { reaction_id } => {
                    self.api.delete_reaction(*reaction_id).await?;
                    Ok(None)
                }
                ReactionOp::Replace { delete, symbol } => {
                    self.api.delete_reaction(*delete).await?;
                    Ok(Some(self.api.create_reaction(message_id, symbol).await?))
                }
            }
        }
        .await;

        let mut state = self.inner.lock().await;
        state.reactions_in_flight.remove(&message_id);
        match result {
            Ok(confirmed) => {
                if let (Some(confirmed), Some(sentinel)) = (confirmed, plan.sentinel) {
                    if state
                        .store
                        .confirm_reaction(message_id, sentinel, confirmed)
                        .changed()
                    {
                        self.emit(SyncEvent::MessagesChanged { scroll: None });
                    }
                }
                Ok(())
            }
            Err(err) => {
                if state
                    .store
                    .replace_reactions(message_id, plan.snapshot)
                    .changed()
                {
                    self.emit(SyncEvent::MessagesChanged { scroll: None });
                }
                Err(self.mutation_failed(MutationKind::React, err))
            }
        }
    }

    /// Local keystroke: sends `typing.start` when due and re-arms the idle timer that
    /// sends `typing.stop`.
    pub async fn notify_keystroke(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        if state.closed {
            return;
        }
        let action = state.local_typing.on_keystroke(Instant::now());
        if action.send_start {
            state.channel.send(ClientFrame::TypingStart);
        }
        let idle = state.local_typing.idle_timeout();
        let session = Arc::downgrade(self);
        if let Some(previous) = state.typing_idle.replace(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(session) = session.upgrade() {
                session.on_typing_idle(action.generation).await;
            }
        })) {
            previous.abort();
        }
    }

    async fn on_typing_idle(&self, generation: u64) {
        let mut state = self.inner.lock().await;
        if state.closed {
            return;
        }
        if state.local_typing.on_idle(generation) {
            state.typing_idle = None;
            state.channel.send(ClientFrame::TypingStop);
        }
    }

    /// Records the newest confirmed message as read. The request is fire-and-forget.
    pub async fn mark_read(&self) {
        let last_read_at = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return;
            }
            let Some(last_read_at) = state.store.latest_confirmed_at() else {
                return;
            };
            if let Some(participant) = state
                .conversation
                .as_mut()
                .and_then(|conversation| conversation.participant_mut(self.local_user))
            {
                if participant.last_read_at >= Some(last_read_at) {
                    return;
                }
                participant.last_read_at = Some(last_read_at);
            }
            last_read_at
        };
        if let Err(err) = self.api.mark_read(self.conversation_id, last_read_at).await {
            debug!(conversation_id = %self.conversation_id, error = %err, "session: mark read failed");
        }
    }

    pub async fn set_archived(&self, archived: bool) -> Result<(), SyncError> {
        let previous = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(SyncError::Closed);
            }
            let Some(conversation) = state.conversation.as_mut() else {
                return Err(SyncError::NotOpen);
            };
            std::mem::replace(&mut conversation.archived, archived)
        };
        if previous == archived {
            return Ok(());
        }

        if let Err(err) = self.api.set_archived(self.conversation_id, archived).await {
            let mut state = self.inner.lock().await;
            if let Some(conversation) = state.conversation.as_mut() {
                conversation.archived = previous;
            }
            return Err(self.mutation_failed(MutationKind::Archive, err));
        }
        Ok(())
    }

    /// Replaces the credential used by later connection attempts and REST calls.
    pub async fn update_credential(&self, credential: Credential) {
        let mut state = self.inner.lock().await;
        state.credential = credential.clone();
        self.api.update_credential(credential);
        info!(conversation_id = %self.conversation_id, "session: credential updated");
    }

    /// Records the viewport and backfills when it has reached the top.
    pub async fn on_scroll(&self, viewport: Viewport) -> Result<bool, SyncError> {
        self.backfill(viewport).await
    }

    /// Explicit request for the previous page, anchored to the last known viewport.
    pub async fn load_older(&self) -> Result<bool, SyncError> {
        let viewport = self.inner.lock().await.viewport.map_or(
            Viewport {
                offset: 0.0,
                content_height: 0.0,
                viewport_height: 0.0,
            },
            |viewport| Viewport {
                offset: 0.0,
                ..viewport
            },
        );
        self.backfill(viewport).await
    }

    /// Returns whether a page was prepended. A call made while another backfill is in
    /// flight, away from the top, or with no older pages is a no-op.
    async fn backfill(&self, viewport: Viewport) -> Result<bool, SyncError> {
        let ticket = {
            let mut state = self.inner.lock().await;
            if state.closed {
                return Err(SyncError::Closed);
            }
            state.viewport = Some(viewport);
            match state.pagination.begin_backfill(&viewport) {
                Some(ticket) => ticket,
                None => return Ok(false),
            }
        };
        debug!(conversation_id = %self.conversation_id, cursor = %ticket.cursor, "pagination: backfill started");

        let result = self
            .api
            .list_messages(self.conversation_id, Some(&ticket.cursor))
            .await;

        let mut state = self.inner.lock().await;
        match result {
            Ok(page) => {
                let inserted = page
                    .results
                    .into_iter()
                    .map(|payload| state.store.apply_remote(payload.into()))
                    .filter(|outcome| matches!(outcome, MergeOutcome::Inserted { .. }))
                    .count();
                state.pagination.finish_backfill(page.next.as_deref());
                self.emit(SyncEvent::BackfillApplied {
                    anchor: ticket.anchor,
                    inserted,
                });
                Ok(true)
            }
            Err(err) => {
                state.pagination.abort_backfill();
                Err(SyncError::Fetch(err))
            }
        }
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.lock().await.store.messages().to_vec()
    }

    pub async fn active_typers(&self) -> Vec<TypingState> {
        self.inner.lock().await.typing.active(Instant::now())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    pub async fn conversation(&self) -> Option<Conversation> {
        self.inner.lock().await.conversation.clone()
    }

    pub async fn has_older(&self) -> bool {
        self.inner.lock().await.pagination.has_older()
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
