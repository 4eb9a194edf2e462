use super::*;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicI64, AtomicUsize, Ordering},
    time::Duration,
};

use anyhow::anyhow;
use shared::{
    domain::ReactionId,
    protocol::{MessagePage, ParticipantPayload, TypingPayload},
};
use tokio::sync::{mpsc, Notify};

use crate::{
    error::{HandshakeError, ABNORMAL_CLOSURE, UNAUTHORIZED_CLOSURE},
    transport::{CloseInfo, LinkEvent},
};

const ME: UserId = UserId(7);
const PEER: UserId = UserId(2);
const CONVERSATION: ConversationId = ConversationId(1);

struct TestLink {
    inbound: mpsc::Sender<LinkEvent>,
    outbound: mpsc::Receiver<LinkCommand>,
}

impl TestLink {
    async fn push(&self, envelope: ServerEnvelope) {
        self.inbound
            .send(LinkEvent::Envelope(envelope))
            .await
            .expect("push envelope");
    }

    fn commands(&mut self) -> Vec<LinkCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.outbound.try_recv() {
            commands.push(command);
        }
        commands
    }
}

#[derive(Default)]
struct MockConnector {
    refuse_all: Option<u16>,
    refusals: Mutex<VecDeque<HandshakeError>>,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<VecDeque<TestLink>>,
}

impl MockConnector {
    async fn attempts(&self) -> usize {
        self.attempts.lock().await.len()
    }

    async fn next_link(&self) -> TestLink {
        settle().await;
        self.links.lock().await.pop_front().expect("push link")
    }
}

#[async_trait]
impl PushConnector for MockConnector {
    async fn connect(
        &self,
        _conversation_id: ConversationId,
        _credential: &Credential,
    ) -> Result<PushLink, HandshakeError> {
        self.attempts.lock().await.push(Instant::now());
        if let Some(code) = self.refuse_all {
            return Err(HandshakeError {
                code,
                reason: "refused".to_string(),
            });
        }
        if let Some(err) = self.refusals.lock().await.pop_front() {
            return Err(err);
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        self.links.lock().await.push_back(TestLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });
        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[derive(Default)]
struct MockApi {
    newest: Vec<MessagePayload>,
    newest_next: Option<String>,
    older: Vec<MessagePayload>,
    fail_fetch: bool,
    fail_sends: bool,
    send_rejection: Option<u16>,
    fail_mutations: bool,
    fail_reactions: bool,
    gate_reactions: bool,
    gate_mutations: bool,
    gate_sends: bool,
    gate_backfill: bool,
    send_gate: Notify,
    backfill_gate: Notify,
    reaction_gate: Notify,
    mutation_gate: Notify,
    newest_calls: AtomicUsize,
    older_cursors: Mutex<Vec<String>>,
    sent: Mutex<Vec<SendMessageRequest>>,
    next_reaction_id: AtomicI64,
}

#[async_trait]
impl ConversationApi for MockApi {
    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<ConversationPayload> {
        if self.fail_fetch {
            return Err(anyhow!("offline"));
        }
        Ok(ConversationPayload {
            id: conversation_id,
            participants: vec![
                ParticipantPayload {
                    user_id: ME,
                    display_name: Some("me".to_string()),
                    last_read_at: None,
                },
                ParticipantPayload {
                    user_id: PEER,
                    display_name: Some("bob".to_string()),
                    last_read_at: None,
                },
            ],
            is_archived: false,
        })
    }

    async fn list_messages(
        &self,
        _conversation_id: ConversationId,
        cursor: Option<&str>,
    ) -> anyhow::Result<MessagePage> {
        match cursor {
            None => {
                self.newest_calls.fetch_add(1, Ordering::SeqCst);
                Ok(MessagePage {
                    results: self.newest.clone(),
                    next: self.newest_next.clone(),
                })
            }
            Some(cursor) => {
                self.older_cursors.lock().await.push(cursor.to_string());
                if self.gate_backfill {
                    self.backfill_gate.notified().await;
                }
                Ok(MessagePage {
                    results: self.older.clone(),
                    next: None,
                })
            }
        }
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: &SendMessageRequest,
    ) -> anyhow::Result<MessagePayload> {
        if self.gate_sends {
            self.send_gate.notified().await;
        }
        if self.fail_sends {
            return Err(anyhow!("server unavailable"));
        }
        if let Some(status) = self.send_rejection {
            return Err(ApiException::from_body(status, "token expired").into());
        }
        self.sent.lock().await.push(request.clone());
        Ok(MessagePayload {
            conversation_id,
            content: request.content.clone(),
            media_url: request.media_url.clone(),
            ..payload(100, ME, "", Utc::now())
        })
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> anyhow::Result<MessagePayload> {
        if self.gate_mutations {
            self.mutation_gate.notified().await;
        }
        if self.fail_mutations {
            return Err(anyhow!("edit rejected"));
        }
        Ok(MessagePayload {
            edited_at: Some(at(500)),
            ..payload(message_id.0, ME, content, at(0))
        })
    }

    async fn delete_message(&self, _message_id: MessageId) -> anyhow::Result<()> {
        if self.gate_mutations {
            self.mutation_gate.notified().await;
        }
        if self.fail_mutations {
            return Err(anyhow!("delete rejected"));
        }
        Ok(())
    }

    async fn create_reaction(
        &self,
        message_id: MessageId,
        symbol: &str,
    ) -> anyhow::Result<Reaction> {
        if self.gate_reactions {
            self.reaction_gate.notified().await;
        }
        if self.fail_reactions {
            return Err(anyhow!("reaction rejected"));
        }
        Ok(Reaction {
            id: ReactionId(500 + self.next_reaction_id.fetch_add(1, Ordering::SeqCst)),
            message_id,
            user_id: ME,
            symbol: symbol.to_string(),
        })
    }

    async fn delete_reaction(&self, _reaction_id: ReactionId) -> anyhow::Result<()> {
        if self.fail_reactions {
            return Err(anyhow!("reaction rejected"));
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        _conversation_id: ConversationId,
        _last_read_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Err(anyhow!("read receipts are down"))
    }

    async fn set_archived(
        &self,
        _conversation_id: ConversationId,
        _archived: bool,
    ) -> anyhow::Result<()> {
        if self.fail_mutations {
            return Err(anyhow!("archive rejected"));
        }
        Ok(())
    }
}

struct StalledConnector {
    attempts: AtomicUsize,
}

#[async_trait]
impl PushConnector for StalledConnector {
    async fn connect(
        &self,
        _conversation_id: ConversationId,
        _credential: &Credential,
    ) -> Result<PushLink, HandshakeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

struct StaticUploader;

#[async_trait]
impl MediaUploader for StaticUploader {
    async fn upload(&self, media: MediaUpload) -> anyhow::Result<String> {
        Ok(format!("https://cdn.example.com/{}", media.filename))
    }
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + seconds, 0).expect("timestamp")
}

fn payload(id: i64, sender: UserId, content: &str, created_at: DateTime<Utc>) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: CONVERSATION,
        sender_id: sender,
        sender_name: None,
        content: Some(content.to_string()),
        media_url: None,
        created_at,
        edited_at: None,
        is_deleted: false,
        reactions: Vec::new(),
    }
}

fn session_with(api: &Arc<MockApi>, connector: &Arc<MockConnector>) -> Arc<ConversationSession> {
    ConversationSession::new(
        CONVERSATION,
        ME,
        Credential::new("token"),
        SessionDependencies {
            api: api.clone(),
            uploader: Arc::new(StaticUploader),
            connector: connector.clone(),
        },
        SyncSettings::default(),
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|message| message.id.0).collect()
}

#[tokio::test(start_paused = true)]
async fn abnormal_closures_back_off_then_hand_off_to_polling() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector {
        refuse_all: Some(ABNORMAL_CLOSURE),
        ..Default::default()
    });
    let session = session_with(&api, &connector);
    let mut events = session.subscribe_events();

    session.open().await.expect("open");
    tokio::time::sleep(Duration::from_secs(40)).await;

    let attempts = connector.attempts.lock().await.clone();
    assert_eq!(attempts.len(), 6);
    let expected = [1_000u128, 2_000, 4_000, 8_000, 16_000];
    for (pair, expected) in attempts.windows(2).zip(expected) {
        let gap = (pair[1] - pair[0]).as_millis();
        assert!(
            (expected..expected + 5).contains(&gap),
            "gap {gap}ms, expected {expected}ms"
        );
    }
    assert_eq!(session.connection_state().await, ConnectionState::Polling);

    let polls_after_giving_up = api.newest_calls.load(Ordering::SeqCst);
    assert!(polls_after_giving_up > 1);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts().await, 6);
    assert!(api.newest_calls.load(Ordering::SeqCst) > polls_after_giving_up);

    let states: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::ConnectionStateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Polling
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn close_cancels_backoff_polling_and_typing_timers() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut link = connector.next_link().await;

    session.notify_keystroke().await;
    link.inbound
        .send(LinkEvent::Closed(CloseInfo::abnormal("connection reset")))
        .await
        .expect("close link");
    settle().await;
    assert_eq!(session.connection_state().await, ConnectionState::Reconnecting);

    session.close().await;
    let mut events = session.subscribe_events();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(connector.attempts().await, 1);
    assert_eq!(api.newest_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        link.commands(),
        vec![LinkCommand::Frame(ClientFrame::TypingStart)]
    );
    assert!(drain(&mut events).is_empty());
    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
    assert!(matches!(session.open().await, Err(SyncError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn close_sends_normal_closure_and_stops_the_heartbeat() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut link = connector.next_link().await;
    assert_eq!(session.connection_state().await, ConnectionState::Connected);

    session.close().await;
    tokio::time::sleep(Duration::from_secs(200)).await;

    assert_eq!(link.commands(), vec![LinkCommand::Close(NORMAL_CLOSURE)]);
    assert_eq!(connector.attempts().await, 1);
}

#[tokio::test(start_paused = true)]
async fn silent_link_is_replaced_after_heartbeat_timeout() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut first = connector.next_link().await;

    tokio::time::sleep(Duration::from_secs(92)).await;

    assert_eq!(connector.attempts().await, 2);
    assert_eq!(session.connection_state().await, ConnectionState::Connected);
    assert_eq!(
        first.commands(),
        vec![LinkCommand::Frame(ClientFrame::Ping); 2]
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_credential_is_signalled_and_retried() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    connector
        .refusals
        .lock()
        .await
        .push_back(HandshakeError::from_http_status(401, "token expired"));
    let session = session_with(&api, &connector);
    let mut events = session.subscribe_events();

    session.open().await.expect("open");
    settle().await;

    assert!(drain(&mut events).contains(&SyncEvent::CredentialRejected {
        code: UNAUTHORIZED_CLOSURE
    }));
    assert_eq!(session.connection_state().await, ConnectionState::Reconnecting);

    session.update_credential(Credential::new("fresh")).await;
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(connector.attempts().await, 2);
    assert_eq!(session.connection_state().await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn server_normal_closure_falls_back_to_polling_without_reconnecting() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;

    link.inbound
        .send(LinkEvent::Closed(CloseInfo::new(NORMAL_CLOSURE, "server restart")))
        .await
        .expect("close link");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(session.connection_state().await, ConnectionState::Polling);
    assert_eq!(connector.attempts().await, 1);
    assert!(api.newest_calls.load(Ordering::SeqCst) > 1);
}

#[tokio::test(start_paused = true)]
async fn initial_load_failure_is_reported_and_push_is_not_opened() {
    let api = Arc::new(MockApi {
        fail_fetch: true,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);

    let err = session.open().await.expect_err("fetch failure");

    assert!(matches!(err, SyncError::Fetch(_)));
    assert!(!err.is_user_visible());
    settle().await;
    assert_eq!(connector.attempts().await, 0);
    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn push_copy_racing_the_send_response_leaves_one_entry() {
    let api = Arc::new(MockApi {
        gate_sends: true,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;

    let sending = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message(Some("hello".to_string()), None).await })
    };
    settle().await;
    let pending = session.messages().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].id.is_sentinel());
    assert_eq!(pending[0].delivery, Delivery::Pending);
    assert_eq!(pending[0].sender_name.as_deref(), Some("me"));

    link.push(ServerEnvelope::MessageCreated(payload(100, ME, "hello", Utc::now())))
        .await;
    settle().await;
    assert_eq!(ids(&session.messages().await), vec![100]);

    api.send_gate.notify_one();
    let confirmed = sending.await.expect("join").expect("send");

    assert_eq!(confirmed, MessageId(100));
    let messages = session.messages().await;
    assert_eq!(ids(&messages), vec![100]);
    assert_eq!(messages[0].delivery, Delivery::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn failed_send_is_flagged_and_can_be_discarded() {
    let api = Arc::new(MockApi {
        fail_sends: true,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut events = session.subscribe_events();

    let err = session
        .send_message(Some("lost".to_string()), None)
        .await
        .expect_err("send failure");

    assert!(matches!(
        err,
        SyncError::SendFailure {
            kind: MutationKind::Send,
            ..
        }
    ));
    assert!(err.is_user_visible());
    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, Delivery::Failed);
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        SyncEvent::MutationFailed {
            kind: MutationKind::Send,
            ..
        }
    )));

    session
        .discard_failed(messages[0].id)
        .await
        .expect("discard");
    assert!(session.messages().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_send_is_rejected_without_a_placeholder() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");

    let err = session
        .send_message(Some("   ".to_string()), None)
        .await
        .expect_err("empty");

    assert!(matches!(err, SyncError::EmptyMessage));
    assert!(session.messages().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn media_is_uploaded_before_the_message_is_posted() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");

    session
        .send_message(
            None,
            Some(MediaUpload {
                filename: "cat.png".to_string(),
                mime_type: Some("image/png".to_string()),
                bytes: vec![1, 2, 3],
            }),
        )
        .await
        .expect("send");

    let sent = api.sent.lock().await.clone();
    assert_eq!(
        sent,
        vec![SendMessageRequest {
            content: None,
            media_url: Some("https://cdn.example.com/cat.png".to_string()),
        }]
    );
    let messages = session.messages().await;
    assert_eq!(
        messages[0].media_url.as_deref(),
        Some("https://cdn.example.com/cat.png")
    );
}

#[tokio::test(start_paused = true)]
async fn replayed_push_message_changes_the_view_once() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;
    let mut events = session.subscribe_events();

    let created = ServerEnvelope::MessageCreated(payload(20, PEER, "hi", at(10)));
    link.push(created.clone()).await;
    link.push(created).await;
    settle().await;

    let changes = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::MessagesChanged { .. }))
        .count();
    assert_eq!(changes, 1);
    assert_eq!(ids(&session.messages().await), vec![20]);
}

#[tokio::test(start_paused = true)]
async fn push_messages_scroll_only_at_the_live_edge() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;
    let mut events = session.subscribe_events();

    let at_bottom = Viewport {
        offset: 880.0,
        content_height: 1_500.0,
        viewport_height: 600.0,
    };
    assert!(!session.on_scroll(at_bottom).await.expect("scroll"));
    link.push(ServerEnvelope::MessageCreated(payload(20, PEER, "one", at(10))))
        .await;
    settle().await;
    assert_eq!(
        drain(&mut events),
        vec![SyncEvent::MessagesChanged {
            scroll: Some(ScrollCommand::ToBottom { animated: true })
        }]
    );

    let reading_history = Viewport {
        offset: 300.0,
        ..at_bottom
    };
    session.on_scroll(reading_history).await.expect("scroll");
    link.push(ServerEnvelope::MessageCreated(payload(21, PEER, "two", at(20))))
        .await;
    settle().await;
    assert_eq!(
        drain(&mut events),
        vec![SyncEvent::MessagesChanged { scroll: None }]
    );
}

#[tokio::test(start_paused = true)]
async fn backfill_fires_once_and_reports_the_scroll_anchor() {
    let api = Arc::new(MockApi {
        newest: vec![payload(10, PEER, "newest", at(100))],
        newest_next: Some(
            "https://chat.example.com/api/conversations/1/messages/?cursor=p2".to_string(),
        ),
        older: vec![payload(5, PEER, "older", at(50))],
        gate_backfill: true,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    assert!(session.has_older().await);
    let mut events = session.subscribe_events();

    let viewport = Viewport {
        offset: 20.0,
        content_height: 1_500.0,
        viewport_height: 600.0,
    };
    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.on_scroll(viewport).await })
    };
    settle().await;
    assert!(!session.on_scroll(viewport).await.expect("duplicate"));
    assert_eq!(api.older_cursors.lock().await.len(), 1);

    api.backfill_gate.notify_one();
    assert!(first.await.expect("join").expect("backfill"));

    assert_eq!(
        api.older_cursors.lock().await.clone(),
        vec!["/api/conversations/1/messages/?cursor=p2".to_string()]
    );
    assert!(!session.has_older().await);
    assert_eq!(ids(&session.messages().await), vec![5, 10]);

    let anchor = drain(&mut events)
        .into_iter()
        .find_map(|event| match event {
            SyncEvent::BackfillApplied { anchor, inserted } => Some((anchor, inserted)),
            _ => None,
        })
        .expect("backfill event");
    assert_eq!(anchor.1, 1);
    assert_eq!(
        anchor.0.restore(1_800.0),
        ScrollCommand::To {
            offset: 320.0,
            animated: false
        }
    );

    assert!(!session.load_older().await.expect("no more pages"));
    assert_eq!(api.older_cursors.lock().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn remote_typing_expires_after_ttl_and_ignores_own_events() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;

    link.push(ServerEnvelope::TypingStarted(TypingPayload {
        user_id: PEER,
        display_name: Some("bob".to_string()),
    }))
    .await;
    link.push(ServerEnvelope::TypingStarted(TypingPayload {
        user_id: ME,
        display_name: None,
    }))
    .await;
    settle().await;

    let typers = session.active_typers().await;
    assert_eq!(typers.len(), 1);
    assert_eq!(typers[0].user_id, PEER);

    tokio::time::sleep(Duration::from_millis(4_800)).await;
    assert_eq!(session.active_typers().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(session.active_typers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_message_clears_the_senders_typing_indicator() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;

    link.push(ServerEnvelope::TypingStarted(TypingPayload {
        user_id: PEER,
        display_name: None,
    }))
    .await;
    settle().await;
    assert_eq!(session.active_typers().await.len(), 1);

    link.push(ServerEnvelope::MessageCreated(payload(30, PEER, "done", at(5))))
        .await;
    settle().await;
    assert!(session.active_typers().await.is_empty());

    link.push(ServerEnvelope::TypingStarted(TypingPayload {
        user_id: PEER,
        display_name: None,
    }))
    .await;
    link.push(ServerEnvelope::TypingStopped(TypingPayload {
        user_id: PEER,
        display_name: None,
    }))
    .await;
    settle().await;
    assert!(session.active_typers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn keystrokes_debounce_typing_stop() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut link = connector.next_link().await;

    session.notify_keystroke().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    session.notify_keystroke().await;
    tokio::time::sleep(Duration::from_millis(2_900)).await;
    assert_eq!(
        link.commands(),
        vec![LinkCommand::Frame(ClientFrame::TypingStart)]
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        link.commands(),
        vec![LinkCommand::Frame(ClientFrame::TypingStop)]
    );
}

#[tokio::test(start_paused = true)]
async fn sending_stops_local_typing() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut link = connector.next_link().await;

    session.notify_keystroke().await;
    session
        .send_message(Some("hi".to_string()), None)
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(
        link.commands(),
        vec![
            LinkCommand::Frame(ClientFrame::TypingStart),
            LinkCommand::Frame(ClientFrame::TypingStop)
        ]
    );
}

fn reaction(id: i64, user: UserId, symbol: &str) -> Reaction {
    Reaction {
        id: ReactionId(id),
        message_id: MessageId(10),
        user_id: user,
        symbol: symbol.to_string(),
    }
}

fn api_with_reactions(reactions: Vec<Reaction>, fail_reactions: bool) -> Arc<MockApi> {
    Arc::new(MockApi {
        newest: vec![MessagePayload {
            reactions,
            ..payload(10, PEER, "react to me", at(0))
        }],
        fail_reactions,
        ..Default::default()
    })
}

async fn reactions_of(session: &ConversationSession, id: i64) -> Vec<Reaction> {
    session
        .messages()
        .await
        .into_iter()
        .find(|message| message.id == MessageId(id))
        .map(|message| message.reactions)
        .expect("message")
}

#[tokio::test(start_paused = true)]
async fn failed_reaction_swap_restores_the_original_reaction() {
    let original = vec![reaction(31, ME, "👍"), reaction(32, PEER, "🎉")];
    let api = api_with_reactions(original.clone(), true);
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut events = session.subscribe_events();

    let err = session
        .toggle_reaction(MessageId(10), "❤️")
        .await
        .expect_err("swap fails");
    assert!(matches!(
        err,
        SyncError::SendFailure {
            kind: MutationKind::React,
            ..
        }
    ));
    assert_eq!(reactions_of(&session, 10).await, original);

    session
        .toggle_reaction(MessageId(10), "👍")
        .await
        .expect_err("removal fails");
    assert_eq!(reactions_of(&session, 10).await, original);

    let failures = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::MutationFailed { kind: MutationKind::React, .. }))
        .count();
    assert_eq!(failures, 2);
}

#[tokio::test(start_paused = true)]
async fn reaction_toggle_adds_then_removes() {
    let api = api_with_reactions(vec![reaction(32, PEER, "🎉")], false);
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");

    session
        .toggle_reaction(MessageId(10), "❤️")
        .await
        .expect("add");
    assert_eq!(
        reactions_of(&session, 10).await,
        vec![reaction(32, PEER, "🎉"), reaction(500, ME, "❤️")]
    );

    session
        .toggle_reaction(MessageId(10), "❤️")
        .await
        .expect("remove");
    assert_eq!(
        reactions_of(&session, 10).await,
        vec![reaction(32, PEER, "🎉")]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_delete_restores_the_message() {
    let api = Arc::new(MockApi {
        newest: vec![payload(10, ME, "keep me", at(0))],
        fail_mutations: true,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let before = session.messages().await;

    session
        .delete_message(MessageId(10))
        .await
        .expect_err("delete fails");
    assert_eq!(session.messages().await, before);

    session
        .edit_message(MessageId(10), "changed".to_string())
        .await
        .expect_err("edit fails");
    assert_eq!(session.messages().await, before);

    session.set_archived(true).await.expect_err("archive fails");
    assert_eq!(
        session.conversation().await.map(|conversation| conversation.archived),
        Some(false)
    );
}

#[tokio::test(start_paused = true)]
async fn edit_applies_the_server_copy() {
    let api = Arc::new(MockApi {
        newest: vec![payload(10, ME, "draft", at(0))],
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");

    session
        .edit_message(MessageId(10), "final".to_string())
        .await
        .expect("edit");

    let messages = session.messages().await;
    assert_eq!(messages[0].content.as_deref(), Some("final"));
    assert_eq!(messages[0].edited_at, Some(at(500)));
    assert!(matches!(
        session.edit_message(MessageId(-4), "x".to_string()).await,
        Err(SyncError::NotConfirmed(_))
    ));
    assert!(matches!(
        session.delete_message(MessageId(404)).await,
        Err(SyncError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn mark_read_records_locally_and_swallows_failures() {
    let api = Arc::new(MockApi {
        newest: vec![payload(10, PEER, "read me", at(30))],
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");

    session.mark_read().await;

    let conversation = session.conversation().await.expect("conversation");
    let me = conversation
        .participants
        .iter()
        .find(|participant| participant.user_id == ME)
        .expect("participant");
    assert_eq!(me.last_read_at, Some(at(30)));
}

#[tokio::test(start_paused = true)]
async fn in_flight_reaction_survives_a_remote_refresh() {
    let api = Arc::new(MockApi {
        newest: vec![payload(10, PEER, "react to me", at(0))],
        gate_reactions: true,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;

    let toggling = {
        let session = session.clone();
        tokio::spawn(async move { session.toggle_reaction(MessageId(10), "❤️").await })
    };
    settle().await;
    assert!(matches!(
        session.toggle_reaction(MessageId(10), "👍").await,
        Err(SyncError::ReactionInFlight(_))
    ));

    link.push(ServerEnvelope::MessageUpdated(MessagePayload {
        edited_at: Some(at(5)),
        ..payload(10, PEER, "react to me!", at(0))
    }))
    .await;
    settle().await;
    let messages = session.messages().await;
    assert_eq!(messages[0].content.as_deref(), Some("react to me!"));
    assert_eq!(messages[0].reactions.len(), 1);
    assert!(messages[0].reactions[0].id.is_sentinel());

    api.reaction_gate.notify_one();
    toggling.await.expect("join").expect("toggle");
    assert_eq!(reactions_of(&session, 10).await, vec![reaction(500, ME, "❤️")]);
}

async fn mutation_racing_a_remote_deletion(fail_mutations: bool, delete: bool) -> Message {
    let api = Arc::new(MockApi {
        newest: vec![payload(10, ME, "draft", at(0))],
        gate_mutations: true,
        fail_mutations,
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let link = connector.next_link().await;

    let mutation = {
        let session = session.clone();
        tokio::spawn(async move {
            if delete {
                session.delete_message(MessageId(10)).await
            } else {
                session.edit_message(MessageId(10), "final".to_string()).await
            }
        })
    };
    settle().await;
    link.push(ServerEnvelope::MessageDeleted(shared::protocol::MessageRef {
        id: MessageId(10),
        conversation_id: Some(CONVERSATION),
    }))
    .await;
    settle().await;
    assert!(session.messages().await[0].deleted);

    api.mutation_gate.notify_one();
    let settled = mutation.await.expect("join");
    assert_eq!(settled.is_err(), fail_mutations);
    session.messages().await.remove(0)
}

#[tokio::test(start_paused = true)]
async fn confirmed_edit_keeps_a_deletion_pushed_while_in_flight() {
    let message = mutation_racing_a_remote_deletion(false, false).await;

    assert!(message.deleted);
    assert_eq!(message.content.as_deref(), Some("final"));
}

#[tokio::test(start_paused = true)]
async fn rolled_back_edit_keeps_a_deletion_pushed_while_in_flight() {
    let message = mutation_racing_a_remote_deletion(true, false).await;

    assert!(message.deleted);
    assert_eq!(message.content.as_deref(), Some("draft"));
    assert_eq!(message.edited_at, None);
}

#[tokio::test(start_paused = true)]
async fn rolled_back_delete_keeps_a_deletion_pushed_while_in_flight() {
    let message = mutation_racing_a_remote_deletion(true, true).await;

    assert!(message.deleted);
}

#[tokio::test(start_paused = true)]
async fn stalled_first_handshake_falls_back_to_polling() {
    let api = Arc::new(MockApi::default());
    let connector = Arc::new(StalledConnector {
        attempts: AtomicUsize::new(0),
    });
    let session = ConversationSession::new(
        CONVERSATION,
        ME,
        Credential::new("token"),
        SessionDependencies {
            api: api.clone(),
            uploader: Arc::new(StaticUploader),
            connector: connector.clone(),
        },
        SyncSettings::default(),
    );
    session.open().await.expect("open");

    tokio::time::sleep(Duration::from_millis(10_100)).await;
    assert_eq!(session.connection_state().await, ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(session.connection_state().await, ConnectionState::Polling);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
    assert!(api.newest_calls.load(Ordering::SeqCst) > 1);
}

#[tokio::test(start_paused = true)]
async fn rest_auth_rejection_signals_the_credential() {
    let api = Arc::new(MockApi {
        send_rejection: Some(401),
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut events = session.subscribe_events();

    session
        .send_message(Some("hi".to_string()), None)
        .await
        .expect_err("rejected");

    let rejected = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::CredentialRejected { .. }))
        .collect::<Vec<_>>();
    assert_eq!(
        rejected,
        vec![SyncEvent::CredentialRejected {
            code: UNAUTHORIZED_CLOSURE
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn ordinary_rest_failures_do_not_signal_the_credential() {
    let api = Arc::new(MockApi {
        send_rejection: Some(500),
        ..Default::default()
    });
    let connector = Arc::new(MockConnector::default());
    let session = session_with(&api, &connector);
    session.open().await.expect("open");
    let mut events = session.subscribe_events();

    session
        .send_message(Some("hi".to_string()), None)
        .await
        .expect_err("server error");

    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SyncEvent::CredentialRejected { .. })));
}
