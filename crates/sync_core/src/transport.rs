use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, Credential},
    protocol::{ClientFrame, ServerEnvelope},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, timeout, Duration, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{classify_close, CloseKind, HandshakeError, ABNORMAL_CLOSURE, NORMAL_CLOSURE, NO_STATUS_RECEIVED},
    heartbeat::{HeartbeatMonitor, HeartbeatVerdict},
};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }

    pub fn kind(&self) -> CloseKind {
        classify_close(self.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Frame(ClientFrame),
    Close(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Envelope(ServerEnvelope),
    Closed(CloseInfo),
    Error(String),
}

/// One established push connection as a pair of channels.
#[derive(Debug)]
pub struct PushLink {
    pub outbound: mpsc::Sender<LinkCommand>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(
        &self,
        conversation_id: ConversationId,
        credential: &Credential,
    ) -> Result<PushLink, HandshakeError>;
}

/// Lifecycle events of an open link. `opened` is delivered separately through
/// [`TransportSink::on_opened`] because it hands over the link itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
    MessageReceived(ServerEnvelope),
    Error(String),
}

impl TransportEvent {
    pub fn closed(info: CloseInfo) -> Self {
        Self::Closed {
            clean: info.code == NORMAL_CLOSURE,
            code: info.code,
            reason: info.reason,
        }
    }
}

/// Receiver of transport lifecycle events. Every call carries the epoch of the
/// connection attempt that produced it so superseded attempts can be ignored.
#[async_trait]
pub trait TransportSink: Send + Sync + 'static {
    async fn on_opened(&self, epoch: u64, link: PushLink);
    async fn on_transport_event(&self, epoch: u64, event: TransportEvent);
}

/// Connection bookkeeping owned by the session: the current epoch, the outbound
/// half of the open link and the tasks serving it.
#[derive(Debug, Default)]
pub struct TransportChannel {
    epoch: u64,
    outbound: Option<mpsc::Sender<LinkCommand>>,
    handshake: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl TransportChannel {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    pub fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    /// Invalidates every earlier attempt and returns the epoch for a new one.
    pub fn next_epoch(&mut self) -> u64 {
        self.teardown();
        self.epoch += 1;
        self.epoch
    }

    pub fn set_handshake(&mut self, handshake: JoinHandle<()>) {
        self.handshake = Some(handshake);
    }

    pub fn attach(&mut self, outbound: mpsc::Sender<LinkCommand>, pump: JoinHandle<()>) {
        self.handshake = None;
        self.outbound = Some(outbound);
        self.pump = Some(pump);
    }

    /// Queues a control frame. Returns false when no link is open or the link is
    /// backed up; control frames are best-effort.
    pub fn send(&self, frame: ClientFrame) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.try_send(LinkCommand::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Caller-initiated close. Bumps the epoch so late events from the old link are
    /// dropped.
    pub fn close(&mut self, code: u16) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.try_send(LinkCommand::Close(code));
        }
        self.teardown();
        self.epoch += 1;
    }

    /// Forgets a link that was lost. The tasks are left to finish on their own since
    /// the caller is usually one of them.
    pub fn detach(&mut self) {
        self.outbound = None;
        self.handshake = None;
        self.pump = None;
    }

    fn teardown(&mut self) {
        self.outbound = None;
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Runs one connect attempt. A connector that neither succeeds nor fails within
/// `limit` is reported as an abnormal closure.
pub fn spawn_handshake(
    sink: Arc<dyn TransportSink>,
    connector: Arc<dyn PushConnector>,
    conversation_id: ConversationId,
    credential: Credential,
    epoch: u64,
    limit: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempt = timeout(limit, connector.connect(conversation_id, &credential))
            .await
            .unwrap_or_else(|_| {
                warn!(epoch, timeout_ms = limit.as_millis() as u64, "push: handshake timed out");
                Err(HandshakeError::network("push handshake timed out"))
            });
        match attempt {
            Ok(link) => sink.on_opened(epoch, link).await,
            Err(err) => {
                sink.on_transport_event(
                    epoch,
                    TransportEvent::Closed {
                        code: err.code,
                        reason: err.reason,
                        clean: false,
                    },
                )
                .await
            }
        }
    })
}

/// Serves an open link: forwards inbound envelopes, pings on the heartbeat
/// interval, and reports exactly one `Closed` when the link ends or goes silent.
pub fn spawn_pump(
    sink: Arc<dyn TransportSink>,
    epoch: u64,
    mut inbound: mpsc::Receiver<LinkEvent>,
    outbound: mpsc::Sender<LinkCommand>,
    mut monitor: HeartbeatMonitor,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + monitor.interval(), monitor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let close = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(LinkEvent::Envelope(envelope)) => {
                        monitor.on_traffic();
                        sink.on_transport_event(epoch, TransportEvent::MessageReceived(envelope))
                            .await;
                    }
                    Some(LinkEvent::Error(reason)) => {
                        sink.on_transport_event(epoch, TransportEvent::Error(reason)).await;
                    }
                    Some(LinkEvent::Closed(info)) => break info,
                    None => break CloseInfo::abnormal("push link dropped"),
                },
                _ = ticker.tick() => match monitor.on_tick() {
                    HeartbeatVerdict::Ping => {
                        if outbound.send(LinkCommand::Frame(ClientFrame::Ping)).await.is_err() {
                            break CloseInfo::abnormal("push link closed while sending ping");
                        }
                    }
                    HeartbeatVerdict::Dead { missed } => {
                        warn!(epoch, missed, "push: heartbeat timeout, treating link as dead");
                        break CloseInfo::abnormal("heartbeat timeout");
                    }
                },
            }
        };

        sink.on_transport_event(epoch, TransportEvent::closed(close))
            .await;
    })
}

/// Push connector over a websocket at `{base}/ws/conversations/{id}/?token=..`.
pub struct WebSocketConnector {
    server_url: String,
}

impl WebSocketConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(
        &self,
        conversation_id: ConversationId,
        credential: &Credential,
    ) -> Result<Url, HandshakeError> {
        let ws_base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://") {
            self.server_url.clone()
        } else {
            return Err(HandshakeError::network(
                "server_url must start with http://, https://, ws:// or wss://",
            ));
        };
        let mut url = Url::parse(&format!("{ws_base}/ws/conversations/{conversation_id}/"))
            .map_err(|err| HandshakeError::network(format!("invalid push endpoint: {err}")))?;
        url.query_pairs_mut()
            .append_pair("token", credential.as_str());
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WebSocketConnector {
    async fn connect(
        &self,
        conversation_id: ConversationId,
        credential: &Credential,
    ) -> Result<PushLink, HandshakeError> {
        let url = self.endpoint(conversation_id, credential)?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| match err {
            tungstenite::Error::Http(response) => HandshakeError::from_http_status(
                response.status().as_u16(),
                format!("push handshake rejected with HTTP {}", response.status()),
            ),
            other => HandshakeError::network(format!("failed to connect websocket: {other}")),
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<LinkCommand>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<LinkEvent>(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                let message = match command {
                    LinkCommand::Frame(frame) => match serde_json::to_string(&frame) {
                        Ok(text) => Message::Text(text),
                        Err(err) => {
                            warn!(%err, "push: failed to encode control frame");
                            continue;
                        }
                    },
                    LinkCommand::Close(code) => {
                        let _ = ws_writer
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: "".into(),
                            })))
                            .await;
                        break;
                    }
                };
                if ws_writer.send(message).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let close = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => match ServerEnvelope::decode(&text) {
                        Ok(Some(envelope)) => {
                            if inbound_tx.send(LinkEvent::Envelope(envelope)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => debug!("push: skipping unknown envelope type"),
                        Err(err) => {
                            let _ = inbound_tx
                                .send(LinkEvent::Error(format!("invalid server envelope: {err}")))
                                .await;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.to_string()),
                            None => CloseInfo::new(NO_STATUS_RECEIVED, ""),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break CloseInfo::abnormal(format!("websocket receive failed: {err}")),
                    None => break CloseInfo::abnormal("websocket stream ended"),
                }
            };
            let _ = inbound_tx.send(LinkEvent::Closed(close)).await;
        });

        Ok(PushLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
