use shared::domain::MessageId;
use thiserror::Error;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const BAD_REQUEST_CLOSURE: u16 = 4400;
pub const UNAUTHORIZED_CLOSURE: u16 = 4401;
pub const FORBIDDEN_CLOSURE: u16 = 4403;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Normal closure; never reconnected.
    Clean,
    /// Transient loss; reconnected with backoff.
    Abnormal,
    /// The server refused the credential. Retried with the same backoff, but only a
    /// fresh credential will make it succeed.
    Auth,
}

pub fn classify_close(code: u16) -> CloseKind {
    match code {
        NORMAL_CLOSURE => CloseKind::Clean,
        BAD_REQUEST_CLOSURE | UNAUTHORIZED_CLOSURE | FORBIDDEN_CLOSURE => CloseKind::Auth,
        _ => CloseKind::Abnormal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Send,
    Edit,
    Delete,
    React,
    Archive,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Send => "send message",
            Self::Edit => "edit message",
            Self::Delete => "delete message",
            Self::React => "toggle reaction",
            Self::Archive => "archive conversation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} failed: {source}")]
    SendFailure {
        kind: MutationKind,
        source: anyhow::Error,
    },
    #[error("failed to fetch conversation state: {0}")]
    Fetch(#[source] anyhow::Error),
    #[error("message {0} is not in the open conversation")]
    NotFound(MessageId),
    #[error("message {0} has not been confirmed by the server yet")]
    NotConfirmed(MessageId),
    #[error("message has neither content nor media")]
    EmptyMessage,
    #[error("a reaction change for message {0} is already in flight")]
    ReactionInFlight(MessageId),
    #[error("conversation has not been opened yet")]
    NotOpen,
    #[error("conversation session is closed")]
    Closed,
}

impl SyncError {
    pub fn send_failure(kind: MutationKind, source: anyhow::Error) -> Self {
        Self::SendFailure { kind, source }
    }

    /// Whether the failure should be shown to the user. Background failures heal on
    /// the next sync cycle and stay silent.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::SendFailure { .. }
                | Self::NotFound(_)
                | Self::NotConfirmed(_)
                | Self::EmptyMessage
                | Self::ReactionInFlight(_)
                | Self::NotOpen
                | Self::Closed
        )
    }
}

/// Push connect failure, expressed with the close code the equivalent mid-session
/// drop would carry so both paths share one classification.
#[derive(Debug, Clone, Error)]
#[error("push handshake failed (code {code}): {reason}")]
pub struct HandshakeError {
    pub code: u16,
    pub reason: String,
}

impl HandshakeError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason: reason.into(),
        }
    }

    pub fn from_http_status(status: u16, reason: impl Into<String>) -> Self {
        let code = match status {
            400 => BAD_REQUEST_CLOSURE,
            401 => UNAUTHORIZED_CLOSURE,
            403 => FORBIDDEN_CLOSURE,
            _ => ABNORMAL_CLOSURE,
        };
        Self {
            code,
            reason: reason.into(),
        }
    }
}
