pub mod api;
pub mod config;
pub mod error;
mod heartbeat;
pub mod pagination;
mod polling;
pub mod reactions;
pub mod reconnect;
mod session;
pub mod store;
pub mod transport;
pub mod typing;

pub use api::{
    ConversationApi, HttpConversationApi, HttpMediaUploader, MediaUpload, MediaUploader,
    MissingMediaUploader,
};
pub use config::{load_settings, SyncSettings};
pub use error::{MutationKind, SyncError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
pub use pagination::{ScrollAnchor, ScrollCommand, Viewport};
pub use polling::PollingFallback;
pub use session::{
    ConnectionState, Conversation, ConversationSession, Participant, SessionDependencies,
    SyncEvent,
};
pub use store::{Delivery, Message};
pub use transport::{PushConnector, WebSocketConnector};
