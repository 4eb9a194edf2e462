use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ReactionId);

impl MessageId {
    /// Locally generated placeholders are negative; the server only hands out positive ids.
    pub fn is_sentinel(self) -> bool {
        self.0 < 0
    }
}

impl ReactionId {
    pub fn is_sentinel(self) -> bool {
        self.0 < 0
    }
}

/// Opaque credential presented to both the push channel and the REST boundary.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(pub String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}
