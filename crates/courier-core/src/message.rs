//! Conversation and message model.
//!
//! Identifiers are opaque strings: the core never interprets conversation or
//! user ids, it only compares them. Message ids are either provisional
//! (a client-generated correlation id) or stable (assigned by the server).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::env::Environment;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Opaque conversation identifier.
    ConversationId
);

opaque_id!(
    /// Opaque user identifier.
    UserId
);

/// Prefix that marks an id as provisional.
pub const PENDING_PREFIX: &str = "pending-";

/// Client-generated token attached to an outbound send and echoed back by the
/// server so the confirmation can be matched exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id from the environment's RNG.
    pub fn generate<E: Environment>(env: &E) -> Self {
        Self(format!("{PENDING_PREFIX}{:032x}", env.random_u128()))
    }

    /// Wrap a correlation id received on the wire.
    pub fn from_wire(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw correlation id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Provisional id of a locally created message awaiting confirmation.
    Pending(CorrelationId),
    /// Stable id assigned by the server once persisted.
    Server(String),
}

impl MessageId {
    /// Whether this id is provisional.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Raw id string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending(correlation_id) => correlation_id.as_str(),
            Self::Server(id) => id,
        }
    }

    /// Server id, if this message has been confirmed.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Pending(_) => None,
            Self::Server(id) => Some(id),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-kind tag carried next to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Plain text.
    Text,
    /// Image reference.
    Image,
    /// Video reference.
    Video,
    /// Audio reference.
    Audio,
    /// Generic file reference.
    File,
}

impl ContentKind {
    /// Wire tag for this kind.
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }

    /// Parse a wire tag. `None` for tags this client does not know.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Text body.
    Text(String),
    /// Reference to binary content stored elsewhere (URL or blob key).
    Attachment {
        /// What the reference points at.
        kind: ContentKind,
        /// Opaque reference.
        reference: String,
    },
    /// Placeholder for an inbound payload this client could not understand.
    ///
    /// Kept in the conversation so the user never silently misses a turn.
    Unrecognized {
        /// Why the payload was not understood.
        reason: String,
    },
}

impl Content {
    /// Text content.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    /// Attachment content.
    pub fn attachment(kind: ContentKind, reference: impl Into<String>) -> Self {
        Self::Attachment { kind, reference: reference.into() }
    }

    /// Content-kind tag. `None` for unrecognized payloads.
    pub fn kind(&self) -> Option<ContentKind> {
        match self {
            Self::Text(_) => Some(ContentKind::Text),
            Self::Attachment { kind, .. } => Some(*kind),
            Self::Unrecognized { .. } => None,
        }
    }

    /// Body as carried on the wire (text or reference).
    pub fn body(&self) -> &str {
        match self {
            Self::Text(body) => body,
            Self::Attachment { reference, .. } => reference,
            Self::Unrecognized { .. } => "",
        }
    }

    /// Whether this is an unrecognized placeholder.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Unrecognized { .. })
    }

    /// Fingerprint used to pair an id-less confirmation with a pending send.
    ///
    /// `None` for placeholders: they never match anything.
    pub fn fingerprint(&self) -> Option<ContentFingerprint> {
        let kind = self.kind()?;
        Some(ContentFingerprint::of(kind, self.body()))
    }

    /// Short human-readable preview for conversation lists.
    pub fn preview(&self, max_chars: usize) -> String {
        match self {
            Self::Text(body) => body.chars().take(max_chars).collect(),
            Self::Attachment { kind, .. } => format!("[{}]", kind.as_tag()),
            Self::Unrecognized { .. } => "[unsupported message]".to_owned(),
        }
    }
}

/// Stable 64-bit digest of (kind, body).
///
/// FNV-1a: deterministic across processes, unlike `DefaultHasher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentFingerprint(u64);

impl ContentFingerprint {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn of(kind: ContentKind, body: &str) -> Self {
        let bytes = kind.as_tag().bytes().chain(std::iter::once(0)).chain(body.bytes());
        let hash =
            bytes.fold(Self::OFFSET, |acc, byte| (acc ^ u64::from(byte)).wrapping_mul(Self::PRIME));
        Self(hash)
    }

    /// Raw digest value.
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Created locally, not yet confirmed by the server.
    Pending,
    /// Confirmed by the server.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Gave up after the retry policy was exhausted.
    Failed,
}

impl DeliveryState {
    /// Position on the confirmed path (`Sent < Delivered < Read`).
    ///
    /// `None` for states that receipts may not move.
    fn confirmed_rank(self) -> Option<u8> {
        match self {
            Self::Sent => Some(0),
            Self::Delivered => Some(1),
            Self::Read => Some(2),
            Self::Pending | Self::Failed => None,
        }
    }

    /// Whether a receipt may move a message from `self` to `next`.
    ///
    /// Receipts only ever move confirmed messages forward.
    pub fn can_advance_to(self, next: Self) -> bool {
        match (self.confirmed_rank(), next.confirmed_rank()) {
            (Some(current), Some(target)) => target > current,
            _ => false,
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Pending or server id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Payload.
    pub content: Content,
    /// Send time in Unix milliseconds.
    pub sent_at_ms: u64,
    /// Delivery state.
    pub delivery: DeliveryState,
    /// Correlation id of the send this message came from, if known.
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    /// Whether this message is still awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        self.id.is_pending() && self.delivery == DeliveryState::Pending
    }

    /// Whether this message carries a server-assigned id.
    pub fn is_confirmed(&self) -> bool {
        !self.id.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_kind_and_body() {
        let a = Content::text("hi").fingerprint();
        let b = Content::text("hi").fingerprint();
        let c = Content::text("hi!").fingerprint();
        let d = Content::attachment(ContentKind::Image, "hi").fingerprint();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(Content::Unrecognized { reason: "x".into() }.fingerprint(), None);
    }

    #[test]
    fn receipts_only_move_forward() {
        assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Delivered));
        assert!(DeliveryState::Delivered.can_advance_to(DeliveryState::Read));
        assert!(!DeliveryState::Read.can_advance_to(DeliveryState::Delivered));
        assert!(!DeliveryState::Pending.can_advance_to(DeliveryState::Delivered));
        assert!(!DeliveryState::Failed.can_advance_to(DeliveryState::Read));
    }

    #[test]
    fn content_kind_tags_round_trip() {
        for kind in [
            ContentKind::Text,
            ContentKind::Image,
            ContentKind::Video,
            ContentKind::Audio,
            ContentKind::File,
        ] {
            assert_eq!(ContentKind::from_tag(kind.as_tag()), Some(kind));
        }
        assert_eq!(ContentKind::from_tag("sticker"), None);
    }

    #[test]
    fn preview_truncates_text() {
        assert_eq!(Content::text("hello world").preview(5), "hello");
        assert_eq!(Content::attachment(ContentKind::Audio, "blob://1").preview(5), "[audio]");
    }
}
