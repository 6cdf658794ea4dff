//! CBOR-encoded wire envelopes.
//!
//! The transport hands the core opaque payloads tagged with the topic they
//! arrived on. Payloads are CBOR: self-describing (field names embedded),
//! compact, and tolerant of fields this client does not know yet.
//!
//! Inbound message fields are all optional on the wire. A payload missing
//! required pieces still decodes, so the engine can place a placeholder in
//! the right conversation instead of dropping the turn.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::EnvelopeError,
    message::{
        Content, ContentKind, ConversationId, CorrelationId, DeliveryState, Message, MessageId,
        UserId,
    },
};

/// Maximum accepted envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1 << 20;

const CONVERSATION_TOPIC_PREFIX: &str = "conversation/";
const USER_TOPIC_PREFIX: &str = "user/";

/// Named pub/sub destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// One topic per conversation.
    Conversation(ConversationId),
    /// User-scoped notification topic.
    User(UserId),
}

impl Topic {
    /// Parse a topic name (`conversation/<id>` or `user/<id>`).
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(id) = name.strip_prefix(CONVERSATION_TOPIC_PREFIX) {
            return (!id.is_empty()).then(|| Self::Conversation(ConversationId::new(id)));
        }
        if let Some(id) = name.strip_prefix(USER_TOPIC_PREFIX) {
            return (!id.is_empty()).then(|| Self::User(UserId::new(id)));
        }
        None
    }

    /// Conversation this topic belongs to, if any.
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Conversation(id) => Some(id),
            Self::User(_) => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "{CONVERSATION_TOPIC_PREFIX}{id}"),
            Self::User(id) => write!(f, "{USER_TOPIC_PREFIX}{id}"),
        }
    }
}

/// Raw event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Topic the event arrived on.
    pub topic: Topic,
    /// Encoded [`InboundEnvelope`].
    pub payload: Bytes,
}

/// Envelope received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEnvelope {
    /// A confirmed message.
    Message(MessageEnvelope),
    /// A delivery receipt for a confirmed message.
    Receipt(ReceiptEnvelope),
}

impl InboundEnvelope {
    /// Encode to CBOR.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        encode_cbor(self)
    }

    /// Decode from CBOR.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::Empty` for zero-length payloads
    /// - `EnvelopeError::TooLarge` above [`MAX_ENVELOPE_SIZE`]
    /// - `EnvelopeError::CborDecode` for anything that is not an envelope
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        decode_cbor(bytes)
    }
}

/// Confirmed message as sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Conversation identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Sender identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    /// Server-assigned message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Content-kind tag. Absent means text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Text body or content reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Server timestamp in Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    /// Correlation id echoed from the matching outbound send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl MessageEnvelope {
    /// Build the envelope a server would emit for `message` under `server_id`.
    pub fn confirming(message: &Message, server_id: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(message.conversation_id.to_string()),
            sender_id: Some(message.sender_id.to_string()),
            server_id: Some(server_id.into()),
            kind: message.content.kind().map(|kind| kind.as_tag().to_owned()),
            body: Some(message.content.body().to_owned()),
            timestamp_ms: Some(message.sent_at_ms),
            correlation_id: message.correlation_id.as_ref().map(|id| id.to_string()),
        }
    }

    /// Parsed content.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::UnknownKind` for tags this client does not know
    /// - `EnvelopeError::MissingField` when the body is absent or empty
    pub fn content(&self) -> Result<Content, EnvelopeError> {
        let kind = match self.kind.as_deref() {
            None => ContentKind::Text,
            Some(tag) => ContentKind::from_tag(tag)
                .ok_or_else(|| EnvelopeError::UnknownKind(tag.to_owned()))?,
        };

        let body = self
            .body
            .as_deref()
            .filter(|body| !body.is_empty())
            .ok_or(EnvelopeError::MissingField("body"))?;

        Ok(match kind {
            ContentKind::Text => Content::text(body),
            kind => Content::attachment(kind, body),
        })
    }

    /// Convert into a confirmed message in `conversation_id`.
    ///
    /// # Errors
    ///
    /// Any missing identity field or unparseable content. The caller turns
    /// these into a placeholder.
    pub fn to_message(
        &self,
        conversation_id: ConversationId,
        local_user: &UserId,
        fallback_time_ms: u64,
    ) -> Result<Message, EnvelopeError> {
        let server_id = self
            .server_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(EnvelopeError::MissingField("server_id"))?;
        let sender_id = self
            .sender_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(EnvelopeError::MissingField("sender_id"))?;
        let content = self.content()?;

        let sender_id = UserId::new(sender_id);
        let delivery =
            if &sender_id == local_user { DeliveryState::Sent } else { DeliveryState::Delivered };

        Ok(Message {
            id: MessageId::Server(server_id.to_owned()),
            conversation_id,
            sender_id,
            content,
            sent_at_ms: self.timestamp_ms.unwrap_or(fallback_time_ms),
            delivery,
            correlation_id: self.correlation_id.as_deref().map(CorrelationId::from_wire),
        })
    }
}

/// Delivery receipt for a previously confirmed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEnvelope {
    /// Conversation identifier.
    pub conversation_id: String,
    /// Server id of the acknowledged message.
    pub server_id: String,
    /// New delivery state (`delivered` or `read`).
    pub state: DeliveryState,
}

/// Envelope published by this client.
///
/// Mirrors [`MessageEnvelope`] minus the server id, plus the correlation id
/// generated at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Conversation identifier.
    pub conversation_id: String,
    /// Sender identifier (the local user).
    pub sender_id: String,
    /// Content-kind tag.
    pub kind: ContentKind,
    /// Text body or content reference.
    pub body: String,
    /// Client timestamp in Unix milliseconds.
    pub timestamp_ms: u64,
    /// Correlation id for exact reconciliation.
    pub correlation_id: String,
}

impl OutboundEnvelope {
    /// Encode to CBOR.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        encode_cbor(self)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        decode_cbor(bytes)
    }

    /// Content carried by this envelope.
    pub fn content(&self) -> Content {
        match self.kind {
            ContentKind::Text => Content::text(self.body.clone()),
            kind => Content::attachment(kind, self.body.clone()),
        }
    }
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Bytes, EnvelopeError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| EnvelopeError::CborEncode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    if bytes.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    if bytes.len() > MAX_ENVELOPE_SIZE {
        return Err(EnvelopeError::TooLarge { size: bytes.len(), max: MAX_ENVELOPE_SIZE });
    }

    ciborium::de::from_reader(bytes).map_err(|e| EnvelopeError::CborDecode(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> MessageEnvelope {
        MessageEnvelope {
            conversation_id: Some("c1".into()),
            sender_id: Some("bob".into()),
            server_id: Some("42".into()),
            kind: None,
            body: Some("hello".into()),
            timestamp_ms: Some(1_700_000_000_000),
            correlation_id: None,
        }
    }

    #[test]
    fn topic_names_parse() {
        let topic = Topic::parse("conversation/c1").unwrap();
        assert_eq!(topic, Topic::Conversation("c1".into()));
        assert_eq!(topic.to_string(), "conversation/c1");
        assert_eq!(Topic::parse("user/alice"), Some(Topic::User("alice".into())));
        assert_eq!(Topic::parse("conversation/"), None);
        assert_eq!(Topic::parse("lobby"), None);
    }

    #[test]
    fn inbound_envelope_decodes_what_server_encodes() {
        let envelope = InboundEnvelope::Message(sample());
        let bytes = envelope.encode().unwrap();
        assert_eq!(InboundEnvelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn rejects_empty_and_garbage_payloads() {
        assert_eq!(InboundEnvelope::decode(&[]), Err(EnvelopeError::Empty));
        assert!(matches!(
            InboundEnvelope::decode(&[0xff, 0x00, 0x13]),
            Err(EnvelopeError::CborDecode(_))
        ));
    }

    #[test]
    fn rejects_oversized_payloads() {
        let bytes = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(InboundEnvelope::decode(&bytes), Err(EnvelopeError::TooLarge { .. })));
    }

    #[test]
    fn message_from_other_user_is_delivered() {
        let message = sample().to_message("c1".into(), &"alice".into(), 0).unwrap();
        assert_eq!(message.id, MessageId::Server("42".into()));
        assert_eq!(message.delivery, DeliveryState::Delivered);
        assert_eq!(message.content, Content::text("hello"));
    }

    #[test]
    fn own_message_is_sent() {
        let message = sample().to_message("c1".into(), &"bob".into(), 0).unwrap();
        assert_eq!(message.delivery, DeliveryState::Sent);
    }

    #[test]
    fn missing_body_is_an_error() {
        let envelope = MessageEnvelope { body: Some(String::new()), ..sample() };
        assert_eq!(envelope.content(), Err(EnvelopeError::MissingField("body")));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let envelope = MessageEnvelope { kind: Some("sticker".into()), ..sample() };
        assert_eq!(envelope.content(), Err(EnvelopeError::UnknownKind("sticker".into())));
    }

    #[test]
    fn attachment_kind_keeps_reference() {
        let envelope = MessageEnvelope {
            kind: Some("image".into()),
            body: Some("https://cdn.example/cat.png".into()),
            ..sample()
        };
        assert_eq!(
            envelope.content().unwrap(),
            Content::attachment(ContentKind::Image, "https://cdn.example/cat.png")
        );
    }
}
