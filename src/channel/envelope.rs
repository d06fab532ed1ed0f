//! Application envelopes carried over a peer channel.
//!
//! On the wire an envelope is a flat JSON object whose `type` names the
//! command (`"chat.message"`, `"data.begin"`, ...) and whose other fields are
//! the command payload.

use crate::utils::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// MIME type of JSON payloads sent as transfers
pub const JSON_MIME: &str = "application/json";

/// Every command a channel understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Application-level handshake
    Connected,
    /// Sync round request
    Sync,
    /// Certificate delivery
    CertIssue,
    /// Encrypted certificate presentation
    CertPresent,
    /// Certificate challenge
    CertVerify,
    /// Chat invitation
    ChatInvite,
    /// New chat message
    ChatMessage,
    /// Chat backlog pushed during sync
    ChatUpdate,
    /// Transfer start
    DataBegin,
    /// Transfer end
    DataEnd,
    /// Transfer acknowledgement
    DataAck,
    /// Request for a stored file
    MediaRequest,
    /// Subscribe to the receiver's posts
    PeerSub,
    /// Unsubscribe from the receiver's posts
    PeerUnsub,
    /// Profile metadata update
    PeerUpdate,
    /// Post announcement
    PostPublish,
    /// Request for a post
    PostRequest,
    /// Post delivery header
    PostResponseBegin,
    /// Post could not be delivered
    PostResponseError,
}

impl CommandKind {
    /// Every kind, in wire-name order
    pub const ALL: [CommandKind; 19] = [
        Self::Connected,
        Self::Sync,
        Self::CertIssue,
        Self::CertPresent,
        Self::CertVerify,
        Self::ChatInvite,
        Self::ChatMessage,
        Self::ChatUpdate,
        Self::DataBegin,
        Self::DataEnd,
        Self::DataAck,
        Self::MediaRequest,
        Self::PeerSub,
        Self::PeerUnsub,
        Self::PeerUpdate,
        Self::PostPublish,
        Self::PostRequest,
        Self::PostResponseBegin,
        Self::PostResponseError,
    ];

    /// Dotted wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Sync => "sync",
            Self::CertIssue => "cert.issue",
            Self::CertPresent => "cert.present",
            Self::CertVerify => "cert.verify",
            Self::ChatInvite => "chat.invite",
            Self::ChatMessage => "chat.message",
            Self::ChatUpdate => "chat.update",
            Self::DataBegin => "data.begin",
            Self::DataEnd => "data.end",
            Self::DataAck => "data.ack",
            Self::MediaRequest => "media.request",
            Self::PeerSub => "peer.sub",
            Self::PeerUnsub => "peer.unsub",
            Self::PeerUpdate => "peer.update",
            Self::PostPublish => "post.publish",
            Self::PostRequest => "post.request",
            Self::PostResponseBegin => "post.response.begin",
            Self::PostResponseError => "post.response.error",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command and its payload fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dotted command name
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope from a serializable payload
    ///
    /// The payload must serialize to a JSON object (or unit); its fields are
    /// merged next to `type`.
    pub fn new<T: Serialize>(kind: CommandKind, payload: &T) -> Result<Self> {
        let fields = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ProtocolError::InvalidMessage {
                    reason: format!("{kind} payload must be an object, got {other}"),
                }
                .into())
            }
        };
        Ok(Self {
            kind: kind.as_str().to_string(),
            fields,
        })
    }

    /// Envelope with no payload
    pub fn bare(kind: CommandKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            fields: Map::new(),
        }
    }

    /// The command, if known
    pub fn command(&self) -> Option<CommandKind> {
        CommandKind::parse(&self.kind)
    }

    /// Deserialize the payload fields
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            ProtocolError::InvalidMessage {
                reason: format!("bad {} payload: {e}", self.kind),
            }
            .into()
        })
    }

    /// Serialize to the wire text form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the wire text form
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            ProtocolError::InvalidMessage {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// `connected` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connected {
    /// Sender's clock, milliseconds since the epoch
    pub timestamp: i64,
}

/// `data.begin` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBegin {
    /// Content type
    pub mime: String,
    /// Total size in bytes
    pub size: usize,
    /// Target filename; empty for an inline JSON envelope
    #[serde(default)]
    pub filename: String,
}

/// `data.end` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEnd {
    /// Content type
    pub mime: String,
    /// Target filename
    #[serde(default)]
    pub filename: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_kind_parses_back() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::parse("chat"), None);
        assert_eq!(CommandKind::parse("chat.message.extra"), None);
    }

    #[test]
    fn test_envelope_is_flat() {
        let envelope = Envelope::new(
            CommandKind::DataBegin,
            &DataBegin {
                mime: "image/png".into(),
                size: 10,
                filename: "a.png".into(),
            },
        )
        .unwrap();

        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "data.begin", "mime": "image/png", "size": 10, "filename": "a.png"})
        );
    }

    #[test]
    fn test_parse_and_decode() {
        let envelope = Envelope::from_json(
            r#"{"type":"chat.message","chat":"c1","content":"hi","mime":"text/plain"}"#,
        )
        .unwrap();

        assert_eq!(envelope.command(), Some(CommandKind::ChatMessage));
        assert_eq!(envelope.fields["chat"], "c1");
        assert!(envelope.decode::<DataBegin>().is_err());
        assert_eq!(envelope.decode::<DataEnd>().unwrap().mime, "text/plain");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(Envelope::new(CommandKind::Sync, &42).is_err());
        assert!(Envelope::new(CommandKind::DataAck, &()).unwrap().fields.is_empty());
    }

    #[test]
    fn test_missing_type_is_invalid() {
        assert!(Envelope::from_json(r#"{"chat":"c1"}"#).is_err());
        assert!(Envelope::from_json("not json").is_err());
    }
}
