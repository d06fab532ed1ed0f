//! Relay wire protocol.
//!
//! Every frame is one line of JSON: `{"event": <name>, "data": <payload>}`.
//! The relay reads [`ClientEvent`]s and writes [`ServerEvent`]s; negotiation
//! payloads pass through untouched.

use crate::transport::{IceCandidate, SessionDescription};
use crate::utils::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Entities per `ListEntities` page
pub const PAGE_SIZE: usize = 50;

/// Largest relay line accepted (bytes)
pub const MAX_LINE_SIZE: usize = 256 * 1024;

/// Ordering of the relay directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortMode {
    /// Display name, case-insensitive
    #[default]
    ByName,
    /// Entity id
    ById,
}

/// Display metadata registered with an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMeta {
    /// Display name
    pub name: String,
    /// Avatar reference
    pub avatar: Option<String>,
}

/// One row of the relay directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityListing {
    /// Entity id
    pub id: String,
    /// Endpoint id of the live session
    pub client_id: String,
    /// Display name
    pub name: String,
    /// Avatar reference
    pub avatar: Option<String>,
}

/// Answer to `GetEntityMeta`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    /// Entity id asked about
    pub id: String,
    /// Whether at least one endpoint is live
    pub available: bool,
    /// First registered endpoint
    pub client_id: Option<String>,
    /// Display name
    pub name: Option<String>,
    /// Avatar reference
    pub avatar: Option<String>,
}

impl EntityMeta {
    /// Meta for an entity the relay does not know
    pub fn unavailable(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            available: false,
            client_id: None,
            name: None,
            avatar: None,
        }
    }
}

/// Offer or answer travelling through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequest {
    /// Sending entity
    pub local: String,
    /// Receiving entity
    pub remote: String,
    /// Endpoint the relay forwards to
    pub target: String,
    /// Endpoint of the calling side; stamped by the relay on offers
    #[serde(default)]
    pub caller: String,
    /// Session description
    pub sdp: SessionDescription,
}

/// Candidate travelling through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    /// Sending entity
    pub local: String,
    /// Receiving entity
    pub remote: String,
    /// Endpoint the relay forwards to
    pub target: String,
    /// The candidate
    pub candidate: IceCandidate,
}

/// Events a client sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Register this connection for an entity
    SetupEntity {
        /// Entity id
        id: String,
        /// Display name
        name: String,
        /// Avatar reference
        #[serde(default)]
        avatar: Option<String>,
    },
    /// Request a directory page
    ListEntities {
        /// Zero-based page index
        page: usize,
        /// Requested ordering
        #[serde(default)]
        sort: Option<SortMode>,
    },
    /// Resolve an entity to its endpoint
    GetEntityMeta {
        /// Entity id
        id: String,
        /// Caller's cached name, unused by the relay
        #[serde(default)]
        name: Option<String>,
        /// Caller's cached avatar, unused by the relay
        #[serde(default)]
        avatar: Option<String>,
    },
    /// Forward an offer
    SendPeerRequest(PeerRequest),
    /// Forward an answer
    AcceptPeerRequest(PeerRequest),
    /// Forward a candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate(CandidateMessage),
    /// Fan a notification out to entities
    PushNotification {
        /// Target entity ids
        targets: Vec<String>,
        /// Opaque notification payload
        notif: serde_json::Value,
        /// Sending entity
        from: String,
    },
}

/// Events the relay sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Outcome of `SetupEntity`
    SetupResult(bool),
    /// A directory page
    ListEntitiesResponse(Vec<EntityListing>),
    /// Outcome of `GetEntityMeta`
    EntityMetaResponse(EntityMeta),
    /// Inbound offer
    PeerConnectionRequest(PeerRequest),
    /// Inbound answer
    PeerConnectionAccepted(PeerRequest),
    /// Inbound candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate(CandidateMessage),
    /// Inbound notification
    PushNotification {
        /// Opaque notification payload
        notif: serde_json::Value,
        /// Sending entity
        from: String,
    },
}

impl ClientEvent {
    /// Event name as written on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupEntity { .. } => "SetupEntity",
            Self::ListEntities { .. } => "ListEntities",
            Self::GetEntityMeta { .. } => "GetEntityMeta",
            Self::SendPeerRequest(_) => "SendPeerRequest",
            Self::AcceptPeerRequest(_) => "AcceptPeerRequest",
            Self::IceCandidate(_) => "ice-candidate",
            Self::PushNotification { .. } => "PushNotification",
        }
    }
}

/// Encode an event as one wire line (without the newline)
pub fn encode_line<T: Serialize>(event: &T) -> Result<String> {
    serde_json::to_string(event).map_err(Into::into)
}

/// Read the next line, never buffering more than [`MAX_LINE_SIZE`] bytes
///
/// Returns `None` at end of stream. A longer line fails with
/// `MessageTooLarge` and leaves the stream mid-line; the caller should drop
/// the connection.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_SIZE as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: buf.len(),
            max: MAX_LINE_SIZE,
        }
        .into());
    }

    String::from_utf8(buf).map(Some).map_err(|e| {
        ProtocolError::InvalidMessage {
            reason: e.to_string(),
        }
        .into()
    })
}

/// Decode one wire line
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            max: MAX_LINE_SIZE,
        }
        .into());
    }
    serde_json::from_str(line).map_err(|e| {
        ProtocolError::InvalidMessage {
            reason: e.to_string(),
        }
        .into()
    })
}
