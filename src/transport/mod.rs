//! Negotiated point-to-point transports.
//!
//! A [`PeerTransport`] follows the offer/answer/candidate dance: the caller
//! creates an offer, the answerer an answer, and both trade candidates through
//! the relay until a direct path opens. Everything else in the crate only
//! sees this trait, so the in-memory network used by tests and the TCP
//! transport used by the binary are interchangeable.

pub mod frame;
pub mod memory;
pub mod tcp;

pub use memory::MemoryNetwork;
pub use tcp::TcpTransportFactory;

use crate::utils::{NetworkError, PeerwayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Sent by the caller
    Offer,
    /// Sent by the answerer
    Answer,
}

/// Opaque session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Transport-specific payload
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with only a candidate line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// One message on an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text, always a JSON envelope
    Text(String),
    /// Raw transfer chunk
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// True for an empty payload
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Events a transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate to forward to the remote side
    LocalCandidate(IceCandidate),
    /// The direct path is usable
    Open,
    /// Inbound frame
    Frame(Frame),
    /// The remote side went away
    Closed,
}

/// Receiver side of a transport's event stream
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A single negotiated connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the caller's offer
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create the answer to an applied offer
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply our own description; candidates start flowing afterwards
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;

    /// Apply a remote candidate; requires the remote description
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Send one frame on the open path
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Tear the connection down
    async fn close(&self);
}

/// Creates transports for peer channels
pub trait TransportFactory: Send + Sync {
    /// New transport for `peer_id` plus its event stream
    fn create(&self, peer_id: &str) -> Result<(Arc<dyn PeerTransport>, TransportEvents)>;
}

pub(crate) fn transport_error(reason: impl Into<String>) -> PeerwayError {
    NetworkError::Transport {
        reason: reason.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_wire_shape() {
        let json = serde_json::to_value(SessionDescription::offer("abc")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "offer", "sdp": "abc"}));
    }

    #[test]
    fn test_candidate_omits_empty_fields() {
        let json = serde_json::to_string(&IceCandidate::new("mem t 0")).unwrap();
        assert_eq!(json, r#"{"candidate":"mem t 0"}"#);

        let parsed: IceCandidate =
            serde_json::from_str(r#"{"candidate":"x","sdpMid":"0","sdpMLineIndex":0}"#).unwrap();
        assert_eq!(parsed.sdp_mid.as_deref(), Some("0"));
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert!(Frame::Binary(Vec::new()).is_empty());
    }
}
