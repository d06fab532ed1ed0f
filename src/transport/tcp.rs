//! Direct TCP transport.
//!
//! The caller listens on an ephemeral port and advertises it as its single
//! candidate (`tcp <addr>`); the answerer dials it and proves which offer it
//! answers by sending the offer token as the first text frame.

use super::frame::{read_frame, write_frame};
use super::{
    transport_error, Frame, IceCandidate, PeerTransport, SdpKind, SessionDescription,
    TransportEvent, TransportEvents, TransportFactory,
};
use crate::utils::{NetworkError, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Builds TCP transports bound to one local address
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    bind_address: IpAddr,
    max_frame_size: usize,
}

impl TcpTransportFactory {
    /// Factory listening on `bind_address`
    pub fn new(bind_address: IpAddr, max_frame_size: usize) -> Self {
        Self {
            bind_address,
            max_frame_size,
        }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self, peer_id: &str) -> Result<(Arc<dyn PeerTransport>, TransportEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = TcpTransport {
            inner: Arc::new(TcpInner {
                bind_address: self.bind_address,
                max_frame_size: self.max_frame_size,
                peer_id: peer_id.to_string(),
                events: tx,
                state: Mutex::new(TcpState::default()),
            }),
        };
        Ok((Arc::new(transport), rx))
    }
}

#[derive(Default)]
struct TcpState {
    token: Option<String>,
    listener: Option<TcpListener>,
    remote_token: Option<String>,
    remote_set: bool,
    writer: Option<OwnedWriteHalf>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

struct TcpInner {
    bind_address: IpAddr,
    max_frame_size: usize,
    peer_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<TcpState>,
}

impl TcpInner {
    async fn install(self: &Arc<Self>, mut reader: OwnedReadHalf, writer: OwnedWriteHalf) {
        let mut state = self.state.lock().await;
        if state.closed || state.writer.is_some() {
            return;
        }
        state.writer = Some(writer);

        let inner = Arc::clone(self);
        state.tasks.push(tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, inner.max_frame_size).await {
                    Ok(Some(frame)) => {
                        if inner.events.send(TransportEvent::Frame(frame)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("TCP transport to {} failed: {e}", inner.peer_id);
                        break;
                    }
                }
            }
            let _ = inner.events.send(TransportEvent::Closed);
        }));

        log::debug!("TCP transport to {} open", self.peer_id);
        let _ = self.events.send(TransportEvent::Open);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: String) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("TCP transport accept failed: {e}");
                    return;
                }
            };

            let (mut reader, writer) = stream.into_split();
            match read_frame(&mut reader, self.max_frame_size).await {
                Ok(Some(Frame::Text(hello))) if hello == token => {
                    self.install(reader, writer).await;
                    return;
                }
                _ => log::warn!("Rejected TCP connection from {addr}: bad hello"),
            }
        }
    }
}

struct TcpTransport {
    inner: Arc<TcpInner>,
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let listener = TcpListener::bind(SocketAddr::new(self.inner.bind_address, 0))
            .await
            .map_err(|e| transport_error(format!("failed to listen: {e}")))?;
        let token = Uuid::new_v4().simple().to_string();

        let mut state = self.inner.state.lock().await;
        state.token = Some(token.clone());
        state.listener = Some(listener);
        Ok(SessionDescription::offer(token))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.inner.state.lock().await;
        let token = state
            .remote_token
            .clone()
            .ok_or_else(|| transport_error("answer requested before an offer was applied"))?;
        Ok(SessionDescription::answer(token))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        if description.kind != SdpKind::Offer {
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        let (Some(listener), Some(token)) = (state.listener.take(), state.token.clone()) else {
            return Err(transport_error("offer was not created by this transport"));
        };
        let addr = listener.local_addr()?;

        let inner = Arc::clone(&self.inner);
        state
            .tasks
            .push(tokio::spawn(inner.accept_loop(listener, token)));
        drop(state);

        let _ = self
            .inner
            .events
            .send(TransportEvent::LocalCandidate(IceCandidate::new(format!(
                "tcp {addr}"
            ))));
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if description.kind == SdpKind::Offer {
            state.remote_token = Some(description.sdp.clone());
        }
        state.remote_set = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let token = {
            let state = self.inner.state.lock().await;
            if !state.remote_set {
                return Err(transport_error("candidate applied before remote description"));
            }
            match (&state.remote_token, &state.writer) {
                (Some(token), None) => token.clone(),
                _ => return Ok(()),
            }
        };

        let address = candidate
            .candidate
            .strip_prefix("tcp ")
            .ok_or_else(|| NetworkError::InvalidAddress {
                address: candidate.candidate.clone(),
            })?;
        let addr: SocketAddr = address.parse().map_err(|_| NetworkError::InvalidAddress {
            address: address.to_string(),
        })?;

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: self.inner.peer_id.clone(),
                reason: e.to_string(),
            })?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Frame::Text(token)).await?;

        self.inner.install(reader, writer).await;
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| transport_error("TCP transport is not open"))?;
        write_frame(writer, &frame).await
    }

    async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        for task in state.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut writer) = state.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_loopback_negotiation() {
        let factory = TcpTransportFactory::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 64 * 1024);
        let (caller, mut caller_rx) = factory.create("b1").unwrap();
        let (answerer, mut answerer_rx) = factory.create("a1").unwrap();

        let offer = caller.create_offer().await.unwrap();
        caller.set_local_description(&offer).await.unwrap();
        answerer.set_remote_description(&offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        caller.set_remote_description(&answer).await.unwrap();

        let candidate = match caller_rx.recv().await.unwrap() {
            TransportEvent::LocalCandidate(c) => c,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(candidate.candidate.starts_with("tcp 127.0.0.1:"));
        answerer.add_ice_candidate(&candidate).await.unwrap();

        assert_eq!(answerer_rx.recv().await.unwrap(), TransportEvent::Open);
        assert_eq!(caller_rx.recv().await.unwrap(), TransportEvent::Open);

        answerer
            .send(Frame::Binary(vec![0xAB; 2048]))
            .await
            .unwrap();
        assert_eq!(
            caller_rx.recv().await.unwrap(),
            TransportEvent::Frame(Frame::Binary(vec![0xAB; 2048]))
        );

        answerer.close().await;
        assert_eq!(caller_rx.recv().await.unwrap(), TransportEvent::Closed);
    }

    #[tokio::test]
    async fn test_rejects_malformed_candidate() {
        let factory = TcpTransportFactory::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1024);
        let (answerer, _rx) = factory.create("a1").unwrap();
        answerer
            .set_remote_description(&SessionDescription::offer("tok"))
            .await
            .unwrap();

        assert!(answerer
            .add_ice_candidate(&IceCandidate::new("udp nowhere"))
            .await
            .is_err());
    }
}
