//! TCP front end for the relay: one line of JSON per event.

use super::hub::Relay;
use super::protocol::{decode_line, encode_line, read_line, ClientEvent};
use crate::utils::{NetworkError, PeerwayError, ProtocolError, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Relay server accepting TCP clients
pub struct RelayServer {
    listener: TcpListener,
    relay: Relay,
}

impl RelayServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr, relay: Relay) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::Transport {
                reason: format!("failed to bind relay on {addr}: {e}"),
            })?;
        Ok(Self { listener, relay })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Shared relay state
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Accept clients until the task is dropped
    pub async fn run(self) -> Result<()> {
        log::info!("Relay listening on {}", self.local_addr()?);

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let relay = self.relay.clone();
            tokio::spawn(async move {
                serve_connection(relay, stream, peer_addr).await;
            });
        }
    }
}

async fn serve_connection(relay: Relay, stream: TcpStream, peer_addr: SocketAddr) {
    let (endpoint_id, mut outbound) = relay.open();
    log::info!("Relay client {peer_addr} connected as {endpoint_id}");

    let (reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let line = match encode_line(&event) {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("Failed to encode relay event: {e}");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut reader = BufReader::new(reader);
    loop {
        match read_line(&mut reader).await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_line::<ClientEvent>(&line) {
                Ok(event) => relay.handle(&endpoint_id, event),
                Err(e) => log::warn!("Malformed relay message from {peer_addr}: {e}"),
            },
            Ok(None) => break,
            Err(e @ PeerwayError::Protocol(ProtocolError::InvalidMessage { .. })) => {
                log::warn!("Malformed relay message from {peer_addr}: {e}");
            }
            Err(e) => {
                log::warn!("Dropping relay client {peer_addr}: {e}");
                break;
            }
        }
    }

    relay.close(&endpoint_id);
    writer_task.abort();
    log::info!("Relay client {peer_addr} disconnected");
}
