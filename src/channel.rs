//! The cross-host command channel.
//!
//! The AgentGateway's three RPCs (`connect`, `send`, `disconnect`) cross
//! the host/remote boundary over an opaque, already-authenticated
//! bidirectional channel. This module defines that contract as the
//! `CommandChannel` trait and ships two implementations:
//!
//! - [`DirectChannel`] calls into an in-process `AgentGateway` with no
//!   serialization at all. Used when gateway and proxy share a process
//!   (tests, or a same-host deployment).
//! - [`NdjsonChannel`] speaks one JSON object per line over any
//!   `AsyncRead + AsyncWrite` pair (a Unix socket, a TCP stream, or piped
//!   stdio to a child process), so the real command-tunnel transport can be
//!   substituted without touching `gateway` or `proxy`.

use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};
use crate::gateway::{AgentGateway, ConnectResult};
use crate::session::SessionId;

/// The three logical RPCs the request proxy drives against the agent
/// gateway, regardless of what carries them.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn connect(&self, session_id: Option<SessionId>) -> Result<ConnectResult>;
    async fn send(&self, session_id: &SessionId, command_block: &[u8]) -> Result<Vec<u8>>;
    async fn disconnect(&self, session_id: &SessionId) -> Result<()>;
}

/// In-process channel: calls straight into an `AgentGateway`, no wire
/// format. This is what a same-host deployment or a unit test wants.
pub struct DirectChannel {
    gateway: Arc<AgentGateway>,
}

impl DirectChannel {
    pub fn new(gateway: Arc<AgentGateway>) -> Self {
        DirectChannel { gateway }
    }
}

#[async_trait]
impl CommandChannel for DirectChannel {
    async fn connect(&self, session_id: Option<SessionId>) -> Result<ConnectResult> {
        self.gateway.connect(session_id).await
    }

    async fn send(&self, session_id: &SessionId, command_block: &[u8]) -> Result<Vec<u8>> {
        self.gateway.send(session_id, command_block).await
    }

    async fn disconnect(&self, session_id: &SessionId) -> Result<()> {
        self.gateway.disconnect(session_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// NDJSON wire transport
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WireRequest {
    Connect { session_id: Option<SessionId> },
    Send { session_id: SessionId, command_block: Vec<u8> },
    Disconnect { session_id: SessionId },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WireResponse {
    Ok { session_id: Option<SessionId>, body: Vec<u8> },
    Err { message: String },
}

/// Newline-delimited JSON request/response channel over any
/// `AsyncRead + AsyncWrite` pair. One in-flight request at a time per
/// channel instance; callers needing concurrent RPCs should pool several
/// `NdjsonChannel`s or rely on the proxy's one-channel-per-connection model.
pub struct NdjsonChannel<S> {
    // A single async mutex serializes request/response pairs on the shared
    // transport, since NDJSON has no built-in request id multiplexing.
    stream: Mutex<BufReader<S>>,
}

impl<S> NdjsonChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        NdjsonChannel { stream: Mutex::new(BufReader::new(stream)) }
    }

    async fn round_trip(&self, request: WireRequest) -> Result<WireResponse> {
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let mut guard = self.stream.lock().await;
        trace!("command channel --> {line}");
        guard.get_mut().write_all(line.as_bytes()).await.map_err(|e| {
            BridgeError::Channel(format!("write failed: {e}"))
        })?;

        let mut response_line = String::new();
        let n = guard
            .read_line(&mut response_line)
            .await
            .map_err(|e| BridgeError::Channel(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(BridgeError::Channel("command channel closed".to_string()));
        }
        trace!("command channel <-- {response_line}");

        Ok(serde_json::from_str(&response_line)?)
    }
}

#[async_trait]
impl<S> CommandChannel for NdjsonChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn connect(&self, session_id: Option<SessionId>) -> Result<ConnectResult> {
        match self.round_trip(WireRequest::Connect { session_id }).await? {
            WireResponse::Ok { session_id: Some(id), body } => {
                Ok(ConnectResult { session_id: id, greeting: body })
            }
            WireResponse::Ok { session_id: None, .. } => {
                Err(BridgeError::Channel("connect response missing session_id".to_string()))
            }
            WireResponse::Err { message } => Err(BridgeError::Channel(message)),
        }
    }

    async fn send(&self, session_id: &SessionId, command_block: &[u8]) -> Result<Vec<u8>> {
        let request = WireRequest::Send {
            session_id: session_id.clone(),
            command_block: command_block.to_vec(),
        };
        match self.round_trip(request).await? {
            WireResponse::Ok { body, .. } => Ok(body),
            WireResponse::Err { message } => Err(BridgeError::Channel(message)),
        }
    }

    async fn disconnect(&self, session_id: &SessionId) -> Result<()> {
        let request = WireRequest::Disconnect { session_id: session_id.clone() };
        match self.round_trip(request).await? {
            WireResponse::Ok { .. } => Ok(()),
            WireResponse::Err { message } => Err(BridgeError::Channel(message)),
        }
    }
}

/// Serve a `CommandChannel`'s RPCs over one side of an NDJSON transport by
/// dispatching directly to a local `AgentGateway`. Pairs with
/// `NdjsonChannel` on the peer side of a Unix socket, TCP stream, or piped
/// stdio to let the gateway live in a different process than the proxy.
pub async fn serve_ndjson<S>(gateway: Arc<AgentGateway>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| BridgeError::Channel(format!("read failed: {e}")))?;
        if n == 0 {
            return Ok(());
        }

        let request: WireRequest = serde_json::from_str(&line)?;
        let response = match request {
            WireRequest::Connect { session_id } => match gateway.connect(session_id).await {
                Ok(result) => WireResponse::Ok { session_id: Some(result.session_id), body: result.greeting },
                Err(e) => WireResponse::Err { message: e.to_string() },
            },
            WireRequest::Send { session_id, command_block } => {
                match gateway.send(&session_id, &command_block).await {
                    Ok(body) => WireResponse::Ok { session_id: None, body },
                    Err(e) => WireResponse::Err { message: e.to_string() },
                }
            }
            WireRequest::Disconnect { session_id } => {
                gateway.disconnect(&session_id);
                WireResponse::Ok { session_id: None, body: Vec::new() }
            }
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        reader.get_mut().write_all(out.as_bytes()).await.map_err(|e| {
            BridgeError::Channel(format!("write failed: {e}"))
        })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::descriptor::AssuanDescriptor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ndjson_round_trips_connect_and_send() {
        let nonce = [5u8; 16];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let agent = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = [0u8; 16];
            socket.read_exact(&mut received).await.unwrap();
            assert_eq!(received, nonce);
            socket.write_all(b"OK\n").await.unwrap();

            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"BYE\n");
            socket.write_all(b"OK\n").await.unwrap();
        });

        let descriptor = AssuanDescriptor { tcp_port: port, nonce };
        let gateway = Arc::new(AgentGateway::from_descriptor(descriptor, BridgeConfig::default()));

        let (client_side, server_side) = tokio::io::duplex(4096);
        let server = tokio::spawn(serve_ndjson(gateway, server_side));

        let channel = NdjsonChannel::new(client_side);
        let connected = channel.connect(None).await.unwrap();
        assert_eq!(connected.greeting, b"OK\n".to_vec());

        let response = channel.send(&connected.session_id, b"BYE\n").await.unwrap();
        assert_eq!(response, b"OK\n".to_vec());

        channel.disconnect(&connected.session_id).await.unwrap();
        agent.await.unwrap();
        drop(server);
    }
}
