//! Host-side agent gateway: multiplexes many logical sessions onto
//! independent TCP connections to the local GnuPG agent, each authenticated
//! with the shared nonce read once from the Assuan socket descriptor file.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

use crate::config::BridgeConfig;
use crate::descriptor::AssuanDescriptor;
use crate::error::{BridgeError, Result};
use crate::framer::{Framer, ResponseKind};
use crate::session::SessionId;

/// Outcome of a successful `connect` call.
#[derive(Debug)]
pub struct ConnectResult {
    pub session_id: SessionId,
    pub greeting: Vec<u8>,
}

struct SessionIo {
    socket: TcpStream,
    accumulator: Vec<u8>,
}

struct SessionEntry {
    io: AsyncMutex<SessionIo>,
}

/// Per-session connector to the local GnuPG Assuan TCP extra-socket.
///
/// Constructed once per host-side process lifetime from the descriptor
/// file path; the parsed `(port, nonce)` pair is cached for as long as the
/// gateway lives.
pub struct AgentGateway {
    port: u16,
    nonce: [u8; 16],
    config: BridgeConfig,
    sessions: Mutex<HashMap<SessionId, Arc<SessionEntry>>>,
}

impl AgentGateway {
    pub async fn new(descriptor_path: impl AsRef<Path>, config: BridgeConfig) -> Result<Self> {
        let descriptor = AssuanDescriptor::load(descriptor_path).await?;
        Ok(AgentGateway::from_descriptor(descriptor, config))
    }

    pub fn from_descriptor(descriptor: AssuanDescriptor, config: BridgeConfig) -> Self {
        AgentGateway {
            port: descriptor.tcp_port,
            nonce: descriptor.nonce,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a dedicated TCP connection to the agent, perform the nonce
    /// handshake, and register the session. `session_id` is allocated
    /// fresh if not supplied; a supplied id that is already registered
    /// fails with `SessionExists`.
    pub async fn connect(&self, session_id: Option<SessionId>) -> Result<ConnectResult> {
        let id = session_id.unwrap_or_else(SessionId::generate);

        let handshake = async {
            let mut socket = TcpStream::connect(("127.0.0.1", self.port))
                .await
                .map_err(|source| BridgeError::AgentConnectRefused { port: self.port, source })?;

            trace!("session {id}: writing {}-byte nonce", self.nonce.len());
            socket
                .write_all(&self.nonce)
                .await
                .map_err(|source| BridgeError::AgentConnectRefused { port: self.port, source })?;

            let mut accumulator = Vec::new();
            let mut read_buf = vec![0u8; 4096];
            loop {
                let n = socket
                    .read(&mut read_buf)
                    .await
                    .map_err(|source| BridgeError::AgentConnectRefused { port: self.port, source })?;
                if n == 0 {
                    return Err(BridgeError::AgentUnexpectedClose);
                }
                accumulator.extend_from_slice(&read_buf[..n]);
                let completion = Framer::detect_response_completion(&accumulator);
                if completion.complete {
                    return Ok((socket, accumulator));
                }
            }
        };

        let (socket, greeting) = timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| BridgeError::AgentHandshakeTimeout {
                timeout_secs: self.config.handshake_timeout.as_secs(),
            })??;

        {
            let mut table = self.sessions.lock();
            if table.contains_key(&id) {
                return Err(BridgeError::SessionExists(id));
            }
            table.insert(
                id.clone(),
                Arc::new(SessionEntry { io: AsyncMutex::new(SessionIo { socket, accumulator: Vec::new() }) }),
            );
        }

        debug!("session {id}: connected to agent on 127.0.0.1:{}", self.port);
        Ok(ConnectResult { session_id: id, greeting })
    }

    /// Write `command_block` to the session's agent socket and read back
    /// one terminal response. Sends on the same session are serialised by
    /// the per-session async mutex; sends on different sessions proceed
    /// concurrently.
    pub async fn send(&self, session_id: &SessionId, command_block: &[u8]) -> Result<Vec<u8>> {
        let entry = self.lookup(session_id)?;
        let mut io = entry.io.lock().await;

        let round_trip = async {
            io.socket
                .write_all(command_block)
                .await
                .map_err(|source| BridgeError::AgentDropped { session: session_id.clone(), source })?;

            io.accumulator.clear();
            let mut read_buf = vec![0u8; 4096];
            loop {
                let n = io.socket.read(&mut read_buf).await.map_err(|source| {
                    BridgeError::AgentDropped { session: session_id.clone(), source }
                })?;
                if n == 0 {
                    return Err(BridgeError::AgentDropped {
                        session: session_id.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "agent closed connection mid-response",
                        ),
                    });
                }
                io.accumulator.extend_from_slice(&read_buf[..n]);
                let completion = Framer::detect_response_completion(&io.accumulator);
                if completion.complete {
                    let response = std::mem::take(&mut io.accumulator);
                    return Ok((response, completion.kind));
                }
            }
        };

        let result = timeout(self.config.send_timeout, round_trip).await;
        drop(io);

        match result {
            Ok(Ok((response, kind))) => {
                trace!("session {session_id}: response kind {kind:?}, {} bytes", response.len());
                Ok(response)
            }
            Ok(Err(e)) => {
                self.drop_session(session_id);
                Err(e)
            }
            Err(_) => {
                self.drop_session(session_id);
                Err(BridgeError::SendTimeout {
                    session: session_id.clone(),
                    timeout_secs: self.config.send_timeout.as_secs(),
                })
            }
        }
    }

    /// Close the agent socket and remove the session from the table.
    /// Idempotent: unknown ids succeed silently.
    pub fn disconnect(&self, session_id: &SessionId) {
        if self.sessions.lock().remove(session_id).is_some() {
            debug!("session {session_id}: disconnected");
        }
    }

    fn lookup(&self, session_id: &SessionId) -> Result<Arc<SessionEntry>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BridgeError::NoSuchSession(session_id.clone()))
    }

    fn drop_session(&self, session_id: &SessionId) {
        if self.sessions.lock().remove(session_id).is_some() {
            warn!("session {session_id}: torn down after transport failure");
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Classify a just-received agent response, used by the request proxy to
/// pick the next state after `SENDING_TO_CLIENT`.
pub fn classify(response: &[u8]) -> Option<ResponseKind> {
    Framer::detect_response_completion(response).kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    async fn fake_agent(nonce: [u8; 16]) -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _ = nonce;
        (listener, port)
    }

    #[tokio::test]
    async fn connect_performs_nonce_handshake_and_reads_greeting() {
        let nonce = [7u8; 16];
        let (listener, port) = fake_agent(nonce).await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received_nonce = [0u8; 16];
            socket.read_exact(&mut received_nonce).await.unwrap();
            assert_eq!(received_nonce, nonce);
            socket.write_all(b"OK Pleased to meet you\n").await.unwrap();
        });

        let descriptor = AssuanDescriptor { tcp_port: port, nonce };
        let gateway = AgentGateway::from_descriptor(descriptor, BridgeConfig::default());

        let result = gateway.connect(None).await.unwrap();
        assert_eq!(result.greeting, b"OK Pleased to meet you\n".to_vec());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn send_round_trips_a_command() {
        let nonce = [3u8; 16];
        let (listener, port) = fake_agent(nonce).await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received_nonce = [0u8; 16];
            socket.read_exact(&mut received_nonce).await.unwrap();
            socket.write_all(b"OK\n").await.unwrap();

            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GETINFO version\n");
            socket.write_all(b"D 2.4.0\nOK\n").await.unwrap();
        });

        let descriptor = AssuanDescriptor { tcp_port: port, nonce };
        let gateway = AgentGateway::from_descriptor(descriptor, BridgeConfig::default());
        let connected = gateway.connect(None).await.unwrap();

        let response = gateway.send(&connected.session_id, b"GETINFO version\n").await.unwrap();
        assert_eq!(response, b"D 2.4.0\nOK\n".to_vec());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn send_on_unknown_session_fails() {
        let descriptor = AssuanDescriptor { tcp_port: 1, nonce: [0; 16] };
        let gateway = AgentGateway::from_descriptor(descriptor, BridgeConfig::default());
        let err = gateway.send(&SessionId::generate(), b"BYE\n").await.unwrap_err();
        assert!(matches!(err, BridgeError::NoSuchSession(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let descriptor = AssuanDescriptor { tcp_port: 1, nonce: [0; 16] };
        let gateway = AgentGateway::from_descriptor(descriptor, BridgeConfig::default());
        let id = SessionId::generate();
        gateway.disconnect(&id);
        gateway.disconnect(&id);
    }

    #[tokio::test]
    async fn reused_session_id_fails_with_session_exists() {
        let nonce = [9u8; 16];
        let (listener, port) = fake_agent(nonce).await;
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut received_nonce = [0u8; 16];
                socket.read_exact(&mut received_nonce).await.unwrap();
                socket.write_all(b"OK\n").await.unwrap();
            }
        });

        let descriptor = AssuanDescriptor { tcp_port: port, nonce };
        let gateway = AgentGateway::from_descriptor(descriptor, BridgeConfig::default());
        let id = SessionId::from("fixed-id");
        gateway.connect(Some(id.clone())).await.unwrap();
        let err = gateway.connect(Some(id.clone())).await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionExists(_)));
        server.await.unwrap();
    }
}
