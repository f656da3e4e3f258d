//! Remote-side request proxy: a Unix domain listener at the canonical
//! agent socket path, driving one [`state`] machine per accepted client
//! through a [`CommandChannel`].

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::channel::CommandChannel;
use crate::config::{BridgeConfig, SOCKET_DIR_MODE};
use crate::error::{BridgeError, Result};
use crate::framer::Framer;
use crate::session::SessionId;
use crate::state::{transition, Event, ProxyState};

/// Injectable listener seam ("server factory"). Production code binds a
/// real Unix domain socket; tests substitute a one-shot listener around an
/// in-memory duplex pair.
#[async_trait]
pub trait ConnectionListener: Send {
    type Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<Self::Connection>;
}

pub struct UnixSocketListener {
    inner: UnixListener,
}

#[async_trait]
impl ConnectionListener for UnixSocketListener {
    type Connection = UnixStream;

    async fn accept(&mut self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}

/// Bind the canonical agent socket path: create the parent directory with
/// mode 0o700 if absent, unlink a stale socket file if present, bind and
/// listen, and apply the configured socket file mode.
pub fn bind_unix_listener(path: impl AsRef<Path>, config: &BridgeConfig) -> io::Result<UnixSocketListener> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(SOCKET_DIR_MODE))?;
        }
    }

    if path.exists() {
        warn!("removing stale socket file at {}", path.display());
        fs::remove_file(path)?;
    }

    let inner = UnixListener::bind(path)?;

    if config.legacy_socket_mode {
        warn!(
            "legacy socket mode enabled: {} will be world read/writable (0o666)",
            path.display()
        );
    }
    fs::set_permissions(path, fs::Permissions::from_mode(config.socket_mode()))?;

    Ok(UnixSocketListener { inner })
}

/// Unlink the socket file on listener teardown. Absence is not an error.
pub fn unlink_socket(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("failed to unlink socket file {}: {e}", path.display());
        }
    }
}

/// Runs the Unix domain listener and spawns one connection driver per
/// accepted client.
pub struct RequestProxy<L> {
    listener: L,
    socket_path: PathBuf,
    channel: Arc<dyn CommandChannel>,
    config: BridgeConfig,
}

impl<L> RequestProxy<L>
where
    L: ConnectionListener + 'static,
{
    pub fn new(
        listener: L,
        socket_path: PathBuf,
        channel: Arc<dyn CommandChannel>,
        config: BridgeConfig,
    ) -> Self {
        RequestProxy { listener, socket_path, channel, config }
    }

    /// Accept connections until the listener errors, spawning one task per
    /// client. Unlinks the socket file on the way out.
    pub async fn serve(mut self) -> io::Result<()> {
        let result = loop {
            match self.listener.accept().await {
                Ok(conn) => {
                    let channel = self.channel.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        drive_connection(conn, channel, config).await;
                    });
                }
                Err(e) => break Err(e),
            }
        };
        unlink_socket(&self.socket_path);
        result
    }
}

/// Read buffer size for one socket read attempt.
const READ_CHUNK: usize = 4096;

/// Outcome of trying to read more bytes from the client while buffering.
enum ReadOutcome {
    Bytes(Vec<u8>),
    ClientClosed,
    Failed(io::Error),
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut R) -> ReadOutcome {
    let mut buf = vec![0u8; READ_CHUNK];
    match reader.read(&mut buf).await {
        Ok(0) => ReadOutcome::ClientClosed,
        Ok(n) => {
            buf.truncate(n);
            ReadOutcome::Bytes(buf)
        }
        Err(e) => ReadOutcome::Failed(e),
    }
}

/// Drive one client connection through the full state machine, from
/// `ClientAccepted` to a terminal `Disconnected`/`Fatal`.
///
/// A clean client-initiated close (EOF) while buffering is not a protocol
/// violation: it routes straight to `CLOSING` rather than through `ERROR`,
/// which is reserved for actual violations and failures. Only unexpected
/// bytes arriving during `WAITING_FOR_AGENT` (strictly half-duplex per
/// command) are a violation.
async fn drive_connection<S>(stream: S, channel: Arc<dyn CommandChannel>, config: BridgeConfig)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = split(stream);

    let mut state = transition(ProxyState::Disconnected, &Event::ClientAccepted);
    state = transition(state, &Event::StartConnect);

    let mut session_id: Option<SessionId> = None;
    let mut framer = Framer::new();
    let mut framed: Option<Vec<u8>> = None;
    let mut agent_response: Option<Vec<u8>> = None;
    let mut last_error: Option<BridgeError> = None;
    let mut closing_cleanly = true;

    match channel.connect(None).await {
        Ok(connected) => {
            session_id = Some(connected.session_id.clone());
            debug!("session {}: client connected, agent greeted", connected.session_id);
            match writer.write_all(&connected.greeting).await {
                Ok(()) => state = transition(state, &Event::GreetingReceived),
                Err(e) => {
                    last_error = Some(BridgeError::Io { session: connected.session_id.clone(), source: e });
                    state = transition(state, &Event::ConnectFailed);
                }
            }
        }
        Err(e) => {
            error!("agent connect failed: {e}");
            last_error = Some(e);
            state = transition(state, &Event::ConnectFailed);
        }
    }

    loop {
        state = match state {
            // A prior read may have delivered more than one frame's worth
            // of bytes (e.g. a client pipelining two commands in one
            // write). If the framer already has residual bytes, process
            // them before touching the socket again.
            ProxyState::Ready if !framer.is_empty() => transition(state, &Event::ClientBytes),

            ProxyState::Ready => match read_some(&mut reader).await {
                ReadOutcome::Bytes(bytes) => {
                    framer.push(&bytes);
                    transition(state, &Event::ClientBytes)
                }
                ReadOutcome::ClientClosed => ProxyState::Closing,
                ReadOutcome::Failed(e) => {
                    last_error = Some(io_error(&session_id, e));
                    ProxyState::Closing
                }
            },

            ProxyState::BufferingCommand => {
                if let Some(cmd) = framer.extract_command() {
                    framed = Some(cmd);
                    transition(state, &Event::CommandFramed)
                } else if framer.len() > config.session_buffer_cap {
                    last_error = Some(BridgeError::BufferCapExceeded {
                        session: current_session(&session_id),
                        limit: config.session_buffer_cap,
                    });
                    transition(state, &Event::FramerError)
                } else {
                    match read_some(&mut reader).await {
                        ReadOutcome::Bytes(bytes) => {
                            framer.push(&bytes);
                            transition(state, &Event::ClientBytes)
                        }
                        ReadOutcome::ClientClosed => ProxyState::Closing,
                        ReadOutcome::Failed(e) => {
                            last_error = Some(io_error(&session_id, e));
                            ProxyState::Closing
                        }
                    }
                }
            }

            ProxyState::BufferingInquire => {
                if let Some(block) = framer.extract_inquire_block() {
                    framed = Some(block);
                    transition(state, &Event::InquireFramed)
                } else if framer.len() > config.session_buffer_cap {
                    last_error = Some(BridgeError::BufferCapExceeded {
                        session: current_session(&session_id),
                        limit: config.session_buffer_cap,
                    });
                    transition(state, &Event::FramerError)
                } else {
                    match read_some(&mut reader).await {
                        ReadOutcome::Bytes(bytes) => {
                            framer.push(&bytes);
                            transition(state, &Event::ClientBytes)
                        }
                        ReadOutcome::ClientClosed => ProxyState::Closing,
                        ReadOutcome::Failed(e) => {
                            last_error = Some(io_error(&session_id, e));
                            ProxyState::Closing
                        }
                    }
                }
            }

            ProxyState::DataReady => transition(state, &Event::Dispatch),

            ProxyState::SendingToAgent => {
                let id = match &session_id {
                    Some(id) => id.clone(),
                    None => unreachable!("SENDING_TO_AGENT is only reached after a session is established"),
                };
                let block = match framed.take() {
                    Some(block) => block,
                    None => unreachable!("DATA_READY always carries a framed block into SENDING_TO_AGENT"),
                };
                match dispatch(&channel, &id, &block, &mut reader).await {
                    DispatchOutcome::Response(response) => {
                        agent_response = Some(response);
                        transition(ProxyState::WaitingForAgent, &Event::AgentResponse)
                    }
                    DispatchOutcome::Timeout(e) => {
                        last_error = Some(e);
                        transition(ProxyState::WaitingForAgent, &Event::AgentTimeout)
                    }
                    DispatchOutcome::SocketErr(e) => {
                        last_error = Some(e);
                        transition(ProxyState::WaitingForAgent, &Event::AgentSocketErr)
                    }
                    DispatchOutcome::ClientViolation => {
                        last_error = Some(BridgeError::ClientWroteDuringWait { session: id, bytes: 1 });
                        transition(ProxyState::WaitingForAgent, &Event::ClientBytesDuringWait)
                    }
                }
            }

            ProxyState::SendingToClient => {
                let response = match agent_response.take() {
                    Some(response) => response,
                    None => unreachable!("WAITING_FOR_AGENT always carries a response into SENDING_TO_CLIENT"),
                };
                let kind = Framer::detect_response_completion(&response).kind;
                match writer.write_all(&response).await {
                    Ok(()) => match kind {
                        Some(kind) => transition(state, &Event::Classify(kind)),
                        None => {
                            last_error = Some(BridgeError::AgentResponseUnterminated {
                                session: current_session(&session_id),
                            });
                            transition(state, &Event::WriteErr)
                        }
                    },
                    Err(e) => {
                        last_error = Some(io_error(&session_id, e));
                        transition(state, &Event::WriteErr)
                    }
                }
            }

            ProxyState::Error => {
                closing_cleanly = false;
                transition(state, &Event::CleanupStart)
            }

            ProxyState::Closing => match cleanup(&channel, session_id.as_ref()).await {
                Ok(()) => transition(state, &Event::CleanupOk),
                Err(e) => {
                    last_error = Some(e);
                    transition(state, &Event::CleanupErr)
                }
            },

            ProxyState::Disconnected => break,

            ProxyState::Fatal => {
                error!(
                    "session {:?} reached FATAL: {:?}",
                    session_id.as_ref().map(SessionId::as_str),
                    last_error
                );
                break;
            }

            // AgentConnecting/ClientConnected/WaitingForAgent are only
            // ever visited transiently above, never as a loop head.
            other => other,
        };
    }

    if let Some(e) = last_error {
        if closing_cleanly {
            debug!("connection closed: {e}");
        } else {
            warn!("connection torn down after error: {e}");
        }
    }
}

enum DispatchOutcome {
    Response(Vec<u8>),
    Timeout(BridgeError),
    SocketErr(BridgeError),
    ClientViolation,
}

/// Send the framed command/inquire block to the agent via the command
/// channel while concurrently watching the client socket: any bytes
/// arriving before the agent responds is a protocol violation per the
/// half-duplex rule, and takes priority over a same-tick agent response.
async fn dispatch<R>(
    channel: &Arc<dyn CommandChannel>,
    session_id: &SessionId,
    block: &[u8],
    client_reader: &mut R,
) -> DispatchOutcome
where
    R: AsyncRead + Unpin,
{
    let send_fut = channel.send(session_id, block);
    tokio::pin!(send_fut);
    let mut peek = [0u8; 1];
    let mut client_exhausted = false;

    loop {
        tokio::select! {
            biased;
            result = &mut send_fut => {
                return match result {
                    Ok(response) => DispatchOutcome::Response(response),
                    Err(e @ BridgeError::SendTimeout { .. }) => DispatchOutcome::Timeout(e),
                    Err(e) => DispatchOutcome::SocketErr(e),
                };
            }
            read_result = client_reader.read(&mut peek), if !client_exhausted => {
                match read_result {
                    // Client half-closed or its read errored; nothing more
                    // to police, so stop selecting this branch and just
                    // wait out the agent round trip.
                    Ok(0) | Err(_) => client_exhausted = true,
                    Ok(_) => return DispatchOutcome::ClientViolation,
                }
            }
        }
    }
}

async fn cleanup(channel: &Arc<dyn CommandChannel>, session_id: Option<&SessionId>) -> Result<()> {
    if let Some(id) = session_id {
        channel.disconnect(id).await.map_err(|e| BridgeError::CleanupFailed {
            session: id.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn io_error(session_id: &Option<SessionId>, source: io::Error) -> BridgeError {
    BridgeError::Io { session: current_session(session_id), source }
}

/// All call sites for this run only after the agent greeting succeeded, by
/// which point `session_id` is always populated.
fn current_session(session_id: &Option<SessionId>) -> SessionId {
    match session_id {
        Some(id) => id.clone(),
        None => unreachable!("buffering/dispatch only run after a session is established"),
    }
}
