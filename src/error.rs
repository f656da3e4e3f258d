//! The one error type that crosses module boundaries in this crate.
//!
//! Every fallible operation in `framer`, `descriptor`, `gateway`, `proxy` and
//! `channel` returns `Result<T, BridgeError>`. Callers match on the variant
//! groups below, not on `io::ErrorKind`.

use std::io;

use crate::session::SessionId;

/// Error taxonomy for the bridge core: config, connect, protocol,
/// transport, cleanup.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // -- config errors: fatal at startup -----------------------------------
    #[error("assuan socket descriptor at {path:?} is malformed: {reason}")]
    DescriptorInvalid { path: String, reason: String },

    #[error("could not resolve socket path: {0}")]
    SocketPathUnresolved(String),

    // -- connect errors: per-session, surfaced to the proxy -----------------
    #[error("agent refused the connection on 127.0.0.1:{port}")]
    AgentConnectRefused { port: u16, #[source] source: io::Error },

    #[error("agent handshake did not complete within {timeout_secs}s")]
    AgentHandshakeTimeout { timeout_secs: u64 },

    #[error("agent closed the connection before sending a greeting")]
    AgentUnexpectedClose,

    #[error("session id {0:?} is already registered")]
    SessionExists(SessionId),

    #[error("no session registered under id {0:?}")]
    NoSuchSession(SessionId),

    // -- protocol errors: force ERROR -> CLOSING -----------------------------
    #[error("session {session} exceeded the {limit}-byte buffer cap")]
    BufferCapExceeded { session: SessionId, limit: usize },

    #[error("client wrote {bytes} byte(s) while session {session} was waiting on the agent")]
    ClientWroteDuringWait { session: SessionId, bytes: usize },

    #[error("agent response for session {session} never reached a terminal line")]
    AgentResponseUnterminated { session: SessionId },

    #[error("protocol violation in session {session}: {reason}")]
    ProtocolViolation { session: SessionId, reason: String },

    // -- transport errors: force ERROR -> CLOSING ----------------------------
    #[error("agent connection for session {session} dropped mid-exchange")]
    AgentDropped { session: SessionId, #[source] source: io::Error },

    #[error("i/o error on session {session}")]
    Io { session: SessionId, #[source] source: io::Error },

    #[error("command channel error: {0}")]
    Channel(String),

    #[error("send on session {session} timed out after {timeout_secs}s")]
    SendTimeout { session: SessionId, timeout_secs: u64 },

    // -- cleanup errors: logged, aggregated, rarely fatal --------------------
    #[error("cleanup of session {session} failed: {reason}")]
    CleanupFailed { session: SessionId, reason: String },
}

impl BridgeError {
    /// Whether this error, raised from `WAITING_FOR_AGENT` or earlier,
    /// forces the owning session straight to `CLOSING` per the transition
    /// table rather than being merely logged.
    pub fn is_fatal_to_session(&self) -> bool {
        !matches!(self, BridgeError::CleanupFailed { .. })
    }
}

/// Bridges `BridgeError` back to `io::Error` at the one seam (the CLI entry
/// point) that still needs to return a plain `io::Result`, generalizing the
/// original bridge's local `other_error` helper.
impl From<BridgeError> for io::Error {
    fn from(err: BridgeError) -> Self {
        io::Error::new(io::ErrorKind::Other, err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Channel(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
