//! Core of a bidirectional bridge for the GnuPG Assuan protocol across a
//! host/guest boundary: a binary-safe framer, a host-side agent gateway
//! that speaks the nonce handshake to the local GnuPG agent, and a
//! remote-side request proxy that drives one state machine per client
//! connection through an opaque command channel.
//!
//! Discovery of the GnuPG binary directory, the `gpg`/`gpgconf` CLI
//! wrappers, the interactive key-selection UI, the public-key sync
//! workflow, the real command-tunnel transport, and extension-host
//! lifecycle glue are all external collaborators and out of scope here.

pub mod channel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod framer;
pub mod gateway;
pub mod proxy;
pub mod session;
pub mod state;

pub use channel::{CommandChannel, DirectChannel, NdjsonChannel};
pub use config::BridgeConfig;
pub use descriptor::AssuanDescriptor;
pub use error::{BridgeError, Result};
pub use framer::{Completion, Framer, ResponseKind};
pub use gateway::{AgentGateway, ConnectResult};
pub use proxy::{bind_unix_listener, unlink_socket, ConnectionListener, RequestProxy, UnixSocketListener};
pub use session::SessionId;
pub use state::{transition, Event, ProxyState};
