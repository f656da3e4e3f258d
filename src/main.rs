use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::info;
use tokio::net::{UnixListener, UnixStream};

use assuan_bridge_core::{
    bind_unix_listener, AgentGateway, BridgeConfig, CommandChannel, NdjsonChannel, RequestProxy,
};

#[derive(Parser)]
#[command(name = "assuan-bridge")]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host side: speak the nonce handshake to the local gpg-agent and serve
    /// the command channel over a Unix socket for one or more remote proxies.
    Agent {
        /// Path to the Assuan socket descriptor file (port + 16-byte nonce).
        #[arg(long, value_name("PATH"))]
        descriptor: PathBuf,
        /// Unix socket path on which to serve the NDJSON command channel.
        #[arg(long, value_name("PATH"))]
        channel_socket: PathBuf,
        /// Seconds allowed for the nonce handshake and initial greeting.
        #[arg(long, value_name("SECS"), default_value_t = 5)]
        handshake_timeout_secs: u64,
        /// Seconds allowed for a single command round trip.
        #[arg(long, value_name("SECS"), default_value_t = 30)]
        send_timeout_secs: u64,
    },
    /// Remote side: listen on the canonical agent socket path and relay each
    /// client connection through the command channel to the host.
    Proxy {
        /// Unix socket path to bind as the remote agent socket.
        #[arg(long, value_name("PATH"))]
        socket: PathBuf,
        /// Unix socket path to connect to for the NDJSON command channel.
        #[arg(long, value_name("PATH"))]
        channel_socket: PathBuf,
        /// Relax the bound socket file to mode 0o666 instead of the default
        /// 0o600. Logged as a warning; the parent directory stays 0o700.
        #[arg(long)]
        legacy_socket_mode: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> assuan_bridge_core::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Agent { descriptor, channel_socket, handshake_timeout_secs, send_timeout_secs } => {
            run_agent(descriptor, channel_socket, handshake_timeout_secs, send_timeout_secs).await
        }
        Command::Proxy { socket, channel_socket, legacy_socket_mode } => {
            run_proxy(socket, channel_socket, legacy_socket_mode).await
        }
    }
}

async fn run_agent(
    descriptor: PathBuf,
    channel_socket: PathBuf,
    handshake_timeout_secs: u64,
    send_timeout_secs: u64,
) -> assuan_bridge_core::Result<()> {
    let config = BridgeConfig {
        handshake_timeout: Duration::from_secs(handshake_timeout_secs),
        send_timeout: Duration::from_secs(send_timeout_secs),
        ..BridgeConfig::default()
    };
    let gateway = Arc::new(AgentGateway::new(&descriptor, config).await?);
    info!(
        "agent gateway ready on 127.0.0.1:{}, serving command channel at {}",
        gateway.port(),
        channel_socket.display()
    );

    if channel_socket.exists() {
        std::fs::remove_file(&channel_socket).map_err(|source| assuan_bridge_core::BridgeError::Io {
            session: assuan_bridge_core::SessionId::from("channel-listener"),
            source,
        })?;
    }
    let listener = UnixListener::bind(&channel_socket).map_err(|source| assuan_bridge_core::BridgeError::Io {
        session: assuan_bridge_core::SessionId::from("channel-listener"),
        source,
    })?;

    loop {
        let (stream, _addr) = listener.accept().await.map_err(|source| assuan_bridge_core::BridgeError::Io {
            session: assuan_bridge_core::SessionId::from("channel-listener"),
            source,
        })?;
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = assuan_bridge_core::channel::serve_ndjson(gateway, stream).await {
                log::error!("command channel connection ended: {e}");
            }
        });
    }
}

async fn run_proxy(
    socket: PathBuf,
    channel_socket: PathBuf,
    legacy_socket_mode: bool,
) -> assuan_bridge_core::Result<()> {
    let config = BridgeConfig { legacy_socket_mode, ..BridgeConfig::default() };

    let stream = UnixStream::connect(&channel_socket)
        .await
        .map_err(|source| assuan_bridge_core::BridgeError::Io {
            session: assuan_bridge_core::SessionId::from("channel-client"),
            source,
        })?;
    let channel: Arc<dyn CommandChannel> = Arc::new(NdjsonChannel::new(stream));

    let listener = bind_unix_listener(&socket, &config).map_err(|source| assuan_bridge_core::BridgeError::Io {
        session: assuan_bridge_core::SessionId::from("proxy-listener"),
        source,
    })?;
    info!("request proxy listening on {}", socket.display());

    let proxy = RequestProxy::new(listener, socket, channel, config);
    proxy.serve().await.map_err(|source| assuan_bridge_core::BridgeError::Io {
        session: assuan_bridge_core::SessionId::from("proxy-listener"),
        source,
    })
}
