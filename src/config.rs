//! Centralised defaults for the bridge core.
//!
//! The CLI layer in `main.rs` is a thin translation from `clap` output into
//! this struct; `framer`, `gateway`, and `proxy` take `BridgeConfig` values
//! and never see a `clap` type, keeping the library half of this crate free
//! of a CLI dependency.

use std::time::Duration;

/// Socket file mode used unless `legacy_socket_mode` is set.
pub const SOCKET_MODE_DEFAULT: u32 = 0o600;
/// Socket file mode used only in the documented legacy compatibility mode.
pub const SOCKET_MODE_LEGACY: u32 = 0o666;
/// Parent directory mode for the remote agent socket, always enforced.
pub const SOCKET_DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Time allowed for the nonce handshake and initial greeting.
    pub handshake_timeout: Duration,
    /// Time allowed for a single `send` round trip.
    pub send_timeout: Duration,
    /// Hard cap on a session's client-side buffer, in bytes. Exceeding it
    /// is a protocol error (`BridgeError::BufferCapExceeded`).
    pub session_buffer_cap: usize,
    /// When true, the socket file is chmod'd 0o666 after bind instead of
    /// the default 0o600. Parent directory mode is unaffected and always
    /// 0o700. Opt-in only; a `warn!` is logged when this is enabled.
    pub legacy_socket_mode: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            handshake_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(30),
            session_buffer_cap: 16 * 1024 * 1024,
            legacy_socket_mode: false,
        }
    }
}

impl BridgeConfig {
    pub fn socket_mode(&self) -> u32 {
        if self.legacy_socket_mode {
            SOCKET_MODE_LEGACY
        } else {
            SOCKET_MODE_DEFAULT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_owner_only() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.socket_mode(), 0o600);
    }

    #[test]
    fn legacy_mode_relaxes_socket_file_only() {
        let cfg = BridgeConfig { legacy_socket_mode: true, ..BridgeConfig::default() };
        assert_eq!(cfg.socket_mode(), 0o666);
        assert_eq!(SOCKET_DIR_MODE, 0o700);
    }
}
