//! Parsing of the Assuan socket descriptor file the host-side gateway reads
//! once at construction time.
//!
//! File format: an ASCII decimal port number, a single `\n`, then exactly
//! 16 raw bytes of nonce. Trailing bytes beyond that are ignored.

use std::path::Path;
use std::str;

use tokio::fs;

use crate::error::{BridgeError, Result};

pub const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssuanDescriptor {
    pub tcp_port: u16,
    pub nonce: [u8; NONCE_LEN],
}

impl AssuanDescriptor {
    /// Read and parse the descriptor file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<AssuanDescriptor> {
        let path = path.as_ref();
        let bytes = fs::read(path).await.map_err(|e| BridgeError::DescriptorInvalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&bytes).map_err(|reason| BridgeError::DescriptorInvalid {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Parse the byte-exact descriptor format without touching the
    /// filesystem, factored out so it is independently unit-testable.
    pub fn parse(bytes: &[u8]) -> std::result::Result<AssuanDescriptor, String> {
        let newline_pos = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| "missing newline after port".to_string())?;

        let port_text = str::from_utf8(&bytes[..newline_pos])
            .map_err(|e| format!("port is not valid ascii: {e}"))?;
        let tcp_port: u32 = port_text
            .trim()
            .parse()
            .map_err(|e| format!("port {port_text:?} is not a decimal number: {e}"))?;
        if !(1..=65535).contains(&tcp_port) {
            return Err(format!("port {tcp_port} out of range 1..=65535"));
        }

        let nonce_start = newline_pos + 1;
        if bytes.len() < nonce_start + NONCE_LEN {
            return Err(format!(
                "nonce too short: need {NONCE_LEN} bytes, found {}",
                bytes.len().saturating_sub(nonce_start)
            ));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[nonce_start..nonce_start + NONCE_LEN]);

        Ok(AssuanDescriptor { tcp_port: tcp_port as u16, nonce })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_nonce() -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        for (i, b) in nonce.iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        nonce
    }

    #[test]
    fn parses_happy_path() {
        let mut bytes = b"63144\n".to_vec();
        bytes.extend_from_slice(&sample_nonce());
        let descriptor = AssuanDescriptor::parse(&bytes).unwrap();
        assert_eq!(descriptor.tcp_port, 63144);
        assert_eq!(descriptor.nonce, sample_nonce());
    }

    #[test]
    fn ignores_trailing_bytes() {
        let mut bytes = b"63144\n".to_vec();
        bytes.extend_from_slice(&sample_nonce());
        bytes.extend_from_slice(b"garbage-trailer");
        let descriptor = AssuanDescriptor::parse(&bytes).unwrap();
        assert_eq!(descriptor.nonce, sample_nonce());
    }

    #[test]
    fn rejects_short_nonce() {
        let bytes = b"63144\n\x01\x02\x03".to_vec();
        assert!(AssuanDescriptor::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_missing_newline() {
        let bytes = b"63144".to_vec();
        assert!(AssuanDescriptor::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let mut bytes = b"notaport\n".to_vec();
        bytes.extend_from_slice(&sample_nonce());
        assert!(AssuanDescriptor::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let mut bytes = b"70000\n".to_vec();
        bytes.extend_from_slice(&sample_nonce());
        assert!(AssuanDescriptor::parse(&bytes).is_err());
    }
}
