use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tracing::warn;

/// Cap on the buffered partial fragment per sender; overflow drops the
/// buffered prefix with a warning.
pub const FRAGMENT_BUFFER_CAP: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

/// Per-sender identifier used for framing buffers and order tracking
pub fn sender_key(protocol: TransportProtocol, peer: &SocketAddr) -> String {
    format!("{}-{}-{}", protocol.as_str(), peer.ip(), peer.port())
}

/// One complete line received on a port, as handed to listeners
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: String,
    pub sender_key: String,
    pub protocol: TransportProtocol,
    pub timestamp: DateTime<Utc>,
    /// Monotonic nanoseconds since the owning receiver started
    pub hrtime: u128,
}

/// Splits a byte stream into `\n`-terminated lines, buffering the
/// trailing fragment between chunks.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the complete lines it finished.
    pub fn push(&mut self, sender_key: &str, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                if !line.trim().is_empty() {
                    lines.push(line);
                }
            } else {
                if self.partial.len() >= FRAGMENT_BUFFER_CAP {
                    warn!(
                        sender_key,
                        cap = FRAGMENT_BUFFER_CAP,
                        "fragment buffer overflow, dropping buffered data"
                    );
                    self.partial.clear();
                }
                self.partial.push(*byte);
            }
        }
        lines
    }

    /// Drop whatever partial fragment is buffered (connection close)
    pub fn discard(&mut self) {
        self.partial.clear();
    }

    pub fn buffered(&self) -> usize {
        self.partial.len()
    }
}
