//! Wire protocol definitions for the KingsIsle network format.

pub mod bytes;
pub mod dml;
pub mod frame;
pub mod handshake;

pub use bytes::ByteBuffer;
pub use frame::{Frame, FrameKind};
pub use handshake::{EncryptedMessage, SignedMessage};

use std::fmt;

/// A host/port pair as exchanged over the wire.
///
/// The host may be a hostname rather than an IP literal; redirect
/// messages routinely carry DNS names, so this is not a `SocketAddr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocketAddress {
    pub ip: String,
    pub port: u16,
}

impl SocketAddress {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Whether this address carries no routable endpoint at all.
    pub fn is_empty(&self) -> bool {
        self.ip.is_empty() && self.port == 0
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
