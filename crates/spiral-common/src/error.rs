//! Error taxonomy shared by every layer of the proxy.
//!
//! All fatal variants are scoped to a single client session; the shard
//! and proxy supervisors survive them and keep serving other clients.

use thiserror::Error;

/// Errors raised while proxying a session.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A codec tried to read past the end of its buffer.
    #[error("short read: needed {needed} more bytes at offset {at}")]
    ShortRead { at: usize, needed: usize },

    /// The outer frame magic was not `0xF00D`.
    #[error("received unsupported frame data (magic 0x{0:04x})")]
    BadMagic(u16),

    /// Symmetric or asymmetric cryptographic verification failed.
    ///
    /// Covers GCM tag mismatches, RSA signature verification failures
    /// and RSA-OAEP padding failures.
    #[error("cryptographic verification failed: {0}")]
    CryptoVerify(&'static str),

    /// The session handshake carried data we cannot reconcile.
    #[error("invalid handshake: {0}")]
    HandshakeInvalid(String),

    /// A DML message did not match its declared layout.
    #[error("malformed DML message: {0}")]
    Dml(String),

    /// A key bundle could not be decoded into usable key material.
    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// No traffic was observed within the idle deadline.
    #[error("connection idled past the keep-alive deadline")]
    Timeout,

    /// The proxy supervisor is gone and cannot spawn shards anymore.
    #[error("shard spawn request rejected: supervisor channel closed")]
    SpawnReject,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Whether this error is an expected way for a connection to die.
    ///
    /// Peers disconnecting mid-stream show up as broken pipes and
    /// connection resets; those are not worth an error-level log line.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Common result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
