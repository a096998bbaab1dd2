//! Spiral Common Library
//!
//! Shared protocol and cryptography primitives for the KingsIsle
//! intercepting proxy:
//! - Wire codecs (outer framing, DML messages, handshake messages)
//! - Streaming AES-GCM session encryption
//! - Asymmetric key chain (RSA signatures and OAEP)
//! - ClientSig challenge computation

pub mod crypto;
pub mod error;
pub mod proto;

pub use error::{ProxyError, Result};
pub use proto::{Frame, SocketAddress};
