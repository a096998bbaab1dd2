//! Spiral Proxy
//!
//! A transparent intercepting proxy for the KingsIsle game protocol.
//! The proxy terminates the client's TCP connection locally, opens an
//! outbound connection to the real server and shuttles frames in both
//! directions while decrypting, inspecting, optionally mutating and
//! re-encrypting them.
//!
//! Interception works by substituting a controlled RSA key pair during
//! the session handshake so the proxy learns the AES-GCM session
//! secrets, then faithfully re-encrypting with KingsIsle's real keys.

pub mod core;
pub mod keys;
pub mod plugin;
pub mod session;
pub mod transport;

pub use crate::core::{Proxy, Shard};
pub use session::Session;
