//! Cryptography for proxied sessions.
//!
//! - Streaming AES-GCM with inline nonce rotation (symmetric layer)
//! - RSA key chain for the handshake (asymmetric layer)
//! - ClientSig challenge computation

pub mod aes;
pub mod challenge;
pub mod key_chain;

pub use aes::{AesContext, CLIENT_CHUNK, SERVER_CHUNK};
pub use challenge::ClientSig;
pub use key_chain::{KeyBundle, KeyChain, fnv_1a};
