//! Per-connection session state and handshake interception.
//!
//! The handshake is where the proxying trick happens. Session Offer
//! carries a server signature over its cryptographic payload; we verify
//! it against KingsIsle's real public key, then re-sign with our
//! injected private key so the client (which trusts the injected public
//! key baked into its binary) accepts the offer. Session Accept carries
//! the AES session secrets encrypted to the injected public key; we
//! decrypt them, keep a copy, patch the key-buffer fingerprint to match
//! KingsIsle's real key material and re-encrypt for the real server.

use std::sync::Arc;

use spiral_common::crypto::challenge::{self, ClientSig};
use spiral_common::crypto::{AesContext, KeyChain};
use spiral_common::error::{ProxyError, Result};
use spiral_common::proto::bytes::ByteBuffer;
use spiral_common::proto::handshake::{EncryptedMessage, SignedMessage};
use spiral_common::proto::{Frame, SocketAddress};
use tracing::debug;

/// Offset of the crypto payload length inside a Session Offer payload.
const OFFER_LEN_OFFSET: usize = 0xE;
/// Offset of the crypto payload itself inside a Session Offer payload.
const OFFER_PAYLOAD_OFFSET: usize = 0x12;

/// Offset of the crypto payload length inside a Session Accept payload.
const ACCEPT_LEN_OFFSET: usize = 0x10;
/// Offset of the OAEP ciphertext inside a Session Accept payload.
const ACCEPT_PAYLOAD_OFFSET: usize = 0x15;

/// Length of the RSA signature trailing the signed offer message.
const SIGNATURE_LEN: usize = 256;

fn read_u32_at(raw: &[u8], offset: usize) -> Result<u32> {
    raw.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ProxyError::ShortRead {
            at: offset,
            needed: 4,
        })
}

/// Splits a Session Offer payload into signed message and signature.
///
/// Returns `None` for the one-byte handshake stub, which is forwarded
/// untouched.
fn extract_signed_message(raw: &[u8]) -> Result<Option<(&[u8], &[u8])>> {
    let crypto_payload_len = read_u32_at(raw, OFFER_LEN_OFFSET)? as usize;
    if crypto_payload_len == 1 {
        return Ok(None);
    }

    let crypto_payload = raw
        .get(OFFER_PAYLOAD_OFFSET..OFFER_PAYLOAD_OFFSET + crypto_payload_len)
        .ok_or(ProxyError::HandshakeInvalid(
            "offer crypto payload out of bounds".into(),
        ))?;
    if crypto_payload.len() < SIGNATURE_LEN {
        return Err(ProxyError::HandshakeInvalid(
            "offer crypto payload shorter than its signature".into(),
        ));
    }

    Ok(Some(
        crypto_payload.split_at(crypto_payload.len() - SIGNATURE_LEN),
    ))
}

/// Extracts the OAEP ciphertext from a Session Accept payload.
///
/// Returns `None` for the one-byte handshake abort.
fn extract_encrypted_message(raw: &[u8]) -> Result<Option<&[u8]>> {
    let crypto_payload_len = read_u32_at(raw, ACCEPT_LEN_OFFSET)? as usize;
    if crypto_payload_len == 1 {
        return Ok(None);
    }

    raw.get(ACCEPT_PAYLOAD_OFFSET..ACCEPT_PAYLOAD_OFFSET + crypto_payload_len - 1)
        .map(Some)
        .ok_or(ProxyError::HandshakeInvalid(
            "accept crypto payload out of bounds".into(),
        ))
}

/// A proxied session between a client and a server, managed by a shard.
///
/// A session stores the cryptographic state of one client connection
/// and attributes a unique id to it. The AES contexts are absent until
/// Session Accept has been processed; no encrypted traffic can occur
/// before that.
pub struct Session {
    pub client: SocketAddress,
    pub server: SocketAddress,
    pub sid: u64,

    key_chain: Arc<KeyChain>,
    client_sig: Option<Arc<ClientSig>>,
    challenge_response: Option<u32>,

    pub key_slot: u8,
    pub fnv_off: u16,
    pub fnv_len: u16,
    pub echo: u32,

    pub client_aes: Option<AesContext>,
    pub server_aes: Option<AesContext>,
}

impl Session {
    pub fn new(
        client: SocketAddress,
        server: SocketAddress,
        sid: u64,
        key_chain: Arc<KeyChain>,
        client_sig: Option<Arc<ClientSig>>,
    ) -> Self {
        Self {
            client,
            server,
            sid,
            key_chain,
            client_sig,
            challenge_response: None,
            key_slot: 0xFF,
            fnv_off: 0,
            fnv_len: 0,
            echo: 0,
            client_aes: None,
            server_aes: None,
        }
    }

    /// The AES context responsible for the given direction of traffic.
    pub fn aes_context(&mut self, client: bool) -> Option<&mut AesContext> {
        if client {
            self.client_aes.as_mut()
        } else {
            self.server_aes.as_mut()
        }
    }

    /// Rewrites a Session Offer in place (control opcode 0).
    pub fn session_offer(&mut self, frame: &mut Frame) -> Result<()> {
        let raw = &frame.payload;
        let Some((signed_bytes, signature)) = extract_signed_message(raw)? else {
            return Ok(());
        };

        let mut buf = ByteBuffer::from_vec(signed_bytes.to_vec());
        let message = SignedMessage::read(&mut buf)?;

        // Keep the handshake parameters we need to check the accept.
        self.key_slot = message.key_slot;
        (self.fnv_off, self.fnv_len) = message.hash_region()?;
        self.echo = message.echo;

        // If we can, compute the challenge answer ahead of time.
        self.challenge_response =
            challenge::process_challenge(self.client_sig.as_deref(), &message)?;

        debug!(
            sid = self.sid,
            key_slot = self.key_slot,
            echo = self.echo,
            "intercepted session offer"
        );

        // Verify the original signature to detect outdated key dumps.
        self.key_chain.verify(self.key_slot, signed_bytes, signature)?;

        // Re-sign with our private key so the client will accept it.
        let signature = self.key_chain.sign(self.key_slot, signed_bytes)?;

        let mut new_payload = raw[..OFFER_PAYLOAD_OFFSET + signed_bytes.len()].to_vec();
        new_payload.extend_from_slice(&signature);
        new_payload.push(0);
        frame.payload = new_payload;

        Ok(())
    }

    /// Rewrites a Session Accept in place (control opcode 5).
    pub fn session_accept(&mut self, frame: &mut Frame) -> Result<()> {
        let raw = &frame.payload;
        let Some(ciphertext) = extract_encrypted_message(raw)? else {
            // The client aborted the handshake; nothing will be encrypted.
            self.client_aes = None;
            self.server_aes = None;
            return Ok(());
        };

        let crypto_payload = self.key_chain.decrypt(self.key_slot, ciphertext)?;

        let mut buf = ByteBuffer::from_vec(crypto_payload);
        let mut message = EncryptedMessage::read(&mut buf)?;

        // Fix the FNV fingerprint for KingsIsle's real key buffer.
        self.key_chain
            .verify_key_hash(self.fnv_off, self.fnv_len, message.key_hash)?;
        message.key_hash = self.key_chain.hash_key_buf(self.fnv_off, self.fnv_len);

        if self.echo != message.echo {
            return Err(ProxyError::HandshakeInvalid(
                "echo value mismatch; algorithm changed?".into(),
            ));
        }

        if let Some(expected) = self.challenge_response {
            if expected != message.challenge_answer {
                return Err(ProxyError::HandshakeInvalid(
                    "challenge response mismatch; algorithm changed?".into(),
                ));
            }
        }

        // Extract the symmetric secrets for both directions.
        self.client_aes = Some(AesContext::client(message.key, message.nonce));
        self.server_aes = Some(AesContext::server(message.key, message.nonce));

        debug!(sid = self.sid, "session secrets established");

        let mut out = ByteBuffer::new();
        message.write(&mut out);

        // Re-encrypt the payload with KingsIsle's public key.
        let ciphertext = self.key_chain.encrypt(self.key_slot, out.as_slice())?;

        let mut new_payload = raw[..ACCEPT_PAYLOAD_OFFSET].to_vec();
        new_payload.extend_from_slice(&ciphertext);
        new_payload.push(0);
        frame.payload = new_payload;

        Ok(())
    }
}
