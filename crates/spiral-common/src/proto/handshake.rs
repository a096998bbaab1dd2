//! The two cryptographic messages of the session handshake.
//!
//! Session Offer (server → client, control opcode 0) carries a
//! [`SignedMessage`] followed by a 256-byte RSA signature. Session
//! Accept (client → server, control opcode 5) carries an
//! [`EncryptedMessage`] as RSA-OAEP ciphertext.

use crate::error::{ProxyError, Result};

use super::bytes::ByteBuffer;

/// The cryptographic message portion of Session Offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub flags: u8,
    pub key_slot: u8,
    pub key_mask: u8,
    pub challenge: Vec<u8>,
    pub echo: u32,
}

impl SignedMessage {
    pub fn read(buf: &mut ByteBuffer) -> Result<Self> {
        let flags = buf.u8()?;
        let key_slot = buf.u8()?;
        let key_mask = buf.u8()?;
        let challenge_len = buf.u8()? as usize;
        let challenge = buf.read(challenge_len)?;
        let echo = buf.u32()?;

        Ok(Self {
            flags,
            key_slot,
            key_mask,
            challenge,
            echo,
        })
    }

    pub fn write(&self, buf: &mut ByteBuffer) {
        buf.write_u8(self.flags);
        buf.write_u8(self.key_slot);
        buf.write_u8(self.key_mask);
        buf.write_u8(self.challenge.len() as u8);
        buf.write(&self.challenge);
        buf.write_u32(self.echo);
    }

    /// The `(offset, length)` region of the key buffer the client is
    /// asked to fingerprint, taken from the head of the challenge.
    pub fn hash_region(&self) -> Result<(u16, u16)> {
        let raw = self
            .challenge
            .get(..4)
            .ok_or(ProxyError::HandshakeInvalid("truncated hash region".into()))?;

        let off = u16::from_le_bytes([raw[0], raw[1]]);
        let len = u16::from_le_bytes([raw[2], raw[3]]);
        Ok((off, len))
    }

    /// The challenge discriminator byte.
    pub fn challenge_type(&self) -> Result<u8> {
        self.challenge
            .get(4)
            .copied()
            .ok_or(ProxyError::HandshakeInvalid("truncated challenge".into()))
    }

    /// The challenge body following the discriminator.
    pub fn challenge_buf(&self) -> &[u8] {
        self.challenge.get(5..).unwrap_or(&[])
    }
}

/// The cryptographic message portion of Session Accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    pub flags: u8,
    pub key_hash: u32,
    pub challenge_answer: u32,
    pub echo: u32,
    pub timestamp: u32,
    pub key: [u8; 16],
    pub nonce: [u8; 16],
}

impl EncryptedMessage {
    pub fn read(buf: &mut ByteBuffer) -> Result<Self> {
        let flags = buf.u8()?;
        let key_hash = buf.u32()?;
        let challenge_answer = buf.u32()?;
        let echo = buf.u32()?;
        let timestamp = buf.u32()?;

        let mut key = [0; 16];
        key.copy_from_slice(&buf.read(16)?);
        let mut nonce = [0; 16];
        nonce.copy_from_slice(&buf.read(16)?);

        Ok(Self {
            flags,
            key_hash,
            challenge_answer,
            echo,
            timestamp,
            key,
            nonce,
        })
    }

    pub fn write(&self, buf: &mut ByteBuffer) {
        buf.write_u8(self.flags);
        buf.write_u32(self.key_hash);
        buf.write_u32(self.challenge_answer);
        buf.write_u32(self.echo);
        buf.write_u32(self.timestamp);
        buf.write(&self.key);
        buf.write(&self.nonce);
    }
}
