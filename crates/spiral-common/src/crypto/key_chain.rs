//! Key chain for managing asymmetric keys.
//!
//! The foundation for proxying is the exfiltration of symmetric keys
//! during the initial session handshake. This is accomplished by making
//! the client use a controlled set of keys to encrypt its payload, then
//! re-encrypting with KingsIsle's real keys before forwarding to the
//! server.
//!
//! Key material comes as two JSON bundles: a dump of the client's
//! embedded public keys and an injected key pair under our control,
//! each carrying the raw key-buffer bytes the client fingerprints
//! during the handshake.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use sha1::{Digest, Sha1};

use crate::error::{ProxyError, Result};

/// FNV-1a over a byte slice, truncated to 32 bits.
pub fn fnv_1a(data: &[u8]) -> u32 {
    let mut state: u32 = 0x811C_9DC5;
    for &b in data {
        state ^= b as u32;
        state = state.wrapping_mul(0x0100_0193);
    }
    state
}

/// One decoded key pair inside a bundle. Either side may be empty for
/// bundles that only carry one half of the material.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyPairEntry {
    #[serde(default)]
    pub public: String,
    #[serde(default)]
    pub private: String,
}

/// The on-disk shape of `ki_keys.json` and `injected_keys.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyBundle {
    /// Base64 of the raw key buffer as embedded in the client binary.
    pub raw: String,
    pub decoded: Vec<KeyPairEntry>,
}

fn decode_base64(what: &str, data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| ProxyError::KeyMaterial(format!("{what}: {e}")))
}

fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(der)
        .or_else(|_| RsaPublicKey::from_public_key_der(der))
        .map_err(|e| ProxyError::KeyMaterial(format!("public key: {e}")))
}

fn parse_private_key(der: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_der(der)
        .or_else(|_| RsaPrivateKey::from_pkcs8_der(der))
        .map_err(|e| ProxyError::KeyMaterial(format!("private key: {e}")))
}

/// Key chain pairing KingsIsle's public keys with our injected private
/// keys, plus the raw key buffers both sides fingerprint with FNV-1a.
pub struct KeyChain {
    ki_key_buf: Vec<u8>,
    public_keys: Vec<RsaPublicKey>,

    injected_key_buf: Vec<u8>,
    private_keys: Vec<RsaPrivateKey>,
}

impl KeyChain {
    /// Builds a key chain from the two parsed JSON bundles.
    pub fn from_bundles(ki_keys: &KeyBundle, injected_keys: &KeyBundle) -> Result<Self> {
        let ki_key_buf = decode_base64("ki raw buffer", &ki_keys.raw)?;
        let public_keys = ki_keys
            .decoded
            .iter()
            .map(|entry| parse_public_key(&decode_base64("ki public key", &entry.public)?))
            .collect::<Result<Vec<_>>>()?;

        let injected_key_buf = decode_base64("injected raw buffer", &injected_keys.raw)?;
        let private_keys = injected_keys
            .decoded
            .iter()
            .map(|entry| {
                parse_private_key(&decode_base64("injected private key", &entry.private)?)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ki_key_buf,
            public_keys,
            injected_key_buf,
            private_keys,
        })
    }

    /// Builds a key chain directly from key material.
    pub fn from_parts(
        ki_key_buf: Vec<u8>,
        public_keys: Vec<RsaPublicKey>,
        injected_key_buf: Vec<u8>,
        private_keys: Vec<RsaPrivateKey>,
    ) -> Self {
        Self {
            ki_key_buf,
            public_keys,
            injected_key_buf,
            private_keys,
        }
    }

    fn public_key(&self, key_slot: u8) -> Result<&RsaPublicKey> {
        self.public_keys.get(key_slot as usize).ok_or_else(|| {
            ProxyError::HandshakeInvalid(format!("public key slot {key_slot} out of range"))
        })
    }

    fn private_key(&self, key_slot: u8) -> Result<&RsaPrivateKey> {
        self.private_keys.get(key_slot as usize).ok_or_else(|| {
            ProxyError::HandshakeInvalid(format!("private key slot {key_slot} out of range"))
        })
    }

    /// FNV-1a over a region of KingsIsle's raw key buffer.
    pub fn hash_key_buf(&self, offset: u16, length: u16) -> u32 {
        fnv_1a(region(&self.ki_key_buf, offset, length))
    }

    /// Checks a client-computed fingerprint against the same region of
    /// the injected key buffer.
    pub fn verify_key_hash(&self, offset: u16, length: u16, expected: u32) -> Result<()> {
        let buf_hash = fnv_1a(region(&self.injected_key_buf, offset, length));
        if buf_hash != expected {
            return Err(ProxyError::HandshakeInvalid(
                "key hash mismatch; algorithm changed?".into(),
            ));
        }
        Ok(())
    }

    /// Signs `data` with the injected private key at `key_slot`.
    ///
    /// PKCS#1 v1.5 over SHA-1, matching what the client verifies
    /// against its embedded public key.
    pub fn sign(&self, key_slot: u8, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha1::digest(data);

        self.private_key(key_slot)?
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|_| ProxyError::CryptoVerify("signing failed"))
    }

    /// Verifies a signature against the KingsIsle public key at
    /// `key_slot`. Rejections indicate an outdated key dump.
    pub fn verify(&self, key_slot: u8, data: &[u8], signature: &[u8]) -> Result<()> {
        let digest = Sha1::digest(data);

        self.public_key(key_slot)?
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .map_err(|_| ProxyError::CryptoVerify("offer signature rejected"))
    }

    /// RSA-OAEP encryption under the KingsIsle public key at `key_slot`.
    pub fn encrypt(&self, key_slot: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.public_key(key_slot)?
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), data)
            .map_err(|_| ProxyError::CryptoVerify("OAEP encryption failed"))
    }

    /// RSA-OAEP decryption under the injected private key at `key_slot`.
    pub fn decrypt(&self, key_slot: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.private_key(key_slot)?
            .decrypt(Oaep::new::<Sha1>(), data)
            .map_err(|_| ProxyError::CryptoVerify("OAEP decryption failed"))
    }
}

/// A subslice of the raw key buffer, truncated at the buffer end the
/// way the client's own fingerprint routine behaves.
fn region(buf: &[u8], offset: u16, length: u16) -> &[u8] {
    let start = (offset as usize).min(buf.len());
    let end = (start + length as usize).min(buf.len());
    &buf[start..end]
}
