//! Streaming AES-128-GCM for session traffic.
//!
//! After the handshake, each direction of a session is encrypted under
//! AES-GCM with a twist: the cipher rotates its nonce every
//! `chunk_size` bytes of plaintext. At a rotation boundary the sender
//! emits the 16-byte authentication tag over the finished chunk
//! followed by a fresh 16-byte nonce, inline in the byte stream, then
//! continues encrypting under the new nonce. Chunk boundaries are pure
//! byte counts and routinely fall inside protocol frames.
//!
//! The AEAD crates only offer one-shot seal/open, which cannot emit
//! ciphertext incrementally mid-chunk, so the context composes the
//! underlying pieces itself: a CTR32-BE keystream over AES-128 plus a
//! streaming GHASH. The 16-byte nonces go through GCM's `J0` GHASH
//! derivation for non-96-bit IVs.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{ProxyError, Result};

pub const BLOCK_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;

/// Bytes between nonce rotations for clientbound processing.
pub const CLIENT_CHUNK: usize = 0x100 * BLOCK_SIZE;

/// Bytes between nonce rotations for serverbound processing.
pub const SERVER_CHUNK: usize = 0x1000 * BLOCK_SIZE;

type KeyStream = Ctr32BE<Aes128>;

/// GCM state for a single chunk: keystream, running MAC and the
/// `E(K, J0)` mask that whitens the final tag.
struct GcmState {
    keystream: KeyStream,
    ghash: GHash,
    tag_mask: [u8; TAG_SIZE],
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
    ct_len: u64,
}

impl GcmState {
    fn new(key: &[u8; 16], h: &ghash::Key, nonce: &[u8; NONCE_SIZE]) -> Self {
        // J0 derivation for a 128-bit IV: GHASH over the IV followed by
        // a length block, per the GCM specification.
        let mut derive = GHash::new(h);
        derive.update(&[(*nonce).into()]);

        let mut len_block = [0u8; BLOCK_SIZE];
        len_block[8..].copy_from_slice(&((NONCE_SIZE as u64) * 8).to_be_bytes());
        derive.update(&[len_block.into()]);
        let j0 = derive.finalize();

        // The keystream starts at J0 itself; that first block is the
        // tag mask, data encryption continues from inc32(J0).
        let mut keystream = KeyStream::new(key.into(), &j0);
        let mut tag_mask = [0u8; TAG_SIZE];
        keystream.apply_keystream(&mut tag_mask);

        Self {
            keystream,
            ghash: GHash::new(h),
            tag_mask,
            pending: [0; BLOCK_SIZE],
            pending_len: 0,
            ct_len: 0,
        }
    }

    /// Feeds ciphertext into the running MAC, buffering partial blocks.
    fn update_mac(&mut self, mut data: &[u8]) {
        self.ct_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK_SIZE - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            if self.pending_len == BLOCK_SIZE {
                self.ghash.update(&[self.pending.into()]);
                self.pending_len = 0;
            }
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            self.ghash.update(&[ghash::Block::clone_from_slice(block)]);
        }

        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    /// Encrypts in place and authenticates the resulting ciphertext.
    fn encrypt(&mut self, data: &mut [u8]) {
        self.keystream.apply_keystream(data);
        self.update_mac(data);
    }

    /// Authenticates the ciphertext and decrypts in place.
    fn decrypt(&mut self, data: &mut [u8]) {
        self.update_mac(data);
        self.keystream.apply_keystream(data);
    }

    /// Completes the chunk, producing its authentication tag.
    fn finalize(mut self) -> [u8; TAG_SIZE] {
        if self.pending_len > 0 {
            self.pending[self.pending_len..].fill(0);
            self.ghash.update(&[self.pending.into()]);
        }

        // No associated data, so the length block is `0 || len(C)`.
        let mut len_block = [0u8; BLOCK_SIZE];
        len_block[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        self.ghash.update(&[len_block.into()]);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (out, (d, m)) in tag.iter_mut().zip(digest.iter().zip(&self.tag_mask)) {
            *out = d ^ m;
        }
        tag
    }
}

/// Symmetric AES-GCM processing context for one direction of a session.
///
/// Each peer maintains separate states for sending and receiving, which
/// is mirrored here by independent encryptor and decryptor halves. The
/// context manages its own key material and rotates nonces as mandated
/// during data processing; callers never observe a partial chunk.
pub struct AesContext {
    key: [u8; 16],
    h: ghash::Key,
    chunk_size: usize,

    encryptor: GcmState,
    encrypted: usize,

    decryptor: GcmState,
    decrypted: usize,
}

impl AesContext {
    pub fn new(key: [u8; 16], nonce: [u8; NONCE_SIZE], chunk_size: usize) -> Self {
        let cipher = Aes128::new(&key.into());
        let mut h = ghash::Key::default();
        cipher.encrypt_block(&mut h);

        Self {
            encryptor: GcmState::new(&key, &h, &nonce),
            encrypted: 0,
            decryptor: GcmState::new(&key, &h, &nonce),
            decrypted: 0,
            key,
            h,
            chunk_size,
        }
    }

    /// A context for data sent by the client.
    pub fn client(key: [u8; 16], nonce: [u8; NONCE_SIZE]) -> Self {
        Self::new(key, nonce, CLIENT_CHUNK)
    }

    /// A context for data sent by the server.
    pub fn server(key: [u8; 16], nonce: [u8; NONCE_SIZE]) -> Self {
        Self::new(key, nonce, SERVER_CHUNK)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn rotation_overhead(&self, progress: usize, step: usize, nbytes: usize) -> usize {
        let block = self.chunk_size + step;

        let mut overflows = 0;
        let remainder_until_rotation = self.chunk_size - progress;
        if remainder_until_rotation <= nbytes {
            overflows = (nbytes - remainder_until_rotation) / block + 1;
        }

        (TAG_SIZE + NONCE_SIZE) * overflows
    }

    /// Wire bytes produced when encrypting `nbytes` of plaintext.
    pub fn calculate_encryption_overhead(&self, nbytes: usize) -> usize {
        nbytes + self.rotation_overhead(self.encrypted, 0, nbytes)
    }

    /// Wire bytes to consume for `nbytes` of plaintext when decrypting.
    pub fn calculate_decryption_overhead(&self, nbytes: usize) -> usize {
        nbytes + self.rotation_overhead(self.decrypted, 0, nbytes)
    }

    /// Plaintext bytes contained in `nbytes` of wire data; the inverse
    /// of [`AesContext::calculate_decryption_overhead`].
    pub fn strip_decryption_overhead(&self, nbytes: usize) -> usize {
        nbytes.saturating_sub(self.rotation_overhead(self.decrypted, TAG_SIZE + NONCE_SIZE, nbytes))
    }

    /// Encrypts `data`, interleaving `tag || nonce` at each rotation.
    pub fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(self.calculate_encryption_overhead(data.len()));
        let mut data = data;

        while !data.is_empty() {
            // Split off what still fits into the current chunk.
            let remaining = self.chunk_size - self.encrypted;
            let take = remaining.min(data.len());

            let start = output.len();
            output.extend_from_slice(&data[..take]);
            self.encryptor.encrypt(&mut output[start..]);

            data = &data[take..];
            self.encrypted = (self.encrypted + take) % self.chunk_size;

            // On a finished chunk, seal it and restart under a fresh nonce.
            if self.encrypted == 0 {
                let mut nonce = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);

                let sealed = std::mem::replace(
                    &mut self.encryptor,
                    GcmState::new(&self.key, &self.h, &nonce),
                );
                output.extend_from_slice(&sealed.finalize());
                output.extend_from_slice(&nonce);
            }
        }

        output
    }

    /// Decrypts wire data, verifying and consuming the inline
    /// `tag || nonce` at each rotation boundary.
    ///
    /// Output is produced only from chunks whose boundary material was
    /// intact; a tag mismatch or truncated rotation is fatal.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(self.strip_decryption_overhead(data.len()));
        let mut data = data;

        while !data.is_empty() {
            let remaining = self.chunk_size - self.decrypted;
            let take = remaining.min(data.len());

            let start = output.len();
            output.extend_from_slice(&data[..take]);
            self.decryptor.decrypt(&mut output[start..]);

            data = &data[take..];
            self.decrypted = (self.decrypted + take) % self.chunk_size;

            if self.decrypted == 0 {
                if data.len() < TAG_SIZE + NONCE_SIZE {
                    return Err(ProxyError::CryptoVerify("truncated nonce rotation"));
                }

                let (tag, rest) = data.split_at(TAG_SIZE);
                let mut nonce = [0u8; NONCE_SIZE];
                nonce.copy_from_slice(&rest[..NONCE_SIZE]);

                let sealed = std::mem::replace(
                    &mut self.decryptor,
                    GcmState::new(&self.key, &self.h, &nonce),
                );
                if sealed.finalize() != tag {
                    return Err(ProxyError::CryptoVerify("authentication tag mismatch"));
                }

                data = &rest[NONCE_SIZE..];
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x42; 16];
    const NONCE: [u8; 16] = [0x24; 16];

    #[test]
    fn test_rotation_adds_inline_overhead() {
        let mut ctx = AesContext::client(KEY, NONCE);
        assert_eq!(ctx.chunk_size(), 4096);

        let output = ctx.encrypt(&vec![0u8; 5000]);
        assert_eq!(output.len(), 5000 + 32);
    }

    #[test]
    fn test_roundtrip_across_rotations() {
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut sender = AesContext::client(KEY, NONCE);
        let mut receiver = AesContext::client(KEY, NONCE);

        let wire = sender.encrypt(&plaintext);
        // Two rotations: floor(10000 / 4096).
        assert_eq!(wire.len(), plaintext.len() + 2 * 32);

        let decrypted = receiver.decrypt(&wire).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_roundtrip_split_into_pieces() {
        let plaintext: Vec<u8> = (0..9_000u32).map(|i| (i / 7) as u8).collect();

        let mut sender = AesContext::client(KEY, NONCE);
        let mut receiver = AesContext::client(KEY, NONCE);

        // Encrypt in uneven pieces; the receiver consumes exactly what
        // the overhead arithmetic says each piece needs.
        let mut recovered = Vec::new();
        let mut wire = Vec::new();
        for piece in plaintext.chunks(1234) {
            wire.extend_from_slice(&sender.encrypt(piece));
        }

        let mut wire = wire.as_slice();
        for piece in plaintext.chunks(1234) {
            let need = receiver.calculate_decryption_overhead(piece.len());
            let (head, rest) = wire.split_at(need);
            recovered.extend_from_slice(&receiver.decrypt(head).unwrap());
            wire = rest;
        }

        assert_eq!(recovered, plaintext);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_tampered_tag_detected() {
        let mut sender = AesContext::client(KEY, NONCE);
        let mut receiver = AesContext::client(KEY, NONCE);

        let mut wire = sender.encrypt(&vec![0u8; 4096]);
        wire[4096] ^= 0xFF; // First tag byte.

        assert!(matches!(
            receiver.decrypt(&wire),
            Err(ProxyError::CryptoVerify("authentication tag mismatch"))
        ));
    }

    #[test]
    fn test_overhead_arithmetic_inverse() {
        let mut ctx = AesContext::client(KEY, NONCE);

        // Walk the cipher to an uneven progress first.
        let _ = ctx.encrypt(&[0u8; 100]);
        let wire = ctx.decrypt(&ctx_encrypt_copy(&[0u8; 100])).unwrap();
        assert_eq!(wire.len(), 100);

        for n in [0usize, 1, 100, 3996, 3997, 4096, 5000, 10_000] {
            let wire_len = ctx.calculate_decryption_overhead(n);
            assert_eq!(ctx.strip_decryption_overhead(wire_len), n, "n = {n}");
        }
    }

    // A throwaway encryptor so the decryptor half above can be walked
    // to a matching progress.
    fn ctx_encrypt_copy(data: &[u8]) -> Vec<u8> {
        AesContext::client(KEY, NONCE).encrypt(data)
    }

    #[test]
    fn test_directional_chunk_sizes() {
        assert_eq!(CLIENT_CHUNK, 0x1000);
        assert_eq!(SERVER_CHUNK, 0x10000);
    }
}
