//! ClientSig challenge computation.
//!
//! Session Offer may embed a challenge asking the client to prove it
//! runs an untampered binary: it hashes regions of its decrypted
//! `ClientSig` artifact with parameters chosen by the server and sends
//! the result back inside Session Accept. When the artifact is
//! available, the proxy computes the same answer so it can verify the
//! client's response before forwarding.

use crate::error::{ProxyError, Result};
use crate::proto::bytes::ByteBuffer;
use crate::proto::handshake::SignedMessage;

/// Challenge discriminator for the ClientSig scheme.
pub const CHALLENGE_ID: u8 = 0xF1;

const CONTROL_DISABLE: u32 = 1 << 5;
const CONTROL_INCLUDE_OFFSETS: u32 = 1 << 9;
const CONTROL_INCLUDE_MODULES: u32 = 1 << 12;
const CONTROL_OBFUSCATE: u32 = 1 << 17;

const FNV_PRIME: u32 = 0x0100_0193;

/// The decrypted ClientSig artifact, split into its three sections.
///
/// The on-disk form is `u32 len || bytes` three times, in the order
/// offsets, modules, code.
#[derive(Debug, Clone)]
pub struct ClientSig {
    offsets: Vec<u8>,
    modules: Vec<u8>,
    code: Vec<u8>,
}

impl ClientSig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = ByteBuffer::from_vec(data.to_vec());
        let mut section = || -> Result<Vec<u8>> {
            let len = buf.u32()? as usize;
            buf.read(len)
        };

        let parsed = Self {
            offsets: section()?,
            modules: section()?,
            code: section()?,
        };
        Ok(parsed)
    }
}

fn fnv_1a_round(acc: u32, b: u8) -> u32 {
    (acc ^ b as u32).wrapping_mul(FNV_PRIME)
}

fn fnv_round(acc: u32, b: u8) -> u32 {
    acc.wrapping_mul(FNV_PRIME) ^ b as u32
}

fn jenkins_one_at_a_time_round(acc: u32, b: u8) -> u32 {
    let acc = acc.wrapping_add(b as u32);
    let acc = acc.wrapping_add(acc << 10);
    acc ^ (acc >> 6)
}

fn pjw_hash_round(acc: u32, b: u8) -> u32 {
    let acc = (acc << 4).wrapping_add(b as u32);

    let high = acc & 0xF000_0000;
    let acc = if high != 0 { acc ^ (high >> 24) } else { acc };

    acc & !high
}

fn processing_func(spec: u32) -> fn(u32, u8) -> u32 {
    match spec & 0b11 {
        0 => fnv_1a_round,
        1 => fnv_round,
        2 => jenkins_one_at_a_time_round,
        _ => pjw_hash_round,
    }
}

fn stride(spec: u32) -> usize {
    (((spec >> 2) & 0xF) + 1) as usize
}

fn rounds(spec: u32) -> u32 {
    ((spec >> 6) & 0x3) + 1
}

fn seed(spec: u32) -> u32 {
    spec >> 8
}

/// Interleaves a section into the signature buffer.
///
/// A step width is derived from scattered bits of `key`; whenever the
/// output length is a positive multiple of it, the previous output byte
/// is duplicated. Every source byte is XORed with a rotating key byte.
fn scramble_buffer(out: &mut Vec<u8>, data: &[u8], key: u32) {
    let key_bytes = key.to_le_bytes();
    let step = ((key >> 3) & 1 | (key >> 4) & 2 | (key >> 5) & 4 | (key >> 11) & 8
        | (key >> 14) & 16) as usize;

    for &b in data {
        if step != 0 && !out.is_empty() && out.len() % step == 0 {
            out.push(out[out.len() - 1]);
        }
        out.push(key_bytes[out.len() & 3] ^ b);
    }
}

fn build_signature_buffer(sig: &ClientSig, flags: u32, key: u32) -> Vec<u8> {
    let mut result = Vec::new();

    if flags & CONTROL_INCLUDE_OFFSETS != 0 {
        scramble_buffer(&mut result, &sig.offsets, key);
    }
    if flags & CONTROL_INCLUDE_MODULES != 0 {
        scramble_buffer(&mut result, &sig.modules, key);
    }
    scramble_buffer(&mut result, &sig.code, key);

    result
}

/// Computes the answer to a ClientSig challenge body.
pub fn challenge(sig: &ClientSig, message: &[u8]) -> Result<u32> {
    if message.len() < 12 {
        return Err(ProxyError::HandshakeInvalid(
            "received too few bytes to perform challenge".into(),
        ));
    }

    let control_mask = u32::from_le_bytes(message[0..4].try_into().unwrap());
    let spec = u32::from_le_bytes(message[4..8].try_into().unwrap());
    let key = u32::from_le_bytes(message[8..12].try_into().unwrap());

    if control_mask & CONTROL_DISABLE != 0 {
        return Ok(0);
    }

    let mut buf = build_signature_buffer(sig, control_mask, key);

    if control_mask & CONTROL_OBFUSCATE != 0 {
        let mask = control_mask.to_le_bytes();
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= mask[i & 3];
        }
    }

    let func = processing_func(spec);
    let size = stride(spec);
    let mut result = seed(spec);
    for _ in 0..rounds(spec) {
        for i in 0..size {
            for &b in buf[i.min(buf.len())..].iter().step_by(size) {
                result = func(result, b);
            }
        }
    }

    Ok(result)
}

/// Dispatches a Session Offer challenge to its processor.
///
/// Returns `None` when the challenge cannot be answered because no
/// ClientSig artifact was supplied; unknown challenge types are fatal.
pub fn process_challenge(
    sig: Option<&ClientSig>,
    message: &SignedMessage,
) -> Result<Option<u32>> {
    let challenge_type = message.challenge_type()?;
    if challenge_type != CHALLENGE_ID {
        return Err(ProxyError::HandshakeInvalid(format!(
            "unknown crypto challenge: 0x{challenge_type:02x}"
        )));
    }

    match sig {
        Some(sig) => Ok(Some(challenge(sig, message.challenge_buf())?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(code: &[u8]) -> ClientSig {
        ClientSig {
            offsets: vec![0xA0, 0xA1],
            modules: vec![0xB0],
            code: code.to_vec(),
        }
    }

    fn challenge_buf(control_mask: u32, spec: u32, key: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&control_mask.to_le_bytes());
        buf.extend_from_slice(&spec.to_le_bytes());
        buf.extend_from_slice(&key.to_le_bytes());
        buf
    }

    #[test]
    fn test_artifact_parsing() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0xA0, 0xA1]);
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&[0xB0]);
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(&[0xC0, 0xC1, 0xC2]);

        let parsed = ClientSig::parse(&raw).unwrap();
        assert_eq!(parsed.offsets, vec![0xA0, 0xA1]);
        assert_eq!(parsed.modules, vec![0xB0]);
        assert_eq!(parsed.code, vec![0xC0, 0xC1, 0xC2]);

        assert!(ClientSig::parse(&raw[..9]).is_err());
    }

    #[test]
    fn test_disable_bit_short_circuits() {
        let answer = challenge(&sig(&[1, 2, 3]), &challenge_buf(CONTROL_DISABLE, 0, 0));
        assert_eq!(answer.unwrap(), 0);
    }

    #[test]
    fn test_single_byte_fnv1a() {
        // control 0: code only, no obfuscation. key 0: identity
        // scramble. spec 0: FNV-1a, stride 1, one round, seed 0.
        let answer = challenge(&sig(&[0xAB]), &challenge_buf(0, 0, 0)).unwrap();
        assert_eq!(answer, 0xAB01_0D31);
    }

    #[test]
    fn test_scramble_duplicates_on_step() {
        // key bit 3 set => step 1; key bytes [0x08, 0, 0, 0].
        let mut out = Vec::new();
        scramble_buffer(&mut out, &[0x10, 0x20], 0x08);
        assert_eq!(out, vec![0x18, 0x18, 0x20]);
    }

    #[test]
    fn test_scramble_without_step() {
        let mut out = Vec::new();
        scramble_buffer(&mut out, &[0x10, 0x20, 0x30, 0x40, 0x50], 0);
        assert_eq!(out, vec![0x10, 0x20, 0x30, 0x40, 0x50]);
    }

    #[test]
    fn test_hash_round_primitives() {
        assert_eq!(fnv_1a_round(0, 0xAB), 0xAB01_0D31);
        assert_eq!(fnv_round(0, 0xAB), 0xAB);
        assert_eq!(jenkins_one_at_a_time_round(0, 1), 1041);
        assert_eq!(pjw_hash_round(0, 5), 5);
    }

    #[test]
    fn test_spec_field_extraction() {
        let spec = 0xABCD_00u32 | (0b11 << 6) | (0b0101 << 2) | 0b10;
        assert_eq!(processing_func(spec)(0, 1), jenkins_one_at_a_time_round(0, 1));
        assert_eq!(stride(spec), 6);
        assert_eq!(rounds(spec), 4);
        assert_eq!(seed(spec), 0xABCD);
    }

    #[test]
    fn test_deterministic() {
        let sig = sig(&[9, 8, 7, 6, 5]);
        let buf = challenge_buf(CONTROL_INCLUDE_OFFSETS | CONTROL_OBFUSCATE, 0x1234, 0xBEEF);
        assert_eq!(challenge(&sig, &buf).unwrap(), challenge(&sig, &buf).unwrap());
    }

    #[test]
    fn test_short_challenge_rejected() {
        assert!(matches!(
            challenge(&sig(&[1]), &[0; 11]),
            Err(ProxyError::HandshakeInvalid(_))
        ));
    }
}
