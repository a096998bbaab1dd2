//! Buffers incoming TCP data and splits it into protocol frames.
//!
//! The buffer works against an optional [`AesContext`]: once a session
//! is encrypted, every byte count has to be adjusted for the inline
//! `tag || nonce` material the cipher interleaves at chunk rotations.
//! Frame boundaries and rotation boundaries are independent, so the
//! adjustment can differ from frame to frame.

use bytes::BytesMut;
use spiral_common::crypto::AesContext;
use spiral_common::error::{ProxyError, Result};
use spiral_common::proto::frame::{FRAME_MAGIC, is_large_frame};

/// Length of the frame header the buffer consumes up front. This spans
/// magic and short size plus the next four bytes, enough to cover the
/// large-size field when present.
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Empty,
    GotHeader { encrypted: bool },
}

/// Recognizes an unencrypted frame by its magic without touching the
/// cipher. A legitimate encrypted frame cannot decrypt its first two
/// bytes to the magic without the cipher being primed first.
fn is_plaintext_frame(raw: &[u8]) -> bool {
    raw[0] == 0x0D && raw[1] == 0xF0
}

/// Stateful de-framer over a rolling byte buffer.
///
/// Meant to be reusable: each connection direction owns one instance
/// and its allocation is recycled across frames.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: BytesMut,
    state: State,
    header: Vec<u8>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw socket data to the buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn required_bytes(aes: Option<&AesContext>, nbytes: usize) -> usize {
        match aes {
            Some(aes) => aes.calculate_decryption_overhead(nbytes),
            None => nbytes,
        }
    }

    fn poll_header(&mut self, aes: &mut Option<&mut AesContext>) -> Result<()> {
        if self.state != State::Empty {
            return Ok(());
        }

        let wire_len = Self::required_bytes(aes.as_deref(), HEADER_LEN);
        if self.buf.len() < wire_len {
            return Ok(());
        }

        let plaintext = is_plaintext_frame(&self.buf);
        let head = self.buf.split_to(wire_len);

        let (encrypted, header) = match aes.as_deref_mut() {
            Some(cipher) if !plaintext => (true, cipher.decrypt(&head)?),
            _ => (false, head.to_vec()),
        };
        self.header = header;
        self.state = State::GotHeader { encrypted };

        Ok(())
    }

    /// Attempts to pull one whole frame out of the buffer.
    ///
    /// Returns `None` until enough data has been fed. On success the
    /// yielded bytes are a complete decrypted frame including its
    /// header, paired with whether it arrived encrypted.
    pub fn poll_frame(
        &mut self,
        mut aes: Option<&mut AesContext>,
    ) -> Result<Option<(bool, Vec<u8>)>> {
        // Read and decrypt the next frame's header, or wait for data.
        self.poll_header(&mut aes)?;
        let State::GotHeader { encrypted } = self.state else {
            return Ok(None);
        };

        let magic = u16::from_le_bytes([self.header[0], self.header[1]]);
        if magic != FRAME_MAGIC {
            return Err(ProxyError::BadMagic(magic));
        }

        let short_size = u16::from_le_bytes([self.header[2], self.header[3]]);
        let size = if is_large_frame(short_size) {
            u32::from_le_bytes([self.header[4], self.header[5], self.header[6], self.header[7]])
                as usize
        } else {
            // The first four body bytes were already consumed into the
            // eight-byte header.
            (short_size as usize).saturating_sub(4)
        };

        let wire_len = Self::required_bytes(aes.as_deref(), size);
        if self.buf.len() < wire_len {
            return Ok(None);
        }

        let body = self.buf.split_to(wire_len);
        let body = match aes.as_deref_mut() {
            Some(cipher) if encrypted => cipher.decrypt(&body)?,
            _ => body.to_vec(),
        };

        let mut frame = std::mem::take(&mut self.header);
        frame.extend_from_slice(&body);
        self.state = State::Empty;

        Ok(Some((encrypted, frame)))
    }
}
