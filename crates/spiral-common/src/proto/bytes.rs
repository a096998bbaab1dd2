//! Structured little-endian reading and writing over a growable buffer.
//!
//! Every codec in this crate works against [`ByteBuffer`]: a `Vec<u8>`
//! with a seek position that supports overwriting in place, which the
//! frame codec relies on for cheap reserialization.

use crate::error::{ProxyError, Result};

/// A growable byte buffer with a seek position.
///
/// All multi-byte operations assume little-endian byte ordering.
/// Reads past the end of the buffer fail with
/// [`ProxyError::ShortRead`] instead of panicking.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    pos: usize,
}

macro_rules! int_codec {
    ($read:ident, $write:ident, $ty:ty) => {
        pub fn $read(&mut self) -> Result<$ty> {
            let raw = self.read_array::<{ size_of::<$ty>() }>()?;
            Ok(<$ty>::from_le_bytes(raw))
        }

        pub fn $write(&mut self, v: $ty) {
            self.write(&v.to_le_bytes());
        }
    };
}

impl ByteBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer over the given bytes with the seek position at 0.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    /// Resets the buffer to contain exactly `raw`.
    ///
    /// Seeks to 0, writes the data and truncates whatever was left over
    /// from previous contents. Reuses the existing allocation.
    pub fn load_frame(&mut self, raw: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(raw);
        self.pos = 0;
    }

    /// Current seek position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves the seek position to `pos`.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Drops everything past the current seek position.
    pub fn truncate(&mut self) {
        self.buf.truncate(self.pos);
    }

    /// Total number of bytes in the buffer, independent of position.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The full buffer contents, independent of position.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the buffer, returning its contents.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn check_remaining(&self, n: usize) -> Result<()> {
        let remaining = self.buf.len().saturating_sub(self.pos);
        if remaining < n {
            return Err(ProxyError::ShortRead {
                at: self.pos,
                needed: n - remaining,
            });
        }
        Ok(())
    }

    /// Reads `n` raw bytes from the current position.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check_remaining(n)?;
        let out = self.buf[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.check_remaining(N)?;
        let mut out = [0; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Writes raw bytes at the current position, growing as needed.
    ///
    /// Bytes under the cursor are overwritten; anything beyond the end
    /// of the buffer is appended.
    pub fn write(&mut self, data: &[u8]) {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn write_i8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }

    int_codec!(u16, write_u16, u16);
    int_codec!(i16, write_i16, i16);
    int_codec!(u32, write_u32, u32);
    int_codec!(i32, write_i32, i32);
    int_codec!(u64, write_u64, u64);

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array::<4>()?))
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write(&v.to_le_bytes());
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array::<8>()?))
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write(&v.to_le_bytes());
    }

    /// Reads a `u16 len || bytes` string.
    pub fn string(&mut self) -> Result<Vec<u8>> {
        let size = self.u16()? as usize;
        self.read(size)
    }

    pub fn write_string(&mut self, data: &[u8]) {
        self.write_u16(data.len() as u16);
        self.write(data);
    }

    /// Reads a `u16 char_count || UTF-16LE bytes` string.
    ///
    /// Unpaired surrogates are replaced rather than rejected; the game
    /// only ever sends well-formed text here.
    pub fn wstr(&mut self) -> Result<String> {
        let chars = self.u16()? as usize;
        let raw = self.read(chars * 2)?;

        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    pub fn write_wstr(&mut self, data: &str) {
        let units: Vec<u16> = data.encode_utf16().collect();
        self.write_u16(units.len() as u16);
        for unit in units {
            self.write(&unit.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut buf = ByteBuffer::new();
        buf.write_u8(0xAB);
        buf.write_u16(0xF00D);
        buf.write_i32(-12345);
        buf.write_u64(0xDEAD_BEEF_CAFE_BABE);
        buf.write_f32(1.5);

        buf.seek(0);
        assert_eq!(buf.u8().unwrap(), 0xAB);
        assert_eq!(buf.u16().unwrap(), 0xF00D);
        assert_eq!(buf.i32().unwrap(), -12345);
        assert_eq!(buf.u64().unwrap(), 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(buf.f32().unwrap(), 1.5);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = ByteBuffer::new();
        buf.write_u16(0xF00D);
        assert_eq!(buf.as_slice(), &[0x0D, 0xF0]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = ByteBuffer::new();
        buf.write_string(b"login.us.wizard101.com");
        buf.write_wstr("Wizard City");

        buf.seek(0);
        assert_eq!(buf.string().unwrap(), b"login.us.wizard101.com");
        assert_eq!(buf.wstr().unwrap(), "Wizard City");
    }

    #[test]
    fn test_wstr_encoding() {
        let mut buf = ByteBuffer::new();
        buf.write_wstr("Ab");
        assert_eq!(buf.as_slice(), &[0x02, 0x00, b'A', 0x00, b'b', 0x00]);
    }

    #[test]
    fn test_short_read() {
        let mut buf = ByteBuffer::from_vec(vec![0x01, 0x02]);
        assert!(matches!(
            buf.u32(),
            Err(ProxyError::ShortRead { at: 0, needed: 2 })
        ));
    }

    #[test]
    fn test_load_frame_truncates() {
        let mut buf = ByteBuffer::new();
        buf.write(&[1, 2, 3, 4, 5, 6, 7, 8]);

        buf.load_frame(&[9, 9]);
        assert_eq!(buf.as_slice(), &[9, 9]);
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_overwrite_in_place() {
        let mut buf = ByteBuffer::new();
        buf.write(&[1, 2, 3, 4]);
        buf.seek(1);
        buf.write(&[9, 9]);
        assert_eq!(buf.as_slice(), &[1, 9, 9, 4]);
    }
}
