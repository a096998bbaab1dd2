//! Outer KingsIsle frame codec.
//!
//! Every message on the wire is wrapped in a common frame:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────────────┐
//! │ Magic (u16)  │ Size (u16)    │ Large size (u32, optional)   │
//! │ 0xF00D       │ ≥0x8000 =>    │ present iff short size set   │
//! │              │ large frame   │ the large-frame indicator    │
//! ├──────────────┴───────────────┴──────────────────────────────┤
//! │ is_control (u8) │ opcode (u8) │ reserved (u16) │ body …     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control frames carry a bare payload. Data frames nest a
//! `service_id (u8) || order (u8) || len (u16) || payload || 0x00`
//! record where `len` includes its own four-byte prelude.

use crate::error::{ProxyError, Result};

use super::bytes::ByteBuffer;

/// Magic number identifying KingsIsle frames (little endian).
pub const FRAME_MAGIC: u16 = 0xF00D;

/// Short sizes at or above this value indicate a large frame.
pub const LARGE_FRAME_THRESHOLD: u16 = 0x8000;

/// Returns whether a short size field announces a large frame.
pub fn is_large_frame(size: u16) -> bool {
    size >= LARGE_FRAME_THRESHOLD
}

/// A declared size minus the header bytes it covers, as a checked
/// subtraction so truncated declarations cannot wrap around.
fn body_len(declared: usize, header: usize, at: usize) -> Result<usize> {
    declared
        .checked_sub(header)
        .ok_or_else(|| ProxyError::ShortRead { at, needed: header - declared })
}

/// Discriminates the two frame shapes.
///
/// Control frames are identified by an opcode; data frames by a
/// `(service_id, order)` pair. A frame is always exactly one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control { opcode: u8 },
    Data { service_id: u8, order: u8 },
}

/// Parsed representation of a KingsIsle network frame.
///
/// The original wire bytes are retained so that untouched frames can be
/// forwarded verbatim without a reserialization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Verbatim bytes this frame was parsed from.
    pub original: Vec<u8>,

    pub kind: FrameKind,

    /// The inner payload; interpretation depends on `kind`.
    pub payload: Vec<u8>,

    /// Set when a listener changed the frame and it must be reserialized.
    pub dirty: bool,
}

impl Frame {
    /// The control opcode, if this is a control frame.
    pub fn opcode(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Control { opcode } => Some(opcode),
            FrameKind::Data { .. } => None,
        }
    }

    /// The DML service id, if this is a data frame.
    pub fn service_id(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Control { .. } => None,
            FrameKind::Data { service_id, .. } => Some(service_id),
        }
    }

    /// The message order within the service, if this is a data frame.
    pub fn order(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Control { .. } => None,
            FrameKind::Data { order, .. } => Some(order),
        }
    }

    /// Parses a frame from the buffer, which must hold exactly one frame.
    pub fn read(buf: &mut ByteBuffer) -> Result<Self> {
        buf.seek(0);
        let original = buf.as_slice().to_vec();

        let magic = buf.u16()?;
        if magic != FRAME_MAGIC {
            return Err(ProxyError::BadMagic(magic));
        }

        let short_size = buf.u16()?;
        let size = if is_large_frame(short_size) {
            buf.u32()? as usize
        } else {
            short_size as usize
        };

        let is_control = buf.u8()? != 0;
        let opcode = buf.u8()?;
        buf.u16()?; // Reserved.

        let (kind, payload) = if is_control {
            let body = body_len(size, 4, buf.position())?;
            (FrameKind::Control { opcode }, buf.read(body)?)
        } else {
            let service_id = buf.u8()?;
            let order = buf.u8()?;
            let payload_len = buf.u16()? as usize;
            let payload = buf.read(body_len(payload_len, 4, buf.position())?)?;
            buf.u8()?; // Trailing null byte.

            (FrameKind::Data { service_id, order }, payload)
        };

        Ok(Self {
            original,
            kind,
            payload,
            dirty: false,
        })
    }

    /// Serializes the frame into the buffer, replacing its contents.
    pub fn write(&self, buf: &mut ByteBuffer) {
        buf.seek(0);

        let payload_len = self.payload.len();
        let size = match self.kind {
            FrameKind::Control { .. } => 4 + payload_len,
            FrameKind::Data { .. } => 9 + payload_len,
        };

        buf.write_u16(FRAME_MAGIC);
        if size < LARGE_FRAME_THRESHOLD as usize {
            buf.write_u16(size as u16);
        } else {
            buf.write_u16(LARGE_FRAME_THRESHOLD);
            buf.write_u32(size as u32);
        }

        match self.kind {
            FrameKind::Control { opcode } => {
                buf.write_u8(1);
                buf.write_u8(opcode);
                buf.write_u16(0);
                buf.write(&self.payload);
            }
            FrameKind::Data { service_id, order } => {
                buf.write_u8(0);
                buf.write_u8(0);
                buf.write_u16(0);
                buf.write_u8(service_id);
                buf.write_u8(order);
                buf.write_u16((payload_len + 4) as u16);
                buf.write(&self.payload);
                buf.write_u8(0);
            }
        }

        buf.truncate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Frame> {
        let mut buf = ByteBuffer::new();
        buf.load_frame(raw);
        Frame::read(&mut buf)
    }

    #[test]
    fn test_control_frame_parsing() {
        // Keep-alive style control frame: magic, size=8, control, opcode 3.
        let data = hex::decode("0df00800010300000a0b0c0d").unwrap();
        let frame = parse(&data).unwrap();

        assert_eq!(frame.kind, FrameKind::Control { opcode: 3 });
        assert_eq!(frame.payload, vec![0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(frame.original, data);
        assert!(!frame.dirty);
    }

    #[test]
    fn test_empty_control_frame() {
        let data = hex::decode("0df0040001000000").unwrap();
        let frame = parse(&data).unwrap();

        assert_eq!(frame.kind, FrameKind::Control { opcode: 0 });
        assert!(frame.payload.is_empty());
        assert_eq!(frame.original, data);
    }

    #[test]
    fn test_data_frame_roundtrip() {
        let frame = Frame {
            original: Vec::new(),
            kind: FrameKind::Data {
                service_id: 7,
                order: 3,
            },
            payload: vec![0xDE, 0xAD, 0xBE, 0xEF],
            dirty: false,
        };

        let mut buf = ByteBuffer::new();
        frame.write(&mut buf);

        let reparsed = parse(buf.as_slice()).unwrap();
        assert_eq!(reparsed.kind, frame.kind);
        assert_eq!(reparsed.payload, frame.payload);
    }

    #[test]
    fn test_serialization_is_faithful() {
        let data = hex::decode("0df00d0000000000070308000102030400").unwrap();
        let frame = parse(&data).unwrap();
        assert_eq!(frame.service_id(), Some(7));
        assert_eq!(frame.order(), Some(3));
        assert_eq!(frame.payload, vec![1, 2, 3, 4]);

        let mut buf = ByteBuffer::new();
        frame.write(&mut buf);
        assert_eq!(buf.as_slice(), &data[..]);
    }

    #[test]
    fn test_large_frame() {
        let frame = Frame {
            original: Vec::new(),
            kind: FrameKind::Control { opcode: 1 },
            payload: vec![0x55; 0x10000 - 4],
            dirty: false,
        };

        let mut buf = ByteBuffer::new();
        frame.write(&mut buf);

        let raw = buf.as_slice();
        assert_eq!(&raw[2..4], &[0x00, 0x80]);
        assert_eq!(&raw[4..8], &0x10000u32.to_le_bytes());

        let reparsed = parse(raw).unwrap();
        assert_eq!(reparsed.payload.len(), 0x10000 - 4);
    }

    #[test]
    fn test_invalid_magic() {
        let data = hex::decode("ffff080001030000").unwrap();
        assert!(matches!(parse(&data), Err(ProxyError::BadMagic(0xFFFF))));
    }
}
