//! DML message codec.
//!
//! DML messages are flat records encoded positionally: a layout names
//! the fields and their primitive types, and values follow each other
//! with no framing of their own. Layouts are declared statically where
//! the messages are consumed.

use crate::error::{ProxyError, Result};

use super::bytes::ByteBuffer;

/// Enumeration of supported DML primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlType {
    Byt,
    UByt,
    UShrt,
    Int,
    UInt,
    Gid,
    Str,
    WStr,
    Flt,
    Dbl,
}

/// A decoded DML field value.
#[derive(Debug, Clone, PartialEq)]
pub enum DmlValue {
    Byt(i8),
    UByt(u8),
    UShrt(u16),
    Int(i32),
    UInt(u32),
    Gid(u64),
    Str(Vec<u8>),
    WStr(String),
    Flt(f32),
    Dbl(f64),
}

impl DmlValue {
    fn read(ty: DmlType, buf: &mut ByteBuffer) -> Result<Self> {
        Ok(match ty {
            DmlType::Byt => DmlValue::Byt(buf.i8()?),
            DmlType::UByt => DmlValue::UByt(buf.u8()?),
            DmlType::UShrt => DmlValue::UShrt(buf.u16()?),
            DmlType::Int => DmlValue::Int(buf.i32()?),
            DmlType::UInt => DmlValue::UInt(buf.u32()?),
            DmlType::Gid => DmlValue::Gid(buf.u64()?),
            DmlType::Str => DmlValue::Str(buf.string()?),
            DmlType::WStr => DmlValue::WStr(buf.wstr()?),
            DmlType::Flt => DmlValue::Flt(buf.f32()?),
            DmlType::Dbl => DmlValue::Dbl(buf.f64()?),
        })
    }

    fn write(&self, buf: &mut ByteBuffer) {
        match self {
            DmlValue::Byt(v) => buf.write_i8(*v),
            DmlValue::UByt(v) => buf.write_u8(*v),
            DmlValue::UShrt(v) => buf.write_u16(*v),
            DmlValue::Int(v) => buf.write_i32(*v),
            DmlValue::UInt(v) => buf.write_u32(*v),
            DmlValue::Gid(v) => buf.write_u64(*v),
            DmlValue::Str(v) => buf.write_string(v),
            DmlValue::WStr(v) => buf.write_wstr(v),
            DmlValue::Flt(v) => buf.write_f32(*v),
            DmlValue::Dbl(v) => buf.write_f64(*v),
        }
    }
}

/// Describes the data layout of a DML message.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub fields: &'static [(&'static str, DmlType)],
}

impl Layout {
    pub const fn new(fields: &'static [(&'static str, DmlType)]) -> Self {
        Self { fields }
    }

    /// Decodes a message payload into a [`Record`].
    pub fn decode(&self, raw: &[u8]) -> Result<Record> {
        let mut buf = ByteBuffer::from_vec(raw.to_vec());
        let mut values = Vec::with_capacity(self.fields.len());

        for (name, ty) in self.fields {
            values.push((*name, DmlValue::read(*ty, &mut buf)?));
        }

        Ok(Record { values })
    }

    /// Encodes a record produced by [`Layout::decode`] back into bytes.
    pub fn encode(&self, record: &Record) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        for (_, value) in &record.values {
            value.write(&mut buf);
        }
        buf.into_vec()
    }
}

/// A decoded DML message with its fields in layout order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<(&'static str, DmlValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&DmlValue> {
        self.values
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    /// Replaces the value of an existing field.
    ///
    /// The new value must match the layout type of the field; records
    /// only travel between `decode` and `encode` of the same layout.
    pub fn set(&mut self, name: &str, value: DmlValue) -> Result<()> {
        let slot = self
            .values
            .iter_mut()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
            .ok_or_else(|| {
                ProxyError::Dml(format!("no such DML field: {name}"))
            })?;

        if std::mem::discriminant(slot) != std::mem::discriminant(&value) {
            return Err(ProxyError::Dml(format!(
                "type mismatch for DML field: {name}"
            )));
        }

        *slot = value;
        Ok(())
    }

    /// A `STR` field interpreted as text.
    pub fn str_field(&self, name: &str) -> Result<String> {
        match self.get(name) {
            Some(DmlValue::Str(raw)) => Ok(String::from_utf8_lossy(raw).into_owned()),
            _ => Err(ProxyError::Dml(format!(
                "expected STR field: {name}"
            ))),
        }
    }

    /// An `INT` field.
    pub fn int_field(&self, name: &str) -> Result<i32> {
        match self.get(name) {
            Some(DmlValue::Int(v)) => Ok(*v),
            _ => Err(ProxyError::Dml(format!(
                "expected INT field: {name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_LAYOUT: Layout = Layout::new(&[
        ("IP", DmlType::Str),
        ("TCPPort", DmlType::Int),
        ("UserID", DmlType::Gid),
        ("ZoneName", DmlType::Str),
    ]);

    #[test]
    fn test_decode_fields() {
        let mut buf = ByteBuffer::new();
        buf.write_string(b"1.2.3.4");
        buf.write_i32(12345);
        buf.write_u64(0x0102_0304_0506_0708);
        buf.write_string(b"WizardCity");

        let record = TEST_LAYOUT.decode(buf.as_slice()).unwrap();
        assert_eq!(record.str_field("IP").unwrap(), "1.2.3.4");
        assert_eq!(record.int_field("TCPPort").unwrap(), 12345);
        assert_eq!(
            record.get("UserID"),
            Some(&DmlValue::Gid(0x0102_0304_0506_0708))
        );
    }

    #[test]
    fn test_patch_and_encode() {
        let mut buf = ByteBuffer::new();
        buf.write_string(b"1.2.3.4");
        buf.write_i32(12345);
        buf.write_u64(7);
        buf.write_string(b"WizardCity");

        let mut record = TEST_LAYOUT.decode(buf.as_slice()).unwrap();
        record.set("IP", DmlValue::Str(b"127.0.0.1".to_vec())).unwrap();
        record.set("TCPPort", DmlValue::Int(40123)).unwrap();

        let reparsed = TEST_LAYOUT.decode(&TEST_LAYOUT.encode(&record)).unwrap();
        assert_eq!(reparsed.str_field("IP").unwrap(), "127.0.0.1");
        assert_eq!(reparsed.int_field("TCPPort").unwrap(), 40123);
        assert_eq!(reparsed.str_field("ZoneName").unwrap(), "WizardCity");
    }

    #[test]
    fn test_set_rejects_type_change() {
        let mut buf = ByteBuffer::new();
        buf.write_string(b"1.2.3.4");
        buf.write_i32(12345);
        buf.write_u64(7);
        buf.write_string(b"WizardCity");

        let mut record = TEST_LAYOUT.decode(buf.as_slice()).unwrap();
        assert!(record.set("TCPPort", DmlValue::Gid(1)).is_err());
        assert!(record.set("Missing", DmlValue::Int(1)).is_err());
    }

    #[test]
    fn test_truncated_payload() {
        assert!(TEST_LAYOUT.decode(&[0x02, 0x00, b'a']).is_err());
    }
}
