//! Primitive field codecs shared by every message type.
//!
//! Layout is `DataOutput`-compatible: big-endian fixed-width integers, single
//! byte booleans, and `u16`-prefixed modified UTF-8 for text. Message codecs
//! call these in their declared field order; nothing here is self-describing
//! except the object-form string, which carries a one-byte type marker.

pub mod frame;

pub use frame::{read_frame, write_frame, Frame, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Object-stream marker for a null reference.
const TC_NULL: u8 = 0x70;
/// Object-stream marker for a string with a `u16` length.
const TC_STRING: u8 = 0x74;
/// Object-stream marker for a string with an `i64` length.
const TC_LONGSTRING: u8 = 0x7C;

/// Append-only payload builder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    /// Write an `i32` element count or byte length.
    pub fn put_len(&mut self, field: &'static str, len: usize) -> Result<()> {
        let len = i32::try_from(len).map_err(|_| ProtocolError::FieldTooLarge { field, len })?;
        self.buf.put_i32(len);
        Ok(())
    }

    /// Write a `u16`-prefixed modified UTF-8 string.
    pub fn put_utf(&mut self, field: &'static str, value: &str) -> Result<()> {
        let encoded = encode_modified_utf8(value);
        let len = u16::try_from(encoded.len()).map_err(|_| ProtocolError::FieldTooLarge {
            field,
            len: encoded.len(),
        })?;
        self.buf.put_u16(len);
        self.buf.put_slice(&encoded);
        Ok(())
    }

    /// Write a string in object form, switching to the long form past 64 KiB.
    pub fn put_object_string(&mut self, field: &'static str, value: &str) -> Result<()> {
        let encoded = encode_modified_utf8(value);
        if let Ok(len) = u16::try_from(encoded.len()) {
            self.buf.put_u8(TC_STRING);
            self.buf.put_u16(len);
        } else {
            let len = i64::try_from(encoded.len()).map_err(|_| ProtocolError::FieldTooLarge {
                field,
                len: encoded.len(),
            })?;
            self.buf.put_u8(TC_LONGSTRING);
            self.buf.put_i64(len);
        }
        self.buf.put_slice(&encoded);
        Ok(())
    }

    /// Write an `i32`-prefixed byte block.
    pub fn put_bytes(&mut self, field: &'static str, data: &[u8]) -> Result<()> {
        self.put_len(field, data.len())?;
        self.buf.put_slice(data);
        Ok(())
    }

    /// Write an `i32` count followed by that many UTF strings.
    pub fn put_utf_list(&mut self, field: &'static str, items: &[String]) -> Result<()> {
        self.put_len(field, items.len())?;
        for item in items {
            self.put_utf(field, item)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Sequential reader over one frame's payload.
///
/// Every read checks the remaining length first; running short is a
/// [`ProtocolError::MalformedMessage`], never a panic or a default.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub const fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, needed: usize, field: &str) -> Result<()> {
        if self.buf.len() < needed {
            return Err(ProtocolError::malformed(format!(
                "{field}: needs {needed} bytes, {} remaining",
                self.buf.len()
            )));
        }
        Ok(())
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        self.ensure(len, field)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn get_u8(&mut self, field: &str) -> Result<u8> {
        self.ensure(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_bool(&mut self, field: &str) -> Result<bool> {
        Ok(self.get_u8(field)? != 0)
    }

    pub fn get_u16(&mut self, field: &str) -> Result<u16> {
        self.ensure(2, field)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_i32(&mut self, field: &str) -> Result<i32> {
        self.ensure(4, field)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_i64(&mut self, field: &str) -> Result<i64> {
        self.ensure(8, field)?;
        Ok(self.buf.get_i64())
    }

    /// Read an `i32` count, rejecting negatives and counts whose smallest
    /// possible encoding (`min_element_len` bytes each) exceeds the payload.
    pub fn get_len(&mut self, field: &str, min_element_len: usize) -> Result<usize> {
        let raw = self.get_i32(field)?;
        let len = usize::try_from(raw)
            .map_err(|_| ProtocolError::malformed(format!("{field}: negative length {raw}")))?;
        if len.saturating_mul(min_element_len) > self.buf.len() {
            return Err(ProtocolError::malformed(format!(
                "{field}: length {len} exceeds the {} remaining bytes",
                self.buf.len()
            )));
        }
        Ok(len)
    }

    pub fn get_utf(&mut self, field: &str) -> Result<String> {
        let len = usize::from(self.get_u16(field)?);
        let raw = self.take(len, field)?;
        decode_modified_utf8(raw, field)
    }

    /// Read an object-form string. A null marker reads as the empty string.
    pub fn get_object_string(&mut self, field: &str) -> Result<String> {
        let len = match self.get_u8(field)? {
            TC_NULL => return Ok(String::new()),
            TC_STRING => usize::from(self.get_u16(field)?),
            TC_LONGSTRING => {
                let raw = self.get_i64(field)?;
                usize::try_from(raw).map_err(|_| {
                    ProtocolError::malformed(format!("{field}: invalid long string length {raw}"))
                })?
            }
            other => {
                return Err(ProtocolError::malformed(format!(
                    "{field}: unexpected object marker 0x{other:02X}"
                )))
            }
        };
        let raw = self.take(len, field)?;
        decode_modified_utf8(raw, field)
    }

    pub fn get_bytes(&mut self, field: &str) -> Result<Vec<u8>> {
        let len = self.get_len(field, 1)?;
        Ok(self.take(len, field)?.to_vec())
    }

    pub fn get_utf_list(&mut self, field: &str) -> Result<Vec<String>> {
        let count = self.get_len(field, 2)?;
        (0..count).map(|_| self.get_utf(field)).collect()
    }
}

/// Encode as modified UTF-8: NUL becomes `C0 80` and characters outside the
/// BMP are written as two 3-byte surrogates.
fn encode_modified_utf8(value: &str) -> Vec<u8> {
    if value.bytes().all(|b| b != 0 && b.is_ascii()) {
        return value.as_bytes().to_vec();
    }

    let mut out = Vec::with_capacity(value.len() + 8);
    let mut units = [0u16; 2];
    for ch in value.chars() {
        for &unit in ch.encode_utf16(&mut units).iter() {
            match unit {
                0x0001..=0x007F => out.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
    }
    out
}

fn decode_modified_utf8(raw: &[u8], field: &str) -> Result<String> {
    if raw.is_ascii() {
        return Ok(raw.iter().copied().map(char::from).collect());
    }

    let continuation = |at: usize| -> Result<u16> {
        match raw.get(at) {
            Some(&b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
            _ => Err(ProtocolError::malformed(format!(
                "{field}: truncated modified UTF-8 sequence at offset {at}"
            ))),
        }
    };

    let mut units = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let lead = raw[i];
        match lead >> 4 {
            0x0..=0x7 => {
                units.push(u16::from(lead));
                i += 1;
            }
            0xC | 0xD => {
                units.push((u16::from(lead & 0x1F) << 6) | continuation(i + 1)?);
                i += 2;
            }
            0xE => {
                units.push(
                    (u16::from(lead & 0x0F) << 12) | (continuation(i + 1)? << 6) | continuation(i + 2)?,
                );
                i += 3;
            }
            _ => {
                return Err(ProtocolError::malformed(format!(
                    "{field}: invalid modified UTF-8 lead byte 0x{lead:02X} at offset {i}"
                )))
            }
        }
    }

    Ok(char::decode_utf16(units)
        .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect())
}
