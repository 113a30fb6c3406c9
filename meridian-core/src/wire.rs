//! Compact binary wire codec.
//!
//! # Encoding
//!
//! ```text
//! compact int   zig-zag LEB128 varint, at most 5 bytes, fits i32
//! long          zig-zag LEB128 varint, at most 10 bytes
//! bool          one byte, 0 or 1
//! string        compact int byte length, then UTF-8 bytes
//! nullable str  bool "present", then string when present
//! ```
//!
//! Requests and responses are sequences of these primitives; there is no
//! outer frame. The reader and writer are both buffered, so callers must
//! [`WireWriter::flush`] at the end of every response.

use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};

use crate::error::{WireError, WireResult};

/// Largest string accepted from a peer.
pub const MAX_STRING_LEN: usize = 16 * 1024 * 1024;

const MAX_VARINT_BYTES: usize = 10;

// ============================================================================
// VALUES
// ============================================================================

/// Shape of one wire field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireKind {
    Int,
    Long,
    Bool,
    Str,
    NullableStr,
}

/// A decoded wire field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireValue {
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),
    NullableStr(Option<String>),
}

impl WireValue {
    pub fn kind(&self) -> WireKind {
        match self {
            WireValue::Int(_) => WireKind::Int,
            WireValue::Long(_) => WireKind::Long,
            WireValue::Bool(_) => WireKind::Bool,
            WireValue::Str(_) => WireKind::Str,
            WireValue::NullableStr(_) => WireKind::NullableStr,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            WireValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            WireValue::Long(v) => Some(*v),
            WireValue::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(v) => Some(v),
            WireValue::NullableStr(v) => v.as_deref(),
            _ => None,
        }
    }
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_BYTES]) -> usize {
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            return len + 1;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
}

// ============================================================================
// READER
// ============================================================================

/// Buffered decoder over any async byte source.
pub struct WireReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    async fn read_u8_raw(&mut self) -> WireResult<u8> {
        match self.inner.read_u8().await {
            Ok(byte) => Ok(byte),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(WireError::UnexpectedEof)
            }
            Err(err) => Err(WireError::Io(err)),
        }
    }

    async fn read_varint_from(&mut self, first: u8) -> WireResult<u64> {
        let mut result = u64::from(first & 0x7f);
        if first & 0x80 == 0 {
            return Ok(result);
        }
        let mut shift = 7;
        for _ in 1..MAX_VARINT_BYTES {
            let byte = self.read_u8_raw().await?;
            if shift == 63 && byte > 1 {
                return Err(WireError::VarintOverflow { bits: 64 });
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarintOverflow { bits: 64 })
    }

    async fn read_varint(&mut self) -> WireResult<u64> {
        let first = self.read_u8_raw().await?;
        self.read_varint_from(first).await
    }

    fn narrow(value: i64) -> WireResult<i32> {
        i32::try_from(value).map_err(|_| WireError::VarintOverflow { bits: 32 })
    }

    /// Read the next opcode, or `None` on a clean end of stream.
    pub async fn read_opcode(&mut self) -> WireResult<Option<i32>> {
        let mut first = [0u8; 1];
        let read = self.inner.read(&mut first).await?;
        if read == 0 {
            return Ok(None);
        }
        let raw = self.read_varint_from(first[0]).await?;
        Self::narrow(zigzag_decode(raw)).map(Some)
    }

    pub async fn read_byte(&mut self) -> WireResult<u8> {
        self.read_u8_raw().await
    }

    pub async fn read_compact_int(&mut self) -> WireResult<i32> {
        let raw = self.read_varint().await?;
        Self::narrow(zigzag_decode(raw))
    }

    pub async fn read_long(&mut self) -> WireResult<i64> {
        let raw = self.read_varint().await?;
        Ok(zigzag_decode(raw))
    }

    pub async fn read_bool(&mut self) -> WireResult<bool> {
        match self.read_u8_raw().await? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub async fn read_string(&mut self) -> WireResult<String> {
        let len = self.read_compact_int().await?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        let len = len as usize;
        if len > MAX_STRING_LEN {
            return Err(WireError::TooLarge {
                len,
                max: MAX_STRING_LEN,
            });
        }
        let mut bytes = vec![0u8; len];
        match self.inner.read_exact(&mut bytes).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::UnexpectedEof)
            }
            Err(err) => return Err(WireError::Io(err)),
        }
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    pub async fn read_nullable_string(&mut self) -> WireResult<Option<String>> {
        if self.read_bool().await? {
            Ok(Some(self.read_string().await?))
        } else {
            Ok(None)
        }
    }

    pub async fn read_value(&mut self, kind: WireKind) -> WireResult<WireValue> {
        Ok(match kind {
            WireKind::Int => WireValue::Int(self.read_compact_int().await?),
            WireKind::Long => WireValue::Long(self.read_long().await?),
            WireKind::Bool => WireValue::Bool(self.read_bool().await?),
            WireKind::Str => WireValue::Str(self.read_string().await?),
            WireKind::NullableStr => WireValue::NullableStr(self.read_nullable_string().await?),
        })
    }

    /// Drop whatever the peer has already sent but nobody has read.
    ///
    /// Used after rejecting a request whose arguments cannot be parsed, so
    /// the next opcode is read from a clean boundary when the peer is not
    /// pipelining.
    pub fn discard_buffered(&mut self) -> usize {
        let pending = self.inner.buffer().len();
        self.inner.consume(pending);
        pending
    }

    /// Read a `-1`-terminated list of compact ints.
    pub async fn read_int_list(&mut self, sentinel: i32) -> WireResult<Vec<i32>> {
        let mut values = Vec::new();
        loop {
            let value = self.read_compact_int().await?;
            if value == sentinel {
                return Ok(values);
            }
            values.push(value);
        }
    }
}

// ============================================================================
// WRITER
// ============================================================================

/// Buffered encoder over any async byte sink.
pub struct WireWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    async fn write_varint(&mut self, value: u64) -> WireResult<()> {
        let mut buf = [0u8; MAX_VARINT_BYTES];
        let len = encode_varint(value, &mut buf);
        self.inner.write_all(&buf[..len]).await?;
        Ok(())
    }

    pub async fn write_byte(&mut self, value: u8) -> WireResult<()> {
        self.inner.write_u8(value).await?;
        Ok(())
    }

    pub async fn write_compact_int(&mut self, value: i32) -> WireResult<()> {
        self.write_varint(zigzag_encode(i64::from(value))).await
    }

    pub async fn write_long(&mut self, value: i64) -> WireResult<()> {
        self.write_varint(zigzag_encode(value)).await
    }

    pub async fn write_bool(&mut self, value: bool) -> WireResult<()> {
        self.write_byte(u8::from(value)).await
    }

    pub async fn write_string(&mut self, value: &str) -> WireResult<()> {
        let len = value.len();
        if len > MAX_STRING_LEN {
            return Err(WireError::TooLarge {
                len,
                max: MAX_STRING_LEN,
            });
        }
        self.write_compact_int(len as i32).await?;
        self.inner.write_all(value.as_bytes()).await?;
        Ok(())
    }

    pub async fn write_nullable_string(&mut self, value: Option<&str>) -> WireResult<()> {
        match value {
            Some(value) => {
                self.write_bool(true).await?;
                self.write_string(value).await
            }
            None => self.write_bool(false).await,
        }
    }

    pub async fn write_value(&mut self, value: &WireValue) -> WireResult<()> {
        match value {
            WireValue::Int(v) => self.write_compact_int(*v).await,
            WireValue::Long(v) => self.write_long(*v).await,
            WireValue::Bool(v) => self.write_bool(*v).await,
            WireValue::Str(v) => self.write_string(v).await,
            WireValue::NullableStr(v) => self.write_nullable_string(v.as_deref()).await,
        }
    }

    /// Write a list of compact ints followed by `sentinel`.
    pub async fn write_int_list(&mut self, values: &[i32], sentinel: i32) -> WireResult<()> {
        for value in values {
            self.write_compact_int(*value).await?;
        }
        self.write_compact_int(sentinel).await
    }

    pub async fn flush(&mut self) -> WireResult<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (WireWriter<tokio::io::DuplexStream>, WireReader<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (WireWriter::new(a), WireReader::new(b))
    }

    #[test]
    fn test_zigzag_extremes() {
        for value in [0i64, -1, 1, i64::from(i32::MIN), i64::from(i32::MAX), i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }

    #[tokio::test]
    async fn test_sentinel_is_one_byte() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_compact_int(-1).await?;
        writer.flush().await?;
        assert_eq!(reader.read_byte().await?, 0x01);
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_buffered_drops_unread_bytes() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_compact_int(7).await?;
        writer.write_string("garbage").await?;
        writer.flush().await?;
        assert_eq!(reader.read_compact_int().await?, 7);
        assert_eq!(reader.discard_buffered(), 8);
        assert_eq!(reader.discard_buffered(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_sequence() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_compact_int(300).await?;
        writer.write_long(-5_000_000_000).await?;
        writer.write_bool(true).await?;
        writer.write_string("mysql_databases").await?;
        writer.write_nullable_string(None).await?;
        writer.write_int_list(&[3, 17], -1).await?;
        writer.flush().await?;

        assert_eq!(reader.read_compact_int().await?, 300);
        assert_eq!(reader.read_long().await?, -5_000_000_000);
        assert!(reader.read_bool().await?);
        assert_eq!(reader.read_string().await?, "mysql_databases");
        assert_eq!(reader.read_nullable_string().await?, None);
        assert_eq!(reader.read_int_list(-1).await?, vec![3, 17]);
        Ok(())
    }

    #[tokio::test]
    async fn test_opcode_eof_is_none() -> WireResult<()> {
        let (writer, mut reader) = pipe();
        drop(writer);
        assert_eq!(reader.read_opcode().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_truncated_string_is_eof() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_compact_int(10).await?;
        writer.write_byte(b'a').await?;
        writer.flush().await?;
        drop(writer);
        assert!(matches!(reader.read_string().await, Err(WireError::UnexpectedEof)));
        Ok(())
    }

    #[tokio::test]
    async fn test_compact_int_overflow_rejected() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_long(i64::from(i32::MAX) + 1).await?;
        writer.flush().await?;
        assert!(matches!(
            reader.read_compact_int().await,
            Err(WireError::VarintOverflow { bits: 32 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_bool_rejected() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_byte(9).await?;
        writer.flush().await?;
        assert!(matches!(reader.read_bool().await, Err(WireError::InvalidBool(9))));
        Ok(())
    }

    #[tokio::test]
    async fn test_negative_length_rejected() -> WireResult<()> {
        let (mut writer, mut reader) = pipe();
        writer.write_compact_int(-4).await?;
        writer.flush().await?;
        assert!(matches!(
            reader.read_string().await,
            Err(WireError::NegativeLength(-4))
        ));
        Ok(())
    }
}
