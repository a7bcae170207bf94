//! Primitive stream codec.
//!
//! The layout is fixed and version independent: multi-byte integers are written
//! most-significant-byte first, floating point values as their IEEE-754 bit patterns, characters
//! as 16-bit code units, and variable payloads behind an `i32` length prefix. Nothing is
//! self-describing; the reader must consume values in the order they were written.

use alloy_primitives::Bytes;

/// Errors raised while decoding a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The decoder was asked for more bytes than remain in the buffer.
    #[error("stream exhausted: needed={needed} remaining={remaining}")]
    StreamExhausted {
        /// Bytes required by the read.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A length prefix was negative.
    #[error("negative length prefix: {length}")]
    NegativeLength {
        /// The decoded prefix.
        length: i32,
    },
    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    /// Bytes were left over after a complete value was decoded.
    #[error("trailing bytes after value: remaining={remaining}")]
    TrailingBytes {
        /// Bytes left in the buffer.
        remaining: usize,
    },
}

/// A forward-only encoder appending values to an owned buffer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty encoder with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends an unsigned byte.
    pub fn encode_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Appends a signed byte.
    pub fn encode_byte(&mut self, value: i8) -> &mut Self {
        self.encode_u8(value as u8)
    }

    /// Appends a boolean as a single `0`/`1` byte.
    pub fn encode_bool(&mut self, value: bool) -> &mut Self {
        self.encode_u8(value as u8)
    }

    /// Appends a 16-bit character code unit.
    pub fn encode_char(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a signed 16-bit integer.
    pub fn encode_short(&mut self, value: i16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends an unsigned 16-bit integer.
    pub fn encode_u16(&mut self, value: u16) -> &mut Self {
        self.encode_char(value)
    }

    /// Appends an unsigned 32-bit integer.
    pub fn encode_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a signed 32-bit integer.
    pub fn encode_int(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a signed 64-bit integer.
    pub fn encode_long(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends an unsigned 64-bit integer.
    pub fn encode_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends the IEEE-754 bit pattern of a single precision float.
    pub fn encode_float(&mut self, value: f32) -> &mut Self {
        self.encode_u32(value.to_bits())
    }

    /// Appends the IEEE-754 bit pattern of a double precision float.
    pub fn encode_double(&mut self, value: f64) -> &mut Self {
        self.encode_u64(value.to_bits())
    }

    /// Appends raw bytes without a length prefix.
    pub fn encode_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Appends a length-prefixed byte payload. Payloads are bounded well below `i32::MAX` by the
    /// structural limits.
    pub fn encode_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        debug_assert!(bytes.len() <= i32::MAX as usize);
        self.encode_int(bytes.len() as i32);
        self.encode_raw(bytes)
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn encode_str(&mut self, value: &str) -> &mut Self {
        self.encode_bytes(value.as_bytes())
    }

    /// Consumes the encoder and returns the written bytes.
    pub fn finish(self) -> Bytes {
        self.buf.into()
    }

    /// Consumes the encoder and returns the written bytes as a vector.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// A forward-only decoder reading values from a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder positioned at the start of `buf`.
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The current read position.
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether every byte has been consumed.
    pub const fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails unless every byte has been consumed.
    pub const fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(CodecError::TrailingBytes { remaining }),
        }
    }

    fn take_slice(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(CodecError::StreamExhausted { needed, remaining });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take_slice(N)?);
        Ok(out)
    }

    /// Reads an unsigned byte.
    pub fn decode_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    /// Reads a signed byte.
    pub fn decode_byte(&mut self) -> Result<i8, CodecError> {
        Ok(self.decode_u8()? as i8)
    }

    /// Reads a boolean. Any non-zero byte is `true`.
    pub fn decode_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.decode_u8()? != 0)
    }

    /// Reads a 16-bit character code unit.
    pub fn decode_char(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    /// Reads a signed 16-bit integer.
    pub fn decode_short(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_be_bytes(self.take()?))
    }

    /// Reads an unsigned 16-bit integer.
    pub fn decode_u16(&mut self) -> Result<u16, CodecError> {
        self.decode_char()
    }

    /// Reads an unsigned 32-bit integer.
    pub fn decode_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    /// Reads a signed 32-bit integer.
    pub fn decode_int(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    /// Reads a signed 64-bit integer.
    pub fn decode_long(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take()?))
    }

    /// Reads an unsigned 64-bit integer.
    pub fn decode_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    /// Reads a single precision float from its bit pattern.
    pub fn decode_float(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.decode_u32()?))
    }

    /// Reads a double precision float from its bit pattern.
    pub fn decode_double(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.decode_u64()?))
    }

    /// Reads `len` raw bytes.
    pub fn decode_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take_slice(len)
    }

    /// Reads an `i32` length prefix, rejecting negative values.
    pub fn decode_length(&mut self) -> Result<usize, CodecError> {
        let length = self.decode_int()?;
        usize::try_from(length).map_err(|_| CodecError::NegativeLength { length })
    }

    /// Reads a length-prefixed byte payload.
    pub fn decode_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let length = self.decode_length()?;
        self.take_slice(length)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn decode_str(&mut self) -> Result<String, CodecError> {
        let bytes = self.decode_bytes()?;
        core::str::from_utf8(bytes).map(str::to_owned).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut encoder = Encoder::new();
        encoder.encode_short(0x0102).encode_int(0x0304_0506).encode_long(-1).encode_char(0x41);
        assert_eq!(
            encoder.into_vec(),
            vec![1, 2, 3, 4, 5, 6, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0x41]
        );
    }

    #[test]
    fn test_float_bit_patterns() {
        let mut encoder = Encoder::new();
        encoder.encode_float(f32::NAN).encode_double(-0.0);
        let bytes = encoder.finish();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode_float().unwrap().to_bits(), f32::NAN.to_bits());
        assert_eq!(decoder.decode_double().unwrap().to_bits(), (-0.0f64).to_bits());
        assert!(decoder.is_exhausted());
    }

    #[test]
    fn test_length_prefixed_payloads() {
        let mut encoder = Encoder::new();
        encoder.encode_str("héllo").encode_bytes(&[]).encode_bytes(&[9, 8, 7]);
        let bytes = encoder.finish();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.decode_str().unwrap(), "héllo");
        assert_eq!(decoder.decode_bytes().unwrap(), &[] as &[u8]);
        assert_eq!(decoder.decode_bytes().unwrap(), &[9, 8, 7]);
        decoder.finish().unwrap();
    }

    #[test]
    fn test_read_past_end_is_stream_exhausted() {
        let mut decoder = Decoder::new(&[0, 0, 1]);
        assert_eq!(
            decoder.decode_int(),
            Err(CodecError::StreamExhausted { needed: 4, remaining: 3 })
        );

        let mut decoder = Decoder::new(&[0, 0, 0, 5, 1, 2]);
        assert_eq!(
            decoder.decode_bytes(),
            Err(CodecError::StreamExhausted { needed: 5, remaining: 2 })
        );

        let mut decoder = Decoder::new(&[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(decoder.decode_bytes(), Err(CodecError::NegativeLength { length: -1 }));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut decoder = Decoder::new(&[1, 2]);
        decoder.decode_u8().unwrap();
        assert_eq!(decoder.finish(), Err(CodecError::TrailingBytes { remaining: 1 }));
    }
}
