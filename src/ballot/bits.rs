//! Bit-level primitives for the ballot format
//!
//! Integers are written in the fewest bits that can hold their declared
//! maximum. Strings are a length prefix followed by one code per character.

use crate::error::BallotCodecError;
use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};
use std::io::Cursor;

/// Number of bits needed to store any value in `0..=max`
pub const fn bit_size(max: u32) -> u32 {
    u32::BITS - max.leading_zeros()
}

/// How string characters are coded
#[derive(Debug, Clone, Copy)]
pub enum StringEncoding {
    /// Length in bytes, then raw UTF-8 bytes
    Utf8,
    /// Length in characters, then each character's index in the charset
    Charset(&'static str),
}

pub struct BitSink {
    inner: BitWriter<Vec<u8>, BigEndian>,
}

impl BitSink {
    pub fn new() -> Self {
        Self {
            inner: BitWriter::endian(Vec::new(), BigEndian),
        }
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BallotCodecError> {
        self.inner.write_bit(value)?;
        Ok(())
    }

    pub fn write_uint(&mut self, value: u32, max: u32) -> Result<(), BallotCodecError> {
        if value > max {
            return Err(BallotCodecError::ValueOutOfRange { value, max });
        }
        let bits = bit_size(max);
        if bits > 0 {
            self.inner.write(bits, value)?;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BallotCodecError> {
        for byte in bytes {
            self.inner.write(8, *byte)?;
        }
        Ok(())
    }

    pub fn write_string(
        &mut self,
        value: &str,
        encoding: StringEncoding,
        max_length: u32,
    ) -> Result<(), BallotCodecError> {
        match encoding {
            StringEncoding::Utf8 => {
                let bytes = value.as_bytes();
                self.write_length(bytes.len(), max_length)?;
                self.write_bytes(bytes)
            }
            StringEncoding::Charset(charset) => {
                let codes = value
                    .chars()
                    .map(|c| {
                        charset
                            .chars()
                            .position(|known| known == c)
                            .map(|i| i as u32)
                            .ok_or(BallotCodecError::UnencodableChar(c))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.write_length(codes.len(), max_length)?;
                let max_code = charset.chars().count().saturating_sub(1) as u32;
                for code in codes {
                    self.write_uint(code, max_code)?;
                }
                Ok(())
            }
        }
    }

    fn write_length(&mut self, length: usize, max: u32) -> Result<(), BallotCodecError> {
        let length32 = u32::try_from(length).unwrap_or(u32::MAX);
        if length32 > max {
            return Err(BallotCodecError::StringTooLong { length, max });
        }
        self.write_uint(length32, max)
    }

    /// Pad with zero bits to a byte boundary and return the bytes
    pub fn finish(mut self) -> Result<Vec<u8>, BallotCodecError> {
        self.inner.byte_align()?;
        Ok(self.inner.into_writer())
    }
}

impl Default for BitSink {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BitSource<'a> {
    inner: BitReader<Cursor<&'a [u8]>, BigEndian>,
    consumed: u64,
    total: u64,
}

impl<'a> BitSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            inner: BitReader::endian(Cursor::new(bytes), BigEndian),
            consumed: 0,
            total: bytes.len() as u64 * 8,
        }
    }

    pub fn read_bool(&mut self) -> Result<bool, BallotCodecError> {
        let bit = self.inner.read_bit()?;
        self.consumed += 1;
        Ok(bit)
    }

    pub fn read_uint(&mut self, max: u32) -> Result<u32, BallotCodecError> {
        let bits = bit_size(max);
        if bits == 0 {
            return Ok(0);
        }
        let value: u32 = self.inner.read(bits)?;
        self.consumed += u64::from(bits);
        if value > max {
            return Err(BallotCodecError::ValueOutOfRange { value, max });
        }
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, BallotCodecError> {
        let mut bytes = Vec::with_capacity(count);
        for _ in 0..count {
            let byte: u8 = self.inner.read(8)?;
            self.consumed += 8;
            bytes.push(byte);
        }
        Ok(bytes)
    }

    pub fn read_string(
        &mut self,
        encoding: StringEncoding,
        max_length: u32,
    ) -> Result<String, BallotCodecError> {
        let length = self.read_uint(max_length)? as usize;
        match encoding {
            StringEncoding::Utf8 => {
                let bytes = self.read_bytes(length)?;
                String::from_utf8(bytes).map_err(|_| BallotCodecError::InvalidUtf8)
            }
            StringEncoding::Charset(charset) => {
                let max_code = charset.chars().count().saturating_sub(1) as u32;
                (0..length)
                    .map(|_| {
                        let code = self.read_uint(max_code)?;
                        charset
                            .chars()
                            .nth(code as usize)
                            .ok_or(BallotCodecError::ValueOutOfRange {
                                value: code,
                                max: max_code,
                            })
                    })
                    .collect()
            }
        }
    }

    /// Require that only zero padding shorter than a byte remains
    pub fn finish(mut self) -> Result<(), BallotCodecError> {
        let remaining = self.total.saturating_sub(self.consumed);
        if remaining >= 8 {
            return Err(BallotCodecError::UnexpectedPadding);
        }
        for _ in 0..remaining {
            if self.read_bool()? {
                return Err(BallotCodecError::UnexpectedPadding);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_size() {
        assert_eq!(bit_size(0), 0);
        assert_eq!(bit_size(1), 1);
        assert_eq!(bit_size(2), 2);
        assert_eq!(bit_size(15), 4);
        assert_eq!(bit_size(16), 5);
        assert_eq!(bit_size(255), 8);
    }

    #[test]
    fn test_uint_uses_minimal_width() {
        let mut sink = BitSink::new();
        sink.write_uint(5, 7).unwrap(); // 101
        sink.write_bool(true).unwrap(); // 1
        sink.write_uint(0, 0).unwrap(); // nothing
        sink.write_uint(3, 15).unwrap(); // 0011
        let bytes = sink.finish().unwrap();
        assert_eq!(bytes, vec![0b1011_0011]);

        let mut source = BitSource::new(&bytes);
        assert_eq!(source.read_uint(7).unwrap(), 5);
        assert!(source.read_bool().unwrap());
        assert_eq!(source.read_uint(0).unwrap(), 0);
        assert_eq!(source.read_uint(15).unwrap(), 3);
        source.finish().unwrap();
    }

    #[test]
    fn test_value_over_max_rejected() {
        let mut sink = BitSink::new();
        assert!(matches!(
            sink.write_uint(4, 3),
            Err(BallotCodecError::ValueOutOfRange { value: 4, max: 3 })
        ));

        // 3 bits can hold 6 but the declared max is 5
        let mut source = BitSource::new(&[0b1100_0000]);
        assert!(matches!(
            source.read_uint(5),
            Err(BallotCodecError::ValueOutOfRange { value: 6, max: 5 })
        ));
    }

    #[test]
    fn test_charset_string() {
        let mut sink = BitSink::new();
        sink.write_string("c0ffee", StringEncoding::Charset("0123456789abcdef"), 64)
            .unwrap();
        let bytes = sink.finish().unwrap();
        // 7-bit length + 6 * 4-bit codes = 31 bits
        assert_eq!(bytes.len(), 4);

        let mut source = BitSource::new(&bytes);
        let s = source
            .read_string(StringEncoding::Charset("0123456789abcdef"), 64)
            .unwrap();
        assert_eq!(s, "c0ffee");
        source.finish().unwrap();
    }

    #[test]
    fn test_unencodable_char_rejected() {
        let mut sink = BitSink::new();
        assert!(matches!(
            sink.write_string("abc!", StringEncoding::Charset("abc"), 10),
            Err(BallotCodecError::UnencodableChar('!'))
        ));
    }

    #[test]
    fn test_utf8_string_too_long() {
        let mut sink = BitSink::new();
        assert!(matches!(
            sink.write_string("hello", StringEncoding::Utf8, 4),
            Err(BallotCodecError::StringTooLong { length: 5, max: 4 })
        ));
    }

    #[test]
    fn test_nonzero_padding_rejected() {
        let mut source = BitSource::new(&[0b0000_0001]);
        assert_eq!(source.read_uint(15).unwrap(), 0);
        assert!(matches!(
            source.finish(),
            Err(BallotCodecError::UnexpectedPadding)
        ));

        let mut source = BitSource::new(&[0xff, 0x00]);
        source.read_uint(255).unwrap();
        source.finish().unwrap_err();
    }

    #[test]
    fn test_truncated_input_is_io_error() {
        let mut source = BitSource::new(&[0xab]);
        assert!(matches!(source.read_bytes(2), Err(BallotCodecError::Io(_))));
    }
}
