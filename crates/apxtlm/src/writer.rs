// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte-level primitives for the container stream.
//!
//! All multi-byte integers on the wire are little-endian, with one
//! exception: the length prefix of the [`qcompress`] envelope is a
//! big-endian u32. Strings are emitted as NUL-terminated UTF-8;
//! "literals" (event values, blob names) carry a `0xFF` sentinel byte
//! before the string.

use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Write};

/// Sentinel byte that opens an inline string literal.
pub const LITERAL_MARK: u8 = 0xFF;

/// Counting writer over a buffered sink.
///
/// Thin wrapper that pairs the endian primitives with a running byte
/// count; every record the encoder emits goes through here.
#[derive(Debug)]
pub struct StreamWriter<W: Write> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// Total bytes pushed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> io::Result<()> {
        self.inner.write_u8(v)?;
        self.bytes_written += 1;
        Ok(())
    }

    pub fn write_u16_le(&mut self, v: u16) -> io::Result<()> {
        self.inner.write_u16::<LittleEndian>(v)?;
        self.bytes_written += 2;
        Ok(())
    }

    pub fn write_u32_le(&mut self, v: u32) -> io::Result<()> {
        self.inner.write_u32::<LittleEndian>(v)?;
        self.bytes_written += 4;
        Ok(())
    }

    pub fn write_u64_le(&mut self, v: u64) -> io::Result<()> {
        self.inner.write_u64::<LittleEndian>(v)?;
        self.bytes_written += 8;
        Ok(())
    }

    pub fn write_i32_le(&mut self, v: i32) -> io::Result<()> {
        self.inner.write_i32::<LittleEndian>(v)?;
        self.bytes_written += 4;
        Ok(())
    }

    pub fn write_f32_le(&mut self, v: f32) -> io::Result<()> {
        self.inner.write_f32::<LittleEndian>(v)?;
        self.bytes_written += 4;
        Ok(())
    }

    /// Big-endian u32; only the qCompress length prefix uses this.
    pub fn write_u32_be(&mut self, v: u32) -> io::Result<()> {
        self.inner.write_u32::<BigEndian>(v)?;
        self.bytes_written += 4;
        Ok(())
    }

    /// NUL-terminated UTF-8 string.
    pub fn write_cstr(&mut self, s: &str) -> io::Result<()> {
        self.write_all(s.as_bytes())?;
        self.write_u8(0)
    }

    /// Inline string literal: `0xFF` sentinel, then a C-string.
    pub fn write_literal(&mut self, s: &str) -> io::Result<()> {
        self.write_u8(LITERAL_MARK)?;
        self.write_cstr(s)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// qCompress envelope: `u32 BE original length ‖ zlib deflate stream`.
///
/// Consumers rely on byte-for-byte reproducibility of this envelope, so
/// the compression level is fixed at the zlib default.
pub fn qcompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    out.write_u32::<BigEndian>(data.len() as u32)?;
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    #[test]
    fn test_endian_primitives() {
        let mut w = StreamWriter::new(Vec::new());
        w.write_u16_le(0x1234).expect("u16");
        w.write_u32_le(0xAABBCCDD).expect("u32");
        w.write_u32_be(0xAABBCCDD).expect("u32 be");
        w.write_i32_le(-2).expect("i32");

        assert_eq!(w.bytes_written(), 14);
        assert_eq!(
            w.inner,
            vec![
                0x34, 0x12, // u16 LE
                0xDD, 0xCC, 0xBB, 0xAA, // u32 LE
                0xAA, 0xBB, 0xCC, 0xDD, // u32 BE
                0xFE, 0xFF, 0xFF, 0xFF, // -2 LE
            ]
        );
    }

    #[test]
    fn test_cstr_and_literal() {
        let mut w = StreamWriter::new(Vec::new());
        w.write_cstr("alt").expect("cstr");
        w.write_literal("gps").expect("literal");

        assert_eq!(w.inner, b"alt\0\xFFgps\0".to_vec());
    }

    #[test]
    fn test_qcompress_envelope_roundtrip() {
        let data: Vec<u8> = (0..600u32).map(|i| (i % 7) as u8).collect();
        let packed = qcompress(&data).expect("qcompress");

        // Big-endian original length, then a zlib stream.
        let mut cursor = std::io::Cursor::new(&packed);
        let prefix = cursor.read_u32::<BigEndian>().expect("prefix");
        assert_eq!(prefix as usize, data.len());

        let mut inflated = Vec::new();
        ZlibDecoder::new(&packed[4..])
            .read_to_end(&mut inflated)
            .expect("inflate");
        assert_eq!(inflated, data);
    }

    #[test]
    fn test_qcompress_empty_payload() {
        let packed = qcompress(&[]).expect("qcompress");
        assert_eq!(&packed[..4], &[0, 0, 0, 0]);

        let mut inflated = Vec::new();
        ZlibDecoder::new(&packed[4..])
            .read_to_end(&mut inflated)
            .expect("inflate");
        assert!(inflated.is_empty());
    }
}
