// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com
//
// Structural record walker for produced containers. Test tooling only:
// it steps through the framing byte by byte and panics loudly on
// anything malformed, so scenario tests can assert record sequences
// without depending on deflate output bytes.

#![allow(dead_code)]

use apxtlm::f16::f16_bits_to_f32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub payload_offset: u16,
    pub start_timestamp: u64,
    pub utc_offset: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rec {
    Ts(u32),
    Dir,
    Field { name: String, aux: Vec<String> },
    EvtId { name: String, keys: Vec<String> },
    Evt { index: u8, values: Vec<String> },
    Jso { name: String, packed: Vec<u8> },
    Raw { name: String, data: Vec<u8> },
    Zip { name: String, packed: Vec<u8> },
    Sample { index: u16, opt8: bool, half: bool, value: f32 },
    Stop,
}

pub fn parse(bytes: &[u8]) -> (Header, Vec<Rec>) {
    assert_eq!(&bytes[0..6], b"APXTLM", "bad magic");
    assert!(bytes[6..16].iter().all(|&b| b == 0), "bad header padding");
    assert!(bytes[20..32].iter().all(|&b| b == 0), "bad header padding");

    let header = Header {
        version: u16::from_le_bytes(bytes[16..18].try_into().unwrap()),
        payload_offset: u16::from_le_bytes(bytes[18..20].try_into().unwrap()),
        start_timestamp: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
        utc_offset: i32::from_le_bytes(bytes[40..44].try_into().unwrap()),
    };
    assert_eq!(header.payload_offset, 44);

    let mut w = Walker { bytes, pos: 44 };
    let mut recs = Vec::new();
    let mut last_index: Option<u16> = None;
    let mut declared_fields = 0u16;
    let mut schema_arity: Vec<usize> = Vec::new();

    loop {
        let b = w.u8();
        if b & 0x0F == 0 {
            // Low nibble 0 is dspec "ext": an extension opcode byte.
            match b >> 4 {
                0 => {
                    recs.push(Rec::Stop);
                    assert_eq!(w.pos, bytes.len(), "bytes after stop");
                    return (header, recs);
                }
                1 => {
                    recs.push(Rec::Ts(w.u32()));
                    last_index = None;
                }
                2 => recs.push(Rec::Dir),
                3 => {
                    let name = w.cstr();
                    let count = w.u8() as usize;
                    let aux = (0..count).map(|_| w.cstr()).collect();
                    declared_fields += 1;
                    recs.push(Rec::Field { name, aux });
                }
                4 => {
                    let name = w.cstr();
                    let count = w.u8() as usize;
                    let keys: Vec<String> = (0..count).map(|_| w.cstr()).collect();
                    schema_arity.push(keys.len());
                    recs.push(Rec::EvtId { name, keys });
                }
                8 => {
                    let index = w.u8();
                    let arity = *schema_arity
                        .get(index as usize)
                        .unwrap_or_else(|| panic!("evt {index} without schema"));
                    let values = (0..arity).map(|_| w.literal()).collect();
                    recs.push(Rec::Evt { index, values });
                }
                9 => {
                    let name = w.literal();
                    let len = w.u32() as usize;
                    recs.push(Rec::Jso { name, packed: w.take(len) });
                }
                10 => {
                    let name = w.literal();
                    let len = w.u16() as usize;
                    recs.push(Rec::Raw { name, data: w.take(len) });
                }
                11 => {
                    let name = w.literal();
                    let len = w.u32() as usize;
                    recs.push(Rec::Zip { name, packed: w.take(len) });
                }
                other => panic!("unknown extension opcode {other}"),
            }
            continue;
        }

        // Value record.
        let dspec = b & 0x0F;
        let opt8 = b & 0x10 != 0;
        let index = if opt8 {
            let delta = u16::from((b >> 5) & 0x07);
            let last = last_index.expect("opt8 framing without a window");
            last + 1 + delta
        } else {
            let low = u16::from((b >> 5) & 0x07);
            (u16::from(w.u8()) << 3) | low
        };
        assert!(index < declared_fields, "sample index {index} not declared");
        last_index = Some(index);

        let (half, value) = match dspec {
            6 => (true, f16_bits_to_f32(w.u16())),
            7 => (false, f32::from_le_bytes(w.take(4).try_into().unwrap())),
            other => panic!("unexpected dspec {other}"),
        };
        recs.push(Rec::Sample { index, opt8, half, value });
    }
}

struct Walker<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Walker<'_> {
    fn u8(&mut self) -> u8 {
        let b = self.bytes[self.pos];
        self.pos += 1;
        b
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take(2).try_into().unwrap())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        let out = self.bytes[self.pos..self.pos + n].to_vec();
        self.pos += n;
        out
    }

    fn cstr(&mut self) -> String {
        let start = self.pos;
        while self.bytes[self.pos] != 0 {
            self.pos += 1;
        }
        let s = String::from_utf8(self.bytes[start..self.pos].to_vec()).expect("utf8");
        self.pos += 1;
        s
    }

    fn literal(&mut self) -> String {
        assert_eq!(self.u8(), 0xFF, "missing literal sentinel");
        self.cstr()
    }
}

/// Inflate a qCompressed payload and check its length prefix.
pub fn unqcompress(packed: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let expected = u32::from_be_bytes(packed[0..4].try_into().unwrap()) as usize;
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(&packed[4..])
        .read_to_end(&mut out)
        .expect("inflate");
    assert_eq!(out.len(), expected, "length prefix mismatch");
    out
}
