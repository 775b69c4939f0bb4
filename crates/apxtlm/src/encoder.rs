// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed record encoder for the APXTLM container.
//!
//! # Record framing
//!
//! Non-value records open with an extension opcode byte,
//! `(ext_id << 4) | 0x00`:
//!
//! ```text
//! id  name   payload
//!  0  stop   none (end of stream)
//!  1  ts     u32 LE milliseconds
//!  2  dir    none (next sample is uplink)
//!  3  field  cstr name | u8 count | count cstr
//!  4  evtid  cstr name | u8 count | count cstr keys
//!  8  evt    u8 schema index | keys.len() literals
//!  9  jso    literal name | u32 LE length | qCompressed JSON
//! 10  raw    literal name | u16 LE length | bytes
//! 11  zip    literal name | u32 LE length | qCompressed bytes
//! ```
//!
//! Value records pack the field index and a 4-bit type code (`dspec`)
//! into one or two framing bytes:
//!
//! ```text
//! long:  ((index & 0x07) << 5) | dspec   then   (index >> 3) & 0xFF
//! opt8:  0x10 | ((delta & 0x07) << 5) | dspec
//! ```
//!
//! where `delta = index - last_index - 1` and opt8 applies for
//! `0 <= delta <= 7` within one timestamp window. A `dspec` of 0 marks
//! an extension opcode instead of a value, which is why the opcode
//! table above keeps the low nibble clear.

use crate::f16;
use crate::writer::{qcompress, StreamWriter};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, warn};

/// Magic bytes at offset 0.
pub const MAGIC: &[u8; 6] = b"APXTLM";

/// Current container format version.
pub const FORMAT_VERSION: u16 = 1;

/// Fixed header size; also the payload offset stored in the header.
pub const HEADER_SIZE: u16 = 44;

/// Hard cap on declared fields (11-bit index space).
pub const MAX_FIELDS: usize = 2048;

/// Hard cap on event schemas (u8 index space).
pub const MAX_EVENTS: usize = 256;

/// Maximum payload of a single `raw` record.
const RAW_CHUNK_MAX: usize = 0xFFFF;

// Extension opcode bytes (ext_id << 4).
const EXT_STOP: u8 = 0x00;
const EXT_TS: u8 = 0x10;
const EXT_DIR: u8 = 0x20;
const EXT_FIELD: u8 = 0x30;
const EXT_EVTID: u8 = 0x40;
const EXT_EVT: u8 = 0x80;
const EXT_JSO: u8 = 0x90;
const EXT_RAW: u8 = 0xA0;
const EXT_ZIP: u8 = 0xB0;

// dspec type codes; samples use only the two float widths.
const DSPEC_F16: u8 = 6;
const DSPEC_F32: u8 = 7;

/// Opt8 framing marker bit.
const OPT8_MARK: u8 = 0x10;

/// Sample direction. Downlink is the default; an uplink sample is
/// preceded by a `dir` opcode on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Downlink,
    Uplink,
}

/// Encoder errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event schema limit reached ({MAX_EVENTS})")]
    EventOverflow,

    #[error("unknown event schema index {0}")]
    UnknownEvent(u8),

    #[error("event carries {got} values but its schema has {want} keys")]
    EventArity { got: usize, want: usize },
}

/// Running counters for a single output stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderStats {
    /// Field declarations emitted.
    pub fields: u32,
    /// Event schemas emitted.
    pub event_schemas: u32,
    /// Timestamp markers emitted (after duplicate suppression).
    pub timestamps: u64,
    /// Numeric samples emitted.
    pub samples: u64,
    /// Samples dropped by the value-change cache.
    pub samples_suppressed: u64,
    /// Event instances emitted.
    pub events: u64,
    /// JSO records emitted.
    pub jso_records: u64,
    /// Raw/zip blob records emitted.
    pub blob_records: u64,
    /// Total bytes written, including header and stop byte.
    pub bytes_written: u64,
}

struct EventSchema {
    name: String,
    keys: Vec<String>,
}

/// Streaming APXTLM writer.
///
/// Lifecycle: [`TlmEncoder::new`] writes the 44-byte header;
/// [`write_info`](TlmEncoder::write_info) embeds the metadata object
/// (exactly once, before any declaration); declarations are appended
/// lazily; [`finish`](TlmEncoder::finish) writes the stop byte and
/// flushes. Dropping without `finish` leaves a truncated stream.
pub struct TlmEncoder<W: Write> {
    w: StreamWriter<W>,
    start_timestamp: u64,
    utc_offset: i32,
    fields: Vec<String>,
    events: Vec<EventSchema>,
    downlink: HashMap<u16, f32>,
    uplink: HashMap<u16, f32>,
    last_index: Option<u16>,
    last_ts: Option<u32>,
    field_overflow_logged: bool,
    stats: EncoderStats,
}

impl<W: Write> TlmEncoder<W> {
    /// Create an encoder and write the fixed header.
    ///
    /// `start_timestamp_ms` is milliseconds since the Unix epoch;
    /// `utc_offset_secs` is the recording site's UTC offset.
    pub fn new(sink: W, start_timestamp_ms: u64, utc_offset_secs: i32) -> Result<Self, EncodeError> {
        let mut w = StreamWriter::new(sink);

        w.write_all(MAGIC)?;
        w.write_all(&[0u8; 10])?;
        w.write_u16_le(FORMAT_VERSION)?;
        w.write_u16_le(HEADER_SIZE)?;
        w.write_all(&[0u8; 12])?;
        w.write_u64_le(start_timestamp_ms)?;
        w.write_i32_le(utc_offset_secs)?;

        Ok(Self {
            w,
            start_timestamp: start_timestamp_ms,
            utc_offset: utc_offset_secs,
            fields: Vec::new(),
            events: Vec::new(),
            downlink: HashMap::new(),
            uplink: HashMap::new(),
            last_index: None,
            last_ts: None,
            field_overflow_logged: false,
            stats: EncoderStats::default(),
        })
    }

    /// Header start timestamp, ms since the Unix epoch.
    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    /// Header UTC offset in seconds.
    pub fn utc_offset(&self) -> i32 {
        self.utc_offset
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.w.bytes_written()
    }

    pub fn stats(&self) -> EncoderStats {
        let mut stats = self.stats;
        stats.bytes_written = self.w.bytes_written();
        stats
    }

    /// Embed the metadata object as the `"info"` JSO record.
    ///
    /// The payload must carry `timestamp` (ms) and `utc_offset`
    /// (seconds); when the caller's object omits either, the header
    /// values are substituted.
    pub fn write_info(&mut self, mut info: Value) -> Result<(), EncodeError> {
        if let Value::Object(map) = &mut info {
            map.entry("timestamp")
                .or_insert_with(|| Value::from(self.start_timestamp));
            map.entry("utc_offset")
                .or_insert_with(|| Value::from(self.utc_offset));
        }
        self.write_jso("info", &info)
    }

    /// Append a field declaration; the new index is returned.
    ///
    /// Declarations beyond [`MAX_FIELDS`] are dropped (`None`). The
    /// encoder performs no duplicate-name check; callers own that.
    pub fn declare_field(&mut self, name: &str, aux: &[String]) -> Result<Option<u16>, EncodeError> {
        if self.fields.len() >= MAX_FIELDS {
            if !self.field_overflow_logged {
                warn!(cap = MAX_FIELDS, "field dictionary full, dropping further declarations");
                self.field_overflow_logged = true;
            }
            return Ok(None);
        }

        let index = self.fields.len() as u16;
        let aux = &aux[..aux.len().min(255)];

        self.w.write_u8(EXT_FIELD)?;
        self.w.write_cstr(name)?;
        self.w.write_u8(aux.len() as u8)?;
        for s in aux {
            self.w.write_cstr(s)?;
        }

        self.fields.push(name.to_owned());
        self.stats.fields += 1;
        Ok(Some(index))
    }

    /// Declare an event schema; the new u8 index is returned.
    ///
    /// The 257th distinct schema is rejected. Duplicate names are the
    /// caller's responsibility.
    pub fn declare_event(&mut self, name: &str, keys: &[String]) -> Result<u8, EncodeError> {
        if self.events.len() >= MAX_EVENTS {
            return Err(EncodeError::EventOverflow);
        }

        let index = self.events.len() as u8;
        let keys = &keys[..keys.len().min(255)];

        self.w.write_u8(EXT_EVTID)?;
        self.w.write_cstr(name)?;
        self.w.write_u8(keys.len() as u8)?;
        for key in keys {
            self.w.write_cstr(key)?;
        }

        self.events.push(EventSchema {
            name: name.to_owned(),
            keys: keys.to_vec(),
        });
        self.stats.event_schemas += 1;
        Ok(index)
    }

    /// Emit a timestamp marker and open a new framing window.
    ///
    /// A marker equal to the previous one is suppressed and does not
    /// reset the window.
    pub fn write_timestamp(&mut self, ms: u32) -> Result<(), EncodeError> {
        if self.last_ts == Some(ms) {
            return Ok(());
        }
        self.w.write_u8(EXT_TS)?;
        self.w.write_u32_le(ms)?;
        self.last_ts = Some(ms);
        self.last_index = None;
        self.stats.timestamps += 1;
        Ok(())
    }

    /// Emit one numeric sample.
    ///
    /// Unchanged values (bitwise, per direction) are suppressed. An
    /// index outside the declared dictionary is skipped, not fatal:
    /// rows longer than the dictionary occur in the wild.
    pub fn write_sample(
        &mut self,
        index: u16,
        value: f32,
        direction: Direction,
    ) -> Result<(), EncodeError> {
        if index as usize >= self.fields.len() {
            debug!(index, declared = self.fields.len(), "sample index out of dictionary, skipping");
            return Ok(());
        }

        let cache = match direction {
            Direction::Downlink => &mut self.downlink,
            Direction::Uplink => &mut self.uplink,
        };
        if let Some(prev) = cache.get(&index) {
            if f16::same_value(*prev, value) {
                self.stats.samples_suppressed += 1;
                return Ok(());
            }
        }
        cache.insert(index, value);

        if direction == Direction::Uplink {
            self.w.write_u8(EXT_DIR)?;
        }

        let half = f16::pack(value);
        let dspec = if half.is_some() { DSPEC_F16 } else { DSPEC_F32 };

        match self.last_index {
            Some(last) if index > last && index - last - 1 <= 7 => {
                let delta = (index - last - 1) as u8;
                self.w.write_u8(OPT8_MARK | (delta << 5) | dspec)?;
            }
            _ => {
                self.w.write_u8(((index as u8 & 0x07) << 5) | dspec)?;
                self.w.write_u8((index >> 3) as u8)?;
            }
        }
        self.last_index = Some(index);

        match half {
            Some(bits) => self.w.write_u16_le(bits)?,
            None => self.w.write_f32_le(value)?,
        }
        self.stats.samples += 1;
        Ok(())
    }

    /// Emit an event instance; `values` are parallel to the schema keys.
    pub fn write_event(&mut self, index: u8, values: &[String]) -> Result<(), EncodeError> {
        let want = self
            .events
            .get(index as usize)
            .ok_or(EncodeError::UnknownEvent(index))?
            .keys
            .len();
        if values.len() != want {
            return Err(EncodeError::EventArity {
                got: values.len(),
                want,
            });
        }

        self.w.write_u8(EXT_EVT)?;
        self.w.write_u8(index)?;
        for v in values {
            self.w.write_literal(v)?;
        }
        self.stats.events += 1;
        Ok(())
    }

    /// Embed a JSON document under a named literal.
    pub fn write_jso(&mut self, name: &str, value: &Value) -> Result<(), EncodeError> {
        let json = serde_json::to_vec(value)?;
        let packed = qcompress(&json)?;

        self.w.write_u8(EXT_JSO)?;
        self.w.write_literal(name)?;
        self.w.write_u32_le(packed.len() as u32)?;
        self.w.write_all(&packed)?;
        self.stats.jso_records += 1;
        Ok(())
    }

    /// Embed an opaque payload, compressed when that actually helps.
    ///
    /// A payload whose qCompressed form saves at least two bytes goes
    /// out as one `zip` record; otherwise it is split into `raw`
    /// records of up to 65535 bytes under the same name, reassembled
    /// by the consumer in order.
    pub fn write_blob(&mut self, name: &str, data: &[u8]) -> Result<(), EncodeError> {
        let packed = qcompress(data)?;
        if packed.len() < data.len() + 2 {
            self.w.write_u8(EXT_ZIP)?;
            self.w.write_literal(name)?;
            self.w.write_u32_le(packed.len() as u32)?;
            self.w.write_all(&packed)?;
            self.stats.blob_records += 1;
            return Ok(());
        }

        if data.is_empty() {
            self.w.write_u8(EXT_RAW)?;
            self.w.write_literal(name)?;
            self.w.write_u16_le(0)?;
            self.stats.blob_records += 1;
            return Ok(());
        }

        for chunk in data.chunks(RAW_CHUNK_MAX) {
            self.w.write_u8(EXT_RAW)?;
            self.w.write_literal(name)?;
            self.w.write_u16_le(chunk.len() as u16)?;
            self.w.write_all(chunk)?;
            self.stats.blob_records += 1;
        }
        Ok(())
    }

    /// Write the stop byte, flush, and return the final counters.
    pub fn finish(mut self) -> Result<EncoderStats, EncodeError> {
        self.w.write_u8(EXT_STOP)?;
        self.w.flush()?;
        Ok(self.stats())
    }

    /// Name of a declared event schema (diagnostics).
    pub fn event_name(&self, index: u8) -> Option<&str> {
        self.events.get(index as usize).map(|s| s.name.as_str())
    }
}
