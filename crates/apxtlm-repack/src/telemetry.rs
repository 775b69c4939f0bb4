// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry-dialect ingest.
//!
//! Walks `<telemetry>` documents in stream order:
//!
//! ```text
//! <telemetry>
//!   <info time="ms"/>
//!   <timestamp value="iso-8601"/>
//!   <fields>csv names</fields>
//!   <data>
//!     <D t="ms">csv values</D>
//!     <E name="..." t="ms" ...>text</E>
//!     <U><roll t="ms">1.5</roll>...</U>
//!     <anything-else>captured as JSO</anything-else>
//!   </data>
//! </telemetry>
//! ```
//!
//! The encoder is built lazily, once the base timestamp is resolved
//! (info `time` attribute, then `timestamp` ISO value, then the file's
//! mtime), so the container header always precedes every record.

use crate::common::{
    attr_pairs, get_attr, parse_finite, parse_iso_ms, parse_ts_attr, resolve_base_ts, split_list,
    split_row, EventTable, FieldTable, INGEST_BUF, OUTPUT_BUF,
};
use crate::jso;
use crate::{RepackConfig, RepackError};
use apxtlm::{Direction, EncoderStats, ImportInfo, TelemetryInfo, TlmEncoder, MAX_FIELDS};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, warn};

type Sink = BufWriter<File>;

/// Minimum token count for an explicit `<fields>` list to be trusted.
const MIN_FIELDS: usize = 5;

/// Repack one telemetry recording.
pub fn repack(
    input: &Path,
    output: &Path,
    config: &RepackConfig,
) -> Result<EncoderStats, RepackError> {
    let file = File::open(input)?;
    let mut reader = Reader::from_reader(BufReader::with_capacity(INGEST_BUF, file));
    reader.trim_text(true);
    reader.expand_empty_elements(true);

    let mut ingest = TelemetryIngest::new(input, output, config);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => ingest.on_start(&mut reader, &e)?,
            Event::Text(t) => {
                let text = t.unescape()?;
                ingest.on_text(&text);
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                ingest.on_text(&text);
            }
            Event::End(e) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                ingest.on_end(&tag)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    ingest.finish()
}

struct TelemetryIngest<'a> {
    input: &'a Path,
    output: &'a Path,
    config: &'a RepackConfig,
    enc: Option<TlmEncoder<Sink>>,
    fields: FieldTable,
    events: EventTable,

    // Base-time candidates, in priority order.
    info_time: Option<u64>,
    stamp_time: Option<u64>,

    in_data: bool,
    in_fields: bool,
    fields_text: String,

    in_d: bool,
    d_ts: u32,
    d_text: String,

    in_e: bool,
    e_name: String,
    e_ts: Option<u32>,
    e_attrs: Vec<(String, String)>,
    e_text: String,

    in_u: bool,
    u_tag: Option<String>,
    u_ts: Option<u32>,
    u_text: String,

    /// Most recent row timestamp; events without `t` reuse it.
    cur_ts: u32,
}

impl<'a> TelemetryIngest<'a> {
    fn new(input: &'a Path, output: &'a Path, config: &'a RepackConfig) -> Self {
        Self {
            input,
            output,
            config,
            enc: None,
            fields: FieldTable::default(),
            events: EventTable::default(),
            info_time: None,
            stamp_time: None,
            in_data: false,
            in_fields: false,
            fields_text: String::new(),
            in_d: false,
            d_ts: 0,
            d_text: String::new(),
            in_e: false,
            e_name: String::new(),
            e_ts: None,
            e_attrs: Vec::new(),
            e_text: String::new(),
            in_u: false,
            u_tag: None,
            u_ts: None,
            u_text: String::new(),
            cur_ts: 0,
        }
    }

    fn on_start<R: BufRead>(
        &mut self,
        reader: &mut Reader<R>,
        e: &BytesStart<'_>,
    ) -> Result<(), RepackError> {
        // Markup nested inside a record's value is not structure.
        if self.in_d || self.in_e || (self.in_u && self.u_tag.is_some()) {
            return Ok(());
        }

        let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        if self.in_u {
            // Each immediate child of <U> is one uplink sample.
            let attrs = attr_pairs(e)?;
            self.u_ts = get_attr(&attrs, "t").and_then(parse_ts_attr);
            self.u_tag = Some(tag);
            self.u_text.clear();
            return Ok(());
        }

        if self.in_data {
            match tag.as_str() {
                "D" => {
                    let attrs = attr_pairs(e)?;
                    self.in_d = true;
                    self.d_ts = get_attr(&attrs, "t").and_then(parse_ts_attr).unwrap_or(0);
                    self.d_text.clear();
                }
                "E" => {
                    let attrs = attr_pairs(e)?;
                    self.in_e = true;
                    self.e_name = get_attr(&attrs, "name").unwrap_or("event").to_owned();
                    self.e_ts = get_attr(&attrs, "t").and_then(parse_ts_attr);
                    self.e_attrs = attrs;
                    self.e_text.clear();
                }
                "U" => self.in_u = true,
                _ => self.capture_or_skip(reader, e, &tag)?,
            }
            return Ok(());
        }

        match tag.as_str() {
            "info" => {
                let attrs = attr_pairs(e)?;
                if let Some(v) = get_attr(&attrs, "time").and_then(parse_finite) {
                    self.info_time = Some(v as u64);
                }
            }
            "timestamp" => {
                let attrs = attr_pairs(e)?;
                if let Some(v) = get_attr(&attrs, "value") {
                    self.stamp_time = parse_iso_ms(v);
                }
            }
            "fields" => {
                self.in_fields = true;
                self.fields_text.clear();
            }
            "data" => self.in_data = true,
            _ => {}
        }
        Ok(())
    }

    fn on_text(&mut self, text: &str) {
        if self.in_fields {
            self.fields_text.push_str(text);
        } else if self.in_d {
            self.d_text.push_str(text);
        } else if self.in_e {
            self.e_text.push_str(text);
        } else if self.in_u && self.u_tag.is_some() {
            self.u_text.push_str(text);
        }
    }

    fn on_end(&mut self, tag: &str) -> Result<(), RepackError> {
        if self.in_d {
            if tag == "D" {
                return self.end_d();
            }
            return Ok(());
        }
        if self.in_e {
            if tag == "E" {
                return self.end_e();
            }
            return Ok(());
        }
        if self.in_u {
            if let Some(current) = self.u_tag.clone() {
                if tag == current.as_str() {
                    return self.end_u_child(&current);
                }
                return Ok(());
            }
            if tag == "U" {
                self.in_u = false;
            }
            return Ok(());
        }

        match tag {
            "fields" if self.in_fields => {
                self.in_fields = false;
                let tokens = split_list(&self.fields_text);
                if tokens.len() >= MIN_FIELDS {
                    self.fields.set_names(tokens);
                } else if !tokens.is_empty() {
                    debug!(count = tokens.len(), "field list below minimum, ignoring");
                }
            }
            "data" => self.in_data = false,
            _ => {}
        }
        Ok(())
    }

    /// Close of a `<D>` row: declare the dictionary if needed, emit the
    /// timestamp marker, then one downlink sample per parsable column.
    fn end_d(&mut self) -> Result<(), RepackError> {
        self.in_d = false;
        let tokens = split_row(&self.d_text);

        self.ensure_encoder()?;
        let Some(enc) = self.enc.as_mut() else {
            return Ok(());
        };
        self.fields.ensure_declared(enc, tokens.len())?;

        enc.write_timestamp(self.d_ts)?;
        self.cur_ts = self.d_ts;

        for (i, token) in tokens.iter().enumerate().take(MAX_FIELDS) {
            if token.is_empty() {
                continue;
            }
            match parse_finite(token) {
                Some(v) => enc.write_sample(i as u16, v as f32, Direction::Downlink)?,
                None => debug!(column = i, token = token.as_str(), "bad numeric token, skipping"),
            }
        }
        Ok(())
    }

    /// Close of an `<E>` element: ts marker, then the event instance.
    fn end_e(&mut self) -> Result<(), RepackError> {
        self.in_e = false;

        self.ensure_encoder()?;
        let Some(enc) = self.enc.as_mut() else {
            return Ok(());
        };

        let ts = self.e_ts.unwrap_or(self.cur_ts);
        enc.write_timestamp(ts)?;
        self.cur_ts = ts;

        self.events.emit(enc, &self.e_name, &self.e_attrs, &self.e_text)?;
        Ok(())
    }

    /// Close of an immediate `<U>` child: one uplink sample, declaring
    /// the field on the fly when it is new.
    fn end_u_child(&mut self, tag: &str) -> Result<(), RepackError> {
        self.u_tag = None;

        self.ensure_encoder()?;
        let Some(enc) = self.enc.as_mut() else {
            return Ok(());
        };

        let index = self.fields.declare_extra(enc, tag)?;

        if let Some(ts) = self.u_ts {
            enc.write_timestamp(ts)?;
            self.cur_ts = ts;
        }

        match parse_finite(&self.u_text) {
            Some(v) => match index {
                Some(index) => enc.write_sample(index, v as f32, Direction::Uplink)?,
                None => debug!(field = tag, "field dictionary full, uplink sample dropped"),
            },
            None => debug!(field = tag, "bad uplink value, skipping"),
        }
        Ok(())
    }

    /// Non-record element inside `<data>`: capture as JSO when enabled,
    /// otherwise consume and forget the sub-tree.
    fn capture_or_skip<R: BufRead>(
        &mut self,
        reader: &mut Reader<R>,
        e: &BytesStart<'_>,
        tag: &str,
    ) -> Result<(), RepackError> {
        if !self.config.include_jso {
            let end = e.to_owned();
            let mut skip = Vec::new();
            reader.read_to_end_into(end.name(), &mut skip)?;
            return Ok(());
        }

        let xml = jso::capture_subtree(reader, e)?;

        self.ensure_encoder()?;
        let Some(enc) = self.enc.as_mut() else {
            return Ok(());
        };

        match jso::reparse(&String::from_utf8_lossy(&xml)) {
            Ok(value) => match jso::try_normalize_nodes(tag, &value, enc.start_timestamp()) {
                Some(nodes) => enc.write_jso("nodes", &nodes)?,
                None => enc.write_jso(tag, &value)?,
            },
            Err(err) => warn!(%err, tag, "captured sub-tree failed to re-parse, skipping"),
        }
        Ok(())
    }

    /// Build the encoder once the base timestamp can be resolved, and
    /// embed the info record before anything else.
    fn ensure_encoder(&mut self) -> Result<(), RepackError> {
        if self.enc.is_some() {
            return Ok(());
        }

        let base = resolve_base_ts(self.info_time.or(self.stamp_time), self.input);
        let stem = self
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("telemetry")
            .to_owned();
        let name = self
            .input
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();

        let file = File::create(self.output)?;
        let mut enc = TlmEncoder::new(
            BufWriter::with_capacity(OUTPUT_BUF, file),
            base,
            self.config.utc_offset_secs,
        )?;
        let info = TelemetryInfo::default()
            .title(stem.clone())
            .import(ImportInfo {
                name: Some(name),
                title: Some(stem),
                format: Some("telemetry".to_owned()),
                timestamp: Some(base),
            })
            .timestamp_ms(base)
            .utc_offset(self.config.utc_offset_secs);
        enc.write_info(info.to_value()?)?;

        self.enc = Some(enc);
        Ok(())
    }

    fn finish(mut self) -> Result<EncoderStats, RepackError> {
        // Even a data-less document yields a complete container.
        self.ensure_encoder()?;
        match self.enc.take() {
            Some(enc) => Ok(enc.finish()?),
            None => Ok(EncoderStats::default()),
        }
    }
}
