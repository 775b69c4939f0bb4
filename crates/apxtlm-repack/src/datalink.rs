// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datalink-dialect ingest.
//!
//! Walks `<mandala>` dumps in stream order:
//!
//! ```text
//! <mandala time_ms="..." callsign="..." uid="...">
//!   <fields>csv names</fields>
//!   <S t="ms">csv values</S>
//!   <D t="ms">csv values</D>
//!   <event name="..." .../>
//!   <anything-else>captured as JSO</anything-else>
//! </mandala>
//! ```
//!
//! The base timestamp comes from the root's `time_ms`/`UTC` attribute;
//! second-resolution values are promoted to milliseconds and pre-2000
//! values fall back to the file's mtime. The root attributes also feed
//! the unit identity of the embedded info record.

use crate::common::{
    attr_pairs, get_attr, normalize_epoch_ms, parse_finite, parse_ts_attr, resolve_base_ts,
    split_list, split_row, EventTable, FieldTable, INGEST_BUF, OUTPUT_BUF,
};
use crate::jso;
use crate::{RepackConfig, RepackError};
use apxtlm::{Direction, EncoderStats, ImportInfo, TelemetryInfo, TlmEncoder, UnitInfo, MAX_FIELDS};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, warn};

type Sink = BufWriter<File>;

/// Repack one datalink dump.
pub fn repack(
    input: &Path,
    output: &Path,
    config: &RepackConfig,
) -> Result<EncoderStats, RepackError> {
    let file = File::open(input)?;
    let mut reader = Reader::from_reader(BufReader::with_capacity(INGEST_BUF, file));
    reader.trim_text(true);
    reader.expand_empty_elements(true);

    let mut ingest = DatalinkIngest::new(input, output, config);
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

struct DatalinkIngest<'a> {
    input: &'a Path,
    output: &'a Path,
    config: &'a RepackConfig,
    enc: Option<TlmEncoder<Sink>>,
    fields: FieldTable,
    events: EventTable,

    root_seen: bool,
    depth: usize,
    unit: UnitInfo,

    in_fields: bool,
    fields_text: String,

    in_row: bool,
    row_ts: u32,
    row_text: String,

    in_evt: bool,
    evt_name: String,
    evt_ts: Option<u32>,
    evt_attrs: Vec<(String, String)>,
    evt_text: String,

    cur_ts: u32,
}

impl<'a> DatalinkIngest<'a> {
    fn new(input: &'a Path, output: &'a Path, config: &'a RepackConfig) -> Self {
        Self {
            input,
            output,
            config,
            enc: None,
            fields: FieldTable::default(),
            events: EventTable::default(),
            root_seen: false,
            depth: 0,
            unit: UnitInfo::default(),
            in_fields: false,
            fields_text: String::new(),
            in_row: false,
            row_ts: 0,
            row_text: String::new(),
            in_evt: false,
            evt_name: String::new(),
            evt_ts: None,
            evt_attrs: Vec::new(),
            evt_text: String::new(),
            cur_ts: 0,
        }
    }

    fn on_start<R: BufRead>(
        &mut self,
        reader: &mut Reader<R>,
        e: &BytesStart<'_>,
    ) -> Result<(), RepackError> {
        self.depth += 1;

        if self.in_row || self.in_fields || self.in_evt {
            return Ok(()); // markup nested inside a value
        }

        let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        if !self.root_seen {
            self.root_seen = true;
            self.start_root(e)?;
            return Ok(());
        }

        match tag.as_str() {
            "S" | "D" => {
                let attrs = attr_pairs(e)?;
                self.in_row = true;
                self.row_ts = row_timestamp(&attrs);
                self.row_text.clear();
            }
            "event" | "evt" => {
                let attrs = attr_pairs(e)?;
                self.in_evt = true;
                self.evt_name = get_attr(&attrs, "name").unwrap_or("event").to_owned();
                self.evt_ts = get_attr(&attrs, "t").and_then(parse_ts_attr);
                self.evt_attrs = attrs;
                self.evt_text.clear();
            }
            "fields" => {
                self.in_fields = true;
                self.fields_text.clear();
            }
            _ if self.depth == 2 => {
                self.capture_or_skip(reader, e, &tag)?;
                self.depth -= 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_text(&mut self, text: &str) {
        if self.in_fields {
            self.fields_text.push_str(text);
        } else if self.in_row {
            self.row_text.push_str(text);
        } else if self.in_evt {
            self.evt_text.push_str(text);
        }
    }

    fn on_end(&mut self, tag: &str) -> Result<(), RepackError> {
        self.depth = self.depth.saturating_sub(1);

        if self.in_row {
            if tag == "S" || tag == "D" {
                return self.end_row();
            }
            return Ok(());
        }
        if self.in_evt {
            if tag == "event" || tag == "evt" {
                return self.end_evt();
            }
            return Ok(());
        }
        if self.in_fields && tag == "fields" {
            self.in_fields = false;
            let tokens = split_list(&self.fields_text);
            if !tokens.is_empty() {
                self.fields.set_names(tokens);
            }
        }
        Ok(())
    }

    /// Root element: resolve the base timestamp, pick up the unit
    /// identity, and build the encoder right away.
    fn start_root(&mut self, e: &BytesStart<'_>) -> Result<(), RepackError> {
        let attrs = attr_pairs(e)?;

        let candidate = get_attr(&attrs, "time_ms")
            .or_else(|| get_attr(&attrs, "UTC"))
            .and_then(parse_finite)
            .map(normalize_epoch_ms);

        self.unit = UnitInfo {
            name: get_attr(&attrs, "callsign")
                .or_else(|| get_attr(&attrs, "name"))
                .map(str::to_owned),
            time: candidate,
            kind: get_attr(&attrs, "type").map(str::to_owned),
            uid: get_attr(&attrs, "uid").map(str::to_owned),
        };

        self.build_encoder(candidate)
    }

    fn end_row(&mut self) -> Result<(), RepackError> {
        self.in_row = false;
        let tokens = split_row(&self.row_text);

        let Some(enc) = self.enc.as_mut() else {
            return Ok(());
        };
        self.fields.ensure_declared(enc, tokens.len())?;

        enc.write_timestamp(self.row_ts)?;
        self.cur_ts = self.row_ts;

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

    fn end_evt(&mut self) -> Result<(), RepackError> {
        self.in_evt = false;

        let Some(enc) = self.enc.as_mut() else {
            return Ok(());
        };

        let ts = self.evt_ts.unwrap_or(self.cur_ts);
        enc.write_timestamp(ts)?;
        self.cur_ts = ts;

        self.events
            .emit(enc, &self.evt_name, &self.evt_attrs, &self.evt_text)?;
        Ok(())
    }

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

    fn build_encoder(&mut self, candidate: Option<u64>) -> Result<(), RepackError> {
        let base = resolve_base_ts(candidate, self.input);
        let stem = self
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("datalink")
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
                format: Some("datalink".to_owned()),
                timestamp: Some(base),
            })
            .unit(self.unit.clone())
            .timestamp_ms(base)
            .utc_offset(self.config.utc_offset_secs);
        enc.write_info(info.to_value()?)?;

        self.enc = Some(enc);
        Ok(())
    }

    fn finish(mut self) -> Result<EncoderStats, RepackError> {
        if self.enc.is_none() {
            // Rootless input: still produce a complete, empty container.
            self.build_encoder(None)?;
        }
        match self.enc.take() {
            Some(enc) => Ok(enc.finish()?),
            None => Ok(EncoderStats::default()),
        }
    }
}

/// Row timestamp attribute, in priority order.
fn row_timestamp(attrs: &[(String, String)]) -> u32 {
    for key in ["t", "ts", "time_ms", "UTC"] {
        if let Some(ts) = get_attr(attrs, key).and_then(parse_ts_attr) {
            return ts;
        }
    }
    0
}
