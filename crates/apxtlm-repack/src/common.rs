// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plumbing shared by both ingest state machines: field and event
//! dictionaries, CSV tokenizers, and timestamp normalization.

use apxtlm::{EncodeError, TlmEncoder, MAX_FIELDS};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use quick_xml::events::BytesStart;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// 2000-01-01T00:00:00Z in ms. Base timestamps before this are treated
/// as bogus and replaced with the input file's mtime.
pub const Y2K_MS: u64 = 946_684_800_000;

/// Input read buffer (both ingests).
pub const INGEST_BUF: usize = 100 * 1024;

/// Output sink buffer.
pub const OUTPUT_BUF: usize = 100 * 1024;

/// Modification time of `path` in ms since the Unix epoch, 0 when
/// unavailable.
pub fn file_mtime_ms(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
}

/// Pick the base timestamp: the candidate when it is sane, otherwise
/// the file's mtime.
pub fn resolve_base_ts(candidate: Option<u64>, input: &Path) -> u64 {
    match candidate {
        Some(ms) if ms >= Y2K_MS => ms,
        other => {
            if other.is_some() {
                debug!(?other, "pre-2000 base timestamp, substituting file mtime");
            }
            file_mtime_ms(input)
        }
    }
}

/// Promote a raw epoch number to milliseconds: values that read as
/// plausible epoch seconds (1e9 ≤ v < 1e11) are multiplied by 1000;
/// anything larger is already milliseconds.
pub fn normalize_epoch_ms(v: f64) -> u64 {
    if (1.0e9..1.0e11).contains(&v) {
        (v * 1000.0) as u64
    } else {
        v as u64
    }
}

/// Parse a finite number; rejects NaN/inf and non-numeric tokens.
pub fn parse_finite(token: &str) -> Option<f64> {
    let v: f64 = token.trim().parse().ok()?;
    v.is_finite().then_some(v)
}

/// Parse a millisecond timestamp attribute, truncating to u32 the way
/// the container's ts marker does.
pub fn parse_ts_attr(token: &str) -> Option<u32> {
    parse_finite(token).map(|v| (v as u64) as u32)
}

/// Parse an ISO-8601-ish date string to epoch ms. Accepts RFC 3339,
/// a space- or `T`-separated local datetime, or a bare date (UTC).
pub fn parse_iso_ms(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return u64::try_from(dt.timestamp_millis()).ok();
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return u64::try_from(dt.and_utc().timestamp_millis()).ok();
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let dt = d.and_hms_opt(0, 0, 0)?;
        return u64::try_from(dt.and_utc().timestamp_millis()).ok();
    }
    None
}

/// Split a name list on comma/whitespace/semicolon runs; tokens are
/// trimmed and empties dropped.
pub fn split_list(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Split a CSV data row, preserving column positions: comma/semicolon
/// are hard separators (empty columns kept), a separator-free row
/// splits on whitespace.
pub fn split_row(text: &str) -> Vec<String> {
    if text.contains([',', ';']) {
        text.split([',', ';']).map(|t| t.trim().to_owned()).collect()
    } else {
        text.split_whitespace().map(str::to_owned).collect()
    }
}

/// Collect an element's attributes as (local name, unescaped value)
/// pairs in document order.
pub fn attr_pairs(e: &BytesStart) -> Result<Vec<(String, String)>, crate::RepackError> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.push((key, value));
    }
    Ok(out)
}

/// First value for `key` in an attribute list.
pub fn get_attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Lazily-declared field dictionary.
///
/// Names learned from `<fields>` are burst-declared on first use; a
/// row seen before any dictionary synthesizes `#0..#N-1` names; uplink
/// records may append new fields afterwards.
#[derive(Debug, Default)]
pub struct FieldTable {
    names: Vec<String>,
    index: HashMap<String, u16>,
    burst_done: bool,
}

impl FieldTable {
    /// Install the declared name list. Ignored once declarations have
    /// been emitted: the wire dictionary is immutable.
    pub fn set_names(&mut self, names: Vec<String>) {
        if self.burst_done {
            debug!("field list arrived after declarations were emitted, ignoring");
            return;
        }
        self.names = names;
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Emit the declaration burst if it has not happened yet. With no
    /// known names, synthesizes `#0..#hint-1` (nothing when `hint` is
    /// 0, so a later source of names can still win).
    pub fn ensure_declared<W: Write>(
        &mut self,
        enc: &mut TlmEncoder<W>,
        hint: usize,
    ) -> Result<(), EncodeError> {
        if self.burst_done {
            return Ok(());
        }
        if self.names.is_empty() {
            if hint == 0 {
                return Ok(());
            }
            self.names = (0..hint.min(MAX_FIELDS)).map(|i| format!("#{i}")).collect();
        }
        for name in &self.names {
            if let Some(idx) = enc.declare_field(name, &[])? {
                self.index.insert(name.clone(), idx);
            }
        }
        self.burst_done = true;
        Ok(())
    }

    /// Index for a named field, declaring it on the fly when new
    /// (uplink path). Returns `None` once the dictionary is full.
    pub fn declare_extra<W: Write>(
        &mut self,
        enc: &mut TlmEncoder<W>,
        name: &str,
    ) -> Result<Option<u16>, EncodeError> {
        self.ensure_declared(enc, 0)?;
        if let Some(&idx) = self.index.get(name) {
            return Ok(Some(idx));
        }
        match enc.declare_field(name, &[])? {
            Some(idx) => {
                self.names.push(name.to_owned());
                self.index.insert(name.to_owned(), idx);
                // The dictionary is live on the wire from here on.
                self.burst_done = true;
                Ok(Some(idx))
            }
            None => Ok(None),
        }
    }
}

/// Event schemas learned from the stream, keyed by event name.
#[derive(Debug, Default)]
pub struct EventTable {
    schemas: HashMap<String, (u8, Vec<String>)>,
}

impl EventTable {
    /// Emit one event instance, declaring its schema on first sight.
    ///
    /// The key list is the attribute names excluding `name` and `t`,
    /// plus a trailing `"text"` key iff the element carried non-empty
    /// text. Later instances are mapped onto the first-seen key list;
    /// unknown keys are dropped and missing ones become empty strings.
    pub fn emit<W: Write>(
        &mut self,
        enc: &mut TlmEncoder<W>,
        name: &str,
        attrs: &[(String, String)],
        text: &str,
    ) -> Result<(), EncodeError> {
        let trimmed = text.trim();

        let (index, keys) = match self.schemas.get(name) {
            Some(entry) => entry.clone(),
            None => {
                let mut keys: Vec<String> = attrs
                    .iter()
                    .map(|(k, _)| k.clone())
                    .filter(|k| k != "name" && k != "t")
                    .collect();
                if !trimmed.is_empty() {
                    keys.push("text".to_owned());
                }
                let index = enc.declare_event(name, &keys)?;
                self.schemas.insert(name.to_owned(), (index, keys.clone()));
                (index, keys)
            }
        };

        let values: Vec<String> = keys
            .iter()
            .map(|key| {
                if key == "text" {
                    trimmed.to_owned()
                } else {
                    get_attr(attrs, key).unwrap_or_default().to_owned()
                }
            })
            .collect();

        enc.write_event(index, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(buf: &mut Vec<u8>) -> TlmEncoder<&mut Vec<u8>> {
        TlmEncoder::new(buf, Y2K_MS, 0).expect("encoder")
    }

    #[test]
    fn test_split_list_collapses_separators() {
        assert_eq!(
            split_list("a, b;c\t d\n,,e"),
            vec!["a", "b", "c", "d", "e"]
        );
        assert!(split_list("  ").is_empty());
    }

    #[test]
    fn test_split_row_preserves_positions() {
        assert_eq!(split_row("1,,3"), vec!["1", "", "3"]);
        assert_eq!(split_row("1, 2 ,3"), vec!["1", "2", "3"]);
        assert_eq!(split_row("4 5 6"), vec!["4", "5", "6"]);
    }

    #[test]
    fn test_parse_finite() {
        assert_eq!(parse_finite(" 1.5 "), Some(1.5));
        assert_eq!(parse_finite("-3e2"), Some(-300.0));
        assert_eq!(parse_finite("NaN"), None);
        assert_eq!(parse_finite("inf"), None);
        assert_eq!(parse_finite("abc"), None);
        assert_eq!(parse_finite(""), None);
    }

    #[test]
    fn test_normalize_epoch_ms() {
        // Seconds are promoted to ms.
        assert_eq!(normalize_epoch_ms(1.7e9), 1_700_000_000_000);
        // Already ms: passed through.
        assert_eq!(normalize_epoch_ms(1.7e12), 1_700_000_000_000);
        // Millisecond values just before 2000 stay milliseconds.
        assert_eq!(normalize_epoch_ms(946_684_799_000.0), 946_684_799_000);
        // Small values are not epoch seconds.
        assert_eq!(normalize_epoch_ms(100.0), 100);
    }

    #[test]
    fn test_parse_iso_ms() {
        assert_eq!(parse_iso_ms("2023-11-14T22:13:20Z"), Some(1_700_000_000_000));
        assert_eq!(parse_iso_ms("2023-11-14 22:13:20"), Some(1_700_000_000_000));
        assert_eq!(parse_iso_ms("2023-11-14"), Some(1_699_920_000_000));
        assert_eq!(parse_iso_ms("not a date"), None);
    }

    #[test]
    fn test_resolve_base_ts_rejects_pre_2000() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x");
        std::fs::write(&path, "x").expect("write");
        let mtime = file_mtime_ms(&path);

        assert_eq!(resolve_base_ts(Some(Y2K_MS + 5), &path), Y2K_MS + 5);
        assert_eq!(resolve_base_ts(Some(946_684_799_000), &path), mtime);
        assert_eq!(resolve_base_ts(None, &path), mtime);
    }

    #[test]
    fn test_field_table_synthesizes_names() {
        let mut buf = Vec::new();
        let mut e = enc(&mut buf);
        let mut table = FieldTable::default();

        table.ensure_declared(&mut e, 0).expect("noop");
        assert_eq!(e.field_count(), 0);

        table.ensure_declared(&mut e, 3).expect("burst");
        assert_eq!(e.field_count(), 3);
        assert_eq!(table.len(), 3);

        // Burst happens once; a larger hint does not extend it.
        table.ensure_declared(&mut e, 10).expect("noop");
        assert_eq!(e.field_count(), 3);
    }

    #[test]
    fn test_field_table_burst_then_extra() {
        let mut buf = Vec::new();
        let mut e = enc(&mut buf);
        let mut table = FieldTable::default();
        table.set_names(vec!["a".into(), "b".into()]);

        let idx = table.declare_extra(&mut e, "roll").expect("extra");
        // Known names burst first, then the new field appends.
        assert_eq!(idx, Some(2));
        assert_eq!(e.field_count(), 3);

        // Second lookup reuses the index without redeclaring.
        assert_eq!(table.declare_extra(&mut e, "roll").expect("again"), Some(2));
        assert_eq!(e.field_count(), 3);
        assert_eq!(table.declare_extra(&mut e, "a").expect("known"), Some(0));
    }

    #[test]
    fn test_event_table_schema_reuse() {
        let mut buf = Vec::new();
        let mut e = enc(&mut buf);
        let mut events = EventTable::default();

        let attrs = vec![
            ("name".to_owned(), "mode".to_owned()),
            ("value".to_owned(), "CRUISE".to_owned()),
        ];
        events.emit(&mut e, "mode", &attrs, "engaged").expect("first");
        assert_eq!(e.event_count(), 1);

        // Same name reuses the schema; a missing attribute maps to "".
        let attrs2 = vec![("name".to_owned(), "mode".to_owned())];
        events.emit(&mut e, "mode", &attrs2, "").expect("second");
        assert_eq!(e.event_count(), 1);
    }
}
