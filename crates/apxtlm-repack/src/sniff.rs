// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Input dialect classification.
//!
//! Cheap checks first: file name, then a marker scan over the first
//! 64 KiB, then a lenient XML parse of the head looking at top-level
//! element names.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Head window inspected for content markers.
const SNIFF_HEAD: usize = 64 * 1024;

/// Input dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Root `<telemetry>` recording.
    Telemetry,
    /// `<mandala>` / datalink dump.
    Datalink,
}

/// Classify `path`, or `None` when no rule matches.
pub fn sniff(path: &Path) -> io::Result<Option<Dialect>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".telemetry") {
        return Ok(Some(Dialect::Telemetry));
    }
    if name.ends_with(".datalink.xml") || name.contains(".datalink") {
        return Ok(Some(Dialect::Datalink));
    }

    let mut head = Vec::with_capacity(SNIFF_HEAD);
    File::open(path)?
        .take(SNIFF_HEAD as u64)
        .read_to_end(&mut head)?;
    let text = String::from_utf8_lossy(&head).to_ascii_lowercase();

    if text.contains("<telemetry") {
        return Ok(Some(Dialect::Telemetry));
    }
    if text.contains("<mandala") || text.contains("<s>") || text.contains("<d>") {
        return Ok(Some(Dialect::Datalink));
    }

    Ok(head_root_dialect(&text))
}

/// Last resort: parse the (possibly truncated) head and judge by
/// top-level element names. Parse errors end the search.
fn head_root_dialect(text: &str) -> Option<Dialect> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    let mut depth = 0u32;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 1 {
                    if let Some(d) = dialect_from_name(e.local_name().as_ref()) {
                        return Some(d);
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    if let Some(d) = dialect_from_name(e.local_name().as_ref()) {
                        return Some(d);
                    }
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn dialect_from_name(name: &[u8]) -> Option<Dialect> {
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    if name.contains("telemetry") {
        return Some(Dialect::Telemetry);
    }
    if name.contains("datalink") || name.contains("mandala") {
        return Some(Dialect::Datalink);
    }
    None
}
