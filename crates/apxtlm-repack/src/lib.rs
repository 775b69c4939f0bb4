// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XML → APXTLM repacker.
//!
//! Streams a legacy flight recording once, top to bottom, and emits an
//! APXTLM container: the field dictionary is learned lazily, unchanged
//! samples are suppressed, floats narrow to half precision when exact,
//! and out-of-band sub-trees become deflated JSON records.
//!
//! Two input dialects are supported:
//! - **telemetry**: root `<telemetry>` with `<D t>csv</D>` rows,
//!   `<E name t>` events and `<U>` uplink bursts;
//! - **datalink**: root `<mandala>` with `<S>`/`<D>` CSV rows and
//!   `<event>`/`<evt>` elements.
//!
//! # Quick Start
//!
//! ```bash
//! repack --in flight_042.telemetry --out flight_042.apxtlm
//! repack --in dump.datalink.xml --out dump.apxtlm --with-jso
//! ```

pub mod common;
pub mod datalink;
pub mod jso;
pub mod sniff;
pub mod telemetry;

pub use sniff::{sniff, Dialect};

use apxtlm::{EncodeError, EncoderStats};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

/// Repack errors. All variants are fatal; recoverable conditions
/// (bad numeric tokens, pre-2000 timestamps, JSO reparse failures)
/// are handled inside the ingests and never surface here.
#[derive(Debug, Error)]
pub enum RepackError {
    #[error("input not found: {0}")]
    NotFound(PathBuf),

    #[error("cannot classify input dialect: {0}")]
    UnknownDialect(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed XML attribute: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// Repack configuration.
#[derive(Debug, Clone, Default)]
pub struct RepackConfig {
    /// UTC offset of the recording site, in seconds.
    pub utc_offset_secs: i32,

    /// Capture non-record sub-trees as embedded JSON documents.
    pub include_jso: bool,
}

impl RepackConfig {
    /// Set the UTC offset in seconds.
    pub fn utc_offset(mut self, seconds: i32) -> Self {
        self.utc_offset_secs = seconds;
        self
    }

    /// Enable or disable JSO capture.
    pub fn include_jso(mut self, enabled: bool) -> Self {
        self.include_jso = enabled;
        self
    }
}

/// Outcome of a completed repack.
#[derive(Debug, Clone, Copy)]
pub struct RepackStats {
    /// Dialect the input was classified as.
    pub dialect: Dialect,

    /// Encoder counters for the produced container.
    pub encoder: EncoderStats,

    /// Wall-clock duration of the repack.
    pub duration_secs: f64,
}

/// Repack one recording: validate the path, classify the dialect, and
/// run the matching ingest.
pub fn repack_file(
    input: &Path,
    output: &Path,
    config: &RepackConfig,
) -> Result<RepackStats, RepackError> {
    if !input.is_file() {
        return Err(RepackError::NotFound(input.to_path_buf()));
    }

    let started = Instant::now();
    let dialect = sniff::sniff(input)?.ok_or_else(|| RepackError::UnknownDialect(input.to_path_buf()))?;

    info!(input = %input.display(), output = %output.display(), ?dialect, "repack started");

    let encoder = match dialect {
        Dialect::Telemetry => telemetry::repack(input, output, config)?,
        Dialect::Datalink => datalink::repack(input, output, config)?,
    };

    let stats = RepackStats {
        dialect,
        encoder,
        duration_secs: started.elapsed().as_secs_f64(),
    };
    info!(
        samples = stats.encoder.samples,
        suppressed = stats.encoder.samples_suppressed,
        bytes = stats.encoder.bytes_written,
        "repack finished"
    );
    Ok(stats)
}
