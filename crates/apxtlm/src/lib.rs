// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! APXTLM binary telemetry container.
//!
//! Append-only container for flight telemetry: a fixed header, a prelude
//! of dictionary declarations, and an interleaved body of timestamp
//! markers, bit-packed numeric samples, string events, and deflated JSON
//! documents, closed by a single stop byte.
//!
//! # Format Overview
//!
//! ```text
//! +---------------------------------------------------------+
//! |                   File Header (44 bytes)                 |
//! |  "APXTLM" (6) | pad (10) | Version (2) | Offset (2)     |
//! |  pad (12) | StartTimestamp ms (8) | UtcOffset s (4)     |
//! +---------------------------------------------------------+
//! |                   Prelude                                |
//! |  jso "info" | field decl[] | event schema[]              |
//! +---------------------------------------------------------+
//! |                   Body (interleaved, stream order)       |
//! |  ts | sample | dir+sample | evt | jso | raw | zip | ...  |
//! +---------------------------------------------------------+
//! |                   Stop byte (0x00)                       |
//! +---------------------------------------------------------+
//! ```
//!
//! Non-value records open with an extension opcode byte
//! (`ext_id << 4`); value records carry the field index and a 4-bit
//! type code in one (delta-compressed) or two framing bytes. Samples
//! are narrowed to half precision whenever the f16 round trip is
//! bit-exact. Declarations are appended lazily on first use and are
//! immutable for the rest of the file.
//!
//! The container is write-only: there is no in-place editing and no
//! random access. See [`TlmEncoder`] for the write path.

pub mod encoder;
pub mod f16;
pub mod info;
pub mod writer;

pub use encoder::{
    Direction, EncodeError, EncoderStats, TlmEncoder, FORMAT_VERSION, HEADER_SIZE, MAGIC,
    MAX_EVENTS, MAX_FIELDS,
};
pub use info::{ImportInfo, TelemetryInfo, UnitInfo};
pub use writer::qcompress;
