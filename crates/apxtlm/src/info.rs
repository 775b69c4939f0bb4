// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metadata embedded as the container's `"info"` record.
//!
//! The object travels verbatim as a deflated JSON blob; unset fields
//! are omitted from the serialization. Consumers require at least
//! `timestamp` (ms) and `utc_offset` (seconds), which the encoder
//! back-fills from the header when absent.

use serde::Serialize;
use serde_json::Value;

/// Provenance of the imported recording.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportInfo {
    /// Source file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Source title (file stem).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Source dialect ("telemetry" or "datalink").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Import wall-clock time, ms since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Identity of the unit the recording came from, when known.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Unit clock at recording start, ms since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl UnitInfo {
    /// True when nothing identifies the unit; such an object is omitted.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.uid.is_none()
    }
}

/// The `"info"` payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryInfo {
    /// Recording title (input file stem).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitInfo>,

    /// Recording start, ms truncated to u32.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u32>,

    /// UTC offset in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_offset: Option<i32>,
}

impl TelemetryInfo {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn import(mut self, import: ImportInfo) -> Self {
        self.import = Some(import);
        self
    }

    /// Attach the unit identity; empty identities are dropped.
    pub fn unit(mut self, unit: UnitInfo) -> Self {
        self.unit = if unit.is_empty() { None } else { Some(unit) };
        self
    }

    pub fn timestamp_ms(mut self, ms: u64) -> Self {
        self.timestamp = Some(ms as u32);
        self
    }

    pub fn utc_offset(mut self, seconds: i32) -> Self {
        self.utc_offset = Some(seconds);
        self
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
