// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Out-of-band sub-tree capture.
//!
//! Any element the ingests do not recognize as a record can be
//! captured verbatim, re-parsed into a JSON value (attributes become
//! `@_name` keys, inner text `#text`), and embedded as a JSO record.
//! Captures that look like a node dictionary are normalized into the
//! canonical `{nodes: [{info, dict, values, time}]}` shape.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use roxmltree::Document;
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::io::BufRead;

use crate::common::parse_finite;

/// Re-serialize one sub-tree, opening tag included, from the live
/// reader. Consumes events through the matching close tag.
pub fn capture_subtree<R: BufRead>(
    reader: &mut Reader<R>,
    start: &BytesStart<'_>,
) -> Result<Vec<u8>, quick_xml::Error> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Start(start.to_owned()))?;

    let mut depth = 1usize;
    let mut buf = Vec::new();
    loop {
        let ev = reader.read_event_into(&mut buf)?;
        match &ev {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => break,
            _ => {}
        }
        writer.write_event(ev)?;
        if depth == 0 {
            break;
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

/// Parse captured XML back into a structured value.
pub fn reparse(xml: &str) -> Result<Value, roxmltree::Error> {
    let doc = Document::parse(xml)?;
    Ok(element_to_value(doc.root_element()))
}

/// Recursive XML → JSON conversion: attributes as `@_name`, repeated
/// children promoted to arrays, trailing text as `#text`. A leaf
/// element with neither attributes nor children collapses to its text.
fn element_to_value(node: roxmltree::Node) -> Value {
    let mut map = Map::new();

    for attr in node.attributes() {
        map.insert(
            format!("@_{}", attr.name()),
            Value::String(attr.value().to_owned()),
        );
    }

    let mut text = String::new();
    for child in node.children() {
        if child.is_element() {
            let key = child.tag_name().name().to_owned();
            let value = element_to_value(child);
            match map.get_mut(&key) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(key, value);
                }
            }
        } else if child.is_text() {
            if let Some(t) = child.text() {
                text.push_str(t);
            }
        }
    }

    let text = text.trim().to_owned();
    if map.is_empty() {
        return Value::String(text);
    }
    if !text.is_empty() {
        map.insert("#text".to_owned(), Value::String(text));
    }
    Value::Object(map)
}

/// One normalized field of a node dictionary.
#[derive(Debug, Clone, PartialEq)]
struct FieldDef {
    name: String,
    title: String,
    kind: String,
    raw_value: Option<String>,
}

/// Normalize a captured value into `{nodes: [...]}` when it matches
/// one of the known node-dictionary shapes; `None` otherwise.
///
/// Three extractors are tried per node, first hit wins: flat
/// `fields.field[]`, direct `field[]` with attribute metadata, and a
/// recursive `dictionary` walk.
pub fn try_normalize_nodes(tag: &str, value: &Value, time_ms: u64) -> Option<Value> {
    let mut nodes = Vec::new();
    for node in node_candidates(tag, value) {
        let fields = extract_flat_fields(node)
            .or_else(|| extract_field_array(node))
            .or_else(|| extract_dictionary(node));
        if let Some(fields) = fields {
            nodes.push(node_entry(node, &fields, time_ms));
        }
    }
    if nodes.is_empty() {
        return None;
    }
    Some(json!({ "nodes": nodes }))
}

fn node_candidates<'a>(tag: &str, value: &'a Value) -> Vec<&'a Value> {
    if tag == "node" {
        return vec![value];
    }
    let inner = value
        .get("node")
        .or_else(|| value.get("nodes").and_then(|n| n.get("node")));
    match inner {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(single) => vec![single],
        None => Vec::new(),
    }
}

fn node_entry(node: &Value, fields: &[FieldDef], time_ms: u64) -> Value {
    let fields_value = Value::Array(
        fields
            .iter()
            .map(|f| json!({ "name": f.name, "title": f.title, "type": f.kind }))
            .collect(),
    );
    let cache = dict_cache(&fields_value);

    let mut values = Map::new();
    for f in fields {
        if let Some(raw) = &f.raw_value {
            values.insert(f.name.clone(), parse_initial(&f.kind, raw));
        }
    }

    json!({
        "info": node.get("info").cloned().unwrap_or_else(|| json!({})),
        "dict": { "cache": cache, "fields": fields_value },
        "values": Value::Object(values),
        "time": time_ms,
    })
}

/// Cache token: first 8 uppercase hex characters of SHA-1 over the
/// serialized field list.
fn dict_cache(fields: &Value) -> String {
    let digest = Sha1::digest(fields.to_string().as_bytes());
    digest
        .iter()
        .take(4)
        .map(|b| format!("{b:02X}"))
        .collect()
}

fn as_items(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Scalar coercion used when reading dictionary properties: strings,
/// numbers, bools, or the `#text` of a wrapped element.
fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => map.get("#text").and_then(scalar),
        _ => None,
    }
}

fn prop(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(scalar)
}

/// Either the plain key or its `@_` attribute spelling.
fn prop_or_attr(obj: &Value, key: &str) -> Option<String> {
    prop(obj, key).or_else(|| prop(obj, &format!("@_{key}")))
}

/// `node.fields.field[]` with optional `struct.type` nesting.
fn extract_flat_fields(node: &Value) -> Option<Vec<FieldDef>> {
    let list = node.get("fields")?.get("field")?;
    let mut out = Vec::new();
    for f in as_items(list) {
        let Some(name) = prop_or_attr(f, "name") else {
            continue;
        };
        let kind = prop_or_attr(f, "type")
            .or_else(|| f.get("struct").and_then(|s| prop_or_attr(s, "type")))
            .unwrap_or_default();
        out.push(FieldDef {
            title: prop_or_attr(f, "title").unwrap_or_else(|| name.clone()),
            kind: normalize_type(&kind),
            raw_value: prop_or_attr(f, "value").or_else(|| prop(f, "#text")),
            name,
        });
    }
    (!out.is_empty()).then_some(out)
}

/// `node.field[]` with attribute metadata and optional inline value.
fn extract_field_array(node: &Value) -> Option<Vec<FieldDef>> {
    let list = node.get("field")?;
    let mut out = Vec::new();
    for f in as_items(list) {
        let Some(name) = prop_or_attr(f, "name") else {
            continue;
        };
        let kind = prop_or_attr(f, "type").unwrap_or_default();
        out.push(FieldDef {
            title: prop_or_attr(f, "title").unwrap_or_else(|| name.clone()),
            kind: normalize_type(&kind),
            raw_value: prop_or_attr(f, "value").or_else(|| prop(f, "#text")),
            name,
        });
    }
    (!out.is_empty()).then_some(out)
}

/// Recursive walk of `node.dictionary`: any object subtree carrying
/// both a name and a type is a field; `info`/`hardware`/`version`
/// sub-objects are skipped.
fn extract_dictionary(node: &Value) -> Option<Vec<FieldDef>> {
    let dict = node.get("dictionary")?;
    let mut out = Vec::new();
    walk_dictionary(dict, &mut out);
    (!out.is_empty()).then_some(out)
}

fn walk_dictionary(v: &Value, out: &mut Vec<FieldDef>) {
    match v {
        Value::Array(items) => {
            for item in items {
                walk_dictionary(item, out);
            }
        }
        Value::Object(map) => {
            let name = prop_or_attr(v, "name");
            let kind = prop_or_attr(v, "type");
            if let (Some(name), Some(kind)) = (name, kind) {
                out.push(FieldDef {
                    title: prop_or_attr(v, "title").unwrap_or_else(|| name.clone()),
                    kind: normalize_type(&kind),
                    raw_value: prop_or_attr(v, "value").or_else(|| prop(v, "#text")),
                    name,
                });
                return;
            }
            for (key, child) in map {
                if key == "info" || key == "hardware" || key == "version" {
                    continue;
                }
                if key.starts_with("@_") || key == "#text" {
                    continue;
                }
                walk_dictionary(child, out);
            }
        }
        _ => {}
    }
}

/// Lowercase the type; enumerated kinds collapse to `string`.
fn normalize_type(kind: &str) -> String {
    let kind = kind.trim().to_ascii_lowercase();
    match kind.as_str() {
        "option" | "enum" => "string".to_owned(),
        _ => kind,
    }
}

fn is_numeric_type(kind: &str) -> bool {
    ["int", "float", "real", "double", "byte", "word"]
        .iter()
        .any(|m| kind.contains(m))
}

fn is_bool_type(kind: &str) -> bool {
    kind.contains("bool") || kind == "bit"
}

/// Initial-value coercion by normalized type.
fn parse_initial(kind: &str, raw: &str) -> Value {
    let trimmed = raw.trim();
    if is_numeric_type(kind) {
        let v = parse_finite(trimmed).unwrap_or(0.0);
        if v.fract() == 0.0 && v.abs() < 9.0e15 {
            return Value::from(v as i64);
        }
        return Value::from(v);
    }
    if is_bool_type(kind) {
        let truthy = matches!(
            trimmed.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
        return Value::Bool(truthy);
    }
    Value::String(trimmed.to_owned())
}
